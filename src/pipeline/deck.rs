//! Deck packaging: [`Flashcard`]s → `.apkg` archive bytes.
//!
//! An `.apkg` is a zip holding a legacy Anki collection database
//! (`collection.anki2`, schema 11) and a `media` JSON map. The collection is
//! written with rusqlite into a scratch directory, then read back into the
//! archive, so nothing outlives the call except the returned bytes.
//!
//! ## Ids
//!
//! Deck and note-type ids are random integers in `[2^30, 2^31)` drawn per
//! [`DeckBuilder`], never shared process-wide. Two decks generated by the same
//! server therefore import side by side without one overwriting the other's
//! note type. Tests pin them with [`DeckBuilder::with_ids`].

use crate::config::DEFAULT_DECK_NAME;
use crate::error::AnkiDexError;
use crate::output::Flashcard;
use once_cell::sync::Lazy;
use regex::Regex;
use rusqlite::{params, Connection, OpenFlags};
use serde_json::json;
use sha1::{Digest, Sha1};
use std::io::{Cursor, Read, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info};
use uuid::Uuid;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

/// Name of the collection database inside the archive.
pub const COLLECTION_ENTRY: &str = "collection.anki2";
/// Name of the media map inside the archive.
pub const MEDIA_ENTRY: &str = "media";
/// Note type every generated card uses.
pub const NOTE_TYPE_NAME: &str = "AnkiDex Basic";

const FIELD_SEPARATOR: char = '\u{1f}';

const QUESTION_TEMPLATE: &str = r#"<div class="card question">
    {{Question}}
</div>"#;

const ANSWER_TEMPLATE: &str = r#"<div class="card question">
    {{Question}}
</div>
<hr id="answer">
<div class="card answer">
    {{Answer}}
</div>"#;

const CARD_CSS: &str = r#".card {
    font-family: 'Segoe UI', Arial, sans-serif;
    font-size: 20px;
    text-align: center;
    color: #333;
    background-color: #fafafa;
    padding: 20px;
    line-height: 1.5;
}
.question {
    font-weight: bold;
    color: #1a73e8;
}
.answer {
    color: #2e7d32;
}
hr#answer {
    border: none;
    border-top: 2px solid #ddd;
    margin: 20px 0;
}"#;

const SCHEMA: &str = r#"
CREATE TABLE col (
    id      integer primary key,
    crt     integer not null,
    mod     integer not null,
    scm     integer not null,
    ver     integer not null,
    dty     integer not null,
    usn     integer not null,
    ls      integer not null,
    conf    text not null,
    models  text not null,
    decks   text not null,
    dconf   text not null,
    tags    text not null
);
CREATE TABLE notes (
    id      integer primary key,
    guid    text not null,
    mid     integer not null,
    mod     integer not null,
    usn     integer not null,
    tags    text not null,
    flds    text not null,
    sfld    integer not null,
    csum    integer not null,
    flags   integer not null,
    data    text not null
);
CREATE TABLE cards (
    id      integer primary key,
    nid     integer not null,
    did     integer not null,
    ord     integer not null,
    mod     integer not null,
    usn     integer not null,
    type    integer not null,
    queue   integer not null,
    due     integer not null,
    ivl     integer not null,
    factor  integer not null,
    reps    integer not null,
    lapses  integer not null,
    left    integer not null,
    odue    integer not null,
    odid    integer not null,
    flags   integer not null,
    data    text not null
);
CREATE TABLE revlog (
    id      integer primary key,
    cid     integer not null,
    usn     integer not null,
    ease    integer not null,
    ivl     integer not null,
    lastIvl integer not null,
    factor  integer not null,
    time    integer not null,
    type    integer not null
);
CREATE TABLE graves (
    usn     integer not null,
    oid     integer not null,
    type    integer not null
);
CREATE INDEX ix_notes_usn ON notes (usn);
CREATE INDEX ix_cards_usn ON cards (usn);
CREATE INDEX ix_revlog_usn ON revlog (usn);
CREATE INDEX ix_cards_nid ON cards (nid);
CREATE INDEX ix_cards_sched ON cards (did, queue, due);
CREATE INDEX ix_revlog_cid ON revlog (cid);
CREATE INDEX ix_notes_csum ON notes (csum);
"#;

/// Deck and note-type ids for one archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeckIds {
    pub deck_id: i64,
    pub model_id: i64,
}

impl DeckIds {
    /// Fresh random ids in `[2^30, 2^31)`.
    pub fn random() -> Self {
        Self {
            deck_id: random_id(),
            model_id: random_id(),
        }
    }
}

/// Builds one `.apkg` archive.
#[derive(Debug, Clone)]
pub struct DeckBuilder {
    name: String,
    ids: DeckIds,
    created_ms: i64,
}

impl DeckBuilder {
    /// A builder with fresh random ids. A blank name falls back to
    /// [`DEFAULT_DECK_NAME`].
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let name = if name.trim().is_empty() {
            DEFAULT_DECK_NAME.to_string()
        } else {
            name.trim().to_string()
        };
        Self {
            name,
            ids: DeckIds::random(),
            created_ms: now_ms(),
        }
    }

    pub fn with_ids(mut self, ids: DeckIds) -> Self {
        self.ids = ids;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ids(&self) -> DeckIds {
        self.ids
    }

    /// Serialise `cards` into `.apkg` bytes, one note and one new card each.
    pub fn build_apkg(&self, cards: &[Flashcard]) -> Result<Vec<u8>, AnkiDexError> {
        let scratch = tempfile::tempdir()
            .map_err(|e| AnkiDexError::DeckBuildFailed(format!("scratch dir: {e}")))?;
        let db_path = scratch.path().join(COLLECTION_ENTRY);

        {
            let mut conn = Connection::open(&db_path)?;
            conn.execute_batch(SCHEMA)?;
            self.write_collection(&mut conn, cards)?;
        }

        let db = std::fs::read(&db_path)
            .map_err(|e| AnkiDexError::DeckBuildFailed(format!("read collection: {e}")))?;
        let bytes = zip_package(&db)?;

        info!(
            "Built deck '{}' ({} notes, {} bytes, deck id {})",
            self.name,
            cards.len(),
            bytes.len(),
            self.ids.deck_id
        );
        Ok(bytes)
    }

    fn write_collection(&self, conn: &mut Connection, cards: &[Flashcard]) -> Result<(), AnkiDexError> {
        let secs = self.created_ms / 1000;

        conn.execute(
            "INSERT INTO col VALUES (1, ?1, ?2, ?3, 11, 0, 0, 0, ?4, ?5, ?6, ?7, '{}')",
            params![
                secs,
                self.created_ms,
                self.created_ms,
                self.collection_conf().to_string(),
                self.models_json().to_string(),
                self.decks_json().to_string(),
                default_deck_config().to_string(),
            ],
        )?;

        let tx = conn.transaction()?;
        {
            let mut note_stmt = tx.prepare(
                "INSERT INTO notes VALUES (?1, ?2, ?3, ?4, -1, '', ?5, ?6, ?7, 0, '')",
            )?;
            let mut card_stmt = tx.prepare(
                "INSERT INTO cards VALUES (?1, ?2, ?3, 0, ?4, -1, 0, 0, ?5, 0, 0, 0, 0, 0, 0, 0, 0, '')",
            )?;

            for (i, card) in cards.iter().enumerate() {
                let note_id = self.created_ms + i as i64;
                let card_id = note_id;
                let sort_field = sort_field(&card.question);
                let flds = format!("{}{}{}", card.question, FIELD_SEPARATOR, card.answer);

                note_stmt.execute(params![
                    note_id,
                    guid(),
                    self.ids.model_id,
                    secs,
                    flds,
                    sort_field,
                    field_checksum(&sort_field),
                ])?;
                card_stmt.execute(params![card_id, note_id, self.ids.deck_id, secs, i as i64 + 1])?;
            }
        }
        tx.commit()?;

        debug!("Wrote {} notes to collection", cards.len());
        Ok(())
    }

    fn collection_conf(&self) -> serde_json::Value {
        json!({
            "activeDecks": [1],
            "addToCur": true,
            "collapseTime": 1200,
            "curDeck": self.ids.deck_id,
            "curModel": self.ids.model_id.to_string(),
            "dueCounts": true,
            "estTimes": true,
            "newBury": true,
            "newSpread": 0,
            "nextPos": 1,
            "sortBackwards": false,
            "sortType": "noteFld",
            "timeLim": 0
        })
    }

    fn models_json(&self) -> serde_json::Value {
        let field = |name: &str, ord: u32| {
            json!({
                "name": name,
                "ord": ord,
                "font": "Arial",
                "media": [],
                "rtl": false,
                "size": 20,
                "sticky": false
            })
        };
        let mut models = serde_json::Map::new();
        models.insert(
            self.ids.model_id.to_string(),
            json!({
                "id": self.ids.model_id,
                "name": NOTE_TYPE_NAME,
                "type": 0,
                "mod": self.created_ms / 1000,
                "usn": -1,
                "sortf": 0,
                "did": self.ids.deck_id,
                "tags": [],
                "vers": [],
                "css": CARD_CSS,
                "latexPre": "\\documentclass[12pt]{article}\n\\special{papersize=3in,5in}\n\\usepackage[utf8]{inputenc}\n\\usepackage{amssymb,amsmath}\n\\pagestyle{empty}\n\\setlength{\\parindent}{0in}\n\\begin{document}\n",
                "latexPost": "\\end{document}",
                "flds": [field("Question", 0), field("Answer", 1)],
                "tmpls": [{
                    "name": "Card 1",
                    "ord": 0,
                    "qfmt": QUESTION_TEMPLATE,
                    "afmt": ANSWER_TEMPLATE,
                    "bqfmt": "",
                    "bafmt": "",
                    "did": null
                }],
                "req": [[0, "any", [0]]]
            }),
        );
        serde_json::Value::Object(models)
    }

    fn decks_json(&self) -> serde_json::Value {
        let deck = |id: i64, name: &str| {
            json!({
                "id": id,
                "name": name,
                "desc": "",
                "conf": 1,
                "dyn": 0,
                "collapsed": false,
                "browserCollapsed": false,
                "extendNew": 10,
                "extendRev": 50,
                "newToday": [0, 0],
                "revToday": [0, 0],
                "lrnToday": [0, 0],
                "timeToday": [0, 0],
                "mod": self.created_ms / 1000,
                "usn": -1
            })
        };
        let mut decks = serde_json::Map::new();
        decks.insert("1".to_string(), deck(1, "Default"));
        decks.insert(self.ids.deck_id.to_string(), deck(self.ids.deck_id, &self.name));
        serde_json::Value::Object(decks)
    }
}

/// Anki's stock "Default" options group. Every deck points at it via `"conf": 1`.
fn default_deck_config() -> serde_json::Value {
    json!({
        "1": {
            "id": 1,
            "name": "Default",
            "dyn": false,
            "new": {
                "bury": true,
                "delays": [1, 10],
                "initialFactor": 2500,
                "ints": [1, 4, 7],
                "order": 1,
                "perDay": 20,
                "separate": true
            },
            "rev": {
                "bury": true,
                "ease4": 1.3,
                "fuzz": 0.05,
                "ivlFct": 1,
                "maxIvl": 36500,
                "minSpace": 1,
                "perDay": 100
            },
            "lapse": {
                "delays": [10],
                "leechAction": 0,
                "leechFails": 8,
                "minInt": 1,
                "mult": 0
            },
            "maxTaken": 60,
            "timer": 0,
            "autoplay": true,
            "replayq": true,
            "mod": 0,
            "usn": 0
        }
    })
}

/// Serialise `cards` into a deck named `deck_name` with fresh ids.
pub fn build_apkg(cards: &[Flashcard], deck_name: &str) -> Result<Vec<u8>, AnkiDexError> {
    DeckBuilder::new(deck_name).build_apkg(cards)
}

/// Write archive bytes to `path` atomically (temp file + rename).
pub async fn write_apkg(bytes: &[u8], path: &Path) -> Result<(), AnkiDexError> {
    let write_err = |source| AnkiDexError::OutputWriteFailed {
        path: path.to_path_buf(),
        source,
    };

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
    }
    let tmp_path = path.with_extension("apkg.tmp");
    tokio::fs::write(&tmp_path, bytes).await.map_err(write_err)?;
    tokio::fs::rename(&tmp_path, path).await.map_err(write_err)?;
    Ok(())
}

/// What an `.apkg` contains, as far as this crate cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApkgContents {
    /// Deck names other than Anki's built-in "Default".
    pub deck_names: Vec<String>,
    /// Notes in insertion order.
    pub cards: Vec<Flashcard>,
}

/// Read the decks and question/answer pairs back out of `.apkg` bytes.
pub fn read_apkg(bytes: &[u8]) -> Result<ApkgContents, AnkiDexError> {
    let mut archive = ZipArchive::new(Cursor::new(bytes))?;
    let mut db = Vec::new();
    archive
        .by_name(COLLECTION_ENTRY)?
        .read_to_end(&mut db)
        .map_err(|e| AnkiDexError::DeckBuildFailed(format!("read {COLLECTION_ENTRY}: {e}")))?;

    let scratch = tempfile::tempdir()
        .map_err(|e| AnkiDexError::DeckBuildFailed(format!("scratch dir: {e}")))?;
    let db_path = scratch.path().join(COLLECTION_ENTRY);
    std::fs::write(&db_path, &db)
        .map_err(|e| AnkiDexError::DeckBuildFailed(format!("write collection: {e}")))?;

    let conn = Connection::open_with_flags(&db_path, OpenFlags::SQLITE_OPEN_READ_ONLY)?;

    let decks_raw: String = conn.query_row("SELECT decks FROM col", [], |row| row.get(0))?;
    let decks: serde_json::Value = serde_json::from_str(&decks_raw)
        .map_err(|e| AnkiDexError::DeckBuildFailed(format!("decks json: {e}")))?;
    let mut deck_names: Vec<String> = decks
        .as_object()
        .map(|m| {
            m.iter()
                .filter(|(id, _)| id.as_str() != "1")
                .filter_map(|(_, d)| d["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    deck_names.sort();

    let mut stmt = conn.prepare("SELECT flds FROM notes ORDER BY id")?;
    let cards = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .map(|flds| -> Result<Flashcard, rusqlite::Error> {
            let flds = flds?;
            let (question, answer) = flds
                .split_once(FIELD_SEPARATOR)
                .unwrap_or((flds.as_str(), ""));
            Ok(Flashcard::new(question, answer))
        })
        .collect::<Result<Vec<_>, rusqlite::Error>>()?;

    Ok(ApkgContents { deck_names, cards })
}

fn zip_package(collection: &[u8]) -> Result<Vec<u8>, AnkiDexError> {
    let io_err = |e: std::io::Error| AnkiDexError::DeckBuildFailed(format!("zip write: {e}"));
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
    zip.start_file(COLLECTION_ENTRY, options)?;
    zip.write_all(collection).map_err(io_err)?;
    zip.start_file(MEDIA_ENTRY, options)?;
    zip.write_all(b"{}").map_err(io_err)?;
    Ok(zip.finish()?.into_inner())
}

static RE_HTML_TAG: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").unwrap());

/// Sort-field text: tags removed, entities decoded, whitespace trimmed.
fn sort_field(field: &str) -> String {
    let stripped = RE_HTML_TAG.replace_all(field, "");
    html_escape::decode_html_entities(&stripped).trim().to_string()
}

/// First 8 hex digits of the SHA-1 of the sort field, as Anki's duplicate check expects.
fn field_checksum(sort_field: &str) -> i64 {
    let digest = Sha1::digest(sort_field.as_bytes());
    i64::from(u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]))
}

const BASE91: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789!#$%&()*+,-./:;<=>?@[]^_`{|}~";

/// Random note GUID in Anki's base91 alphabet.
fn guid() -> String {
    let mut n = Uuid::new_v4().as_u128() as u64;
    let mut out = Vec::with_capacity(10);
    loop {
        out.push(BASE91[(n % 91) as usize]);
        n /= 91;
        if n == 0 {
            break;
        }
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn random_id() -> i64 {
    let bits = Uuid::new_v4().as_u128() as u64;
    (1i64 << 30) + (bits % (1u64 << 30)) as i64
}

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
