//! CLI binary for ankidex.
//!
//! A thin shim over the library crate: `serve` runs the web app, `generate`
//! runs the pipeline once from the terminal, `inspect` reads a deck back.

use anyhow::{bail, Context, Result};
use ankidex::server;
use ankidex::{
    generate, read_apkg, write_apkg, GeminiProvider, GenerationConfig, GenerationRequest,
    ServerConfig,
};
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

// ── ANSI colour helpers (no extra deps) ──────────────────────────────────────

fn green(s: &str) -> String {
    format!("\x1b[32m{s}\x1b[0m")
}
fn dim(s: &str) -> String {
    format!("\x1b[2m{s}\x1b[0m")
}
fn bold(s: &str) -> String {
    format!("\x1b[1m{s}\x1b[0m")
}
fn cyan(s: &str) -> String {
    format!("\x1b[36m{s}\x1b[0m")
}

const AFTER_HELP: &str = r#"EXAMPLES:
  # Run the web app on http://127.0.0.1:5000
  ankidex serve

  # Listen on all interfaces, keep decks in ./decks
  ankidex serve --host 0.0.0.0 --port 8080 --output-dir decks

  # 20 cards from a PDF
  ankidex generate --pdf lecture.pdf -n 20 --deck-name "Cell Biology" -o cells.apkg

  # Cards from pasted notes, JSON summary on stdout
  ankidex generate --text "Osmosis is ..." -o notes.apkg --json

  # List the cards inside a deck (no API key needed)
  ankidex inspect cells.apkg

ENVIRONMENT VARIABLES:
  GEMINI_API_KEY      Google Gemini API key (form field api_key overrides it per request)
  ANKIDEX_MODEL       Override model ID (default: gemini-2.0-flash)
  PDFIUM_LIB_PATH     Path to libpdfium; otherwise ./ then the system library
  RUST_LOG            Log filter, e.g. ankidex=debug

SETUP:
  1. Set API key:     export GEMINI_API_KEY=...
  2. Start:           ankidex serve
"#;

/// Generate Anki flashcard decks from PDFs and notes with Google Gemini.
#[derive(Parser, Debug)]
#[command(
    name = "ankidex",
    version,
    about = "Generate Anki flashcard decks from PDFs and notes with Google Gemini",
    arg_required_else_help = true,
    color = clap::ColorChoice::Auto,
    after_long_help = AFTER_HELP
)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable DEBUG-level tracing logs.
    #[arg(short, long, global = true, env = "ANKIDEX_VERBOSE")]
    verbose: bool,

    /// Suppress all output except errors.
    #[arg(short, long, global = true, env = "ANKIDEX_QUIET")]
    quiet: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the web app.
    Serve(ServeArgs),
    /// Generate one deck from the terminal.
    Generate(GenerateArgs),
    /// List the decks and cards inside an .apkg file.
    Inspect(InspectArgs),
}

/// Model options shared by `serve` and `generate`.
#[derive(Args, Debug)]
struct ModelArgs {
    /// Gemini API key used when a request does not bring its own.
    #[arg(long, env = "GEMINI_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Gemini model ID.
    #[arg(long, env = "ANKIDEX_MODEL", default_value = "gemini-2.0-flash")]
    model: String,

    /// Sampling temperature (0.0–2.0).
    #[arg(long, env = "ANKIDEX_TEMPERATURE", default_value_t = 0.4)]
    temperature: f32,

    /// Max model output tokens.
    #[arg(long, env = "ANKIDEX_MAX_TOKENS", default_value_t = 8192)]
    max_tokens: u32,

    /// Model call timeout in seconds.
    #[arg(long, env = "ANKIDEX_API_TIMEOUT", default_value_t = 60)]
    api_timeout: u64,

    /// Retries on timeouts, rate limits and 5xx responses.
    #[arg(long, env = "ANKIDEX_MAX_RETRIES", default_value_t = 0)]
    max_retries: u32,

    /// Gemini API base URL.
    #[arg(long, env = "ANKIDEX_API_BASE", default_value = ankidex::config::DEFAULT_API_BASE)]
    api_base: String,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Interface to bind.
    #[arg(long, env = "ANKIDEX_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// Port to bind.
    #[arg(long, env = "ANKIDEX_PORT", default_value_t = 5000)]
    port: u16,

    /// Directory for generated decks (default: $TMPDIR/ankidex).
    #[arg(long, env = "ANKIDEX_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,

    /// Delete decks older than this many hours (0 keeps them forever).
    #[arg(long, env = "ANKIDEX_KEEP_HOURS", default_value_t = 24)]
    keep_hours: u64,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct GenerateArgs {
    /// PDF file to read.
    #[arg(long)]
    pdf: Option<PathBuf>,

    /// Source text, appended after the PDF text.
    #[arg(long, conflicts_with = "text_file")]
    text: Option<String>,

    /// Read source text from this file.
    #[arg(long)]
    text_file: Option<PathBuf>,

    /// Number of cards to request.
    #[arg(short = 'n', long, default_value_t = 10)]
    num_cards: usize,

    /// Deck title shown in Anki.
    #[arg(long, default_value = ankidex::config::DEFAULT_DECK_NAME)]
    deck_name: String,

    /// Where to write the .apkg file.
    #[arg(short, long)]
    output: PathBuf,

    /// Print the cards and stats as JSON on stdout.
    #[arg(long)]
    json: bool,

    #[command(flatten)]
    model: ModelArgs,
}

#[derive(Args, Debug)]
struct InspectArgs {
    /// The .apkg file to read.
    deck: PathBuf,

    /// Print as JSON.
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // ── Logging setup ────────────────────────────────────────────────────
    let filter = if cli.verbose {
        "debug"
    } else if cli.quiet {
        "error"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(io::stderr)
        .init();

    match cli.command {
        Command::Serve(args) => run_serve(args).await,
        Command::Generate(args) => run_generate(args, cli.quiet).await,
        Command::Inspect(args) => run_inspect(args),
    }
}

async fn run_serve(args: ServeArgs) -> Result<()> {
    let config = build_config(&args.model)?;
    let mut server_config = ServerConfig {
        bind: SocketAddr::new(args.host, args.port),
        deck_ttl: (args.keep_hours > 0).then(|| Duration::from_secs(args.keep_hours * 3600)),
        ..ServerConfig::default()
    };
    if let Some(dir) = args.output_dir {
        server_config.output_dir = dir;
    }

    server::serve(config, server_config)
        .await
        .context("Server failed")
}

async fn run_generate(args: GenerateArgs, quiet: bool) -> Result<()> {
    if args.pdf.is_none() && args.text.is_none() && args.text_file.is_none() {
        bail!("Nothing to generate from: pass --pdf, --text or --text-file");
    }
    let config = build_config(&args.model)?;
    let provider = GeminiProvider::new(&config).context("Failed to create Gemini client")?;

    let mut builder = GenerationRequest::builder()
        .num_cards(args.num_cards)
        .deck_name(&args.deck_name);
    if let Some(ref path) = args.pdf {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        builder = builder.pdf(bytes);
    }
    if let Some(text) = args.text {
        builder = builder.text(text);
    } else if let Some(ref path) = args.text_file {
        let text = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()))?;
        builder = builder.text(text);
    }

    let spinner = (!quiet && !args.json).then(|| {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {prefix:.bold}  {msg}  {elapsed}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏", "⠿"]),
        );
        bar.set_prefix("Generating");
        bar.set_message(format!("{} cards with {}", args.num_cards, config.model));
        bar.enable_steady_tick(Duration::from_millis(80));
        bar
    });

    let result = generate(builder.build(), &provider, &config).await;
    if let Some(ref bar) = spinner {
        bar.finish_and_clear();
    }
    let output = result.context("Generation failed")?;

    write_apkg(&output.deck, &args.output)
        .await
        .context("Failed to write deck")?;

    if args.json {
        let json = serde_json::to_string_pretty(&output).context("Failed to serialise output")?;
        println!("{json}");
    } else if !quiet {
        eprintln!(
            "{}  {} cards  {}ms  →  {}",
            green("✔"),
            output.flashcards.len(),
            output.stats.total_duration_ms,
            bold(&args.output.display().to_string()),
        );
        if !output.rejected.is_empty() {
            eprintln!(
                "   {} {} malformed entries dropped",
                cyan("⚠"),
                output.rejected.len()
            );
        }
        eprintln!(
            "   {} tokens in  /  {} tokens out",
            dim(&output.stats.prompt_tokens.to_string()),
            dim(&output.stats.output_tokens.to_string()),
        );
    }
    Ok(())
}

fn run_inspect(args: InspectArgs) -> Result<()> {
    let bytes = std::fs::read(&args.deck)
        .with_context(|| format!("Failed to read {}", args.deck.display()))?;
    let contents = read_apkg(&bytes).context("Not a readable .apkg file")?;

    if args.json {
        let json = serde_json::json!({
            "decks": contents.deck_names,
            "cards": contents.cards,
        });
        println!(
            "{}",
            serde_json::to_string_pretty(&json).context("Failed to serialise deck")?
        );
        return Ok(());
    }

    println!("File:   {}", args.deck.display());
    println!("Decks:  {}", contents.deck_names.join(", "));
    println!("Cards:  {}", contents.cards.len());
    for (i, card) in contents.cards.iter().enumerate() {
        println!();
        println!("{} {}", bold(&format!("{:>3}.", i + 1)), card.question);
        println!("     {}", dim(&card.answer));
    }
    Ok(())
}

fn build_config(args: &ModelArgs) -> Result<GenerationConfig> {
    let mut builder = GenerationConfig::builder()
        .model(&args.model)
        .temperature(args.temperature)
        .max_output_tokens(args.max_tokens)
        .api_timeout_secs(args.api_timeout)
        .max_retries(args.max_retries)
        .api_base(&args.api_base);
    if let Some(ref key) = args.api_key {
        builder = builder.api_key(key);
    }
    builder.build().context("Invalid configuration")
}
