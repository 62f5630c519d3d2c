//! Pipeline stages for text-to-deck generation.
//!
//! Each submodule implements exactly one transformation step, so each can be
//! tested without the others (the coercer and serializer need neither pdfium
//! nor the network).
//!
//! ## Data Flow
//!
//! ```text
//! extract ──▶ llm ──▶ coerce ──▶ deck
//! (pdfium)   (Gemini)  (JSON)    (.apkg)
//! ```
//!
//! 1. [`extract`] — pull page text out of an uploaded PDF; runs in
//!    `spawn_blocking` because pdfium blocks
//! 2. [`llm`]     — one completion call with timeout and optional retry; the
//!    only stage with network I/O
//! 3. [`coerce`]  — turn the model's text into validated flashcards, recording
//!    the entries it drops
//! 4. [`deck`]    — package the cards as an Anki collection inside a zip

pub mod coerce;
pub mod deck;
pub mod extract;
pub mod llm;
