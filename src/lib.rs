#![forbid(unsafe_code)]

//! Shared modules for the ytbatch binary.
//!
//! The crate is intentionally small; it exposes the pieces the CLI wires
//! together so each one can be exercised in isolation: config resolution,
//! URL list handling, the yt-dlp invocation shim, the worker pool, and the
//! progress display.

pub mod config;
pub mod progress;
pub mod runner;
pub mod urls;
pub mod ytdlp;
