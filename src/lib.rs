//! Block-level, offline file deduplicator for copy-on-write filesystems.
//!
//! The binary (`main.rs`) is a thin CLI wrapper; everything it drives is
//! exposed here so integration tests can exercise `engine::Engine` directly
//! without going through a subprocess.

pub mod bitset;
pub mod cli;
pub mod engine;
pub mod error;
pub mod hashstorage;
pub mod intfile;
pub mod kernel;
pub mod progress;
pub mod varint;
