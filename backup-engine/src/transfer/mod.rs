//! Streaming helpers for moving archive content.

pub mod hashing_reader;

pub use hashing_reader::{sha256_hex, HashingReader};
