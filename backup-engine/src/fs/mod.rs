//! File system helpers: tree walking and timestamp preservation.

pub mod metadata;
pub mod walker;
