//! Infrastructure layer for weft.
//!
//! Contains implementations of the repository traits defined in `weft-core`
//! (SQLite storage with split reader/writer pools) and the loader for the
//! engine configuration file.

pub mod config;
pub mod sqlite;
