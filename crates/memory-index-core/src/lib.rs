//! # memory-index core
//!
//! Pure logic shared by the memory index: data models, markdown chunking,
//! vector utilities, the FTS query builder, hybrid score merging, and
//! session transcript parsing.
//!
//! This crate has no tokio, sqlx, or network dependencies. Everything here
//! is deterministic and synchronous so it can be tested in isolation.

pub mod chunk;
pub mod embedding;
pub mod hybrid;
pub mod models;
pub mod transcript;
