//! jobplane dispatcher library.
//!
//! This crate primarily ships a `dispatcher` binary, but exposes a small
//! library surface for integration testing and reuse.

pub mod config;
pub mod db;
pub mod scheduler;
