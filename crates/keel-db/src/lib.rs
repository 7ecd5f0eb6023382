//! Storage adapter for the keel kernel.
//!
//! Wraps PostgreSQL behind typed row models and query functions. Row-level
//! locking (`FOR UPDATE SKIP LOCKED`) backs the atomic claim protocol;
//! status transitions use optimistic locking on the expected current status.

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
