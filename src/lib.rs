//! Chainstore - versioned snapshot storage
//!
//! Stores entities as append-only chains of immutable snapshots in SQL
//! tables, with optimistic concurrency on every update, atomic
//! multi-collection transactions and in-process change notification.

pub mod config;
pub mod linking;
pub mod storage;
pub mod utils;
