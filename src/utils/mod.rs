//! Pure utility functions.

pub mod bootstrap;
pub mod retry;
