//! Submitted jobs are recorded in a SQLite database

/// Connect to a SQLite database
pub mod open;
/// Record and reload jobs
pub mod job;
