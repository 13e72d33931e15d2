//! Submit shell commands to an SGE cluster with qsub and wait for them to finish.
//!
//! ```no_run
//! use std::time::Duration;
//! use qsubwrap::sge::client::SgeCommands;
//! use qsubwrap::sge::job_request::JobRequest;
//! use qsubwrap::sge::monitor::Monitor;
//!
//! # fn main() -> qsubwrap::error::Result<()> {
//! let monitor = Monitor::new(Box::new(SgeCommands::default()));
//! let mut job = monitor.submit(&JobRequest::new("sleep 10"))?;
//! let status = monitor.wait(&mut job, Duration::from_secs(5), Some(Duration::from_secs(600)))?;
//! println!("{} {}", job, status.state);
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod logging;
pub mod sge;
/// Job ledger stored in SQLite
pub mod db;
pub mod mail;
