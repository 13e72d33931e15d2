//! Submit jobs to Sun Grid Engine and follow them until they finish

/// Job identifiers, states and log file locations
pub mod job;
/// Job requests are deserialised from validated JSON or built in code
pub mod job_request;
/// Render job requests into qsub scripts
pub mod script;
/// Read qsub, qstat and qacct output
pub mod parse;
/// Run the SGE command line tools
pub mod client;
/// Submission, polling and waiting
pub mod monitor;
/// Validate finished jobs with qacct
pub mod accounting;

#[cfg(test)]
pub(crate) mod testing;
