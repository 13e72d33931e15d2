//! Process logging setup and the job lifecycle event sink
use std::fs::File;
use std::path::Path;
use std::time::Duration;

use env_logger::{Builder, Env, Target};
use log::{log, Level, LevelFilter};

use crate::sge::job::{JobId, JobState};

/// Set up env_logger once at process start.
///
/// `RUST_LOG` wins over the verbosity flag. With a log file, records go to the file instead of
/// stderr.
pub fn init(verbosity: u8, log_file: Option<&Path>) -> std::io::Result<()> {
    let level = match verbosity {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    let mut builder = Builder::from_env(Env::default().default_filter_or(level.as_str()));
    if let Some(path) = log_file {
        builder.target(Target::Pipe(Box::new(File::create(path)?)));
    }
    builder.init();
    Ok(())
}

/// Something worth recording about a job
#[derive(Clone, Debug, PartialEq)]
pub enum JobEvent {
    Submitted { id: JobId, name: String },
    StateChanged { id: JobId, from: JobState, to: JobState },
    UnrecognisedState { id: JobId, code: String },
    /// The job left the queue listing and is being re-checked before classification
    Vanished { id: JobId, settle: Duration },
    Reappeared { id: JobId },
    Regression { id: JobId, from: JobState, to: JobState },
    Finished { id: JobId, state: JobState, note: Option<String> },
    TimedOut { id: JobId, last: JobState },
    Killed { ids: Vec<JobId> },
}

/// Receives job lifecycle events from a monitor
pub trait EventSink {
    fn record(&self, event: &JobEvent);
}

/// Forward events to the `log` facade under a fixed target
pub struct LogSink {
    target: String,
}

impl LogSink {
    pub fn new(target: &str) -> LogSink {
        LogSink { target: target.to_string() }
    }
}

impl Default for LogSink {
    fn default() -> Self {
        LogSink::new("qsub")
    }
}

impl EventSink for LogSink {
    fn record(&self, event: &JobEvent) {
        let target = self.target.as_str();
        match event {
            JobEvent::Submitted { id, name } => log!(target: target, Level::Info, "Submitted job {id} ({name})"),
            JobEvent::StateChanged { id, from, to } => log!(target: target, Level::Info, "Job {id}: {from} -> {to}"),
            JobEvent::UnrecognisedState { id, code } => {
                log!(target: target, Level::Warn, "Job {id} has unrecognised qstat state {code}")
            }
            JobEvent::Vanished { id, settle } => {
                log!(target: target, Level::Debug, "Job {id} left the queue, checking again in {settle:?}")
            }
            JobEvent::Reappeared { id } => log!(target: target, Level::Warn, "Job {id} is listed again after vanishing"),
            JobEvent::Regression { id, from, to } => {
                log!(target: target, Level::Error, "Job {id} went backwards from {from} to {to}")
            }
            JobEvent::Finished { id, state, note } => match (state, note) {
                (JobState::Completed, _) => log!(target: target, Level::Info, "Job {id} completed"),
                (_, Some(note)) => log!(target: target, Level::Error, "Job {id} {state}: {note}"),
                (_, None) => log!(target: target, Level::Error, "Job {id} {state}"),
            },
            JobEvent::TimedOut { id, last } => {
                log!(target: target, Level::Warn, "Gave up waiting on job {id}, last seen {last}; it was not cancelled")
            }
            JobEvent::Killed { ids } => log!(target: target, Level::Info, "Deleted jobs {ids:?}"),
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    /// Keeps every event for assertions
    #[derive(Clone, Default)]
    pub struct RecordingSink {
        pub events: Rc<RefCell<Vec<JobEvent>>>,
    }

    impl RecordingSink {
        pub fn events(&self) -> Vec<JobEvent> {
            self.events.borrow().clone()
        }
    }

    impl EventSink for RecordingSink {
        fn record(&self, event: &JobEvent) {
            self.events.borrow_mut().push(event.clone());
        }
    }
}
