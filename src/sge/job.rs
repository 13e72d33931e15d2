use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Serialize;

/// Numeric job identifier assigned by the scheduler at submission
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(JobId)
    }
}

/// Client side view of a job's progress.
///
/// States only move forward: Pending, then Running, then one of the terminal states. `Unknown`
/// is reported when the scheduler shows a code we can't interpret, and never moves a job.
/// `Unsubmitted` is only used for requests staged in the ledger that haven't reached qsub yet.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Unsubmitted,
    Pending,
    Running,
    Completed,
    Failed,
    Unknown,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Position in the forward progression, `None` for `Unknown`
    pub fn rank(&self) -> Option<u8> {
        match self {
            JobState::Unsubmitted => Some(0),
            JobState::Pending => Some(1),
            JobState::Running => Some(2),
            JobState::Completed | JobState::Failed => Some(3),
            JobState::Unknown => None,
        }
    }

    /// db columns are lower case
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Unsubmitted => "unsubmitted",
            JobState::Pending => "pending",
            JobState::Running => "running",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unsubmitted" => Ok(JobState::Unsubmitted),
            "pending" => Ok(JobState::Pending),
            "running" => Ok(JobState::Running),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "unknown" => Ok(JobState::Unknown),
            other => Err(format!("unrecognised job state {other}")),
        }
    }
}

/// The result of a single poll
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct JobStatus {
    pub id: JobId,
    pub state: JobState,
    /// Raw qstat state code, only set while the job is listed
    pub code: Option<String>,
    /// Why a terminal state was chosen
    pub note: Option<String>,
}

/// A job the scheduler has accepted.
///
/// Only built from a successful submission, from earlier submission output, or from the ledger,
/// so the identifier is always real. Hold on to it between polls: the identifier is the only
/// handle to the external job.
#[derive(Clone, Debug, Serialize)]
pub struct Job {
    id: JobId,
    name: String,
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    joined: bool,
    state: JobState,
    note: Option<String>,
}

impl Job {
    /// A freshly submitted job with SGE's default log file names in the given directories
    pub fn new(id: JobId, name: &str, stdout_dir: &Path, stderr_dir: &Path, joined: bool) -> Job {
        let stdout_path = stdout_dir.join(format!("{name}.o{id}"));
        let stderr_path = match joined {
            true => stdout_path.clone(),
            false => stderr_dir.join(format!("{name}.e{id}")),
        };
        Job {
            id,
            name: name.to_string(),
            stdout_path,
            stderr_path,
            joined,
            state: JobState::Pending,
            note: None,
        }
    }

    /// Rebuild a job recorded earlier, e.g. by the ledger
    pub fn restore(
        id: JobId,
        name: String,
        stdout_path: PathBuf,
        stderr_path: PathBuf,
        state: JobState,
    ) -> Job {
        let joined = stdout_path == stderr_path;
        Job { id, name, stdout_path, stderr_path, joined, state, note: None }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn stdout_path(&self) -> &Path {
        &self.stdout_path
    }

    /// With joined output this is the same file as stdout
    pub fn stderr_path(&self) -> &Path {
        &self.stderr_path
    }

    pub fn is_joined(&self) -> bool {
        self.joined
    }

    /// Status as of the last poll
    pub fn status(&self) -> JobStatus {
        JobStatus { id: self.id, state: self.state, code: None, note: self.note.clone() }
    }

    pub(crate) fn advance(&mut self, state: JobState, note: Option<String>) {
        self.state = state;
        self.note = note;
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} ({})", self.id, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths_follow_sge_naming() {
        let job = Job::new(JobId(4088513), "python", Path::new("/logs/out"), Path::new("/logs/err"), false);
        assert_eq!(job.stdout_path(), Path::new("/logs/out/python.o4088513"));
        assert_eq!(job.stderr_path(), Path::new("/logs/err/python.e4088513"));
        assert_eq!(job.state(), JobState::Pending);
    }

    #[test]
    fn joined_output_uses_stdout_for_errors() {
        let job = Job::new(JobId(7), "align", Path::new("/logs"), Path::new("/elsewhere"), true);
        assert!(job.is_joined());
        assert_eq!(job.stderr_path(), job.stdout_path());
    }

    #[test]
    fn unknown_has_no_rank() {
        assert!(JobState::Pending.rank() < JobState::Running.rank());
        assert_eq!(JobState::Completed.rank(), JobState::Failed.rank());
        assert_eq!(JobState::Unknown.rank(), None);
    }

    #[test]
    fn state_names_parse_back() {
        for state in [JobState::Unsubmitted, JobState::Running, JobState::Failed] {
            assert_eq!(state.as_str().parse::<JobState>(), Ok(state));
        }
        assert!("Eqw".parse::<JobState>().is_err());
    }
}
