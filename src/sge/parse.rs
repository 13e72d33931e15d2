//! Parsing of scheduler tool output.
//!
//! qsub and qstat print text meant for people. Everything that depends on that text lives behind
//! [OutputParser], so a structured output mode can replace [SgeText] without touching the monitor.

use std::sync::OnceLock;

use regex::Regex;

use crate::sge::job::{JobId, JobState};

/// What qsub reported for one accepted submission
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub id: JobId,
    pub name: Option<String>,
}

/// A submission confirmation found in output printed by another program
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub id: JobId,
    pub name: String,
    /// the qsub command echoed before the confirmation asked for `-j y`
    pub joined: bool,
}

/// One row of the active queue listing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: JobId,
    pub code: String,
    pub state: JobState,
}

pub trait OutputParser {
    /// The job accepted by a single qsub call, `None` if the output holds no identifier
    fn submission(&self, stdout: &str) -> Option<Submission>;

    /// Every submission confirmation found in arbitrary program output
    fn submissions(&self, text: &str) -> Vec<Confirmation>;

    /// Active jobs listed by qstat. Errors describe the first row that can't be read.
    fn listing(&self, stdout: &str) -> Result<Vec<QueueEntry>, String>;
}

/// Plain text output of SGE's qsub and qstat
#[derive(Debug, Default, Clone, Copy)]
pub struct SgeText;

fn confirmation() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"Your job(?:-array)?\s+(\d+)(?:\.[0-9:\-]+)?\s+\("(.*)"\)\s+has been submitted"#)
            .expect("valid regex")
    })
}

fn qsub_command() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\bqsub\s").expect("valid regex"))
}

fn join_flag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s-j\s+(?i:y|yes|true)(?:\s|$)").expect("valid regex"))
}

fn loose_job_number() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\bjob(?:-array)?\s+(\d+)\b").expect("valid regex"))
}

impl OutputParser for SgeText {
    fn submission(&self, stdout: &str) -> Option<Submission> {
        // the confirmation is normally the last line, but site wrappers may print more around it
        if let Some(found) = self.submissions(stdout).pop() {
            return Some(Submission { id: found.id, name: Some(found.name) });
        }
        let caps = loose_job_number().captures_iter(stdout).last()?;
        let id = caps[1].parse().ok()?;
        Some(Submission { id, name: None })
    }

    fn submissions(&self, text: &str) -> Vec<Confirmation> {
        let mut found = Vec::new();
        // programs often echo the qsub command line just before its confirmation
        let mut joined = false;
        for line in text.lines() {
            if let Some(caps) = confirmation().captures(line) {
                if let Ok(id) = caps[1].parse() {
                    found.push(Confirmation { id, name: caps[2].to_string(), joined });
                }
                joined = false;
            } else if qsub_command().is_match(line) {
                joined = join_flag().is_match(line);
            }
        }
        found
    }

    fn listing(&self, stdout: &str) -> Result<Vec<QueueEntry>, String> {
        let mut entries = Vec::new();
        for line in stdout.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("job-ID") || trimmed.starts_with('-') {
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() < 5 {
                return Err(format!("too few columns in qstat row: {trimmed}"));
            }
            let id: JobId = fields[0]
                .parse()
                .map_err(|_| format!("qstat row doesn't start with a job id: {trimmed}"))?;
            let code = fields[4].to_string();
            let state = state_from_code(&code);
            entries.push(QueueEntry { id, code, state });
        }
        Ok(entries)
    }
}

/// Interpret a qstat state code.
///
/// Any code holding `E` is an error state (`Eqw` never leaves the queue by itself). `d` marks a
/// job being deleted, which says nothing about how it ends. Transferring, running and suspended
/// jobs have all been started; `q`, `w` and `h` are still waiting.
pub fn state_from_code(code: &str) -> JobState {
    if code.contains('E') {
        JobState::Failed
    } else if code.contains('d') {
        JobState::Unknown
    } else if code.contains(['r', 't', 's', 'S', 'T']) {
        JobState::Running
    } else if code.contains(['q', 'w', 'h']) {
        JobState::Pending
    } else {
        JobState::Unknown
    }
}

/// The state to report for a job that may have several rows (array tasks)
pub fn merge_entries<'a>(id: JobId, entries: impl IntoIterator<Item = &'a QueueEntry>) -> Option<&'a QueueEntry> {
    let mut best: Option<&QueueEntry> = None;
    for entry in entries.into_iter().filter(|e| e.id == id) {
        best = match best {
            None => Some(entry),
            Some(current) => Some(worse(current, entry)),
        };
    }
    best
}

// an errored task wins, then the task furthest along
fn worse<'a>(a: &'a QueueEntry, b: &'a QueueEntry) -> &'a QueueEntry {
    if a.state == JobState::Failed {
        return a;
    }
    if b.state == JobState::Failed || b.state.rank() > a.state.rank() {
        return b;
    }
    a
}
