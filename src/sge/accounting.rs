//! Completion checks against qacct records.
//!
//! qacct is slow (tens of seconds on a busy cluster) and job numbers wrap around, so a single
//! `qacct -j` can return records of unrelated historic jobs. Records are filtered by owner and age
//! before the remaining one is checked.

use std::collections::BTreeMap;

use chrono::{Local, NaiveDateTime};
use log::{debug, warn};
use serde::Serialize;

use crate::error::{QsubError, Result};
use crate::sge::job::Job;
use crate::sge::monitor::Monitor;
use crate::sge::parse::merge_entries;

/// One qacct record as key/value pairs
pub type Record = BTreeMap<String, String>;

/// Which qacct records can belong to the job being validated
#[derive(Clone, Debug)]
pub struct RecordFilter {
    pub owner: String,
    /// Drop records that ended more than this many days before `now`
    pub days_limit: Option<i64>,
    pub now: NaiveDateTime,
}

impl RecordFilter {
    /// Records of the current user from the last week
    pub fn current_user() -> RecordFilter {
        let owner = std::env::var("USER")
            .or_else(|_| std::env::var("LOGNAME"))
            .unwrap_or_default();
        RecordFilter { owner, days_limit: Some(7), now: Local::now().naive_local() }
    }

    fn keep(&self, record: &Record) -> bool {
        if record.get("owner").map(String::as_str) != Some(self.owner.as_str()) {
            return false;
        }
        let Some(limit) = self.days_limit else {
            return true;
        };
        let Some(end_time) = record.get("end_time") else {
            return true;
        };
        match parse_timestamp(end_time) {
            // whole days elapsed, so a 7 day limit keeps anything under 8 days old
            Some(end) => (self.now - end).num_days() <= limit,
            None => {
                warn!("Can't read qacct end_time {end_time:?}, keeping record");
                true
            }
        }
    }
}

/// Outcome of one completion check
#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct Check {
    pub name: &'static str,
    pub passed: bool,
    pub note: String,
}

/// All checks run for a job, in order. Checking stops at the first check that makes the rest
/// meaningless.
#[derive(Clone, Debug, Default, Serialize)]
pub struct Validation {
    pub checks: Vec<Check>,
}

impl Validation {
    fn push(&mut self, name: &'static str, passed: bool, note: String) -> bool {
        self.checks.push(Check { name, passed, note });
        passed
    }

    pub fn get(&self, name: &str) -> Option<&Check> {
        self.checks.iter().find(|c| c.name == name)
    }

    /// Valid when both the failed flag and exit status were checked and passed
    pub fn is_valid(&self) -> bool {
        let passed = |name| self.get(name).map(|c| c.passed).unwrap_or(false);
        passed("failed_status_0") && passed("exit_status_0")
    }
}

/// Split qacct output into records.
///
/// Records are separated by lines of `=`; each line inside is a key, whitespace, then a value.
pub fn parse_qacct(stdout: &str) -> Vec<Record> {
    let mut records = Vec::new();
    let mut current = Record::new();
    for line in stdout.lines() {
        let trimmed = line.trim();
        if !trimmed.is_empty() && trimmed.chars().all(|c| c == '=') {
            if !current.is_empty() {
                records.push(std::mem::take(&mut current));
            }
            continue;
        }
        if let Some((key, value)) = trimmed.split_once(char::is_whitespace) {
            current.insert(key.to_string(), value.trim().to_string());
        }
    }
    if !current.is_empty() {
        records.push(current);
    }
    records
}

/// The `failed` field can carry a description, e.g. `100 : assumedly after job`
fn leading_number(value: &str) -> Option<i64> {
    value.split_whitespace().next()?.parse().ok()
}

fn parse_timestamp(value: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 3] = ["%a %b %e %H:%M:%S %Y", "%m/%d/%Y %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];
    FORMATS.iter().find_map(|format| NaiveDateTime::parse_from_str(value.trim(), format).ok())
}

/// Run the checks over qacct output that was already fetched
pub fn check_records(stdout: &str, filter: &RecordFilter, validation: &mut Validation) {
    let records: Vec<Record> = parse_qacct(stdout).into_iter().filter(|r| filter.keep(r)).collect();
    debug!("{} qacct records left after filtering", records.len());

    if !validation.push(
        "has_qacct_entries",
        !records.is_empty(),
        format!("{} record(s) left after filtering by owner {:?} and age", records.len(), filter.owner),
    ) {
        return;
    }
    if !validation.push(
        "has_only_one_qacct_entry",
        records.len() == 1,
        "exactly one record must remain to identify the job".to_string(),
    ) {
        return;
    }

    let record = &records[0];
    let failed = record.get("failed").and_then(|v| leading_number(v));
    validation.push(
        "failed_status_0",
        failed == Some(0),
        format!("qacct failed value was {}; >0 means the job failed", describe(record.get("failed"))),
    );
    let exit_status = record.get("exit_status").and_then(|v| leading_number(v));
    validation.push(
        "exit_status_0",
        exit_status == Some(0),
        format!("qacct exit_status was {}; >0 means the job failed", describe(record.get("exit_status"))),
    );
}

fn describe(value: Option<&String>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "missing".to_string())
}

impl Monitor {
    /// Check a finished job's accounting records.
    ///
    /// The job must have left the queue; otherwise only the presence check is reported.
    pub fn validate(&self, job: &Job, filter: &RecordFilter) -> Result<Validation> {
        let mut validation = Validation::default();

        let listing = self.listing()?;
        let listed = merge_entries(job.id(), &listing).is_some();
        let note = match listed {
            true => "job is still in qstat and can't be validated yet",
            false => "job is not in qstat",
        };
        if !validation.push("qstat_absent", !listed, note.to_string()) {
            return Ok(validation);
        }

        let output = self
            .scheduler()
            .accounting(job.id())
            .map_err(|err| QsubError::Accounting(format!("can't run qacct: {err}")))?;
        if !output.success {
            // qacct exits non-zero when it has no record for the job yet
            validation.push("has_qacct_entries", false, format!("qacct {}", output.describe()));
            return Ok(validation);
        }
        check_records(&output.stdout, filter, &mut validation);
        Ok(validation)
    }
}
