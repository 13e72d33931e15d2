//! Job ledger
//!
//! Requests are staged (state `unsubmitted`) before qsub runs and updated once the scheduler has
//! assigned an identifier, so a crash between the two leaves a visible trace. Later invocations
//! reload jobs by their SGE identifier to keep polling them.
//!
//! SGE job numbers wrap around, so an identifier can come back for an unrelated job. The newest
//! job always takes over the identifier and the stale row is dropped.

use std::path::PathBuf;

use log::{info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;
use crate::sge::job::{Job, JobId, JobState};
use crate::sge::job_request::JobRequest;

pub struct Ledger {
    conn: Connection,
}

impl Ledger {
    pub fn new(conn: Connection) -> Ledger {
        Ledger { conn }
    }

    /// Record a request before submission, returning its row id
    pub fn stage(&self, request: &JobRequest) -> Result<i64> {
        let json = serde_json::to_string(request)?;
        self.conn.execute(
            "INSERT INTO job (name, request, state) VALUES (?1, ?2, ?3)",
            params![request.name, json, JobState::Unsubmitted.as_str()],
        )?;
        let row = self.conn.last_insert_rowid();
        info!("Staged job request {row} ({})", request.name);
        Ok(row)
    }

    /// Attach the scheduler's identifier to a staged request
    pub fn record_submission(&self, row: i64, job: &Job) -> Result<()> {
        info!("Updating {row} with SGE id {}", job.id());
        let tx = self.conn.unchecked_transaction()?;
        let stale = tx.execute("DELETE FROM job WHERE sge_id = ?1 AND id != ?2", params![job.id().0 as i64, row])?;
        if stale > 0 {
            warn!("SGE reused job id {}, dropping the old ledger entry", job.id());
        }
        tx.execute(
            "UPDATE job SET sge_id = ?1, name = ?2, stdout_path = ?3, stderr_path = ?4, state = ?5,
                 updated_at = CURRENT_TIMESTAMP
             WHERE id = ?6",
            params![
                job.id().0 as i64,
                job.name(),
                job.stdout_path().to_string_lossy().into_owned(),
                job.stderr_path().to_string_lossy().into_owned(),
                job.state().as_str(),
                row
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record a job submitted by some other program.
    ///
    /// Tracking the same job again keeps its recorded progress; a different job under the same id
    /// replaces the old row.
    pub fn track(&self, job: &Job) -> Result<()> {
        let stdout_path = job.stdout_path().to_string_lossy().into_owned();
        let stderr_path = job.stderr_path().to_string_lossy().into_owned();
        let tx = self.conn.unchecked_transaction()?;
        let existing = tx
            .query_row(
                "SELECT name, stdout_path, stderr_path FROM job WHERE sge_id = ?1",
                params![job.id().0 as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                    ))
                },
            )
            .optional()?;

        match existing {
            Some((name, Some(out), Some(err))) if name == job.name() && out == stdout_path && err == stderr_path => {
                info!("Job {job} is already tracked");
                return Ok(());
            }
            Some(_) => {
                warn!("SGE reused job id {}, dropping the old ledger entry", job.id());
                tx.execute("DELETE FROM job WHERE sge_id = ?1", params![job.id().0 as i64])?;
            }
            None => {}
        }

        info!("Tracking job {job}");
        tx.execute(
            "INSERT INTO job (sge_id, name, stdout_path, stderr_path, state) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![job.id().0 as i64, job.name(), stdout_path, stderr_path, job.state().as_str()],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn update_state(&self, job: &Job) -> Result<()> {
        let status = job.status();
        self.conn.execute(
            "UPDATE job SET state = ?1, note = ?2, updated_at = CURRENT_TIMESTAMP WHERE sge_id = ?3",
            params![status.state.as_str(), status.note, job.id().0 as i64],
        )?;
        Ok(())
    }

    /// Reload a job by its SGE identifier
    pub fn load(&self, id: JobId) -> Result<Option<Job>> {
        let row = self
            .conn
            .query_row(
                "SELECT name, stdout_path, stderr_path, state FROM job WHERE sge_id = ?1",
                params![id.0 as i64],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        Ok(row.map(|(name, stdout_path, stderr_path, state)| {
            let state = state.parse().unwrap_or_else(|err| {
                warn!("Job {id} has unreadable state in the ledger ({err}), treating it as unknown");
                JobState::Unknown
            });
            Job::restore(id, name, PathBuf::from(stdout_path), PathBuf::from(stderr_path), state)
        }))
    }

    /// Ids of every job not yet seen finishing
    pub fn unfinished(&self) -> Result<Vec<JobId>> {
        let mut stmt = self.conn.prepare(
            "SELECT sge_id FROM job WHERE sge_id IS NOT NULL AND state NOT IN ('completed', 'failed') ORDER BY sge_id",
        )?;
        let rows = stmt.query_map([], |row| row.get::<_, i64>(0))?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(JobId(row? as u64));
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::db::open::create_schema;

    fn ledger() -> Ledger {
        let conn = Connection::open_in_memory().unwrap();
        create_schema(&conn).unwrap();
        Ledger::new(conn)
    }

    #[test]
    fn staged_request_is_not_loadable_until_submitted() {
        let ledger = ledger();
        let row = ledger.stage(&JobRequest::new("echo foo")).unwrap();
        assert!(ledger.load(JobId(55)).unwrap().is_none());

        let job = Job::new(JobId(55), "qsubwrap", Path::new("/logs"), Path::new("/logs"), false);
        ledger.record_submission(row, &job).unwrap();

        let loaded = ledger.load(JobId(55)).unwrap().unwrap();
        assert_eq!(loaded.stderr_path(), Path::new("/logs/qsubwrap.e55"));
        assert_eq!(loaded.state(), JobState::Pending);
        assert!(!loaded.is_joined());
    }

    #[test]
    fn state_updates_are_persisted() {
        let ledger = ledger();
        let mut job = Job::new(JobId(8), "a", Path::new("/logs"), Path::new("/logs"), true);
        ledger.track(&job).unwrap();
        // tracking the same job twice is harmless
        ledger.track(&job).unwrap();
        assert_eq!(ledger.unfinished().unwrap(), vec![JobId(8)]);

        job.advance(JobState::Completed, Some("left the queue".to_string()));
        ledger.update_state(&job).unwrap();

        let loaded = ledger.load(JobId(8)).unwrap().unwrap();
        assert_eq!(loaded.state(), JobState::Completed);
        assert!(loaded.is_joined());
        assert!(ledger.unfinished().unwrap().is_empty());

        // re-tracking the same job doesn't reset its progress
        ledger.track(&Job::new(JobId(8), "a", Path::new("/logs"), Path::new("/logs"), true)).unwrap();
        assert_eq!(ledger.load(JobId(8)).unwrap().unwrap().state(), JobState::Completed);
    }

    #[test]
    fn reused_id_on_submission_replaces_old_job() {
        let ledger = ledger();
        let mut old = Job::new(JobId(55), "old", Path::new("/logs"), Path::new("/logs"), false);
        old.advance(JobState::Completed, None);
        ledger.track(&old).unwrap();

        let row = ledger.stage(&JobRequest::new("echo again")).unwrap();
        let new = Job::new(JobId(55), "new", Path::new("/scratch"), Path::new("/scratch"), false);
        ledger.record_submission(row, &new).unwrap();

        let loaded = ledger.load(JobId(55)).unwrap().unwrap();
        assert_eq!(loaded.name(), "new");
        assert_eq!(loaded.stdout_path(), Path::new("/scratch/new.o55"));
        assert_eq!(loaded.state(), JobState::Pending);
        assert_eq!(ledger.unfinished().unwrap(), vec![JobId(55)]);
    }

    #[test]
    fn reused_id_on_tracking_replaces_old_job() {
        let ledger = ledger();
        let mut old = Job::new(JobId(55), "old", Path::new("/logs"), Path::new("/logs"), false);
        old.advance(JobState::Failed, Some("error output".to_string()));
        ledger.track(&old).unwrap();

        let new = Job::new(JobId(55), "new", Path::new("/logs"), Path::new("/logs"), true);
        ledger.track(&new).unwrap();

        let loaded = ledger.load(JobId(55)).unwrap().unwrap();
        assert_eq!(loaded.name(), "new");
        assert_eq!(loaded.state(), JobState::Pending);
        assert!(loaded.is_joined());
    }

    #[test]
    fn unreadable_state_loads_as_unknown() {
        let ledger = ledger();
        ledger.track(&Job::new(JobId(3), "a", Path::new("/logs"), Path::new("/logs"), false)).unwrap();
        ledger.conn.execute("UPDATE job SET state = 'exploded' WHERE sge_id = 3", []).unwrap();

        assert_eq!(ledger.load(JobId(3)).unwrap().unwrap().state(), JobState::Unknown);
        assert_eq!(ledger.unfinished().unwrap(), vec![JobId(3)]);
    }
}
