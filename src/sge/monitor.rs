use std::fs;
use std::io::ErrorKind;
use std::path::Path;
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::error::{QsubError, Result};
use crate::logging::{EventSink, JobEvent, LogSink};
use crate::sge::client::Scheduler;
use crate::sge::job::{Job, JobState, JobStatus, JobId};
use crate::sge::job_request::JobRequest;
use crate::sge::parse::{merge_entries, OutputParser, QueueEntry, SgeText};

/// Tuning for submission and polling
#[derive(Clone, Debug)]
pub struct MonitorSettings {
    /// How long to wait before re-listing a job that just left the queue
    pub settle: Duration,
    /// How many times to re-list before trusting the job's absence
    pub settle_attempts: u32,
    /// Pause after each submission so bursts don't overwhelm the scheduler
    pub submit_delay: Duration,
    /// Text in a job's logs that marks it as failed even when stderr is empty or joined
    pub error_markers: Vec<String>,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        MonitorSettings {
            settle: Duration::from_secs(2),
            settle_attempts: 1,
            submit_delay: Duration::from_millis(500),
            error_markers: Vec::new(),
        }
    }
}

/// Submits jobs and follows them through the queue by polling qstat.
///
/// Everything is blocking and single threaded: each call spawns at most a handful of external
/// processes and returns once they exit. Nothing here ever cancels a job except [Monitor::kill].
pub struct Monitor {
    scheduler: Box<dyn Scheduler>,
    parser: Box<dyn OutputParser>,
    sink: Box<dyn EventSink>,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(scheduler: Box<dyn Scheduler>) -> Monitor {
        Monitor {
            scheduler,
            parser: Box::new(SgeText),
            sink: Box::new(LogSink::default()),
            settings: MonitorSettings::default(),
        }
    }

    pub fn with_parser(mut self, parser: Box<dyn OutputParser>) -> Monitor {
        self.parser = parser;
        self
    }

    pub fn with_sink(mut self, sink: Box<dyn EventSink>) -> Monitor {
        self.sink = sink;
        self
    }

    pub fn with_settings(mut self, settings: MonitorSettings) -> Monitor {
        self.settings = settings;
        self
    }

    pub(crate) fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Submit a job and return it once qsub has reported its identifier
    pub fn submit(&self, request: &JobRequest) -> Result<Job> {
        request.validate()?;
        let dirs = request.prepare_log_dirs()?;
        let script = request.render(&dirs)?;

        let output = self
            .scheduler
            .submit(&script.content)
            .map_err(|err| QsubError::Submission(format!("can't run qsub: {err}")))?;
        if !output.success {
            return Err(QsubError::Submission(format!("qsub {}", output.describe())));
        }
        let submission = self.parser.submission(&output.stdout).ok_or_else(|| {
            QsubError::Submission(format!("no job id in qsub output: {:?}", output.stdout.trim()))
        })?;

        // log files are named after the name qsub reports, which can differ from the request
        let name = submission.name.unwrap_or_else(|| request.name.clone());
        let job = Job::new(submission.id, &name, &dirs.stdout, &dirs.stderr, request.join_output);
        self.sink.record(&JobEvent::Submitted { id: job.id(), name });

        if !self.settings.submit_delay.is_zero() {
            thread::sleep(self.settings.submit_delay);
        }
        Ok(job)
    }

    /// Rebuild jobs from submission messages printed by other programs.
    ///
    /// `joined` marks every job as writing a single `.o` log; jobs whose echoed qsub command asked
    /// for `-j y` are marked joined regardless.
    pub fn track(&self, text: &str, log_dir: &Path, joined: bool) -> Vec<Job> {
        self.parser
            .submissions(text)
            .into_iter()
            .map(|found| {
                let joined = joined || found.joined;
                info!("Tracking job {} ({}), joined output: {}", found.id, found.name, joined);
                Job::new(found.id, &found.name, log_dir, log_dir, joined)
            })
            .collect()
    }

    /// Check the job once and advance its state.
    ///
    /// A job missing from qstat is only classified after the settle re-check, and then by its
    /// error output: missing means it never started, non-empty means it failed.
    pub fn poll(&self, job: &mut Job) -> Result<JobStatus> {
        if job.state().is_terminal() {
            return Ok(job.status());
        }
        let listing = self.listing()?;
        self.observe(job, &listing)
    }

    /// Poll until the job finishes or the timeout runs out.
    ///
    /// Polls at least once, even with a zero timeout. A timeout leaves the job running on the
    /// cluster. Failed jobs are returned as [QsubError::JobFailed].
    pub fn wait(&self, job: &mut Job, interval: Duration, timeout: Option<Duration>) -> Result<JobStatus> {
        let start = Instant::now();
        loop {
            let status = self.poll(job)?;
            if status.state.is_terminal() {
                return finish(status);
            }
            let pause = match timeout {
                Some(limit) => {
                    let elapsed = start.elapsed();
                    if elapsed >= limit {
                        self.sink.record(&JobEvent::TimedOut { id: job.id(), last: job.state() });
                        return Err(QsubError::Timeout { id: job.id(), timeout: limit, last: job.state() });
                    }
                    interval.min(limit - elapsed)
                }
                None => interval,
            };
            thread::sleep(pause);
        }
    }

    /// Wait on several jobs, listing the queue once per round.
    ///
    /// Returns one outcome per job in the same order. Only a failure to list the queue aborts the
    /// whole wait; anything else is reported against the job it concerns.
    pub fn wait_all(
        &self,
        jobs: &mut [Job],
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<Vec<Result<JobStatus>>> {
        let start = Instant::now();
        let mut outcomes: Vec<Option<Result<JobStatus>>> = jobs.iter().map(|_| None).collect();
        debug!("Monitoring {} jobs for completion", jobs.len());

        loop {
            let listing = self.listing()?;
            for (job, outcome) in jobs.iter_mut().zip(outcomes.iter_mut()) {
                if outcome.is_some() {
                    continue;
                }
                if job.state().is_terminal() {
                    *outcome = Some(finish(job.status()));
                    continue;
                }
                match self.observe(job, &listing) {
                    Ok(status) if status.state.is_terminal() => *outcome = Some(finish(status)),
                    Ok(_) => {}
                    Err(err) => *outcome = Some(Err(err)),
                }
            }

            let remaining = outcomes.iter().filter(|o| o.is_none()).count();
            if remaining == 0 {
                break;
            }
            debug!("Number of jobs in queue: {remaining}");

            let mut pause = interval;
            if let Some(limit) = timeout {
                let elapsed = start.elapsed();
                if elapsed >= limit {
                    for (job, outcome) in jobs.iter().zip(outcomes.iter_mut()).filter(|(_, o)| o.is_none()) {
                        self.sink.record(&JobEvent::TimedOut { id: job.id(), last: job.state() });
                        *outcome = Some(Err(QsubError::Timeout { id: job.id(), timeout: limit, last: job.state() }));
                    }
                    break;
                }
                pause = pause.min(limit - elapsed);
            }
            thread::sleep(pause);
        }

        debug!("No jobs remaining in the job queue");
        Ok(outcomes.into_iter().flatten().collect())
    }

    /// Delete jobs with qdel. Job states are left alone; the next poll sees them leave.
    pub fn kill(&self, ids: &[JobId]) -> Result<()> {
        if ids.is_empty() {
            debug!("No jobs passed");
            return Ok(());
        }
        let output = self
            .scheduler
            .delete(ids)
            .map_err(|err| QsubError::Delete(format!("can't run qdel: {err}")))?;
        if !output.success {
            return Err(QsubError::Delete(format!("qdel {}", output.describe())));
        }
        debug!("{}", output.stdout.trim());
        self.sink.record(&JobEvent::Killed { ids: ids.to_vec() });
        Ok(())
    }

    /// Failed jobs still sitting in the queue, e.g. in `Eqw`; they stay there until deleted
    pub fn stuck(&self, jobs: &[Job]) -> Result<Vec<JobId>> {
        let listing = self.listing()?;
        Ok(jobs
            .iter()
            .filter(|job| job.state() == JobState::Failed)
            .filter(|job| merge_entries(job.id(), &listing).is_some())
            .map(Job::id)
            .collect())
    }

    pub(crate) fn listing(&self) -> Result<Vec<QueueEntry>> {
        let output = self
            .scheduler
            .status()
            .map_err(|err| QsubError::Poll(format!("can't run qstat: {err}")))?;
        if !output.success {
            return Err(QsubError::Poll(format!("qstat {}", output.describe())));
        }
        self.parser.listing(&output.stdout).map_err(QsubError::Poll)
    }

    fn observe(&self, job: &mut Job, listing: &[QueueEntry]) -> Result<JobStatus> {
        if let Some(entry) = merge_entries(job.id(), listing) {
            return self.apply_listed(job, entry);
        }

        for _ in 0..self.settings.settle_attempts {
            self.sink.record(&JobEvent::Vanished { id: job.id(), settle: self.settings.settle });
            thread::sleep(self.settings.settle);
            let again = self.listing()?;
            if let Some(entry) = merge_entries(job.id(), &again) {
                self.sink.record(&JobEvent::Reappeared { id: job.id() });
                return self.apply_listed(job, entry);
            }
        }

        let (state, note) = self.classify_absent(job)?;
        self.transition(job, state, Some(note.clone()))?;
        Ok(JobStatus { id: job.id(), state, code: None, note: Some(note) })
    }

    fn apply_listed(&self, job: &mut Job, entry: &QueueEntry) -> Result<JobStatus> {
        if entry.state == JobState::Unknown {
            self.sink.record(&JobEvent::UnrecognisedState { id: job.id(), code: entry.code.clone() });
            return Ok(JobStatus { id: job.id(), state: JobState::Unknown, code: Some(entry.code.clone()), note: None });
        }
        let note = (entry.state == JobState::Failed)
            .then(|| format!("scheduler reports error state {}", entry.code));
        self.transition(job, entry.state, note.clone())?;
        Ok(JobStatus { id: job.id(), state: entry.state, code: Some(entry.code.clone()), note })
    }

    fn transition(&self, job: &mut Job, to: JobState, note: Option<String>) -> Result<()> {
        let from = job.state();
        if to.rank() < from.rank() {
            self.sink.record(&JobEvent::Regression { id: job.id(), from, to });
            return Err(QsubError::StateRegression { id: job.id(), from, to });
        }
        if from == to {
            return Ok(());
        }
        self.sink.record(&JobEvent::StateChanged { id: job.id(), from, to });
        job.advance(to, note.clone());
        if to.is_terminal() {
            self.sink.record(&JobEvent::Finished { id: job.id(), state: to, note });
        }
        Ok(())
    }

    /// Decide how a job that left the queue ended, from its log files
    fn classify_absent(&self, job: &Job) -> Result<(JobState, String)> {
        let stderr = job.stderr_path();
        let size = match fs::metadata(stderr) {
            Ok(metadata) => metadata.len(),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Ok((
                    JobState::Failed,
                    format!("left the queue without writing {}, it probably never started", stderr.display()),
                ));
            }
            Err(err) => return Err(err.into()),
        };

        if !job.is_joined() && size > 0 {
            return Ok((JobState::Failed, format!("error output {} has {} bytes", stderr.display(), size)));
        }
        for path in [job.stdout_path(), stderr] {
            if let Some(marker) = self.find_marker(path)? {
                return Ok((JobState::Failed, format!("{} contains {:?}", path.display(), marker)));
            }
            if job.is_joined() {
                break;
            }
        }
        Ok((JobState::Completed, "left the queue with no error output".to_string()))
    }

    fn find_marker(&self, path: &Path) -> Result<Option<&str>> {
        if self.settings.error_markers.is_empty() {
            return Ok(None);
        }
        let bytes = match fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let text = String::from_utf8_lossy(&bytes);
        Ok(self.settings.error_markers.iter().map(String::as_str).find(|marker| text.contains(marker)))
    }
}

fn finish(status: JobStatus) -> Result<JobStatus> {
    match status.state {
        JobState::Completed => Ok(status),
        _ => Err(QsubError::JobFailed {
            id: status.id,
            reason: status.note.unwrap_or_else(|| status.state.to_string()),
        }),
    }
}
