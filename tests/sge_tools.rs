//! Drive the real process plumbing with shell stand-ins for the SGE tools
#![cfg(unix)]

use std::fs;
use std::path::Path;
use std::time::Duration;

use qsubwrap::error::QsubError;
use qsubwrap::sge::client::{SgeCommands, Tool};
use qsubwrap::sge::job::{JobId, JobState};
use qsubwrap::sge::job_request::JobRequest;
use qsubwrap::sge::monitor::{Monitor, MonitorSettings};

fn shell(script: &str) -> Tool {
    Tool::new("sh").arg("-c").arg(script)
}

/// qsub swallows the script into `dir/script.sh` and confirms job 4242
fn commands(dir: &Path, qstat: &str) -> SgeCommands {
    let qsub = format!(
        "cat > '{}/script.sh'; echo 'Your job 4242 (\"itest\") has been submitted'",
        dir.display()
    );
    let qdel = format!("echo \"$@\" > '{}/deleted'; echo deleted", dir.display());
    SgeCommands {
        qsub: shell(&qsub),
        qstat: shell(qstat),
        qacct: shell("exit 1"),
        qdel: Tool::new("sh").arg("-c").arg(qdel).arg("qdel"),
    }
}

fn monitor(commands: SgeCommands) -> Monitor {
    let settings = MonitorSettings {
        settle: Duration::from_millis(10),
        submit_delay: Duration::ZERO,
        ..MonitorSettings::default()
    };
    Monitor::new(Box::new(commands)).with_settings(settings)
}

fn request(dir: &Path) -> JobRequest {
    let mut request = JobRequest::new("echo hello");
    request.name = "itest".to_string();
    request.log_dir = Some(dir.join("logs"));
    request
}

#[test]
fn submit_then_wait_until_completed() {
    let tmp = tempfile::tempdir().unwrap();
    let monitor = monitor(commands(tmp.path(), "true"));

    let mut job = monitor.submit(&request(tmp.path())).unwrap();
    assert_eq!(job.id(), JobId(4242));
    assert_eq!(job.state(), JobState::Pending);

    let script = fs::read_to_string(tmp.path().join("script.sh")).unwrap();
    assert!(script.contains("#$ -N itest"));
    assert!(script.contains("echo hello"));

    // the job ran and wrote nothing to stderr
    fs::write(job.stderr_path(), "").unwrap();
    let status = monitor.wait(&mut job, Duration::from_millis(10), Some(Duration::from_secs(5))).unwrap();
    assert_eq!(status.state, JobState::Completed);
    assert_eq!(job.state(), JobState::Completed);
}

#[test]
fn job_without_error_log_never_started() {
    let tmp = tempfile::tempdir().unwrap();
    let monitor = monitor(commands(tmp.path(), "true"));

    let mut job = monitor.submit(&request(tmp.path())).unwrap();
    let err = monitor.wait(&mut job, Duration::from_millis(10), None).unwrap_err();
    assert!(matches!(err, QsubError::JobFailed { id: JobId(4242), .. }), "{err}");
    assert_eq!(job.state(), JobState::Failed);
}

#[test]
fn errored_jobs_are_reported_and_can_be_deleted() {
    let tmp = tempfile::tempdir().unwrap();
    let qstat = "echo 'job-ID  prior   name       user         state submit/start at     queue      slots'; \
                 echo '-----------------------------------------------------------------------------'; \
                 echo '4242 0.50000 itest      someone      Eqw   06/07/2017 17:02:09     1'";
    let monitor = monitor(commands(tmp.path(), qstat));

    let mut jobs = vec![monitor.submit(&request(tmp.path())).unwrap()];
    let outcomes = monitor.wait_all(&mut jobs, Duration::from_millis(10), Some(Duration::from_secs(5))).unwrap();
    assert!(matches!(outcomes[0], Err(QsubError::JobFailed { .. })));

    let stuck = monitor.stuck(&jobs).unwrap();
    assert_eq!(stuck, vec![JobId(4242)]);
    monitor.kill(&stuck).unwrap();
    assert_eq!(fs::read_to_string(tmp.path().join("deleted")).unwrap().trim(), "4242");
}

#[test]
fn rejected_submission_is_an_error() {
    let tmp = tempfile::tempdir().unwrap();
    let mut commands = commands(tmp.path(), "true");
    commands.qsub = shell("cat > /dev/null; echo 'Unable to run job: no such queue' >&2; exit 1");

    let err = monitor(commands).submit(&request(tmp.path())).unwrap_err();
    assert!(matches!(err, QsubError::Submission(_)), "{err}");
}

#[test]
fn timeout_leaves_job_running() {
    let tmp = tempfile::tempdir().unwrap();
    let qstat = "echo '4242 0.50000 itest      someone      r     06/07/2017 17:02:09     1'";
    let monitor = monitor(commands(tmp.path(), qstat));

    let mut job = monitor.submit(&request(tmp.path())).unwrap();
    let err = monitor.wait(&mut job, Duration::from_millis(10), Some(Duration::from_millis(50))).unwrap_err();
    assert!(matches!(err, QsubError::Timeout { last: JobState::Running, .. }), "{err}");
    assert!(!tmp.path().join("deleted").exists());
}
