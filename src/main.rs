use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn};

use qsubwrap::db::job::Ledger;
use qsubwrap::db::open::open_db;
use qsubwrap::error::QsubError;
use qsubwrap::logging;
use qsubwrap::mail::{Email, Mailer};
use qsubwrap::sge::accounting::RecordFilter;
use qsubwrap::sge::client::{SgeCommands, Tool};
use qsubwrap::sge::job::{Job, JobId, JobStatus};
use qsubwrap::sge::job_request::JobRequest;
use qsubwrap::sge::monitor::{Monitor, MonitorSettings};

/// Submit jobs to an SGE cluster and follow them until they finish
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding the job ledger (qsubwrap.db)
    #[arg(long, default_value = ".")]
    work_dir: PathBuf,
    /// Write log records to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// More logging, repeat for trace output
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(flatten)]
    tools: ToolArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args, Debug)]
struct ToolArgs {
    /// qsub command line, e.g. "ssh head-node qsub"
    #[arg(long, default_value = "qsub")]
    qsub: String,
    #[arg(long, default_value = "qstat")]
    qstat: String,
    #[arg(long, default_value = "qacct")]
    qacct: String,
    #[arg(long, default_value = "qdel")]
    qdel: String,
}

#[derive(Args, Debug)]
struct PollArgs {
    /// Seconds between qstat calls
    #[arg(long, default_value_t = 5)]
    interval: u64,
    /// Give up waiting after this many seconds; jobs keep running on the cluster
    #[arg(long)]
    timeout: Option<u64>,
    /// Seconds to wait before re-checking a job that left the queue
    #[arg(long, default_value_t = 2)]
    settle: u64,
    /// Text in job logs that marks the job as failed
    #[arg(long = "error-marker")]
    error_markers: Vec<String>,
    /// Email these addresses when each job finishes
    #[arg(long)]
    notify: Vec<String>,
    /// Reply-to address for notifications
    #[arg(long)]
    reply_to: Option<String>,
}

#[derive(Args, Debug)]
struct RequestArgs {
    /// JSON job request
    #[arg(long, conflicts_with = "command")]
    request: Option<PathBuf>,
    /// Shell commands to run in the job
    #[arg(short, long)]
    command: Option<String>,
    #[arg(short = 'N', long)]
    name: Option<String>,
    #[arg(short, long)]
    queue: Option<String>,
    /// Memory request, e.g. 8G
    #[arg(long)]
    memory: Option<String>,
    /// Slots in the parallel environment
    #[arg(long)]
    cores: Option<u32>,
    #[arg(long)]
    log_dir: Option<PathBuf>,
    /// Merge stderr into the stdout log
    #[arg(long)]
    join: bool,
    /// Environment variable for the job, KEY=VALUE
    #[arg(short, long = "env", value_parser = parse_env)]
    environment: Vec<(String, String)>,
    #[arg(long)]
    working_dir: Option<PathBuf>,
    /// Raw qsub option, repeatable
    #[arg(long = "param")]
    params: Vec<String>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Submit a job
    Submit {
        #[command(flatten)]
        request: RequestArgs,
        /// Print the job script instead of submitting it
        #[arg(long)]
        dry_run: bool,
        /// Wait for the job to finish
        #[arg(long)]
        wait: bool,
        #[command(flatten)]
        poll: PollArgs,
    },
    /// Poll jobs once
    Status { ids: Vec<JobId> },
    /// Wait for jobs to finish; all unfinished ledger jobs when no ids are given
    Wait {
        ids: Vec<JobId>,
        #[command(flatten)]
        poll: PollArgs,
        /// qdel failed jobs left in the queue (e.g. Eqw)
        #[arg(long)]
        kill_errored: bool,
    },
    /// Check a finished job's qacct record
    Validate {
        id: JobId,
        /// Ignore records older than this many days
        #[arg(long, default_value_t = 7)]
        days: i64,
        /// Owner the record must have, defaults to the current user
        #[arg(long)]
        user: Option<String>,
    },
    /// Delete jobs with qdel
    Kill {
        #[arg(required = true)]
        ids: Vec<JobId>,
    },
    /// Record jobs from qsub messages printed by another program
    Track {
        /// Text to scan, stdin when missing
        file: Option<PathBuf>,
        /// Where those jobs write their logs
        #[arg(long, default_value = ".")]
        log_dir: PathBuf,
        /// The jobs were submitted with `-j y`, even where no qsub command line was printed
        #[arg(long)]
        joined: bool,
    },
}

fn parse_env(s: &str) -> Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got {s}"))
}

/// A JSON request file, or a request assembled from command line flags
fn build_request(args: RequestArgs) -> Result<JobRequest> {
    if let Some(path) = &args.request {
        return Ok(JobRequest::read(path)?);
    }
    let Some(command) = &args.command else {
        bail!("either --request or --command is required");
    };

    let mut request = JobRequest::new(command);
    if let Some(name) = args.name {
        request.name = name;
    }
    request.queue = args.queue;
    request.memory = args.memory;
    request.cores = args.cores;
    request.log_dir = args.log_dir;
    request.join_output = args.join;
    request.environment = args.environment.into_iter().collect();
    request.working_dir = args.working_dir;
    request.params = args.params;
    Ok(request)
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, cli.log_file.as_deref()).context("Can't open log file")?;
    info!("terve! starting up :)");

    let commands = SgeCommands {
        qsub: tool(&cli.tools.qsub)?,
        qstat: tool(&cli.tools.qstat)?,
        qacct: tool(&cli.tools.qacct)?,
        qdel: tool(&cli.tools.qdel)?,
    };

    match cli.command {
        Commands::Submit { request, dry_run, wait, poll } => {
            let request = build_request(request)?;
            if dry_run {
                request.validate()?;
                let script = request.render(&request.planned_log_dirs()?)?;
                print!("{}", script.content);
                return Ok(());
            }
            let ledger = ledger(&cli.work_dir)?;
            let monitor = monitor(commands, Some(&poll));

            let row = ledger.stage(&request)?;
            let job = monitor.submit(&request)?;
            // the id is the only handle on a submitted job, so it goes out before the ledger write
            println!("{}", job.id());
            ledger
                .record_submission(row, &job)
                .with_context(|| format!("Job {} was submitted but can't be recorded in the ledger", job.id()))?;

            if wait {
                wait_for(&monitor, &ledger, vec![job], &poll, false)?;
            }
        }
        Commands::Status { ids } => {
            let ledger = ledger(&cli.work_dir)?;
            let monitor = monitor(commands, None);
            for mut job in load_jobs(&ledger, &ids)? {
                match monitor.poll(&mut job) {
                    Ok(status) => println!("{}", serde_json::to_string(&status)?),
                    Err(err) => error!("Can't poll job {}: {}", job.id(), err),
                }
                ledger.update_state(&job)?;
            }
        }
        Commands::Wait { ids, poll, kill_errored } => {
            let ledger = ledger(&cli.work_dir)?;
            let monitor = monitor(commands, Some(&poll));
            let ids = match ids.is_empty() {
                true => ledger.unfinished()?,
                false => ids,
            };
            wait_for(&monitor, &ledger, load_jobs(&ledger, &ids)?, &poll, kill_errored)?;
        }
        Commands::Validate { id, days, user } => {
            let ledger = ledger(&cli.work_dir)?;
            let monitor = monitor(commands, None);
            let job = load_jobs(&ledger, &[id])?.remove(0);

            let mut filter = RecordFilter::current_user();
            filter.days_limit = Some(days);
            if let Some(user) = user {
                filter.owner = user;
            }
            let validation = monitor.validate(&job, &filter)?;
            println!("{}", serde_json::to_string_pretty(&validation)?);
            if !validation.is_valid() {
                bail!("job {id} did not pass completion validation");
            }
        }
        Commands::Kill { ids } => {
            let monitor = monitor(commands, None);
            monitor.kill(&ids)?;
        }
        Commands::Track { file, log_dir, joined } => {
            let text = match &file {
                Some(path) => fs::read_to_string(path).with_context(|| format!("Can't read {}", path.display()))?,
                None => {
                    let mut text = String::new();
                    std::io::stdin().read_to_string(&mut text)?;
                    text
                }
            };
            let log_dir = fs::canonicalize(&log_dir).with_context(|| format!("No log directory {}", log_dir.display()))?;
            let ledger = ledger(&cli.work_dir)?;
            let monitor = monitor(commands, None);
            for job in monitor.track(&text, &log_dir, joined) {
                ledger.track(&job)?;
                println!("{}", job.id());
            }
        }
    }

    Ok(())
}

fn tool(command_line: &str) -> Result<Tool> {
    Tool::parse(command_line).ok_or_else(|| anyhow!("empty tool command line"))
}

fn ledger(work_dir: &Path) -> Result<Ledger> {
    let conn = open_db(work_dir).with_context(|| format!("Can't open job ledger in {}", work_dir.display()))?;
    Ok(Ledger::new(conn))
}

fn monitor(commands: SgeCommands, poll: Option<&PollArgs>) -> Monitor {
    let mut settings = MonitorSettings::default();
    if let Some(poll) = poll {
        settings.settle = Duration::from_secs(poll.settle);
        settings.error_markers = poll.error_markers.clone();
    }
    Monitor::new(Box::new(commands)).with_settings(settings)
}

fn load_jobs(ledger: &Ledger, ids: &[JobId]) -> Result<Vec<Job>> {
    ids.iter()
        .map(|id| ledger.load(*id)?.ok_or_else(|| anyhow!("job {id} is not in the ledger, submit or track it first")))
        .collect()
}

/// Wait for every job, record the outcomes, and fail if any job didn't complete
fn wait_for(monitor: &Monitor, ledger: &Ledger, mut jobs: Vec<Job>, poll: &PollArgs, kill_errored: bool) -> Result<()> {
    if jobs.is_empty() {
        info!("No jobs to wait for");
        return Ok(());
    }
    let interval = Duration::from_secs(poll.interval);
    let timeout = poll.timeout.map(Duration::from_secs);
    let outcomes = monitor.wait_all(&mut jobs, interval, timeout)?;

    let mut failures = 0;
    for (job, outcome) in jobs.iter().zip(outcomes.iter()) {
        ledger.update_state(job)?;
        match outcome {
            Ok(status) => println!("{}", serde_json::to_string(status)?),
            Err(err) => {
                failures += 1;
                println!("{}", serde_json::to_string(&job.status())?);
                error!("{err}");
            }
        }
        if !poll.notify.is_empty() {
            notify(job, outcome, poll);
        }
    }

    if kill_errored {
        let stuck = monitor.stuck(&jobs)?;
        if !stuck.is_empty() {
            warn!("Killing jobs left in error state: {stuck:?}");
            monitor.kill(&stuck)?;
        }
    }

    if failures > 0 {
        bail!("{failures} of {} job(s) did not complete", jobs.len());
    }
    Ok(())
}

/// Mail a job's outcome; a failed notification doesn't change the outcome
fn notify(job: &Job, outcome: &Result<JobStatus, QsubError>, poll: &PollArgs) {
    let (headline, detail) = match outcome {
        Ok(status) => (status.state.to_string(), status.note.clone().unwrap_or_default()),
        Err(err) => ("did not complete".to_string(), err.to_string()),
    };
    let mut attachments = vec![job.stdout_path().to_path_buf()];
    if !job.is_joined() {
        attachments.push(job.stderr_path().to_path_buf());
    }
    attachments.retain(|path| path.exists());

    let email = Email {
        recipients: poll.notify.clone(),
        subject: format!("[qsubwrap] job {job} {headline}"),
        body: format!("Job {job} {headline}\n{detail}\n\nstdout: {}\nstderr: {}\n", job.stdout_path().display(), job.stderr_path().display()),
        attachments,
    };
    let mailer = match &poll.reply_to {
        Some(address) => Mailer::default().reply_to(address),
        None => Mailer::default(),
    };
    if let Err(err) = mailer.send(&email) {
        warn!("Can't send notification for job {}: {}", job.id(), err);
    }
}
