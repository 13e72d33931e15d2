use std::ffi::OsString;
use std::io;
use std::io::Write;
use std::process::{Command, Stdio};

use log::{debug, info};

use crate::sge::job::JobId;

/// Captured result of one external tool run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: &str) -> CommandOutput {
        CommandOutput { success: true, code: Some(0), stdout: stdout.to_string(), stderr: String::new() }
    }

    pub fn failed(code: i32, stderr: &str) -> CommandOutput {
        CommandOutput { success: false, code: Some(code), stdout: String::new(), stderr: stderr.to_string() }
    }

    /// Short description of a failure for error messages
    pub fn describe(&self) -> String {
        let status = match self.code {
            Some(code) => format!("exit status {code}"),
            None => "killed by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        match stderr.is_empty() {
            true => status,
            false => format!("{status}: {stderr}"),
        }
    }
}

/// The scheduler's command line tools.
///
/// Each call runs synchronously and only reports what the tool printed; interpreting the text is
/// left to an [crate::sge::parse::OutputParser]. Spawn failures come back as `io::Error`.
pub trait Scheduler {
    /// Submit a job script through stdin
    fn submit(&self, script: &str) -> io::Result<CommandOutput>;

    /// List active jobs
    fn status(&self) -> io::Result<CommandOutput>;

    /// Accounting records of a finished job
    fn accounting(&self, id: JobId) -> io::Result<CommandOutput>;

    /// Delete jobs from the queue
    fn delete(&self, ids: &[JobId]) -> io::Result<CommandOutput>;
}

/// A program plus any leading arguments, e.g. `qstat` or `ssh head-node qstat`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tool {
    pub program: OsString,
    pub args: Vec<OsString>,
}

impl Tool {
    pub fn new(program: impl Into<OsString>) -> Tool {
        Tool { program: program.into(), args: Vec::new() }
    }

    /// Split a command line on whitespace, no shell quoting
    pub fn parse(command_line: &str) -> Option<Tool> {
        let mut words = command_line.split_whitespace();
        let program = words.next()?;
        Some(Tool { program: program.into(), args: words.map(OsString::from).collect() })
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Tool {
        self.args.push(arg.into());
        self
    }

    pub fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

/// Runs the SGE client tools installed on the submit host
#[derive(Clone, Debug)]
pub struct SgeCommands {
    pub qsub: Tool,
    pub qstat: Tool,
    pub qacct: Tool,
    pub qdel: Tool,
}

impl Default for SgeCommands {
    fn default() -> Self {
        SgeCommands {
            qsub: Tool::new("qsub"),
            qstat: Tool::new("qstat"),
            qacct: Tool::new("qacct"),
            qdel: Tool::new("qdel"),
        }
    }
}

impl Scheduler for SgeCommands {
    fn submit(&self, script: &str) -> io::Result<CommandOutput> {
        let mut cmd = self.qsub.command();
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        info!("Running qsub process");
        debug!("{:?}", &cmd);

        let mut child = cmd.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(script.as_bytes())?;
            // stdin is dropped here so qsub sees EOF
        }
        Ok(capture(child.wait_with_output()?))
    }

    fn status(&self) -> io::Result<CommandOutput> {
        run(self.qstat.command())
    }

    fn accounting(&self, id: JobId) -> io::Result<CommandOutput> {
        let mut cmd = self.qacct.command();
        cmd.arg("-j").arg(id.to_string());
        run(cmd)
    }

    fn delete(&self, ids: &[JobId]) -> io::Result<CommandOutput> {
        let mut cmd = self.qdel.command();
        cmd.args(ids.iter().map(|id| id.to_string()));
        info!("Running qdel process");
        run(cmd)
    }
}

fn run(mut cmd: Command) -> io::Result<CommandOutput> {
    debug!("{:?}", &cmd);
    cmd.stdin(Stdio::null());
    Ok(capture(cmd.output()?))
}

fn capture(output: std::process::Output) -> CommandOutput {
    CommandOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    }
}
