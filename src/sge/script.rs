use log::debug;
use serde::Serialize;
use tinytemplate::{format_unescaped, TinyTemplate};

use crate::error::{QsubError, Result};
use crate::sge::job_request::{JobRequest, LogDirs};

/// Rendered job script, fed to qsub on stdin.
///
/// Submission options are written as `#$` directives at the top of the script, so the qsub
/// command line itself never changes.
pub struct JobScript {
    pub content: String,
}

/// Rendering context for the job script
#[derive(Serialize)]
struct ScriptContext<'a> {
    name: &'a str,
    stdout_dir: String,
    stderr_dir: String,
    join_output: bool,
    queue: Option<&'a str>,
    memory: Option<&'a str>,
    cores: Option<u32>,
    parallel_environment: &'a str,
    working_dir: Option<String>,
    environment: Vec<String>,
    params: Vec<&'a str>,
    pre_commands: Option<&'a str>,
    command: &'a str,
    post_commands: Option<&'a str>,
}

impl JobRequest {
    /// Render the job script for this request using resolved log directories
    pub fn render(&self, dirs: &LogDirs) -> Result<JobScript> {
        /// included job script template
        static JOB: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/templates/job.txt"));
        let mut tt = TinyTemplate::new();
        // commands are shell, not HTML
        tt.set_default_formatter(&format_unescaped);
        tt.add_template("job", JOB).map_err(template_error)?;

        let context = ScriptContext {
            name: &self.name,
            stdout_dir: dirs.stdout.display().to_string(),
            stderr_dir: dirs.stderr.display().to_string(),
            join_output: self.join_output,
            queue: self.queue.as_deref(),
            memory: self.memory.as_deref(),
            cores: self.cores,
            parallel_environment: &self.parallel_environment,
            working_dir: self.working_dir.as_ref().map(|p| p.display().to_string()),
            environment: self.environment.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            params: self.params.iter().map(String::as_str).collect(),
            pre_commands: self.pre_commands.as_deref(),
            command: &self.command,
            post_commands: self.post_commands.as_deref(),
        };

        let content = tt.render("job", &context).map_err(template_error)?;
        debug!("qsub script is:\n{content}");
        Ok(JobScript { content })
    }
}

fn template_error(err: tinytemplate::error::Error) -> QsubError {
    QsubError::Submission(format!("can't render job script: {err}"))
}
