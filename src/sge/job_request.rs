use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use jsonschema::JSONSchema;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{QsubError, Result};

/// Everything needed to build a qsub submission.
///
/// Requests are usually deserialised from JSON files, which are validated against the bundled
/// schema first. Requests built in code go through the same validation in [JobRequest::validate].
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct JobRequest {
    /// shell commands run inside the job
    pub command: String,
    #[serde(default = "default_name")]
    pub name: String,
    #[serde(default)]
    pub queue: Option<String>,
    /// requested as `-l mem_free=<memory>`, e.g. "8G"
    #[serde(default)]
    pub memory: Option<String>,
    /// slots requested from the parallel environment
    #[serde(default)]
    pub cores: Option<u32>,
    #[serde(default = "default_parallel_environment")]
    pub parallel_environment: String,
    /// sets both stdout_dir and stderr_dir when those are missing
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default)]
    pub stdout_dir: Option<PathBuf>,
    #[serde(default)]
    pub stderr_dir: Option<PathBuf>,
    /// merge stderr into the stdout log (`-j y`)
    #[serde(default)]
    pub join_output: bool,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// defaults to the submitting process' working directory (`-cwd`)
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    #[serde(default)]
    pub pre_commands: Option<String>,
    #[serde(default)]
    pub post_commands: Option<String>,
    /// raw qsub options, one per directive line
    #[serde(default)]
    pub params: Vec<String>,
}

fn default_name() -> String {
    "qsubwrap".to_string()
}

fn default_parallel_environment() -> String {
    "threaded".to_string()
}

/// Log directories after creation and path resolution
#[derive(Clone, Debug, PartialEq)]
pub struct LogDirs {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl JobRequest {
    pub fn new(command: &str) -> JobRequest {
        JobRequest {
            command: command.to_string(),
            name: default_name(),
            queue: None,
            memory: None,
            cores: None,
            parallel_environment: default_parallel_environment(),
            log_dir: None,
            stdout_dir: None,
            stderr_dir: None,
            join_output: false,
            environment: BTreeMap::new(),
            working_dir: None,
            pre_commands: None,
            post_commands: None,
            params: Vec::new(),
        }
    }

    /// Read, validate and deserialise a JSON job request
    pub fn read(path: &Path) -> Result<JobRequest> {
        info!("Reading job request at {}", path.display());
        let json_string = fs::read_to_string(path).map_err(|err| {
            warn!("Can't read job request at path {}: {}", path.display(), err);
            QsubError::InvalidRequest(format!("can't read {}: {}", path.display(), err))
        })?;
        JobRequest::from_json(&json_string)
    }

    pub fn from_json(json_string: &str) -> Result<JobRequest> {
        let json: Value = serde_json::from_str(json_string)
            .map_err(|err| QsubError::InvalidRequest(format!("not JSON: {err}")))?;
        validate_json(&json)?;
        info!("Deserialising valid JSON into a job request");
        serde_json::from_value::<JobRequest>(json)
            .map_err(|err| QsubError::InvalidRequest(err.to_string()))
    }

    /// Check a request built in code against the same schema used for JSON files
    pub fn validate(&self) -> Result<()> {
        let json = serde_json::to_value(self)?;
        validate_json(&json)
    }

    /// Log directories as requested, without touching the filesystem
    pub fn planned_log_dirs(&self) -> Result<LogDirs> {
        let fallback = match &self.log_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        Ok(LogDirs {
            stdout: self.stdout_dir.clone().unwrap_or_else(|| fallback.clone()),
            stderr: self.stderr_dir.clone().unwrap_or(fallback),
        })
    }

    /// Create the log directories and resolve them to absolute paths.
    ///
    /// Relative or missing log paths are a common cause of jobs that never start, so they are
    /// always canonicalised before they reach the job script.
    pub fn prepare_log_dirs(&self) -> Result<LogDirs> {
        let planned = self.planned_log_dirs()?;
        Ok(LogDirs { stdout: resolve_dir(&planned.stdout)?, stderr: resolve_dir(&planned.stderr)? })
    }
}

fn resolve_dir(dir: &Path) -> Result<PathBuf> {
    if !dir.exists() {
        info!("Creating log directory {}", dir.display());
        fs::create_dir_all(dir)?;
    }
    Ok(fs::canonicalize(dir)?)
}

fn validate_json(json: &Value) -> Result<()> {
    /// included request schema
    static SCHEMA: &str = include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/data/schema/job_request.json"));
    let schema: Value = serde_json::from_str(SCHEMA)?;
    let compiled = JSONSchema::compile(&schema)
        .map_err(|err| QsubError::InvalidRequest(format!("bad bundled schema: {err}")))?;

    let result = compiled.validate(json).map_err(|errors| {
        let messages: Vec<String> = errors.map(|e| format!("{}: {}", e.instance_path, e)).collect();
        messages.join("; ")
    });

    match result {
        Ok(_) => {
            info!("Job request is valid");
            Ok(())
        }
        Err(messages) => {
            warn!("Job request fails validation: {messages}");
            Err(QsubError::InvalidRequest(messages))
        }
    }
}
