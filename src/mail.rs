//! Send mail with mutt from the submit host
use std::ffi::OsString;
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::{debug, info};

use crate::error::{QsubError, Result};

#[derive(Clone, Debug, PartialEq)]
pub struct Email {
    pub recipients: Vec<String>,
    pub subject: String,
    pub body: String,
    pub attachments: Vec<PathBuf>,
}

/// Wrapper around the mutt client
#[derive(Clone, Debug)]
pub struct Mailer {
    program: Vec<OsString>,
    /// exported as EMAIL, which mutt uses for the From/Reply-To address
    reply_to: Option<String>,
}

impl Default for Mailer {
    fn default() -> Self {
        Mailer { program: vec!["mutt".into()], reply_to: None }
    }
}

impl Mailer {
    /// Use another mail program (plus leading arguments) taking mutt's arguments
    pub fn with_program(program: Vec<OsString>) -> Mailer {
        Mailer { program, reply_to: None }
    }

    pub fn reply_to(mut self, address: &str) -> Mailer {
        self.reply_to = Some(address.to_string());
        self
    }

    /// Arguments passed to mutt, after the program itself
    pub fn arguments(&self, email: &Email) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec!["-s".into(), email.subject.clone().into()];
        if !email.attachments.is_empty() {
            args.push("-a".into());
            args.extend(email.attachments.iter().map(|p| p.clone().into_os_string()));
        }
        args.push("--".into());
        args.extend(email.recipients.iter().map(OsString::from));
        args
    }

    /// The command as it would be run, for display
    pub fn command_line(&self, email: &Email) -> String {
        self.program
            .iter()
            .chain(self.arguments(email).iter())
            .map(|arg| {
                let arg = arg.to_string_lossy();
                match arg.contains(char::is_whitespace) {
                    true => format!("{arg:?}"),
                    false => arg.into_owned(),
                }
            })
            .collect::<Vec<String>>()
            .join(" ")
    }

    /// Send the email, with the body on mutt's stdin
    pub fn send(&self, email: &Email) -> Result<()> {
        if email.recipients.is_empty() {
            return Err(QsubError::Mail("no recipients".to_string()));
        }
        let Some((program, leading)) = self.program.split_first() else {
            return Err(QsubError::Mail("no mail program configured".to_string()));
        };

        let mut cmd = Command::new(program);
        cmd.args(leading).args(self.arguments(email));
        if let Some(address) = &self.reply_to {
            cmd.env("EMAIL", address);
        }
        cmd.stdin(Stdio::piped()).stdout(Stdio::piped()).stderr(Stdio::piped());
        info!("Sending email {:?} to {}", email.subject, email.recipients.join(", "));
        debug!("{}", self.command_line(email));

        let mut child = cmd
            .spawn()
            .map_err(|err| QsubError::Mail(format!("can't run {}: {err}", program.to_string_lossy())))?;
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(email.body.as_bytes())?;
        }
        let output = child.wait_with_output()?;
        match output.status.success() {
            true => Ok(()),
            false => Err(QsubError::Mail(format!(
                "{} exited with {}: {}",
                program.to_string_lossy(),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            ))),
        }
    }
}
