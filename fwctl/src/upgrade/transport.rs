//! ssh/scp invocation rendering

use secrecy::{ExposeSecret, SecretString};

use crate::models::job::{AuthMode, RemoteTarget};
use crate::upgrade::pipeline::StepAction;

/// Environment variable sshpass reads the password from
pub const SSHPASS_ENV: &str = "SSHPASS";

/// A fully rendered local process invocation
#[derive(Debug)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Set on the child only, never rendered
    pub secret_env: Option<(String, SecretString)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            secret_env: None,
        }
    }

    /// Printable command line. Secrets are not part of it.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '\'' || c == '"') {
                line.push_str(&crate::upgrade::pipeline::shell_quote(arg));
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// Renders steps into ssh and scp invocations
#[derive(Debug, Clone)]
pub struct SshTransport {
    /// `ConnectTimeout` in seconds
    pub connect_timeout_secs: u64,
}

impl Default for SshTransport {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
        }
    }
}

impl SshTransport {
    pub fn new(connect_timeout_secs: u64) -> Self {
        Self {
            connect_timeout_secs,
        }
    }

    fn common_options(&self, auth: &AuthMode) -> Vec<String> {
        let mut options = vec![
            format!("ConnectTimeout={}", self.connect_timeout_secs),
            "StrictHostKeyChecking=no".to_string(),
            "UserKnownHostsFile=/dev/null".to_string(),
            "LogLevel=ERROR".to_string(),
        ];
        match auth {
            AuthMode::Key => {
                options.push("BatchMode=yes".to_string());
                options.push("PreferredAuthentications=publickey".to_string());
                options.push("PasswordAuthentication=no".to_string());
            }
            AuthMode::Password(_) => {
                options.push("BatchMode=no".to_string());
                options.push("PreferredAuthentications=password,keyboard-interactive".to_string());
                options.push("PubkeyAuthentication=no".to_string());
            }
        }
        options
            .into_iter()
            .flat_map(|option| ["-o".to_string(), option])
            .collect()
    }

    /// Wrap `program args` for the target's auth mode
    fn finish(&self, target: &RemoteTarget, program: &str, mut args: Vec<String>) -> CommandSpec {
        match &target.auth {
            AuthMode::Key => CommandSpec::new(program, args),
            AuthMode::Password(password) => {
                let mut wrapped = vec!["-e".to_string(), program.to_string()];
                wrapped.append(&mut args);
                CommandSpec {
                    program: "sshpass".to_string(),
                    args: wrapped,
                    secret_env: Some((
                        SSHPASS_ENV.to_string(),
                        SecretString::from(password.expose_secret().to_owned()),
                    )),
                }
            }
        }
    }

    /// `ssh … user@host script`
    pub fn remote_shell(&self, target: &RemoteTarget, script: &str) -> CommandSpec {
        let mut args = self.common_options(&target.auth);
        args.push("-p".to_string());
        args.push(target.port.to_string());
        args.push(target.destination());
        args.push(script.to_string());
        self.finish(target, "ssh", args)
    }

    /// `scp … local user@host:remote`
    pub fn upload(&self, target: &RemoteTarget, local: &str, remote: &str) -> CommandSpec {
        let mut args = self.common_options(&target.auth);
        args.push("-P".to_string());
        args.push(target.port.to_string());
        args.push(local.to_string());
        args.push(format!("{}:{}", target.destination(), remote));
        self.finish(target, "scp", args)
    }

    pub fn render(&self, target: &RemoteTarget, action: &StepAction) -> CommandSpec {
        match action {
            StepAction::RemoteShell { fragments } => {
                self.remote_shell(target, &fragments.join(" && "))
            }
            StepAction::Upload { local, remote } => {
                self.upload(target, &local.to_string_lossy(), remote)
            }
        }
    }
}
