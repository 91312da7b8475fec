//! Shell command specialization of [`RemoteCommand`].

use super::command::{CommandArgs, RemoteCommand};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Name of the worker-side command implementing shell execution
pub const SHELL_COMMAND: &str = "shell";

/// A command line, either pre-split or to be run through the worker's shell
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ShellCommand {
    Argv(Vec<String>),
    Line(String),
}

impl ShellCommand {
    pub fn argv<I, S>(parts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Argv(parts.into_iter().map(Into::into).collect())
    }

    /// Rendering used in logs and status text
    pub fn display(&self) -> String {
        match self {
            Self::Argv(parts) => parts.join(" "),
            Self::Line(line) => line.clone(),
        }
    }
}

impl From<&str> for ShellCommand {
    fn from(line: &str) -> Self {
        Self::Line(line.to_string())
    }
}

impl From<Vec<String>> for ShellCommand {
    fn from(argv: Vec<String>) -> Self {
        Self::Argv(argv)
    }
}

/// Declarative description of a shell command, turned into a
/// [`RemoteCommand`] per dispatch
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteShellCommand {
    workdir: String,
    command: ShellCommand,
    env: BTreeMap<String, String>,
    want_stdout: bool,
    want_stderr: bool,
    user: Option<String>,
}

impl RemoteShellCommand {
    pub fn new(workdir: impl Into<String>, command: impl Into<ShellCommand>) -> Self {
        Self {
            workdir: workdir.into(),
            command: command.into(),
            env: BTreeMap::new(),
            want_stdout: true,
            want_stderr: true,
            user: None,
        }
    }

    /// Run as another user on the worker. `None` leaves the key out entirely.
    pub fn with_user(mut self, user: Option<String>) -> Self {
        self.user = user;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn want_stdout(mut self, want: bool) -> Self {
        self.want_stdout = want;
        self
    }

    pub fn want_stderr(mut self, want: bool) -> Self {
        self.want_stderr = want;
        self
    }

    pub fn command(&self) -> &ShellCommand {
        &self.command
    }

    pub fn workdir(&self) -> &str {
        &self.workdir
    }

    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Arguments as they go over the wire
    pub fn args(&self) -> CommandArgs {
        let mut args = CommandArgs::new();
        args.insert("workdir", self.workdir.clone());
        args.insert(
            "command",
            serde_json::to_value(&self.command).unwrap_or(serde_json::Value::Null),
        );
        args.insert(
            "env",
            serde_json::to_value(&self.env).unwrap_or(serde_json::Value::Null),
        );
        args.insert("want_stdout", self.want_stdout);
        args.insert("want_stderr", self.want_stderr);
        if let Some(user) = &self.user {
            args.insert("user", user.clone());
        }
        args
    }

    /// Fresh channel object for one dispatch
    pub fn to_remote_command(&self) -> Arc<RemoteCommand> {
        RemoteCommand::new(SHELL_COMMAND, self.args())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make(user: Option<&str>) -> Arc<RemoteCommand> {
        RemoteShellCommand::new("build", ShellCommand::argv(["echo", "hello"]))
            .with_user(user.map(str::to_string))
            .to_remote_command()
    }

    #[test]
    fn test_user_argument_only_when_set() {
        let rc = RemoteShellCommand::new("build", ShellCommand::argv(["echo", "hello"]))
            .to_remote_command();
        assert!(!rc.args().contains_key("user"));

        assert!(!make(None).args().contains_key("user"));

        let rc = make(Some("test"));
        assert_eq!(rc.args().get("user"), Some(&serde_json::json!("test")));
    }

    #[test]
    fn test_args_carry_command_body() {
        let rc = make(None);
        assert_eq!(rc.remote_command(), SHELL_COMMAND);
        assert_eq!(
            rc.args().get("command"),
            Some(&serde_json::json!(["echo", "hello"]))
        );
        assert_eq!(rc.args().get("workdir"), Some(&serde_json::json!("build")));
    }

    #[test]
    fn test_shell_line_display() {
        let cmd: ShellCommand = "make all".into();
        assert_eq!(cmd.display(), "make all");
        assert_eq!(ShellCommand::argv(["make", "all"]).display(), "make all");
    }
}
