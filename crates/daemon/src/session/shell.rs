//! Shell selection and process environment.
//!
//! The shell binary and its arguments come from a fixed per-platform table;
//! they are not read from configuration. Tests and embedders can still hand
//! the session manager a different [`ShellCommand`].

use std::path::{Path, PathBuf};

use portable_pty::CommandBuilder;

use super::pty::SessionError;

/// Variables that make the shell (and programs under it) emit color and
/// identify as a 256-color terminal.
pub const TERMINAL_ENV: &[(&str, &str)] = &[
    ("TERM", "xterm-256color"),
    ("COLORTERM", "truecolor"),
    ("FORCE_COLOR", "1"),
];

#[cfg(windows)]
const PLATFORM_SHELL: (&str, &[&str]) = ("powershell.exe", &[]);

#[cfg(not(windows))]
const PLATFORM_SHELL: (&str, &[&str]) = ("/bin/bash", &["-l"]);

/// A shell invocation: program, arguments, working directory and extra
/// environment on top of the daemon's own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellCommand {
    program: String,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl ShellCommand {
    /// Creates a command for `program` with the terminal environment set and
    /// the user's home directory as working directory.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: dirs::home_dir(),
            env: TERMINAL_ENV
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// The platform's login shell: `/bin/bash -l` on Unix, `powershell.exe`
    /// on Windows.
    pub fn platform_default() -> Self {
        let (program, args) = PLATFORM_SHELL;
        args.iter().fold(Self::new(program), |cmd, arg| cmd.arg(*arg))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Sets an environment variable, replacing an earlier value for the same key.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let key = key.into();
        let value = value.into();
        match self.env.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.env.push((key, value)),
        }
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    pub fn env_vars(&self) -> &[(String, String)] {
        &self.env
    }

    /// Locates the program on this host.
    ///
    /// Absolute paths must exist; bare names are looked up in `PATH`.
    pub fn resolve(&self) -> Result<PathBuf, SessionError> {
        which::which(&self.program).map_err(|e| {
            SessionError::SpawnFailed(format!("shell `{}` not found: {}", self.program, e))
        })
    }

    /// Builds the portable-pty command. The builder starts from the daemon's
    /// environment, so our variables are layered on top of it.
    pub(crate) fn to_command_builder(&self, program: &Path) -> CommandBuilder {
        let mut cmd = CommandBuilder::new(program);
        cmd.args(&self.args);

        // A missing home directory would make the spawn fail; fall back to
        // the daemon's cwd instead.
        if let Some(dir) = self.cwd.as_ref().filter(|d| d.is_dir()) {
            cmd.cwd(dir);
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

impl Default for ShellCommand {
    fn default() -> Self {
        Self::platform_default()
    }
}
