use std::io::{self, BufRead, Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Duration;
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// A command as program + argument list, never a shell string.
/// The only place a shell string survives is the payload handed to a remote
/// session, where the remote side does the interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, limit: Duration) -> Self {
        self.timeout = Some(limit);
        self
    }

    /// one-line rendering for diagnostics only
    pub fn rendered(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            if arg.contains(' ') {
                line.push('\'');
                line.push_str(arg);
                line.push('\'');
            } else {
                line.push_str(arg);
            }
        }
        line
    }
}

/// container for information extracted from running an external command
#[derive(Debug, Clone, Default)]
pub struct RunOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Capability used for every external invocation: remote transport, the
/// package build tool and the analysis shell all go through here, which keeps
/// the callers testable without spawning anything.
pub trait ProcessRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<RunOutput>;
}

/// Runner that spawns real processes with piped stdio.
pub struct SystemRunner;

impl ProcessRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> io::Result<RunOutput> {
        debug!("running: {}", spec.rendered());

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &spec.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;

        let status = match spec.timeout {
            Some(limit) => match child.wait_timeout(limit)? {
                Some(status) => status,
                None => {
                    warn!("{} timed out after {:?}", spec.program, limit);
                    child.kill()?;
                    child.wait()?;
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} timed out", spec.rendered()),
                    ));
                }
            },
            None => child.wait()?,
        };

        let mut stdout = String::new();
        if let Some(mut pipe) = child.stdout.take() {
            pipe.read_to_string(&mut stdout)?;
        }
        let mut stderr = String::new();
        if let Some(mut pipe) = child.stderr.take() {
            pipe.read_to_string(&mut stderr)?;
        }

        Ok(RunOutput {
            status: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// How to answer before a destructive step.
/// `Interactive` reads y/n/a from stdin, `AutoAccept` always says yes and is
/// what unattended/scheduled invocations select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationPolicy {
    Interactive,
    AutoAccept,
}

/// Prompts are only meaningful on a terminal; scheduled invocations run
/// without one and get the batch behavior.
fn attended() -> bool {
    nix::unistd::isatty(0).unwrap_or(false)
}

impl ConfirmationPolicy {
    /// `yes_to_all` is sticky: answering `a` once silences later prompts.
    pub fn confirm(&self, prompt: &str, yes_to_all: &mut bool) -> bool {
        if matches!(self, Self::AutoAccept) || *yes_to_all || !attended() {
            return true;
        }

        print!("{prompt} ? [y/n/a] ");
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return false;
        }

        match answer.trim() {
            "y" => true,
            "a" => {
                *yes_to_all = true;
                true
            }
            _ => false,
        }
    }

    /// Solicit a free-form value (e.g. a user identity). Returns None in
    /// batch context or on empty input.
    pub fn solicit(&self, prompt: &str) -> Option<String> {
        if matches!(self, Self::AutoAccept) || !attended() {
            return None;
        }

        print!("{prompt}: ");
        let _ = io::stdout().flush();
        let mut answer = String::new();
        if io::stdin().lock().read_line(&mut answer).is_err() {
            return None;
        }
        let answer = answer.trim();
        if answer.is_empty() {
            None
        } else {
            Some(answer.to_string())
        }
    }
}
