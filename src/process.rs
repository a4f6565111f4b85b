//! External tool invocation.
//!
//! The engine never interprets what a tool does. It launches the program
//! with the arguments it was given, keeps the combined output as a log and
//! reports the exit status. A non-zero exit is a [`Process`] failure of the
//! task that ran it.
//!
//! [`Process`]: crate::ErrorKind::Process
use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};

use crate::core::CancelToken;
use crate::engine::{Children, TaskContext, TypedTask};
use crate::error::{ProcessError, TaskError, TaskResult};

/// An external executable, optionally run through an interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: Utf8PathBuf,
    /// E.g. `Rscript` or `python` for tools shipped as scripts.
    pub runner: Option<Utf8PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl Into<Utf8PathBuf>) -> Self {
        Self {
            program: program.into(),
            runner: None,
        }
    }

    pub fn with_runner(mut self, runner: impl Into<Utf8PathBuf>) -> Self {
        self.runner = Some(runner.into());
        self
    }

    /// Short name of the tool for logs and error messages.
    pub fn display_name(&self) -> &str {
        self.program.file_name().unwrap_or(self.program.as_str())
    }

    fn command(&self) -> Command {
        match &self.runner {
            Some(runner) => {
                let mut command = Command::new(runner);
                command.arg(&self.program);
                command
            }
            None => Command::new(&self.program),
        }
    }
}

/// One concrete run of a tool.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub tool: ToolCommand,
    pub args: Vec<String>,
    pub working_dir: Option<Utf8PathBuf>,
    /// Prepended to `PATH` for the duration of the run.
    pub extra_dirs: Vec<Utf8PathBuf>,
}

impl Invocation {
    pub fn new(tool: ToolCommand) -> Self {
        Self {
            tool,
            args: Vec::new(),
            working_dir: None,
            extra_dirs: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn extra_dirs(mut self, dirs: impl IntoIterator<Item = Utf8PathBuf>) -> Self {
        self.extra_dirs.extend(dirs);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was terminated by a signal.
    pub code: Option<i32>,
    pub success: bool,
    /// Captured stdout followed by stderr.
    pub log: String,
}

/// Launches external processes on behalf of tasks.
pub trait ProcessRunner: Send + Sync {
    /// Runs the invocation to completion. Implementations should give up
    /// with [`ProcessError::Canceled`] once `token` is canceled.
    fn run(&self, invocation: &Invocation, token: &CancelToken)
    -> Result<ProcessOutput, ProcessError>;
}

/// Runs tools as child processes of the current process.
#[derive(Debug, Clone)]
pub struct SystemProcessRunner {
    poll: Duration,
}

impl Default for SystemProcessRunner {
    fn default() -> Self {
        Self {
            poll: Duration::from_millis(20),
        }
    }
}

impl SystemProcessRunner {
    /// How often the cancellation token is checked while the tool runs.
    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll = poll;
        self
    }

    fn wait(
        &self,
        child: &mut Child,
        token: &CancelToken,
        name: &str,
    ) -> Result<ExitStatus, ProcessError> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if token.is_canceled() => {
                    tracing::debug!("killing '{name}'");
                    child.kill().ok();
                    child.wait().ok();
                    return Err(ProcessError::Canceled(name.to_string()));
                }
                Ok(None) => std::thread::sleep(self.poll),
                Err(e) => return Err(ProcessError::Wait(name.to_string(), e)),
            }
        }
    }
}

impl ProcessRunner for SystemProcessRunner {
    fn run(
        &self,
        invocation: &Invocation,
        token: &CancelToken,
    ) -> Result<ProcessOutput, ProcessError> {
        let name = invocation.tool.display_name();

        let mut command = invocation.tool.command();
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = &invocation.working_dir {
            command.current_dir(dir);
        }

        if !invocation.extra_dirs.is_empty() {
            let current = std::env::var_os("PATH").unwrap_or_default();
            let dirs = invocation
                .extra_dirs
                .iter()
                .map(|dir| PathBuf::from(dir.as_std_path()))
                .chain(std::env::split_paths(&current));
            command.env("PATH", std::env::join_paths(dirs)?);
        }

        tracing::debug!("launching '{name}' {:?}", invocation.args);
        let mut child = command
            .spawn()
            .map_err(|e| ProcessError::Launch(name.to_string(), e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, stdout, stderr) = std::thread::scope(|s| {
            let stdout = s.spawn(move || read_all(stdout));
            let stderr = s.spawn(move || read_all(stderr));
            let status = self.wait(&mut child, token, name);

            (
                status,
                stdout.join().unwrap_or_default(),
                stderr.join().unwrap_or_default(),
            )
        });

        let status = status?;
        let mut log = String::from_utf8_lossy(&stdout).into_owned();
        log.push_str(&String::from_utf8_lossy(&stderr));

        Ok(ProcessOutput {
            code: status.code(),
            success: status.success(),
            log,
        })
    }
}

fn read_all(pipe: Option<impl Read>) -> Vec<u8> {
    let mut buffer = Vec::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_end(&mut buffer).ok();
    }
    buffer
}

/// A leaf task running one external tool.
pub struct ProcessTask {
    name: String,
    invocation: Invocation,
    runner: Arc<dyn ProcessRunner>,
    output: Option<ProcessOutput>,
}

impl ProcessTask {
    pub fn new(
        name: impl Into<String>,
        invocation: Invocation,
        runner: Arc<dyn ProcessRunner>,
    ) -> Self {
        Self {
            name: name.into(),
            invocation,
            runner,
            output: None,
        }
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }
}

impl TypedTask for ProcessTask {
    type Output = ProcessOutput;

    fn get_name(&self) -> String {
        self.name.clone()
    }

    fn run(&mut self, context: &TaskContext) -> TaskResult<Children> {
        context.check_canceled()?;

        let tool = self.invocation.tool.display_name();
        let output = match self.runner.run(&self.invocation, context.token()) {
            Ok(output) => output,
            Err(ProcessError::Canceled(_)) => {
                return Err(TaskError::canceled(context.name()).into());
            }
            Err(e) => {
                let message = format!("couldn't run '{tool}'");
                return Err(TaskError::process(context.name(), message).with_source(e).into());
            }
        };

        if !output.success {
            let status = match output.code {
                Some(code) => format!("exit code {code}"),
                None => String::from("a signal"),
            };

            let mut message = format!("'{tool}' terminated with {status}");
            let log = output.log.trim();
            if !log.is_empty() {
                message.push('\n');
                message.push_str(log);
            }

            return Err(TaskError::process(context.name(), message).into());
        }

        self.output = Some(output);
        Ok(Vec::new())
    }

    fn output(&mut self) -> Option<Self::Output> {
        self.output.take()
    }
}

/// Resolves `path` against `base` unless it is already absolute.
pub(crate) fn resolve(base: &Utf8Path, path: &Utf8Path) -> Utf8PathBuf {
    if path.is_absolute() {
        path.to_owned()
    } else {
        base.join(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_name() {
        let tool = ToolCommand::new("/opt/cistrome/bin/MDSeqPos.py").with_runner("python3");
        assert_eq!(tool.display_name(), "MDSeqPos.py");
    }

    #[test]
    fn test_runner_is_the_executable() {
        let tool = ToolCommand::new("script.R").with_runner("Rscript");
        let command = tool.command();

        assert_eq!(command.get_program(), "Rscript");
        assert_eq!(command.get_args().collect::<Vec<_>>(), ["script.R"]);
    }

    #[test]
    fn test_resolve() {
        let base = Utf8Path::new("/data/out");
        assert_eq!(resolve(base, Utf8Path::new("a.txt")), "/data/out/a.txt");
        assert_eq!(resolve(base, Utf8Path::new("/tmp/b.txt")), "/tmp/b.txt");
    }

    #[cfg(unix)]
    mod unix {
        use std::time::Instant;

        use super::*;

        fn sh(script: &str) -> Invocation {
            Invocation::new(ToolCommand::new("/bin/sh")).args(["-c", script])
        }

        #[test]
        fn test_captures_log_and_status() {
            let runner = SystemProcessRunner::default();
            let output = runner
                .run(&sh("echo found 3 motifs; echo oops >&2; exit 2"), &CancelToken::new())
                .unwrap();

            assert_eq!(output.code, Some(2));
            assert!(!output.success);
            assert!(output.log.contains("found 3 motifs"));
            assert!(output.log.contains("oops"));
        }

        #[test]
        fn test_working_dir_and_search_path() {
            let dir = tempfile::TempDir::new().unwrap();
            let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

            let invocation = sh("pwd; echo \"$PATH\"")
                .working_dir(dir.clone())
                .extra_dirs([Utf8PathBuf::from("/opt/tools/bin")]);

            let output = SystemProcessRunner::default()
                .run(&invocation, &CancelToken::new())
                .unwrap();

            assert!(output.success);
            let real = dir.canonicalize_utf8().unwrap();
            assert!(output.log.contains(real.as_str()) || output.log.contains(dir.as_str()));
            assert!(output.log.contains("/opt/tools/bin:"));
        }

        #[test]
        fn test_cancel_kills_process() {
            let token = CancelToken::new();
            let canceler = token.clone();

            let thread = std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                canceler.cancel();
            });

            let start = Instant::now();
            let result = SystemProcessRunner::default().run(&sh("exec sleep 10"), &token);
            thread.join().unwrap();

            assert!(matches!(result, Err(ProcessError::Canceled(_))));
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        #[test]
        fn test_missing_program() {
            let invocation = Invocation::new(ToolCommand::new("/nonexistent/tool"));
            let result = SystemProcessRunner::default().run(&invocation, &CancelToken::new());

            assert!(matches!(result, Err(ProcessError::Launch(..))));
        }
    }
}
