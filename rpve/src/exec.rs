use std::{
    fmt,
    path::PathBuf,
    process::Stdio,
    sync::Mutex,
    time::Duration,
};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::{io::AsyncWriteExt, process::Command};

/// An external command, built up before handing it to a [`CommandRunner`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cmd {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    env: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    /// Only inspects state, never changes it.
    query: bool,
}

impl Cmd {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            stdin: None,
            env: vec![],
            current_dir: None,
            query: false,
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

    /// Append `--flag value`.
    pub fn opt(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    /// Mark the command as read-only, see [`DryRunRunner`].
    pub fn query(mut self) -> Self {
        self.query = true;
        self
    }

    pub fn is_query(&self) -> bool {
        self.query
    }

    pub fn get_stdin(&self) -> Option<&str> {
        self.stdin.as_deref()
    }
}

fn quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=,@+%".contains(c))
    {
        word.to_owned()
    } else {
        format!("'{}'", word.replace('\'', "'\\''"))
    }
}

impl fmt::Display for Cmd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{}={} ", key, quote(value))?;
        }
        write!(f, "{}", quote(&self.program))?;
        for arg in &self.args {
            write!(f, " {}", quote(arg))?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Output {
    /// Exit code, `None` if the process was killed by a signal.
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion. A non-zero exit is not an error here.
    async fn run(&self, cmd: &Cmd) -> Result<Output>;

    /// Run a command and fail unless it exits with status 0.
    async fn check(&self, cmd: &Cmd) -> Result<Output> {
        let output = self.run(cmd).await?;
        if output.success() {
            return Ok(output);
        }
        let status = output
            .code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        Err(anyhow!(
            "`{}` failed with status {}: {}",
            cmd,
            status,
            output.stderr.trim()
        ))
    }

    fn is_dry_run(&self) -> bool {
        false
    }
}

/// Runs commands on the local host.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    timeout: Option<Duration>,
}

impl SystemRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
        }
    }

    async fn spawn(&self, cmd: &Cmd) -> Result<std::process::Output> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .envs(cmd.env.iter().map(|(k, v)| (k, v)))
            .stdin(if cmd.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &cmd.current_dir {
            command.current_dir(dir);
        }

        let mut child = command
            .spawn()
            .with_context(|| format!("Failed to spawn {}", cmd.program))?;
        if let Some(input) = &cmd.stdin {
            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("Could not capture standard input"))?;
            stdin.write_all(input.as_bytes()).await?;
            // close stdin so the child sees EOF
            drop(stdin);
        }
        child
            .wait_with_output()
            .await
            .with_context(|| format!("Failed to wait for {}", cmd.program))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &Cmd) -> Result<Output> {
        tracing::debug!("Running {}", cmd);
        let output = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.spawn(cmd))
                .await
                .map_err(|_| anyhow!("`{}` timed out after {}s", cmd, timeout.as_secs()))??,
            None => self.spawn(cmd).await?,
        };
        let output = Output {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        for line in output.stdout.lines() {
            tracing::trace!("{}", line);
        }
        if !output.success() {
            tracing::debug!("{} exited with {:?}", cmd.program, output.code);
        }
        Ok(output)
    }
}

/// Logs commands instead of running them.
///
/// Queries report failure with empty output, so everything looks absent:
/// VMIDs are free, no storage is listed.
#[derive(Debug, Clone, Default)]
pub struct DryRunRunner;

#[async_trait]
impl CommandRunner for DryRunRunner {
    async fn run(&self, cmd: &Cmd) -> Result<Output> {
        if cmd.is_query() {
            tracing::debug!("[dry-run] {}", cmd);
            return Ok(Output::failed(1, "dry-run"));
        }
        tracing::info!("[dry-run] {}", cmd);
        if let Some(input) = cmd.get_stdin() {
            tracing::debug!("[dry-run] stdin:\n{}", input);
        }
        Ok(Output::ok(""))
    }

    fn is_dry_run(&self) -> bool {
        true
    }
}

/// Records every command and answers from scripted responses.
///
/// Responses are matched by prefix against the rendered command line; the
/// first matching response wins. Unmatched commands succeed with empty output.
#[derive(Debug, Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<Cmd>>,
    responses: Mutex<Vec<Response>>,
}

#[derive(Debug)]
struct Response {
    prefix: String,
    output: Output,
    /// Forgotten after the first match.
    once: bool,
}

impl RecordingRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(&self, prefix: impl Into<String>, output: Output) -> &Self {
        self.push(prefix.into(), output, false)
    }

    /// Like [`respond`](Self::respond), for the first matching command only.
    pub fn respond_once(&self, prefix: impl Into<String>, output: Output) -> &Self {
        self.push(prefix.into(), output, true)
    }

    fn push(&self, prefix: String, output: Output, once: bool) -> &Self {
        self.responses
            .lock()
            .expect("responses lock poisoned")
            .push(Response {
                prefix,
                output,
                once,
            });
        self
    }

    pub fn fail_on(&self, prefix: impl Into<String>) -> &Self {
        self.respond(prefix, Output::failed(1, "scripted failure"))
    }

    pub fn commands(&self) -> Vec<Cmd> {
        self.commands
            .lock()
            .expect("commands lock poisoned")
            .clone()
    }

    /// Rendered command lines, in execution order.
    pub fn lines(&self) -> Vec<String> {
        self.commands().iter().map(|c| c.to_string()).collect()
    }

    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.lines().iter().position(|l| l.starts_with(prefix))
    }
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, cmd: &Cmd) -> Result<Output> {
        let line = cmd.to_string();
        self.commands
            .lock()
            .expect("commands lock poisoned")
            .push(cmd.clone());
        let mut responses = self.responses.lock().expect("responses lock poisoned");
        let matched = responses
            .iter()
            .position(|response| line.starts_with(response.prefix.as_str()));
        Ok(match matched {
            Some(index) if responses[index].once => responses.remove(index).output,
            Some(index) => responses[index].output.clone(),
            None => Output::ok(""),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_shell_quoted() {
        let cmd = Cmd::new("qm")
            .args(["set", "9000"])
            .opt("--ciuser", "admin")
            .opt("--cipassword", "it's secret")
            .env("LANG", "C");
        assert_eq!(
            cmd.to_string(),
            "LANG=C qm set 9000 --ciuser admin --cipassword 'it'\\''s secret'"
        );
        assert_eq!(Cmd::new("echo").arg("").to_string(), "echo ''");
    }

    #[tokio::test]
    async fn system_runner_captures_output() {
        let runner = SystemRunner::default();
        let output = runner
            .check(&Cmd::new("sh").args(["-c", "echo out; echo err >&2"]))
            .await
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn system_runner_feeds_stdin() {
        let runner = SystemRunner::default();
        let output = runner
            .check(&Cmd::new("cat").stdin("hello"))
            .await
            .unwrap();
        assert_eq!(output.stdout, "hello");
    }

    #[tokio::test]
    async fn check_reports_failures() {
        let runner = SystemRunner::default();
        let err = runner
            .check(&Cmd::new("sh").args(["-c", "echo broken >&2; exit 3"]))
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("status 3"), "{}", msg);
        assert!(msg.contains("broken"), "{}", msg);
    }

    #[tokio::test]
    async fn system_runner_times_out() {
        let runner = SystemRunner::new(Some(Duration::from_millis(100)));
        let err = runner
            .run(&Cmd::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn dry_run_pretends_nothing_exists() {
        let runner = DryRunRunner;
        assert!(!runner.run(&Cmd::new("qm").args(["status", "100"]).query()).await.unwrap().success());
        assert!(runner.run(&Cmd::new("qm").args(["destroy", "100"])).await.unwrap().success());
        assert!(runner.is_dry_run());
    }

    #[tokio::test]
    async fn recording_runner_scripts_responses() {
        let runner = RecordingRunner::new();
        runner.respond("qm status 100", Output::ok("status: stopped"));
        runner.fail_on("qm status");

        assert!(runner.run(&Cmd::new("qm").args(["status", "100"])).await.unwrap().success());
        assert!(!runner.run(&Cmd::new("qm").args(["status", "101"])).await.unwrap().success());
        assert!(runner.run(&Cmd::new("pct").arg("list")).await.unwrap().success());
        assert_eq!(runner.lines(), vec!["qm status 100", "qm status 101", "pct list"]);
        assert_eq!(runner.position("pct"), Some(2));
    }

    #[tokio::test]
    async fn one_shot_responses_are_consumed() {
        let runner = RecordingRunner::new();
        runner.respond_once("pct status", Output::failed(2, "no such container"));

        assert!(!runner.run(&Cmd::new("pct").args(["status", "7"])).await.unwrap().success());
        assert!(runner.run(&Cmd::new("pct").args(["status", "7"])).await.unwrap().success());
    }
}
