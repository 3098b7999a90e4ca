//! External command execution seam.
//!
//! Every subprocess the engine drives (easy-rsa, openvpn, sshpass, scp,
//! systemctl, curl) goes through [`CommandRunner`] so tests can substitute a
//! fake. The trait also carries the one semi-interactive shape the PKI
//! toolchain needs: wait for a known prompt, answer it once, let the command
//! finish.

use crate::error::EngineError;
use async_trait::async_trait;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error};

/// Abstraction over external command execution.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and return its stdout.
    async fn run(&self, cmd: &str, args: &[&str], cwd: Option<&Path>)
        -> Result<String, EngineError>;

    /// Run a command that asks a single question on stdout: once
    /// `expected_prompt` appears, `response` is written to stdin and the
    /// command is left to finish.
    async fn run_interactive(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
        expected_prompt: &str,
        response: &str,
    ) -> Result<(), EngineError>;

    /// Check whether a tool is on PATH.
    async fn tool_available(&self, tool: &str) -> bool;
}

/// Runner backed by `tokio::process`.
#[derive(Debug, Default, Clone)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        SystemRunner
    }

    fn spawn_error(err: io::Error, cmd: &str) -> EngineError {
        match err.kind() {
            io::ErrorKind::NotFound => EngineError::ToolUnavailable(cmd.to_string()),
            io::ErrorKind::PermissionDenied => EngineError::PermissionDenied(cmd.to_string()),
            _ => EngineError::Io(err),
        }
    }

    fn describe(cmd: &str, args: &[&str]) -> String {
        if args.is_empty() {
            cmd.to_string()
        } else {
            format!("{} {}", cmd, args.join(" "))
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<String, EngineError> {
        debug!("Running command: {} {:?}", cmd, args);

        let mut command = Command::new(cmd);
        command.args(args);
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let output = command
            .output()
            .await
            .map_err(|e| Self::spawn_error(e, cmd))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!("Command failed: {} {}", output.status, stderr);
            return Err(EngineError::CommandFailed {
                command: Self::describe(cmd, args),
                status: output.status.to_string(),
                stderr,
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        debug!("Command output: {}", stdout);

        Ok(stdout)
    }

    async fn run_interactive(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
        expected_prompt: &str,
        response: &str,
    ) -> Result<(), EngineError> {
        debug!(
            "Running interactive command: {} {:?} (answering {:?})",
            cmd, args, expected_prompt
        );

        let mut command = Command::new(cmd);
        command
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|e| Self::spawn_error(e, cmd))?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            EngineError::Io(io::Error::other("child stdin was not captured"))
        })?;
        let mut stdout = child.stdout.take().ok_or_else(|| {
            EngineError::Io(io::Error::other("child stdout was not captured"))
        })?;

        // Drain stderr concurrently: a child that fills the stderr pipe
        // before printing the prompt would otherwise block against our
        // stdout read below.
        let stderr_pipe = child.stderr.take();
        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            if let Some(mut pipe) = stderr_pipe {
                let _ = pipe.read_to_end(&mut buf).await;
            }
            buf
        });

        // Read stdout until the prompt shows up, answer it once, then let
        // the command run out. EOF before the prompt falls through to the
        // exit-status check below.
        let mut seen = String::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = stdout.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            seen.push_str(&String::from_utf8_lossy(&buf[..n]));
            if seen.contains(expected_prompt) {
                stdin.write_all(response.as_bytes()).await?;
                stdin.write_all(b"\n").await?;
                stdin.flush().await?;
                break;
            }
        }
        drop(stdin);

        let mut rest = Vec::new();
        let _ = stdout.read_to_end(&mut rest).await;

        let status = child.wait().await?;
        let stderr = stderr_task.await.unwrap_or_default();
        if !status.success() {
            return Err(EngineError::CommandFailed {
                command: Self::describe(cmd, args),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }

        Ok(())
    }

    async fn tool_available(&self, tool: &str) -> bool {
        Command::new("sh")
            .arg("-c")
            .arg(format!("command -v {} >/dev/null 2>&1", tool))
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

/// Scripted runner for tests: commands whose rendered form contains any
/// configured substring fail; everything else succeeds. Every invocation is
/// recorded for assertions.
#[derive(Debug, Default)]
pub struct FakeRunner {
    fail_matching: Vec<String>,
    pub invocations: std::sync::Mutex<Vec<String>>,
    missing_tools: Vec<String>,
}

impl FakeRunner {
    pub fn new() -> Self {
        FakeRunner::default()
    }

    /// Fail any command whose rendered form contains `needle`.
    pub fn fail_on(mut self, needle: &str) -> Self {
        self.fail_matching.push(needle.to_string());
        self
    }

    /// Report `tool` as missing from PATH.
    pub fn without_tool(mut self, tool: &str) -> Self {
        self.missing_tools.push(tool.to_string());
        self
    }

    pub fn recorded(&self) -> Vec<String> {
        self.invocations.lock().unwrap().clone()
    }

    fn record_and_check(&self, cmd: &str, args: &[&str]) -> Result<(), EngineError> {
        let rendered = format!("{} {}", cmd, args.join(" "));
        self.invocations.lock().unwrap().push(rendered.clone());

        if let Some(needle) = self.fail_matching.iter().find(|n| rendered.contains(n.as_str())) {
            return Err(EngineError::CommandFailed {
                command: rendered,
                status: "exit status: 1".to_string(),
                stderr: format!("scripted failure on `{}`", needle),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl CommandRunner for FakeRunner {
    async fn run(
        &self,
        cmd: &str,
        args: &[&str],
        _cwd: Option<&Path>,
    ) -> Result<String, EngineError> {
        self.record_and_check(cmd, args)?;
        Ok(String::new())
    }

    async fn run_interactive(
        &self,
        cmd: &str,
        args: &[&str],
        _cwd: Option<&Path>,
        _expected_prompt: &str,
        _response: &str,
    ) -> Result<(), EngineError> {
        self.record_and_check(cmd, args)
    }

    async fn tool_available(&self, tool: &str) -> bool {
        !self.missing_tools.iter().any(|t| t == tool)
    }
}

/// Where a fake needs to materialize artifacts an external tool would have
/// produced (inline bundles, ta.key), tests can wrap [`FakeRunner`] with a
/// side-effect callback keyed on the rendered command line.
pub struct SideEffectRunner<F>
where
    F: Fn(&str) + Send + Sync,
{
    inner: FakeRunner,
    effect: F,
}

impl<F> SideEffectRunner<F>
where
    F: Fn(&str) + Send + Sync,
{
    pub fn new(inner: FakeRunner, effect: F) -> Self {
        SideEffectRunner { inner, effect }
    }
}

#[async_trait]
impl<F> CommandRunner for SideEffectRunner<F>
where
    F: Fn(&str) + Send + Sync,
{
    async fn run(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
    ) -> Result<String, EngineError> {
        let rendered = format!("{} {}", cmd, args.join(" "));
        let out = self.inner.run(cmd, args, cwd).await?;
        (self.effect)(&rendered);
        Ok(out)
    }

    async fn run_interactive(
        &self,
        cmd: &str,
        args: &[&str],
        cwd: Option<&Path>,
        expected_prompt: &str,
        response: &str,
    ) -> Result<(), EngineError> {
        let rendered = format!("{} {}", cmd, args.join(" "));
        self.inner
            .run_interactive(cmd, args, cwd, expected_prompt, response)
            .await?;
        (self.effect)(&rendered);
        Ok(())
    }

    async fn tool_available(&self, tool: &str) -> bool {
        self.inner.tool_available(tool).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let runner = SystemRunner::new();
        let out = runner.run("echo", &["hello"], None).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_missing_tool_maps_to_tool_unavailable() {
        let runner = SystemRunner::new();
        let err = runner
            .run("definitely-not-a-real-binary", &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ToolUnavailable(_)));
    }

    #[tokio::test]
    async fn test_nonzero_exit_maps_to_command_failed() {
        let runner = SystemRunner::new();
        let err = runner.run("false", &[], None).await.unwrap_err();
        match err {
            EngineError::CommandFailed { command, .. } => assert_eq!(command, "false"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interactive_answers_prompt() {
        let runner = SystemRunner::new();
        // `read` echoes nothing, so use a tiny shell session that prompts
        // and then checks what it was given.
        runner
            .run_interactive(
                "sh",
                &[
                    "-c",
                    "printf 'Common Name:'; read name; test \"$name\" = office",
                ],
                None,
                "Common Name",
                "office",
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_interactive_survives_stderr_flood_before_prompt() {
        let runner = SystemRunner::new();
        // The child writes well past a pipe buffer to stderr before
        // prompting; the prompt must still be answered without stalling.
        tokio::time::timeout(
            std::time::Duration::from_secs(10),
            runner.run_interactive(
                "sh",
                &[
                    "-c",
                    "head -c 262144 /dev/zero | tr '\\0' 'e' >&2; \
                     printf 'Common Name:'; read name; test \"$name\" = office",
                ],
                None,
                "Common Name",
                "office",
            ),
        )
        .await
        .expect("stderr output before the prompt must not stall the exchange")
        .unwrap();
    }

    #[tokio::test]
    async fn test_interactive_failure_reports_stderr() {
        let runner = SystemRunner::new();
        let err = runner
            .run_interactive(
                "sh",
                &["-c", "printf 'Common Name:'; read name; echo bad >&2; exit 3"],
                None,
                "Common Name",
                "office",
            )
            .await
            .unwrap_err();
        match err {
            EngineError::CommandFailed { stderr, .. } => assert_eq!(stderr, "bad"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tool_available() {
        let runner = SystemRunner::new();
        assert!(runner.tool_available("sh").await);
        assert!(!runner.tool_available("definitely-not-a-real-binary").await);
    }

    #[tokio::test]
    async fn test_fake_runner_scripted_failure() {
        let runner = FakeRunner::new().fail_on("systemctl start");
        assert!(runner.run("systemctl", &["stop", "x"], None).await.is_ok());
        assert!(runner.run("systemctl", &["start", "x"], None).await.is_err());
        assert_eq!(runner.recorded().len(), 2);
    }
}
