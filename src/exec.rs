use anyhow::{bail, Result};
use async_trait::async_trait;
use log::debug;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

/// Result of running one external command to completion.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_utf8(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A single command invocation: argv plus optional stdin/cwd/env.
#[derive(Debug, Clone, Default)]
pub struct CommandRequest {
    pub argv: Vec<String>,
    pub stdin: Option<Vec<u8>>,
    pub current_dir: Option<PathBuf>,
    pub env: HashMap<String, String>,
}

impl CommandRequest {
    pub fn new<const N: usize>(argv: [&str; N]) -> Self {
        Self {
            argv: argv.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Runs external commands on behalf of the managers.
///
/// All interface, firewall, disk-image and VNC tooling goes through this
/// seam so tests can swap in a recording mock.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    async fn run(&self, req: &CommandRequest) -> Result<CommandOutput>;

    /// Run a command and fail with its stderr when it exits non-zero.
    async fn run_checked(&self, req: &CommandRequest) -> Result<CommandOutput> {
        let out = self.run(req).await?;
        if !out.success() {
            bail!(
                "Command '{}' failed ({}): {}",
                req.argv.join(" "),
                out.status,
                out.stderr_utf8().trim()
            );
        }
        Ok(out)
    }
}

/// Executor backed by real host processes.
#[derive(Debug, Default, Clone)]
pub struct ShellExecutor;

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, req: &CommandRequest) -> Result<CommandOutput> {
        let Some((program, args)) = req.argv.split_first() else {
            bail!("Empty command");
        };
        debug!("Executing command: {}", req.argv.join(" "));

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .stdin(if req.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            });
        if let Some(dir) = &req.current_dir {
            cmd.current_dir(dir);
        }
        for (k, v) in &req.env {
            cmd.env(k, v);
        }

        let mut child = cmd.spawn()?;
        if let Some(input) = &req.stdin {
            if let Some(mut stdin) = child.stdin.take() {
                stdin.write_all(input).await?;
            }
        }
        let out = child.wait_with_output().await?;
        Ok(CommandOutput {
            status: out.status.code().unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }
}
