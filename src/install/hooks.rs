//! Lifecycle hooks declared in a package's `scripts`.

use std::path::Path;
use std::process::Stdio;

use anyhow::{Result, bail};
use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HookRunner: Send + Sync {
    /// Run `script` for the `hook` lifecycle event inside `cwd`.
    async fn run(&self, hook: &str, script: &str, cwd: &Path) -> Result<()>;
}

/// Runs hooks through the platform shell.
#[derive(Debug, Default, Clone)]
pub struct ShellHookRunner;

impl ShellHookRunner {
    fn command(script: &str) -> Command {
        if cfg!(windows) {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(script);
            cmd
        } else {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(script);
            cmd
        }
    }
}

#[async_trait]
impl HookRunner for ShellHookRunner {
    #[tracing::instrument(skip(self))]
    async fn run(&self, hook: &str, script: &str, cwd: &Path) -> Result<()> {
        debug!("Running {} hook in {:?}: {}", hook, cwd, script);

        let mut cmd = Self::command(script);
        cmd.current_dir(cwd)
            .env("BOXPM_LIFECYCLE_EVENT", hook)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = cmd.output().await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        if !stdout.trim().is_empty() {
            debug!("{} output: {}", hook, stdout.trim());
        }
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("{} exited with {}: {}", hook, output.status, stderr.trim());
        }
        Ok(())
    }
}
