//! Sandbox strategy: persistent sandboxes driven by detached commands.
//!
//! Sandboxes are named `<prefix><index>` and reused when they already
//! exist. A dispatch prepares the scratch directory on the shared volume and
//! starts the compiler inside an idle sandbox without waiting for it. The
//! command touches a marker file in the scratch directory when the compiler
//! exits, and each reconcile checks for markers without blocking.
//!
//! No timeout applies here: a compiler that never exits keeps its sandbox
//! busy until shutdown.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use texflow_core::{defaults, Error, Result, SandboxConfig, Task};

use super::{Completion, Outcome, PoolStats, WorkerPool};
use crate::job::{CompileContext, CompileJob};

/// Execution substrate for the sandbox pool.
#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Make sure the sandbox `name` is running, reusing it if it exists.
    async fn ensure(&self, name: &str) -> Result<()>;

    /// Start `argv` inside `name` with working directory `workdir`; do not wait.
    async fn exec_detached(&self, name: &str, workdir: &Path, argv: &[String]) -> Result<()>;

    /// Stop the sandbox `name`.
    async fn stop(&self, name: &str) -> Result<()>;
}

/// Runs sandboxes as Docker containers through the `docker` CLI.
///
/// The shared volume is mounted at the scratch root, so scratch paths are
/// the same inside and outside the containers.
pub struct DockerRuntime {
    config: SandboxConfig,
    mount: PathBuf,
}

impl DockerRuntime {
    pub fn new(config: SandboxConfig, mount: impl Into<PathBuf>) -> Self {
        Self {
            config,
            mount: mount.into(),
        }
    }

    async fn docker(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(host) = &self.config.docker_host {
            cmd.env("DOCKER_HOST", host);
        }

        let timeout = Duration::from_secs(defaults::SANDBOX_COMMAND_TIMEOUT_SECS);
        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| {
                Error::Sandbox(format!(
                    "docker {} timed out after {}s",
                    args[0],
                    timeout.as_secs()
                ))
            })?
            .map_err(|e| Error::Sandbox(format!("failed to execute docker: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Sandbox(format!(
                "docker {} failed ({}): {}",
                args[0],
                output.status,
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl SandboxRuntime for DockerRuntime {
    async fn ensure(&self, name: &str) -> Result<()> {
        let state = self
            .docker(&["inspect", "--type", "container", "--format", "{{.State.Running}}", name])
            .await;

        match state {
            Ok(running) if running.trim() == "true" => {
                info!(subsystem = "pool", component = "sandbox", worker = name, "Reusing sandbox");
            }
            Ok(_) => {
                self.docker(&["start", name]).await?;
                info!(subsystem = "pool", component = "sandbox", worker = name, "Restarted sandbox");
            }
            Err(_) => {
                let volume = format!("{}:{}", self.config.volume, self.mount.display());
                self.docker(&[
                    "run",
                    "-d",
                    "-i",
                    "-t",
                    "--name",
                    name,
                    "-v",
                    &volume,
                    &self.config.image,
                    defaults::SANDBOX_IDLE_COMMAND,
                ])
                .await?;
                info!(
                    subsystem = "pool",
                    component = "sandbox",
                    worker = name,
                    image = %self.config.image,
                    "Created sandbox"
                );
            }
        }
        Ok(())
    }

    async fn exec_detached(&self, name: &str, workdir: &Path, argv: &[String]) -> Result<()> {
        let workdir = workdir.to_string_lossy();
        let mut args = vec!["exec", "-d", "-w", &*workdir, name];
        args.extend(argv.iter().map(String::as_str));
        self.docker(&args).await.map(|_| ())
    }

    async fn stop(&self, name: &str) -> Result<()> {
        self.docker(&["stop", name]).await.map(|_| ())
    }
}

/// Runs "sandboxed" commands directly on the host.
///
/// For development and tests, where the scratch root is local.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalRuntime;

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn ensure(&self, name: &str) -> Result<()> {
        debug!(subsystem = "pool", component = "local", worker = name, "Local sandbox ready");
        Ok(())
    }

    async fn exec_detached(&self, name: &str, workdir: &Path, argv: &[String]) -> Result<()> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::Sandbox("empty command".into()))?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| Error::Sandbox(format!("failed to execute {}: {}", program, e)))?;

        let name = name.to_string();
        tokio::spawn(async move {
            if let Err(e) = child.wait().await {
                warn!(subsystem = "pool", component = "local", worker = %name, error = %e, "Wait failed");
            }
        });
        Ok(())
    }

    async fn stop(&self, _name: &str) -> Result<()> {
        Ok(())
    }
}

/// Wrap `argv` so the marker is touched once it exits, whatever its status.
///
/// The marker and arguments travel as positional parameters; nothing is
/// interpolated into the shell script.
pub fn with_marker(marker: &Path, argv: Vec<String>) -> Vec<String> {
    let mut wrapped = vec![
        "sh".to_string(),
        "-c".to_string(),
        r#""$@"; touch "$0""#.to_string(),
        marker.to_string_lossy().into_owned(),
    ];
    wrapped.extend(argv);
    wrapped
}

struct Assignment {
    task: Task,
    job: CompileJob,
    marker: PathBuf,
}

/// Pool of persistent sandboxes.
pub struct SandboxPool {
    ctx: CompileContext,
    runtime: Arc<dyn SandboxRuntime>,
    sandboxes: Vec<String>,
    /// Sandbox name to the attempt it runs.
    assigned: HashMap<String, Assignment>,
    /// Attempts that ended during dispatch.
    ready: Vec<Completion>,
}

impl SandboxPool {
    /// Ensure `compiler_number` sandboxes exist and are running.
    pub async fn start(ctx: CompileContext, runtime: Arc<dyn SandboxRuntime>) -> Result<Self> {
        let prefix = ctx
            .config
            .sandbox
            .as_ref()
            .map(|s| s.name_prefix.clone())
            .unwrap_or_else(|| defaults::SANDBOX_NAME_PREFIX.to_string());

        let mut sandboxes = Vec::with_capacity(ctx.config.worker_count());
        for index in 0..ctx.config.worker_count() {
            let name = format!("{}{}", prefix, index);
            runtime.ensure(&name).await?;
            sandboxes.push(name);
        }

        info!(
            subsystem = "pool",
            component = "sandbox",
            workers = sandboxes.len(),
            "Sandbox pool started"
        );

        Ok(Self {
            ctx,
            runtime,
            sandboxes,
            assigned: HashMap::new(),
            ready: Vec::new(),
        })
    }

    /// Names of the sandboxes in this pool.
    pub fn sandboxes(&self) -> &[String] {
        &self.sandboxes
    }

    /// Resolve an attempt that could not be started as failed.
    async fn fail_now(&mut self, task: Task, job: &CompileJob, error: Error) {
        warn!(
            subsystem = "pool",
            component = "sandbox",
            task_id = %task.task_id,
            error = %error,
            "Dispatch failed"
        );
        if !self.ctx.config.keep_failed_scratch {
            job.cleanup().await;
        }
        self.ready.push(Completion {
            task,
            outcome: Outcome::Failed {
                error: error.to_string(),
            },
        });
    }

    async fn resolve(&self, assignment: Assignment) -> Completion {
        let Assignment { task, job, marker } = assignment;

        if let Err(e) = tokio::fs::remove_file(&marker).await {
            warn!(subsystem = "pool", task_id = %task.task_id, error = %e, "Failed to remove marker");
        }

        let outcome = match job.read_artifact().await {
            Ok(pdf) => Outcome::Finished { pdf },
            Err(e) => Outcome::Failed {
                error: e.to_string(),
            },
        };

        let keep = self.ctx.config.keep_failed_scratch && matches!(outcome, Outcome::Failed { .. });
        if !keep {
            job.cleanup().await;
        }
        Completion { task, outcome }
    }
}

#[async_trait]
impl WorkerPool for SandboxPool {
    fn name(&self) -> &'static str {
        "sandbox"
    }

    fn size(&self) -> usize {
        self.sandboxes.len()
    }

    fn idle_count(&self) -> usize {
        self.sandboxes.len() - self.assigned.len()
    }

    fn stats(&self) -> PoolStats {
        PoolStats {
            queued: 0,
            busy: self.assigned.len(),
            results: self.ready.len(),
        }
    }

    async fn dispatch(&mut self, task: Task) -> Result<()> {
        let name = self
            .sandboxes
            .iter()
            .find(|name| !self.assigned.contains_key(*name))
            .cloned()
            .ok_or_else(|| Error::Internal("no idle sandbox".into()))?;

        let job = self.ctx.job(&task);
        let marker = job.scratch().join(defaults::MARKER_FILE_NAME);
        let _ = tokio::fs::remove_file(&marker).await;

        if let Err(e) = job.prepare(&self.ctx, &task).await {
            self.fail_now(task, &job, e).await;
            return Ok(());
        }

        let argv = with_marker(&marker, self.ctx.command.argv(job.source(), job.scratch()));
        if let Err(e) = self.runtime.exec_detached(&name, job.scratch(), &argv).await {
            self.fail_now(task, &job, e).await;
            return Ok(());
        }

        info!(
            subsystem = "pool",
            component = "sandbox",
            worker = %name,
            task_id = %task.task_id,
            "Compiling task"
        );
        self.assigned.insert(name, Assignment { task, job, marker });
        Ok(())
    }

    async fn reconcile(&mut self) -> Result<Vec<Completion>> {
        let mut done = std::mem::take(&mut self.ready);

        let mut finished = Vec::new();
        for (name, assignment) in &self.assigned {
            if tokio::fs::try_exists(&assignment.marker).await.unwrap_or(false) {
                finished.push(name.clone());
            }
        }

        for name in finished {
            if let Some(assignment) = self.assigned.remove(&name) {
                debug!(subsystem = "pool", worker = %name, task_id = %assignment.task.task_id, "Marker found");
                done.push(self.resolve(assignment).await);
            }
        }
        Ok(done)
    }

    async fn shutdown(&mut self) -> Result<Vec<Completion>> {
        let done = self.reconcile().await?;

        for name in &self.sandboxes {
            if let Err(e) = self.runtime.stop(name).await {
                warn!(subsystem = "pool", component = "sandbox", worker = %name, error = %e, "Failed to stop sandbox");
            }
        }

        if !self.assigned.is_empty() {
            warn!(
                subsystem = "pool",
                component = "sandbox",
                in_flight = self.assigned.len(),
                "Stopping with tasks still compiling"
            );
        }
        for (_, assignment) in self.assigned.drain() {
            assignment.job.cleanup().await;
        }

        info!(subsystem = "pool", component = "sandbox", completions = done.len(), "Sandbox pool stopped");
        Ok(done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_wrapper_passes_arguments_positionally() {
        let wrapped = with_marker(
            Path::new("/scratch/t1/finished"),
            vec!["xelatex".into(), "/scratch/t1/t1.tex; rm -rf /".into()],
        );
        assert_eq!(wrapped[0], "sh");
        assert_eq!(wrapped[2], r#""$@"; touch "$0""#);
        assert_eq!(wrapped[3], "/scratch/t1/finished");
        assert_eq!(&wrapped[4..], ["xelatex", "/scratch/t1/t1.tex; rm -rf /"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_runtime_touches_marker() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("finished");
        let argv = with_marker(&marker, vec!["touch".into(), "out.pdf".into()]);

        LocalRuntime
            .exec_detached("local-0", dir.path(), &argv)
            .await
            .unwrap();

        let mut waited = 0;
        while !marker.exists() && waited < 100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            waited += 1;
        }
        assert!(marker.exists());
        assert!(dir.path().join("out.pdf").exists());
    }
}
