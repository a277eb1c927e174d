//! One compile attempt for one task.
//!
//! A job owns `<scratch root>/<task id>/` for the length of the attempt:
//! the rendered `<task id>.tex`, staged images, the template's class file
//! and the compiler's output, which must include `<task id>.pdf`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, warn};

use texflow_core::{defaults, CompilerConfig, Error, ImageRef, Result, Task};
use texflow_db::Records;

use crate::command::CompileCommand;
use crate::template;

/// Everything a worker needs to run compile jobs.
#[derive(Clone)]
pub struct CompileContext {
    pub config: Arc<CompilerConfig>,
    pub records: Records,
    pub command: CompileCommand,
    /// Absolute scratch root.
    pub scratch_root: PathBuf,
}

impl CompileContext {
    /// Parse the compile command and create the scratch root.
    pub async fn new(config: Arc<CompilerConfig>, records: Records) -> Result<Self> {
        let command = CompileCommand::parse(config.compile_cmd()?)?;
        let scratch_root = absolute(&config.compile_tmp_dir)?;
        tokio::fs::create_dir_all(&scratch_root).await?;
        Ok(Self {
            config,
            records,
            command,
            scratch_root,
        })
    }

    pub fn job(&self, task: &Task) -> CompileJob {
        CompileJob::new(task, &self.scratch_root)
    }
}

/// Paths of one attempt.
#[derive(Debug, Clone)]
pub struct CompileJob {
    task_id: String,
    scratch: PathBuf,
    source: PathBuf,
    artifact: PathBuf,
}

impl CompileJob {
    pub fn new(task: &Task, scratch_root: &Path) -> Self {
        let scratch = scratch_root.join(&task.task_id);
        let source = scratch.join(format!("{}.{}", task.task_id, defaults::SOURCE_EXTENSION));
        let artifact = scratch.join(format!("{}.{}", task.task_id, defaults::ARTIFACT_EXTENSION));
        Self {
            task_id: task.task_id.clone(),
            scratch,
            source,
            artifact,
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.scratch
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    pub fn artifact(&self) -> &Path {
        &self.artifact
    }

    /// Create the scratch directory and write everything the compiler reads.
    pub async fn prepare(&self, ctx: &CompileContext, task: &Task) -> Result<()> {
        let rendered = template::render(&ctx.config, task).await?;

        tokio::fs::create_dir_all(&self.scratch).await?;
        self.stage_images(ctx, task).await?;

        if let Some(cls_path) = &ctx.config.template(&task.template)?.cls_path {
            let name = cls_path.file_name().ok_or_else(|| {
                Error::Config(format!("class path has no file name: {}", cls_path.display()))
            })?;
            tokio::fs::copy(cls_path, self.scratch.join(name))
                .await
                .map_err(|e| {
                    Error::Template(format!("cannot copy {}: {}", cls_path.display(), e))
                })?;
        }

        tokio::fs::write(&self.source, rendered.source).await?;
        debug!(
            subsystem = "compile",
            task_id = %self.task_id,
            scratch = %self.scratch.display(),
            "Compile job prepared"
        );
        Ok(())
    }

    /// Write each referenced image into the scratch directory. Images that
    /// cannot be resolved are logged and skipped.
    async fn stage_images(&self, ctx: &CompileContext, task: &Task) -> Result<()> {
        for reference in &task.images {
            let image_ref = match ImageRef::parse(reference) {
                Ok(r) => r,
                Err(e) => {
                    warn!(subsystem = "compile", task_id = %self.task_id, error = %e, "Skipping image");
                    continue;
                }
            };
            let bytes = match ctx
                .records
                .images
                .get(&task.user_id, &image_ref.image_id)
                .await
                .and_then(|image| image.decode_content())
            {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(
                        subsystem = "compile",
                        task_id = %self.task_id,
                        image = %reference,
                        error = %e,
                        "Skipping image"
                    );
                    continue;
                }
            };
            tokio::fs::write(self.scratch.join(image_ref.file_name()), bytes).await?;
        }
        Ok(())
    }

    /// Read the produced artifact.
    pub async fn read_artifact(&self) -> Result<Vec<u8>> {
        match tokio::fs::read(&self.artifact).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::MissingArtifact(self.artifact.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Remove the scratch directory. Failures are logged.
    pub async fn cleanup(&self) {
        match tokio::fs::remove_dir_all(&self.scratch).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                subsystem = "compile",
                task_id = %self.task_id,
                error = %e,
                "Failed to remove scratch directory"
            ),
        }
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
