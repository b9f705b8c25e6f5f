//! Image generation through an external backend executable.
//!
//! Each run invokes the backend once as a subprocess and publishes exactly one
//! status message and exactly one [`ImageOutcome`], on two separate queues.

use crate::config::ImageConfig;
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::{ImageOutcome, TaskKind};
use crate::pipeline::task::{TaskHandle, TaskPoll, poll_queue};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Status published when the backend produced an image.
pub const SUCCESS_STATUS: &str = "Image generated successfully!";

/// Queues of one running image generation.
#[derive(Debug)]
pub struct ImageTaskHandle {
    status: mpsc::UnboundedReceiver<String>,
    result: TaskHandle<ImageOutcome>,
    output_path: PathBuf,
}

impl ImageTaskHandle {
    /// Next status message, without blocking.
    pub fn poll_status(&mut self) -> TaskPoll<String> {
        poll_queue(&mut self.status)
    }

    /// The final outcome, without blocking.
    pub fn poll_result(&mut self) -> TaskPoll<ImageOutcome> {
        self.result.try_next()
    }

    /// Where the backend was asked to write the image.
    #[must_use]
    pub fn output_path(&self) -> &Path {
        &self.output_path
    }
}

/// One run of the image backend.
pub struct ImageGenerationTask;

impl ImageGenerationTask {
    /// Spawn the backend for `prompt` and return the handle to its queues.
    pub fn start(runtime: &Handle, config: &ImageConfig, prompt: &str) -> ImageTaskHandle {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let (result_tx, result_rx) = mpsc::unbounded_channel();

        let output_path = output_path_in(&config.effective_output_dir());
        let executable = config.executable.clone();
        let args = build_args(config, prompt, &output_path);
        let target = output_path.clone();

        runtime.spawn(async move {
            let (status, outcome) = run_backend(&executable, args, &target).await;
            // Status first: the consumer finalizes on the outcome.
            let _ = status_tx.send(status);
            let _ = result_tx.send(outcome);
        });

        ImageTaskHandle {
            status: status_rx,
            result: TaskHandle::new(TaskKind::ImageGeneration, result_rx),
            output_path,
        }
    }
}

/// Unique, time-based output path inside `dir`.
#[must_use]
pub fn output_path_in(dir: &Path) -> PathBuf {
    let stamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
    dir.join(format!("generated_image_{stamp}.png"))
}

/// Command-line arguments for one backend invocation.
#[must_use]
pub fn build_args(config: &ImageConfig, prompt: &str, output_path: &Path) -> Vec<OsString> {
    vec![
        "--prompt".into(),
        prompt.into(),
        "--model-version".into(),
        config.model_version.clone().into(),
        "--output-path".into(),
        output_path.as_os_str().to_owned(),
        "--steps".into(),
        config.steps.to_string().into(),
    ]
}

/// Run the backend and turn the result into the status line and outcome.
///
/// Backend failures are reported as `Error: ...`; failures to launch it at
/// all as `Exception: ...`.
async fn run_backend(
    executable: &str,
    args: Vec<OsString>,
    output_path: &Path,
) -> (String, ImageOutcome) {
    match invoke_backend(executable, args, output_path).await {
        Ok(path) => (SUCCESS_STATUS.to_owned(), ImageOutcome::Ready(path)),
        Err(AssistantError::Image(reason)) => {
            warn!("image backend failed: {reason}");
            (format!("Error: {reason}"), ImageOutcome::Failed(reason))
        }
        Err(e) => {
            let reason = e.to_string();
            warn!("{reason}");
            (format!("Exception: {reason}"), ImageOutcome::Failed(reason))
        }
    }
}

async fn invoke_backend(
    executable: &str,
    args: Vec<OsString>,
    output_path: &Path,
) -> Result<PathBuf> {
    let program = which::which(executable).map_err(|e| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("image backend `{executable}` not found: {e}"),
        )
    })?;

    info!("starting image backend {}", program.display());
    let started = Instant::now();

    let output = tokio::process::Command::new(&program)
        .args(&args)
        .output()
        .await
        .map_err(|e| std::io::Error::new(e.kind(), format!("failed to run image backend: {e}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_owned();
        return Err(AssistantError::Image(if stderr.is_empty() {
            format!("image backend exited with {}", output.status)
        } else {
            stderr
        }));
    }

    if !output_path.is_file() {
        return Err(AssistantError::Image(format!(
            "image backend produced no file at {}",
            output_path.display()
        )));
    }

    info!(
        "image generated in {:.1}s: {}",
        started.elapsed().as_secs_f64(),
        output_path.display()
    );
    Ok(output_path.to_path_buf())
}
