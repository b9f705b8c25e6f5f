//! Streaming chat requests against a line-delimited JSON generate endpoint.
//!
//! Supports any server implementing the `/api/generate` streaming contract
//! (Ollama and compatible servers). Each request runs as its own task and
//! republishes the response as [`StreamToken`]s on a single-consumer queue.

pub mod ndjson;

use crate::config::LlmConfig;
use crate::error::{AssistantError, Result};
use crate::pipeline::messages::{StreamToken, TaskKind};
use crate::pipeline::task::TaskHandle;
use futures_util::StreamExt;
use ndjson::{GenerateLine, NdjsonLineParser};
use serde::Serialize;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Body of a generate request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
}

/// Build the full prompt: rendered history, the new user line, and the bot cue.
#[must_use]
pub fn build_prompt(rendered_context: &str, user_prompt: &str) -> String {
    format!("{rendered_context}\nUser: {user_prompt}\nBot:")
}

/// Build the HTTP client shared by every chat request of a session.
///
/// # Errors
///
/// Returns an error if the TLS backend cannot be initialised.
pub fn build_client(config: &LlmConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(config.connect_timeout())
        .build()
        .map_err(|e| AssistantError::Llm(format!("failed to build HTTP client: {e}")))
}

/// One streaming request to the language model backend.
pub struct ChatStreamTask;

impl ChatStreamTask {
    /// Spawn the request on `runtime` and return the handle to its token queue.
    ///
    /// The queue always receives exactly one terminal token ([`StreamToken::End`]
    /// or [`StreamToken::Failed`]), after which the task returns.
    pub fn start(
        runtime: &Handle,
        client: reqwest::Client,
        config: &LlmConfig,
        model: &str,
        rendered_context: &str,
        user_prompt: &str,
    ) -> TaskHandle<StreamToken> {
        let (tx, rx) = mpsc::unbounded_channel();
        let url = config.generate_url();
        let idle_timeout = config.idle_timeout();
        let request = GenerateRequest {
            model: model.to_owned(),
            prompt: build_prompt(rendered_context, user_prompt),
        };

        runtime.spawn(async move {
            let started = Instant::now();
            let outcome = stream_generate(&client, &url, &request, idle_timeout, &tx).await;
            let terminal = match outcome {
                Ok(fragments) => {
                    info!(
                        "chat stream finished: {fragments} fragments in {:.1}s",
                        started.elapsed().as_secs_f64()
                    );
                    StreamToken::End
                }
                Err(e) => {
                    warn!("chat stream failed: {e}");
                    StreamToken::Failed(e.to_string())
                }
            };
            if tx.send(terminal).is_err() {
                debug!("chat stream consumer dropped before the terminal token");
            }
        });

        TaskHandle::new(TaskKind::ChatStreaming, rx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineFlow {
    Continue,
    Done,
}

/// Send the request and forward fragments until the backend finishes.
///
/// Waiting longer than `idle_timeout` for the response headers or for the
/// next chunk fails the stream.
///
/// Returns the number of fragments published.
async fn stream_generate(
    client: &reqwest::Client,
    url: &str,
    request: &GenerateRequest,
    idle_timeout: Duration,
    tx: &mpsc::UnboundedSender<StreamToken>,
) -> Result<usize> {
    info!("chat request to {url} model={}", request.model);

    let response = tokio::time::timeout(idle_timeout, client.post(url).json(request).send())
        .await
        .map_err(|_| idle_error(idle_timeout))?
        .map_err(|e| AssistantError::Llm(format!("request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(AssistantError::Llm(format!(
            "HTTP {}: {}",
            status.as_u16(),
            body.trim()
        )));
    }

    let mut parser = NdjsonLineParser::new();
    let mut byte_stream = response.bytes_stream();
    let mut fragments = 0usize;

    while let Some(chunk) = tokio::time::timeout(idle_timeout, byte_stream.next())
        .await
        .map_err(|_| idle_error(idle_timeout))?
    {
        let chunk = chunk.map_err(|e| AssistantError::Llm(format!("stream read error: {e}")))?;
        for line in parser.push(&chunk) {
            if publish_line(&line, tx, &mut fragments)? == LineFlow::Done {
                return Ok(fragments);
            }
        }
    }

    if let Some(line) = parser.flush() {
        publish_line(&line, tx, &mut fragments)?;
    }

    Ok(fragments)
}

fn idle_error(idle_timeout: Duration) -> AssistantError {
    AssistantError::Llm(format!(
        "no response from backend for {}s",
        idle_timeout.as_secs()
    ))
}

fn publish_line(
    line: &str,
    tx: &mpsc::UnboundedSender<StreamToken>,
    fragments: &mut usize,
) -> Result<LineFlow> {
    let parsed = GenerateLine::parse(line)
        .map_err(|e| AssistantError::Llm(format!("JSON parse error: {e}")))?;

    if let Some(error) = parsed.error {
        return Err(AssistantError::Llm(format!("backend error: {error}")));
    }

    if !parsed.response.is_empty() {
        *fragments += 1;
        debug!(fragment = %parsed.response, "chat fragment");
        tx.send(StreamToken::Fragment(parsed.response))
            .map_err(|_| AssistantError::Channel("chat token queue closed".to_owned()))?;
    }

    Ok(if parsed.done {
        LineFlow::Done
    } else {
        LineFlow::Continue
    })
}
