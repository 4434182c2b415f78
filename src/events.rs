use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;

use crate::error::{AppError, AppResult};
use crate::http::{ApiClient, ApiTarget};
use crate::progress::ProgressSink;

/// One record off the per-operation event stream.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutcome {
    Completed,
    Failed(String),
}

/// Terminal classification of a single event, if it is terminal at all.
///
/// `connected` is informational. `error` records and any `success == false`
/// record fail the operation; the first non-`connected` record carrying
/// `success == true` completes it. Everything else is progress.
pub fn classify(event: &OperationEvent) -> Option<OperationOutcome> {
    if event.kind == "connected" {
        return None;
    }
    let failure_reason = || {
        event
            .error
            .clone()
            .or_else(|| event.message.clone())
            .unwrap_or_else(|| "Operation failed".to_string())
    };
    if event.kind == "error" {
        return Some(OperationOutcome::Failed(failure_reason()));
    }
    match event.success {
        Some(true) => Some(OperationOutcome::Completed),
        Some(false) => Some(OperationOutcome::Failed(failure_reason())),
        None => None,
    }
}

/// Follow one asynchronous operation to its terminal event.
///
/// Consumes `data: ` records off the correlation-id stream, relaying each
/// event's `message` to `sink`, until a terminal event, end of stream, or the
/// wall-clock deadline. Dropping the future (caller cancellation) closes the
/// underlying response body.
pub async fn follow_operation(
    api: &ApiClient,
    correlation_id: &str,
    timeout: Duration,
    sink: &dyn ProgressSink,
) -> AppResult<()> {
    let consume = async {
        let resp = api
            .get_stream(
                ApiTarget::Api,
                &format!("/public-build/events/{correlation_id}"),
                timeout,
            )
            .await?;
        let mut stream = resp.bytes_stream();
        let mut buf: Vec<u8> = Vec::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| AppError::Stream(err.to_string()))?;
            buf.extend_from_slice(&chunk);
            while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = buf.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                let line = line.trim_end();
                // Non-data lines are reserved SSE fields; skip them.
                let Some(payload) = line.strip_prefix("data: ") else {
                    continue;
                };
                let event: OperationEvent = match serde_json::from_str(payload) {
                    Ok(event) => event,
                    Err(err) => {
                        tracing::debug!(?err, payload, "skipping unparseable event record");
                        continue;
                    }
                };
                if let Some(message) = &event.message {
                    sink.progress(message);
                }
                if let Some(outcome) = classify(&event) {
                    return Ok(outcome);
                }
            }
        }
        Ok(OperationOutcome::Failed(
            "SSE stream ended without completion".to_string(),
        ))
    };

    match tokio::time::timeout(timeout, consume).await {
        Err(_) => Err(AppError::Stream(format!(
            "operation timed out after {}s",
            timeout.as_secs()
        ))),
        Ok(Err(err)) => Err(err),
        Ok(Ok(OperationOutcome::Completed)) => Ok(()),
        Ok(Ok(OperationOutcome::Failed(reason))) => Err(AppError::Stream(reason)),
    }
}
