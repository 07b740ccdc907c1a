use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::warn;

use super::{Reporter, TaskHandler};
use crate::protocol::{LogLevel, WorkerError};
use crate::worker::WORKER_ID_ENV;

/// Diagnostic handler for checking a pool deployment end to end.
///
/// The payload says how the task should behave, so every outcome the pool
/// must cope with (success, reported failure, process crash, a worker that
/// never answers) can be produced on demand.
#[derive(Debug, Default)]
pub struct ProbeHandler;

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProbeRequest {
    sleep_ms: u64,
    progress_steps: u32,
    /// Report `failed` with this message
    fail: Option<String>,
    /// Exit the whole process with this status
    crash: Option<i32>,
    /// Never answer
    hang: bool,
    echo: Value,
}

#[async_trait]
impl TaskHandler for ProbeHandler {
    async fn handle(
        &self,
        task_id: &str,
        payload: Value,
        reporter: &Reporter,
    ) -> Result<Value, WorkerError> {
        let request: ProbeRequest = if payload.is_null() {
            ProbeRequest::default()
        } else {
            serde_json::from_value(payload).map_err(|e| {
                WorkerError::new(format!("invalid probe payload: {e}")).with_kind("invalid_payload")
            })?
        };

        reporter.log(
            LogLevel::Debug,
            format!("probe {task_id} started"),
            json!({ "sleep_ms": request.sleep_ms }),
        );

        if request.hang {
            std::future::pending::<()>().await;
        }

        let steps = request.progress_steps.max(1);
        let pause = Duration::from_millis(request.sleep_ms / u64::from(steps));
        for step in 1..=steps {
            tokio::time::sleep(pause).await;
            if request.progress_steps > 0 {
                reporter.progress(json!({ "percent": f64::from(step) * 100.0 / f64::from(steps) }));
            }
        }

        if let Some(code) = request.crash {
            warn!("Probe {} exiting with status {}", task_id, code);
            std::process::exit(code);
        }

        if let Some(message) = request.fail {
            return Err(WorkerError::new(message).with_kind("probe_failure"));
        }

        Ok(json!({
            "task_id": task_id,
            "worker_id": std::env::var(WORKER_ID_ENV).ok(),
            "echo": request.echo,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn reporter() -> (Reporter, mpsc::UnboundedReceiver<crate::protocol::WorkerMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Reporter::new("p1", tx), rx)
    }

    #[tokio::test]
    async fn test_probe_echoes_payload() {
        let (reporter, _rx) = reporter();
        let result = ProbeHandler
            .handle("p1", json!({"echo": [1, 2]}), &reporter)
            .await
            .unwrap();
        assert_eq!(result["task_id"], json!("p1"));
        assert_eq!(result["echo"], json!([1, 2]));
    }

    #[tokio::test]
    async fn test_probe_reports_progress_steps() {
        let (reporter, mut rx) = reporter();
        ProbeHandler
            .handle("p1", json!({"progress_steps": 4}), &reporter)
            .await
            .unwrap();

        let mut percents = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let crate::protocol::WorkerMessage::Progress { value, .. } = message {
                percents.push(value["percent"].as_f64().unwrap());
            }
        }
        assert_eq!(percents, vec![25.0, 50.0, 75.0, 100.0]);
    }

    #[tokio::test]
    async fn test_probe_failure_and_bad_payload() {
        let (reporter, _rx) = reporter();
        let err = ProbeHandler
            .handle("p1", json!({"fail": "no formats"}), &reporter)
            .await
            .unwrap_err();
        assert_eq!(err.kind.as_deref(), Some("probe_failure"));

        let err = ProbeHandler
            .handle("p1", json!({"sleep_ms": "soon"}), &reporter)
            .await
            .unwrap_err();
        assert_eq!(err.kind.as_deref(), Some("invalid_payload"));
    }
}
