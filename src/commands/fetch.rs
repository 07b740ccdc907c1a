use anyhow::{anyhow, Result};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use serde_json::json;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::PoolConfig;
use crate::fetch::{FetchRequest, FetchResult};
use crate::pool::{Pool, PoolEvent};
use crate::task::Task;

/// Command to download a list of URLs through the worker pool
pub struct FetchCommand {
    urls: Vec<String>,
    list_file: Option<PathBuf>,
    output_dir: PathBuf,
    format: Option<String>,
    workers: Option<usize>,
    background: bool,
}

impl FetchCommand {
    pub fn new(
        urls: Vec<String>,
        list_file: Option<PathBuf>,
        output_dir: PathBuf,
        format: Option<String>,
        workers: Option<usize>,
        background: bool,
    ) -> Self {
        Self {
            urls,
            list_file,
            output_dir,
            format,
            workers,
            background,
        }
    }

    /// Collect URLs from the command line and the optional list file
    pub async fn collect_urls(&self) -> Result<Vec<String>> {
        let mut urls = self.urls.clone();
        if let Some(list_file) = &self.list_file {
            let content = tokio::fs::read_to_string(list_file)
                .await
                .map_err(|e| anyhow!("Failed to read URL list {:?}: {}", list_file, e))?;
            urls.extend(parse_url_list(&content));
        }
        Ok(urls)
    }

    fn pool_config(&self) -> PoolConfig {
        let mut config = PoolConfig::from_env();
        if let Some(workers) = self.workers {
            config = config.with_size(workers);
        }
        if self.background {
            config = config.with_env("FETCHPOOL_BACKGROUND", "1");
        }
        config
    }

    pub async fn execute(&self) -> Result<()> {
        let urls = self.collect_urls().await?;
        if urls.is_empty() {
            return Err(anyhow!("No URLs to fetch"));
        }

        tokio::fs::create_dir_all(&self.output_dir).await?;

        let pool = Pool::spawn(self.pool_config())?;
        info!(
            "✅ Started {} workers for {} downloads into {:?}",
            pool.stats().size,
            urls.len(),
            self.output_dir
        );

        let progress = tokio::spawn(render_progress(pool.subscribe(), MultiProgress::new()));

        // Terminating the pool settles every outstanding handle
        let signal_pool = pool.clone();
        let signal_task = tokio::spawn(async move {
            if signal::ctrl_c().await.is_ok() {
                info!("🛑 Shutdown signal received. Terminating pool.");
                signal_pool.terminate().await;
            }
        });

        let mut handles = Vec::with_capacity(urls.len());
        for url in &urls {
            let request = FetchRequest {
                url: url.clone(),
                output_dir: Some(self.output_dir.clone()),
                format: self.format.clone(),
            };
            let handle = pool.submit(Task::new(Uuid::new_v4().to_string(), json!(request)))?;
            debug!("Submitted {} as task {}", url, handle.task_id());
            handles.push(handle);
        }

        let outcomes = futures::future::join_all(handles).await;
        signal_task.abort();
        pool.terminate().await;
        progress.abort();

        let mut failed = 0;
        for (url, outcome) in urls.iter().zip(outcomes) {
            match outcome {
                Ok(value) => match serde_json::from_value::<FetchResult>(value) {
                    Ok(result) => info!("📁 {} -> {}", url, describe_path(result.path.as_deref())),
                    Err(e) => warn!("Fetched {} but could not read the result: {}", url, e),
                },
                Err(failure) => {
                    failed += 1;
                    error!("❌ {}: {}", url, failure.reason);
                }
            }
        }

        info!("Fetched {} of {} URLs", urls.len() - failed, urls.len());
        if failed > 0 {
            return Err(anyhow!("{} of {} downloads failed", failed, urls.len()));
        }
        Ok(())
    }
}

/// One URL per line; blank lines and `#` comments are skipped
pub fn parse_url_list(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

fn describe_path(path: Option<&Path>) -> String {
    path.map(|p| p.display().to_string())
        .unwrap_or_else(|| "(no file reported)".to_string())
}

/// Draw one bar per running task until the event stream closes
async fn render_progress(mut events: broadcast::Receiver<PoolEvent>, bars: MultiProgress) {
    let style = ProgressStyle::with_template("[worker {prefix}] {bar:30} {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar());
    let mut running: HashMap<String, ProgressBar> = HashMap::new();

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!("Progress display skipped {} events", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };

        match event {
            PoolEvent::TaskStarted { worker_id, task_id } => {
                let bar = bars.add(ProgressBar::new(100));
                bar.set_style(style.clone());
                bar.set_prefix(worker_id.to_string());
                bar.set_message(task_id.clone());
                running.insert(task_id, bar);
            }
            PoolEvent::Progress { task_id, value, .. } => {
                if let Some(bar) = running.get(&task_id) {
                    let percent = value
                        .get("percent")
                        .and_then(|p| p.as_f64())
                        .or_else(|| value.as_f64())
                        .unwrap_or(0.0);
                    bar.set_position(percent.clamp(0.0, 100.0) as u64);
                }
            }
            PoolEvent::TaskFinished {
                task_id, success, ..
            } => {
                if let Some(bar) = running.remove(&task_id) {
                    let verdict = if success { "done" } else { "failed" };
                    bar.finish_with_message(format!("{task_id} {verdict}"));
                }
            }
            PoolEvent::Log { .. } | PoolEvent::WorkerRestarted { .. } => {}
        }
    }
}
