use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::FetchConfig;
use crate::protocol::{self, WorkerError};
use crate::runner::{Reporter, TaskHandler};

/// Prefix of the line the downloader prints once the file is in place
const PATH_MARKER: &str = "fetchpool-path=";
/// How many stderr lines to keep for error reports
const STDERR_TAIL: usize = 20;

/// What a fetch task asks for
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchRequest {
    pub url: String,
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Format selector passed through to the downloader
    #[serde(default)]
    pub format: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FetchResult {
    pub url: String,
    pub path: Option<PathBuf>,
    pub attempts: u32,
}

/// One line of downloader progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DownloadProgress {
    pub percent: f64,
    pub total: Option<String>,
    pub speed: Option<String>,
    pub eta: Option<String>,
}

/// Whether an attempt should authenticate with cookies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CookieMode {
    Anonymous,
    WithCookies,
}

/// Downloads media with an external tool (yt-dlp by default), retrying
/// with cookies when the anonymous attempt fails
pub struct FetchHandler {
    config: FetchConfig,
    progress_pattern: Regex,
}

impl FetchHandler {
    pub fn new(config: FetchConfig) -> Result<Self> {
        Ok(Self {
            config,
            progress_pattern: Regex::new(
                r"^\[download\]\s+(\d+(?:\.\d+)?)%(?:\s+of\s+~?\s*(\S+))?(?:\s+at\s+(\S+))?(?:\s+ETA\s+(\S+))?",
            )?,
        })
    }

    /// Parse a `[download]  42.3% of 10.00MiB at 1.00MiB/s ETA 00:06` line
    pub fn parse_progress(&self, line: &str) -> Option<DownloadProgress> {
        let caps = self.progress_pattern.captures(line.trim())?;
        let percent = caps.get(1)?.as_str().parse().ok()?;
        let text = |i: usize| {
            caps.get(i)
                .map(|m| m.as_str().to_string())
                .filter(|s| s != "Unknown")
        };
        Some(DownloadProgress {
            percent,
            total: text(2),
            speed: text(3),
            eta: text(4),
        })
    }

    /// Attempt plan: anonymous first, cookies on every retry when available
    fn plan(&self) -> Vec<CookieMode> {
        let attempts = self.config.max_attempts.max(1);
        (0..attempts)
            .map(|i| {
                if i > 0 && self.config.has_cookies() {
                    CookieMode::WithCookies
                } else {
                    CookieMode::Anonymous
                }
            })
            .collect()
    }

    /// Build base command, niced when running in the background
    fn build_base_command(&self) -> Command {
        if self.config.background {
            let mut c = Command::new("nice");
            c.args(["-n", "19"]);
            c.arg(&self.config.tool);
            c
        } else {
            Command::new(&self.config.tool)
        }
    }

    fn build_command(&self, request: &FetchRequest, cookies: CookieMode) -> Command {
        let mut cmd = self.build_base_command();
        cmd.args(["--newline", "--progress", "--no-playlist"]);
        cmd.args(["--print", &format!("after_move:{PATH_MARKER}%(filepath)s")]);

        if let Some(location) = &self.config.ffmpeg_location {
            cmd.args(["--ffmpeg-location", location]);
        }
        if let Some(format) = &request.format {
            cmd.args(["-f", format]);
        }
        if let Some(dir) = &request.output_dir {
            cmd.arg("-P").arg(dir);
        }
        if cookies == CookieMode::WithCookies {
            if let Some(browser) = &self.config.cookies_from_browser {
                cmd.args(["--cookies-from-browser", browser]);
            } else if let Some(file) = &self.config.cookies_file {
                cmd.arg("--cookies").arg(file);
            }
        }

        cmd.arg(&request.url);
        cmd
    }

    /// Run one attempt, streaming progress. Returns the final file path if
    /// the downloader reported one.
    async fn run_attempt(&self, mut cmd: Command, reporter: &Reporter) -> Result<Option<PathBuf>> {
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Executing downloader command: {:?}", cmd);
        let mut child = cmd.spawn()?;

        let stderr = child.stderr.take();
        let stderr_task = tokio::spawn(collect_tail(stderr));

        let mut path = None;
        if let Some(stdout) = child.stdout.take() {
            let mut lines = protocol::lossy_lines(stdout);
            while let Some(line) = lines.next().await {
                let line = line?;
                if let Some(found) = line.strip_prefix(PATH_MARKER) {
                    path = Some(PathBuf::from(found.trim()));
                } else if let Some(progress) = self.parse_progress(&line) {
                    reporter.progress(json!(progress));
                }
            }
        }

        let status = child.wait().await?;
        let stderr_tail = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(anyhow!(
                "{} exited with {}: {}",
                self.config.tool,
                status,
                stderr_tail.join("\n")
            ));
        }
        Ok(path)
    }

    pub async fn fetch(&self, request: &FetchRequest, reporter: &Reporter) -> Result<FetchResult, WorkerError> {
        if let Some(dir) = &request.output_dir {
            ensure_dir(dir).await.map_err(|e| {
                WorkerError::new(format!("cannot create output directory {dir:?}: {e}"))
                    .with_kind("output_dir")
            })?;
        }

        let plan = self.plan();
        let mut errors = Vec::new();
        for (index, cookies) in plan.iter().enumerate() {
            let attempt = index as u32 + 1;
            if attempt > 1 {
                let with = if *cookies == CookieMode::WithCookies {
                    " with cookies"
                } else {
                    ""
                };
                reporter.warn(format!(
                    "retrying {}{with} (attempt {attempt}/{})",
                    request.url,
                    plan.len()
                ));
            }

            info!("🚀 Fetching {} (attempt {})", request.url, attempt);
            let cmd = self.build_command(request, *cookies);
            match self.run_attempt(cmd, reporter).await {
                Ok(path) => {
                    info!("✅ Fetched {} -> {:?}", request.url, path);
                    reporter.info(format!("fetched {}", request.url));
                    return Ok(FetchResult {
                        url: request.url.clone(),
                        path,
                        attempts: attempt,
                    });
                }
                Err(e) => {
                    warn!("Attempt {} for {} failed: {}", attempt, request.url, e);
                    errors.push(e.to_string());
                }
            }
        }

        Err(WorkerError::new(format!(
            "failed to fetch {} after {} attempts",
            request.url,
            plan.len()
        ))
        .with_kind("fetch_failed")
        .with_details(json!({ "attempts": errors })))
    }
}

#[async_trait]
impl TaskHandler for FetchHandler {
    async fn handle(
        &self,
        _task_id: &str,
        payload: Value,
        reporter: &Reporter,
    ) -> Result<Value, WorkerError> {
        let request: FetchRequest = serde_json::from_value(payload).map_err(|e| {
            WorkerError::new(format!("invalid fetch request: {e}")).with_kind("invalid_payload")
        })?;
        let result = self.fetch(&request, reporter).await?;
        serde_json::to_value(result).map_err(|e| WorkerError::new(e.to_string()))
    }
}

async fn ensure_dir(dir: &Path) -> std::io::Result<()> {
    tokio::fs::create_dir_all(dir).await
}

async fn collect_tail<R: AsyncRead + Unpin>(stream: Option<R>) -> Vec<String> {
    let mut tail = VecDeque::with_capacity(STDERR_TAIL);
    if let Some(stream) = stream {
        let mut lines = protocol::lossy_lines(stream);
        while let Some(Ok(line)) = lines.next().await {
            if tail.len() == STDERR_TAIL {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    }
    tail.into()
}
