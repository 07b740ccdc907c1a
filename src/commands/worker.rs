use anyhow::Result;
use tracing::info;

use crate::config::FetchConfig;
use crate::fetch::FetchHandler;
use crate::runner::{run_worker, ProbeHandler};
use crate::worker::WORKER_ID_ENV;
use crate::HandlerKind;

/// Command run inside each worker process spawned by the pool
pub struct WorkerCommand {
    handler: HandlerKind,
}

impl WorkerCommand {
    pub fn new(handler: HandlerKind) -> Self {
        Self { handler }
    }

    pub async fn execute(&self) -> Result<()> {
        let worker_id = std::env::var(WORKER_ID_ENV).unwrap_or_else(|_| "?".to_string());
        info!(
            "Worker {} serving {:?} tasks (pid {})",
            worker_id,
            self.handler,
            std::process::id()
        );

        match self.handler {
            HandlerKind::Fetch => {
                let config = FetchConfig::from_env();
                info!("Using downloader: {}", config.tool);
                run_worker(FetchHandler::new(config)?).await?;
            }
            HandlerKind::Probe => run_worker(ProbeHandler).await?,
        }

        info!("Worker {} input closed, exiting", worker_id);
        Ok(())
    }
}
