//! Background cache warm-up for likely next prompts

use crate::context_engine::SharedContextAssembler;
use crate::error::{BackgroundError, BackgroundTask};
use crate::types::{ContextBuildOptions, NodeId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One build to run ahead of time. Warming with `useCache: false` builds but stores nothing.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WarmupRequest {
    pub node_id: NodeId,
    pub prompt: String,
    #[serde(default)]
    pub options: ContextBuildOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WarmupReport {
    pub warmed: usize,
    pub failed: usize,
}

/// Running warm-up job. Failures arrive on `errors`; the channel closes when the job ends.
pub struct WarmupHandle {
    pub errors: mpsc::UnboundedReceiver<BackgroundError>,
    task: JoinHandle<WarmupReport>,
}

impl WarmupHandle {
    pub async fn finish(self) -> WarmupReport {
        match self.task.await {
            Ok(report) => report,
            Err(e) => {
                warn!("Warm-up task aborted: {}", e);
                WarmupReport::default()
            }
        }
    }
}

/// Build each request through the normal path on a background task
pub fn spawn_warmup(assembler: SharedContextAssembler, requests: Vec<WarmupRequest>) -> WarmupHandle {
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut report = WarmupReport::default();
        for request in requests {
            match assembler
                .build_context(&request.node_id, &request.prompt, request.options)
                .await
            {
                Ok(_) => report.warmed += 1,
                Err(error) => {
                    report.failed += 1;
                    let _ = tx.send(BackgroundError {
                        task: BackgroundTask::Warmup,
                        key: request.node_id,
                        error,
                    });
                }
            }
        }
        info!("Cache warm-up finished: {} warmed, {} failed", report.warmed, report.failed);
        report
    });

    WarmupHandle { errors: rx, task }
}
