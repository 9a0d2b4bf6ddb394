//! Engine Task Handler
//!
//! Binds the durable queue to the engine: write turns route through the
//! ingestion pipeline (lane = `end_user_id`, so per-user writes stay FIFO),
//! reads through the orchestrator, and the maintenance kinds through the job
//! runner. Unknown kinds fail their task without touching the engine.

use std::sync::Arc;

use async_trait::async_trait;

use crate::config::MemoryConfig;
use crate::error::{MemoryError, Result};
use crate::ingestion::{IngestRequest, IngestionPipeline};
use crate::insight::InsightService;
use crate::jobs::JobRunner;
use crate::orchestrator::{ReadOrchestrator, ReadRequest};
use crate::queue::TaskHandler;
use crate::store::{RelationalStore, TaskRecord};

/// Task kinds the engine dispatches
pub mod kind {
    pub const INGEST: &str = "ingest";
    pub const READ: &str = "read";
    pub const FORGETTING_CYCLE: &str = "forgetting_cycle";
    pub const CACHE_REGENERATION: &str = "cache_regeneration";
    pub const REFLECTION: &str = "reflection";
    pub const MEMORY_TOTALS: &str = "memory_totals";
}

/// Queue handler over the full engine
pub struct EngineTaskHandler {
    pipeline: Arc<IngestionPipeline>,
    orchestrator: Arc<ReadOrchestrator>,
    runner: Arc<JobRunner>,
    insight: Arc<InsightService>,
    relational: Arc<RelationalStore>,
}

impl EngineTaskHandler {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        orchestrator: Arc<ReadOrchestrator>,
        runner: Arc<JobRunner>,
        insight: Arc<InsightService>,
        relational: Arc<RelationalStore>,
    ) -> Self {
        Self {
            pipeline,
            orchestrator,
            runner,
            insight,
            relational,
        }
    }

    fn config_for(&self, config_id: Option<&str>) -> Result<MemoryConfig> {
        self.relational.load_config_or_default(config_id)
    }
}

#[async_trait]
impl TaskHandler for EngineTaskHandler {
    async fn handle(&self, task: &TaskRecord) -> Result<serde_json::Value> {
        match task.kind.as_str() {
            kind::INGEST => {
                let request: IngestRequest = serde_json::from_value(task.payload.clone())?;
                let config = self.config_for(request.config_id.as_deref())?;
                let report = self.pipeline.ingest(&request, &config).await?;
                Ok(serde_json::to_value(report)?)
            }
            kind::READ => {
                let request: ReadRequest = serde_json::from_value(task.payload.clone())?;
                let config = self.config_for(request.config_id.as_deref())?;
                let result = self.orchestrator.read(&request, &config).await?;
                Ok(serde_json::to_value(result)?)
            }
            kind::FORGETTING_CYCLE => {
                let config = self.config_for(
                    task.payload.get("configId").and_then(|v| v.as_str()),
                )?;
                let report = self.runner.run_forgetting_cycle(&config).await?;
                Ok(serde_json::to_value(report)?)
            }
            kind::CACHE_REGENERATION => {
                let config = self.config_for(
                    task.payload.get("configId").and_then(|v| v.as_str()),
                )?;
                let report = self.runner.run_cache_regeneration(&config).await?;
                Ok(serde_json::to_value(report)?)
            }
            kind::REFLECTION => {
                let config = self.config_for(
                    task.payload.get("configId").and_then(|v| v.as_str()),
                )?;
                let written = self.runner.run_reflection_sweep(&config).await?;
                Ok(serde_json::json!({"summariesWritten": written}))
            }
            kind::MEMORY_TOTALS => {
                let workspace_id = task
                    .payload
                    .get("workspaceId")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| {
                        MemoryError::InvalidInput("memory_totals needs workspaceId".to_string())
                    })?;
                let total = self.insight.write_workspace_totals(workspace_id)?;
                Ok(serde_json::json!({"workspaceId": workspace_id, "totalNum": total}))
            }
            other => Err(MemoryError::InvalidInput(format!(
                "unknown task kind '{other}'"
            ))),
        }
    }
}
