//! Periodic Jobs
//!
//! Idempotent background sweeps driven by tokio intervals: the reflection
//! sweep, the forgetting cycle, insight cache regeneration, and the health
//! probe. Every run takes a Redis advisory lock on `(job_name, workspace?)`
//! so overlapping schedulers across processes cannot double-run a job; when
//! Redis is absent (single-process deployments, tests) jobs run unlocked.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use crate::config::MemoryConfig;
use crate::error::Result;
use crate::forgetting::{ForgettingEngine, ForgettingReport};
use crate::graph::{EdgeKind, GraphEdge, GraphStore, IngestBatch, MemorySummary, NodeCategory, TemporalRange};
use crate::health::{publish_health, HealthReport, PoolUsage};
use crate::ingestion::TurnMessage;
use crate::insight::{InsightService, RegenerationReport};
use crate::orchestrator::{ReadOrchestrator, ReadRequest, SearchSwitch};
use crate::provider::{ChatMessage, ChatOptions, LanguageModel};
use crate::redis_support::RedisHandle;
use crate::store::RelationalStore;

/// Lock TTL generous enough to cover a slow sweep
const JOB_LOCK_TTL_MS: u64 = 10 * 60 * 1000;

/// Outcome of one advisory-lock attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockAttempt {
    /// Lock taken; run and release afterwards
    Acquired,
    /// Another runner holds it; skip this run
    Busy,
    /// Lock service failed; run unlocked rather than stall maintenance
    Unlocked,
}

fn classify_lock_attempt(attempt: Result<bool>) -> LockAttempt {
    match attempt {
        Ok(true) => LockAttempt::Acquired,
        Ok(false) => LockAttempt::Busy,
        Err(_) => LockAttempt::Unlocked,
    }
}

/// Minimum fresh statements before a reflection summary is written
const REFLECTION_MIN_STATEMENTS: usize = 5;

/// Intervals for the background scheduler
#[derive(Debug, Clone)]
pub struct JobSchedule {
    pub forgetting_every: Duration,
    pub regeneration_every: Duration,
    pub reflection_every: Duration,
    pub health_every: Duration,
}

impl Default for JobSchedule {
    fn default() -> Self {
        Self {
            forgetting_every: Duration::from_secs(6 * 3600),
            regeneration_every: Duration::from_secs(24 * 3600),
            reflection_every: Duration::from_secs(3600),
            health_every: Duration::from_secs(60),
        }
    }
}

/// Background job runner
pub struct JobRunner {
    store: Arc<GraphStore>,
    relational: Arc<RelationalStore>,
    model: Arc<dyn LanguageModel>,
    forgetting: Arc<ForgettingEngine>,
    insight: Arc<InsightService>,
    orchestrator: Arc<ReadOrchestrator>,
    redis: Option<RedisHandle>,
    health_ttl_seconds: u64,
}

impl JobRunner {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<GraphStore>,
        relational: Arc<RelationalStore>,
        model: Arc<dyn LanguageModel>,
        forgetting: Arc<ForgettingEngine>,
        insight: Arc<InsightService>,
        orchestrator: Arc<ReadOrchestrator>,
        redis: Option<RedisHandle>,
        health_ttl_seconds: u64,
    ) -> Self {
        Self {
            store,
            relational,
            model,
            forgetting,
            insight,
            orchestrator,
            redis,
            health_ttl_seconds,
        }
    }

    /// Take the per-job advisory lock; `None` when another holder has it
    async fn lock_job(&self, job_name: &str, scope: Option<&str>) -> Option<JobLock> {
        let Some(redis) = &self.redis else {
            return Some(JobLock::unlocked());
        };
        let key = match scope {
            Some(scope) => format!("mnemo:lock:{job_name}:{scope}"),
            None => format!("mnemo:lock:{job_name}"),
        };
        let token = Uuid::new_v4().to_string();
        let attempt = redis.try_lock(&key, &token, JOB_LOCK_TTL_MS).await;
        if let Err(e) = &attempt {
            tracing::warn!(job = job_name, "lock acquisition failed, running unlocked: {}", e);
        }
        match classify_lock_attempt(attempt) {
            LockAttempt::Acquired => Some(JobLock {
                redis: Some(redis.clone()),
                key,
                token,
            }),
            LockAttempt::Busy => {
                tracing::debug!(job = job_name, "another runner holds the lock, skipping");
                None
            }
            LockAttempt::Unlocked => Some(JobLock::unlocked()),
        }
    }

    /// Forgetting cycle over all users
    pub async fn run_forgetting_cycle(&self, config: &MemoryConfig) -> Result<Option<ForgettingReport>> {
        let Some(lock) = self.lock_job("forgetting_cycle", None).await else {
            return Ok(None);
        };
        let report = self.forgetting.run_cycle(None, config).await?;
        lock.release().await;
        Ok(Some(report))
    }

    /// Insight cache regeneration for every workspace
    pub async fn run_cache_regeneration(
        &self,
        config: &MemoryConfig,
    ) -> Result<Option<RegenerationReport>> {
        let Some(lock) = self.lock_job("cache_regeneration", None).await else {
            return Ok(None);
        };
        let report = self.insight.regenerate_all(None, config).await?;
        lock.release().await;
        Ok(Some(report))
    }

    /// Reflection sweep: distill each user's recent statements into a new
    /// summary node
    pub async fn run_reflection_sweep(&self, config: &MemoryConfig) -> Result<Option<usize>> {
        let Some(lock) = self.lock_job("reflection", None).await else {
            return Ok(None);
        };

        let mut written = 0_usize;
        for end_user_id in self.relational.list_end_users(None)? {
            match self.reflect_user(&end_user_id, config).await {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(end_user_id = %end_user_id, "reflection failed: {}", e);
                }
            }
        }

        lock.release().await;
        tracing::info!(written, "reflection sweep finished");
        Ok(Some(written))
    }

    async fn reflect_user(&self, end_user_id: &str, config: &MemoryConfig) -> Result<bool> {
        let range = TemporalRange {
            start: Some(Utc::now() - chrono::Duration::hours(24)),
            end: None,
            valid_at: None,
        };
        let recent = self.store.temporal_search(end_user_id, &range, 50)?;
        if recent.len() < REFLECTION_MIN_STATEMENTS {
            return Ok(false);
        }

        let statements: Vec<&str> = recent
            .iter()
            .filter_map(|hit| hit.props.get("statement").and_then(|v| v.as_str()))
            .collect();
        let messages = vec![
            ChatMessage::system(
                "Reflect on the user's recent memories and write one consolidated paragraph \
                 capturing the themes that emerged. Plain text, no preamble.",
            ),
            ChatMessage::user(statements.join("\n")),
        ];
        let outcome = self
            .model
            .chat(&config.llm_model_id, &messages, &ChatOptions::default())
            .await?;
        if outcome.content.trim().is_empty() {
            return Ok(false);
        }

        let summary_id = Uuid::new_v4().to_string();
        let mut batch = IngestBatch::default();
        batch.summaries.push(MemorySummary {
            id: summary_id.clone(),
            end_user_id: end_user_id.to_string(),
            content: outcome.content.trim().to_string(),
            importance_score: 0.5,
            activation_value: None,
            access_history: vec![],
            created_at: Utc::now(),
            version: 0,
        });
        for hit in &recent {
            batch.edges.push(GraphEdge::new(
                summary_id.clone(),
                hit.id.clone(),
                EdgeKind::DerivedFromStatement,
            ));
        }
        if let Ok(vectors) = self
            .model
            .embed(&config.embedding_model_id, &[outcome.content.trim().to_string()])
            .await
        {
            if let Some(vector) = vectors.into_iter().next() {
                batch
                    .embeddings
                    .push((summary_id, NodeCategory::Summary, vector));
            }
        }
        self.store.upsert_ingested_batch(&batch)?;
        Ok(true)
    }

    /// Health probe: exercise the read path and publish the outcome
    pub async fn run_health_probe(&self, config: &MemoryConfig, pool: PoolUsage) -> Result<HealthReport> {
        let probe = ReadRequest {
            end_user_id: "健康检查".to_string(),
            message: "你好".to_string(),
            history: Vec::<TurnMessage>::new(),
            search_switch: SearchSwitch::ContextOnly,
            config_id: None,
        };
        let report = match self.orchestrator.read(&probe, config).await {
            Ok(_) => HealthReport::success(pool).with_pool_pressure(),
            Err(e) => HealthReport::failure(e.to_string(), pool),
        };

        if let Some(redis) = &self.redis {
            if let Err(e) = publish_health(redis, &report, self.health_ttl_seconds).await {
                tracing::warn!("failed to publish health report: {}", e);
            }
        }
        Ok(report)
    }

    /// Spawn the interval-driven scheduler; aborts when the handle is dropped
    pub fn spawn_scheduler(self: Arc<Self>, schedule: JobSchedule, config: MemoryConfig) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut forgetting = tokio::time::interval(schedule.forgetting_every);
            let mut regeneration = tokio::time::interval(schedule.regeneration_every);
            let mut reflection = tokio::time::interval(schedule.reflection_every);
            let mut health = tokio::time::interval(schedule.health_every);
            // The first tick of every interval fires immediately; skip it so
            // boot does not trigger all sweeps at once
            forgetting.tick().await;
            regeneration.tick().await;
            reflection.tick().await;
            health.tick().await;

            loop {
                tokio::select! {
                    _ = forgetting.tick() => {
                        if let Err(e) = self.run_forgetting_cycle(&config).await {
                            tracing::error!("forgetting cycle failed: {}", e);
                        }
                    }
                    _ = regeneration.tick() => {
                        if let Err(e) = self.run_cache_regeneration(&config).await {
                            tracing::error!("cache regeneration failed: {}", e);
                        }
                    }
                    _ = reflection.tick() => {
                        if let Err(e) = self.run_reflection_sweep(&config).await {
                            tracing::error!("reflection sweep failed: {}", e);
                        }
                    }
                    _ = health.tick() => {
                        if let Err(e) = self.run_health_probe(&config, PoolUsage::default()).await {
                            tracing::error!("health probe failed: {}", e);
                        }
                    }
                }
            }
        })
    }
}

/// Held advisory lock; release is best-effort, expiry is the backstop
struct JobLock {
    redis: Option<RedisHandle>,
    key: String,
    token: String,
}

impl JobLock {
    fn unlocked() -> Self {
        Self {
            redis: None,
            key: String::new(),
            token: String::new(),
        }
    }

    async fn release(self) {
        if let Some(redis) = &self.redis {
            if let Err(e) = redis.unlock(&self.key, &self.token).await {
                tracing::debug!(key = %self.key, "lock release failed: {}", e);
            }
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
