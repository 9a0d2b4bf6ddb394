//! Health Probe
//!
//! Periodically exercises the read path with a fixed probe request and
//! publishes the outcome to the `memsci:health:read_service` hash in Redis;
//! the key's TTL bounds how stale a reported status can be.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::redis_support::RedisHandle;

/// Redis key carrying the latest read-service health report
pub const HEALTH_KEY: &str = "memsci:health:read_service";

/// Overall probe status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Success,
    Fail,
    #[serde(rename = "unknown")]
    Unknown,
    #[serde(rename = "warning")]
    Warning,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Success => "Success",
            HealthStatus::Fail => "Fail",
            HealthStatus::Unknown => "unknown",
            HealthStatus::Warning => "warning",
        }
    }
}

/// Connection-pool utilisation attached to the health report
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolUsage {
    pub usage_percent: f64,
}

/// Health report as published and as returned to callers
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: HealthStatus,
    pub msg: String,
    pub code: i64,
    pub error: String,
    /// Unix seconds of the probe
    pub time: i64,
    pub database_pool: PoolUsage,
}

impl HealthReport {
    pub fn success(pool: PoolUsage) -> Self {
        Self {
            status: HealthStatus::Success,
            msg: "read service responded".to_string(),
            code: 0,
            error: String::new(),
            time: chrono::Utc::now().timestamp(),
            database_pool: pool,
        }
    }

    pub fn failure(error: impl Into<String>, pool: PoolUsage) -> Self {
        let error = error.into();
        Self {
            status: HealthStatus::Fail,
            msg: "read service request failed".to_string(),
            code: 500,
            error,
            time: chrono::Utc::now().timestamp(),
            database_pool: pool,
        }
    }

    /// Flag pool pressure above 80% as a warning
    pub fn with_pool_pressure(mut self) -> Self {
        if self.status == HealthStatus::Success && self.database_pool.usage_percent > 80.0 {
            self.status = HealthStatus::Warning;
            self.msg = format!(
                "database pool at {:.0}% utilisation",
                self.database_pool.usage_percent
            );
        }
        self
    }
}

/// Publish a report to Redis under the health key
pub async fn publish_health(
    redis: &RedisHandle,
    report: &HealthReport,
    ttl_seconds: u64,
) -> Result<()> {
    let fields = [
        ("status", report.status.as_str().to_string()),
        ("msg", report.msg.clone()),
        ("code", report.code.to_string()),
        ("error", report.error.clone()),
        ("time", report.time.to_string()),
        (
            "usage_percent",
            format!("{:.2}", report.database_pool.usage_percent),
        ),
    ];
    redis.set_hash_with_ttl(HEALTH_KEY, &fields, ttl_seconds).await
}

/// Read the last published report; an expired key yields `Unknown`
pub async fn read_health(redis: &RedisHandle) -> Result<HealthReport> {
    let fields = redis.get_hash(HEALTH_KEY).await?;
    if fields.is_empty() {
        return Ok(HealthReport {
            status: HealthStatus::Unknown,
            msg: "no recent health report".to_string(),
            code: 0,
            error: String::new(),
            time: 0,
            database_pool: PoolUsage::default(),
        });
    }

    let get = |name: &str| {
        fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_default()
    };

    let status = match get("status").as_str() {
        "Success" => HealthStatus::Success,
        "Fail" => HealthStatus::Fail,
        "warning" => HealthStatus::Warning,
        _ => HealthStatus::Unknown,
    };
    Ok(HealthReport {
        status,
        msg: get("msg"),
        code: get("code").parse().unwrap_or(0),
        error: get("error"),
        time: get("time").parse().unwrap_or(0),
        database_pool: PoolUsage {
            usage_percent: get("usage_percent").parse().unwrap_or(0.0),
        },
    })
}

// ============================================================================
// TESTS
// ============================================================================
