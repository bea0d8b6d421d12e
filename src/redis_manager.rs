//! Redis Manager - Centralized Redis connection and operations
//!
//! This module handles all Redis-related operations including:
//! - Job queue operations (BLPOP)
//! - Result storage and publishing
//!
//! Popping and publishing use separate connections: a pending BLPOP holds
//! its connection, and results are written from many job tasks at once.

use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::{info, warn};

use crate::jobs::{JobResult, SandboxJob};

/// Redis key constants
pub mod keys {
    /// Sandbox job queue key
    pub const SANDBOX_QUEUE: &str = "sandbox:queue";

    /// Sandbox result key prefix (for polling)
    pub const SANDBOX_RESULT_PREFIX: &str = "sandbox:result:";

    /// Sandbox result channel (for pub/sub)
    pub const SANDBOX_RESULT_CHANNEL: &str = "sandbox:results";
}

const RESULT_EXPIRY_SECS: u64 = 3600; // 1 hour

/// Consumes the sandbox job queue
pub struct RedisManager {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl RedisManager {
    async fn with_url(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;
        let conn = get_connection_with_retry(&client).await?;
        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// Create a new RedisManager using the REDIS_URL environment variable.
    /// Defaults to "redis://localhost:6379" if not set.
    pub async fn from_env() -> Result<Self> {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".into());
        Self::with_url(&url).await
    }

    /// Open a dedicated connection for storing results
    pub async fn publisher(&self) -> Result<ResultPublisher> {
        let conn = get_connection_with_retry(&self.client).await?;
        Ok(ResultPublisher {
            client: self.client.clone(),
            conn,
        })
    }

    /// Wait up to `timeout` for the next job.
    ///
    /// Returns `None` when the wait times out so callers can check for
    /// shutdown between pops. Malformed jobs are logged and skipped.
    /// Automatically reconnects on connection failure.
    pub async fn pop_job(&mut self, timeout: Duration) -> Result<Option<SandboxJob>> {
        loop {
            let result: Option<(String, String)> = match self
                .conn
                .blpop(keys::SANDBOX_QUEUE, timeout.as_secs_f64())
                .await
            {
                Ok(res) => res,
                Err(e) => {
                    warn!("Redis BLPOP failed: {}. Reconnecting...", e);
                    self.reconnect().await?;
                    continue;
                }
            };

            let Some((_, job_data)) = result else {
                return Ok(None);
            };
            match serde_json::from_str::<SandboxJob>(&job_data) {
                Ok(job) => return Ok(Some(job)),
                Err(e) => {
                    warn!("Failed to parse job data: {}. Data: {}", e, job_data);
                    continue;
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.conn = get_connection_with_retry(&self.client).await?;
        Ok(())
    }
}

/// Stores job results; cheap to clone into job tasks
#[derive(Clone)]
pub struct ResultPublisher {
    client: redis::Client,
    conn: MultiplexedConnection,
}

impl ResultPublisher {
    /// Store a job result in Redis.
    ///
    /// The result is stored with a 1-hour expiration and also published
    /// to a channel for real-time subscribers.
    pub async fn store_result(&mut self, result: &JobResult) -> Result<()> {
        let key = result_key(&result.request_id);
        let json = serde_json::to_string(result)?;

        // Try to store, reconnect on failure
        if let Err(e) = self
            .conn
            .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
            .await
        {
            warn!("Failed to store result: {}. Reconnecting...", e);
            self.conn = get_connection_with_retry(&self.client).await?;
            self.conn
                .set_ex::<_, _, ()>(&key, &json, RESULT_EXPIRY_SECS)
                .await?;
        }

        // Publish to channel (ignore errors as there may be no subscribers)
        let _ = self
            .conn
            .publish::<_, _, ()>(keys::SANDBOX_RESULT_CHANNEL, &json)
            .await;

        Ok(())
    }
}

fn result_key(request_id: &str) -> String {
    format!("{}{}", keys::SANDBOX_RESULT_PREFIX, request_id)
}

/// Get a Redis connection with retry logic
async fn get_connection_with_retry(client: &redis::Client) -> Result<MultiplexedConnection> {
    loop {
        match client.get_multiplexed_async_connection().await {
            Ok(conn) => return Ok(conn),
            Err(e) => {
                warn!(
                    "Failed to connect to Redis: {}. Retrying in 3 seconds...",
                    e
                );
                tokio::time::sleep(Duration::from_secs(3)).await;
            }
        }
    }
}
