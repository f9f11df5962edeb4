//! Durable work queue with visibility-timeout claims.
//!
//! Tasks live in a sorted set scored by the epoch-millisecond time they
//! become visible, with payloads in a companion hash. Claiming a task does
//! not remove it: the claim script re-scores it to `now + visibility
//! timeout`, so a worker that dies mid-delivery simply lets the task
//! reappear. Only `delete` removes a task for good.

use std::{future::Future, pin::Pin, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use hookwire_core::models::{AttemptId, EndpointId, EventId};
use redis::aio::ConnectionManager;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{DeliveryError, Result};

/// Claims up to ARGV[1] due tasks and hides them for ARGV[2] milliseconds.
///
/// Returns `{id, original_score, payload}` triples. Ids whose payload is
/// gone are dropped from the set.
const CLAIM_SCRIPT: &str = r"
redis.replicate_commands()
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local visible_at = now + tonumber(ARGV[2])
local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES',
    'LIMIT', 0, tonumber(ARGV[1]))
local claimed = {}
for i = 1, #due, 2 do
    local id = due[i]
    local payload = redis.call('HGET', KEYS[2], id)
    if payload then
        redis.call('ZADD', KEYS[1], visible_at, id)
        table.insert(claimed, {id, due[i + 1], payload})
    else
        redis.call('ZREM', KEYS[1], id)
    end
end
return claimed
";

/// Returns `{depth, backlog_latency_ms}`.
const STATS_SCRIPT: &str = r"
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)
local depth = redis.call('ZCARD', KEYS[1])
local oldest = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', now, 'WITHSCORES', 'LIMIT', 0, 1)
local lag = 0
if #oldest > 0 then
    lag = now - tonumber(oldest[2])
end
return {depth, lag}
";

/// Data a worker needs to deliver one attempt without touching the events table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPayload {
    /// Event being delivered.
    pub event_id: EventId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// 1-based attempt number.
    pub attempt_number: u32,
    /// Event data, sent as the request body.
    pub event: serde_json::Value,
}

/// A unit of work in the queue. Its id is the id of the attempt it delivers.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    /// Attempt id.
    pub id: AttemptId,
    /// When the task first becomes visible.
    pub scheduled_at: DateTime<Utc>,
    /// Delivery payload.
    pub payload: TaskPayload,
}

impl Task {
    /// Queue score: epoch milliseconds.
    pub fn score(&self) -> i64 {
        self.scheduled_at.timestamp_millis()
    }
}

/// Point-in-time queue health.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Tasks in the queue, visible or not.
    pub depth: u64,
    /// How long the oldest due task has been waiting.
    pub backlog_latency: Duration,
}

/// Queue keys and claim visibility.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    /// Sorted set of task ids scored by visibility time.
    pub queue_key: String,
    /// Hash of task id to JSON payload.
    pub data_key: String,
    /// How long a claimed task stays hidden.
    pub visibility_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            queue_key: "hookwire:queue".to_string(),
            data_key: "hookwire:queue_data".to_string(),
            visibility_timeout: Duration::from_secs(65),
        }
    }
}

/// Visibility-timeout work queue.
///
/// Each returned task is hidden from other claimers until its visibility
/// timeout passes or it is deleted.
pub trait TaskQueue: Send + Sync + 'static {
    /// Adds tasks; re-adding an id overwrites its score and payload.
    fn add(&self, tasks: Vec<Task>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Claims up to `max_count` due tasks.
    fn get(&self, max_count: usize)
        -> Pin<Box<dyn Future<Output = Result<Vec<Task>>> + Send + '_>>;

    /// Removes tasks permanently.
    fn delete(&self, ids: Vec<AttemptId>)
        -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Depth and backlog latency.
    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>>;
}

fn millis_to_utc(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis).single().unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Redis-backed queue. Cheap to clone; clones share the connection manager.
#[derive(Clone)]
pub struct RedisTaskQueue {
    conn: ConnectionManager,
    config: QueueConfig,
    claim: redis::Script,
    stats: redis::Script,
}

impl std::fmt::Debug for RedisTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisTaskQueue").field("config", &self.config).finish_non_exhaustive()
    }
}

impl RedisTaskQueue {
    /// Creates a queue on an existing connection manager.
    pub fn new(conn: ConnectionManager, config: QueueConfig) -> Self {
        Self {
            conn,
            config,
            claim: redis::Script::new(CLAIM_SCRIPT),
            stats: redis::Script::new(STATS_SCRIPT),
        }
    }

    async fn add_tasks(&self, tasks: Vec<Task>) -> Result<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic();
        for task in &tasks {
            let id = task.id.to_string();
            let payload = serde_json::to_string(&task.payload)?;
            pipe.zadd(&self.config.queue_key, &id, task.score()).ignore();
            pipe.hset(&self.config.data_key, &id, payload).ignore();
        }

        let mut conn = self.conn.clone();
        pipe.query_async::<_, ()>(&mut conn).await?;
        debug!(count = tasks.len(), "added tasks to queue");
        Ok(())
    }

    async fn claim_tasks(&self, max_count: usize) -> Result<Vec<Task>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let raw: Vec<(String, String, String)> = self
            .claim
            .key(&self.config.queue_key)
            .key(&self.config.data_key)
            .arg(max_count)
            .arg(duration_millis(self.config.visibility_timeout))
            .invoke_async(&mut conn)
            .await?;

        let mut tasks = Vec::with_capacity(raw.len());
        let mut malformed = Vec::new();
        for (id, score, payload) in raw {
            match decode_task(&id, &score, &payload) {
                Ok(task) => tasks.push(task),
                Err(err) => {
                    warn!(task_id = %id, error = %err, "dropping malformed task");
                    malformed.push(id);
                },
            }
        }

        if !malformed.is_empty() {
            self.delete_raw(&malformed).await?;
        }
        Ok(tasks)
    }

    async fn delete_raw(&self, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zrem(&self.config.queue_key, ids)
            .ignore()
            .hdel(&self.config.data_key, ids)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn read_stats(&self) -> Result<QueueStats> {
        let mut conn = self.conn.clone();
        let (depth, lag_ms): (u64, i64) =
            self.stats.key(&self.config.queue_key).invoke_async(&mut conn).await?;

        Ok(QueueStats {
            depth,
            backlog_latency: Duration::from_millis(u64::try_from(lag_ms).unwrap_or(0)),
        })
    }
}

fn decode_task(id: &str, score: &str, payload: &str) -> Result<Task> {
    let id: AttemptId =
        id.parse().map_err(|e| DeliveryError::serialization(format!("task id {id}: {e}")))?;
    let score: f64 = score
        .parse()
        .map_err(|e| DeliveryError::serialization(format!("task score {score}: {e}")))?;
    let payload: TaskPayload = serde_json::from_str(payload)?;

    // Scores are whole milliseconds, well inside f64's exact integer range.
    #[allow(clippy::cast_possible_truncation)]
    let scheduled_at = millis_to_utc(score as i64);

    Ok(Task { id, scheduled_at, payload })
}

impl TaskQueue for RedisTaskQueue {
    fn add(&self, tasks: Vec<Task>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(self.add_tasks(tasks))
    }

    fn get(
        &self,
        max_count: usize,
    ) -> Pin<Box<dyn Future<Output = Result<Vec<Task>>> + Send + '_>> {
        Box::pin(self.claim_tasks(max_count))
    }

    fn delete(
        &self,
        ids: Vec<AttemptId>,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            let ids: Vec<String> = ids.iter().map(ToString::to_string).collect();
            self.delete_raw(&ids).await
        })
    }

    fn stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>> {
        Box::pin(self.read_stats())
    }
}

pub mod mock {
    //! In-memory queue honoring the Redis queue contract.
    //!
    //! Time comes from the injected `Clock`, so tests move a `TestClock`
    //! forward to make tasks due or to expire visibility timeouts.

    use std::{
        collections::{BTreeSet, HashMap},
        future::Future,
        pin::Pin,
        sync::Arc,
        time::Duration,
    };

    use hookwire_core::{models::AttemptId, time::Clock};
    use tokio::sync::Mutex;

    use super::{duration_millis, millis_to_utc, QueueStats, Task, TaskPayload, TaskQueue};
    use crate::error::{DeliveryError, Result};

    #[derive(Debug, Default)]
    struct State {
        // (score, id) ordering mirrors ZRANGEBYSCORE on ties.
        index: BTreeSet<(i64, AttemptId)>,
        scores: HashMap<AttemptId, i64>,
        payloads: HashMap<AttemptId, TaskPayload>,
        fail_next: Option<String>,
    }

    impl State {
        fn set_score(&mut self, id: AttemptId, score: i64) {
            if let Some(old) = self.scores.insert(id, score) {
                self.index.remove(&(old, id));
            }
            self.index.insert((score, id));
        }

        fn remove(&mut self, id: AttemptId) {
            if let Some(old) = self.scores.remove(&id) {
                self.index.remove(&(old, id));
            }
            self.payloads.remove(&id);
        }

        fn check_failure(&mut self) -> Result<()> {
            match self.fail_next.take() {
                Some(message) => Err(DeliveryError::queue(message)),
                None => Ok(()),
            }
        }
    }

    /// Queue kept in process memory.
    #[derive(Debug, Clone)]
    pub struct InMemoryTaskQueue {
        state: Arc<Mutex<State>>,
        clock: Arc<dyn Clock>,
        visibility_timeout: Duration,
    }

    impl InMemoryTaskQueue {
        /// Creates an empty queue.
        pub fn new(clock: Arc<dyn Clock>, visibility_timeout: Duration) -> Self {
            Self { state: Arc::new(Mutex::new(State::default())), clock, visibility_timeout }
        }

        /// Number of tasks, visible or not.
        pub async fn len(&self) -> usize {
            self.state.lock().await.scores.len()
        }

        /// True when the queue holds no task.
        pub async fn is_empty(&self) -> bool {
            self.len().await == 0
        }

        /// Whether a task with this id is present.
        pub async fn contains(&self, id: AttemptId) -> bool {
            self.state.lock().await.scores.contains_key(&id)
        }

        /// Makes the next queue operation fail with a queue error.
        pub async fn fail_next(&self, message: impl Into<String>) {
            self.state.lock().await.fail_next = Some(message.into());
        }

        /// Leaves an id in the sorted set without a payload.
        pub async fn insert_orphan(&self, id: AttemptId, score: i64) {
            self.state.lock().await.set_score(id, score);
        }
    }

    impl TaskQueue for InMemoryTaskQueue {
        fn add(&self, tasks: Vec<Task>) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.check_failure()?;
                for task in tasks {
                    state.set_score(task.id, task.score());
                    state.payloads.insert(task.id, task.payload);
                }
                Ok(())
            })
        }

        fn get(
            &self,
            max_count: usize,
        ) -> Pin<Box<dyn Future<Output = Result<Vec<Task>>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.check_failure()?;

                let now = self.clock.now_millis();
                let timeout_millis =
                    i64::try_from(duration_millis(self.visibility_timeout)).unwrap_or(i64::MAX);
                let visible_at = now.saturating_add(timeout_millis);
                let due: Vec<(i64, AttemptId)> = state
                    .index
                    .iter()
                    .take_while(|(score, _)| *score <= now)
                    .take(max_count)
                    .copied()
                    .collect();

                let mut claimed = Vec::with_capacity(due.len());
                for (score, id) in due {
                    match state.payloads.get(&id).cloned() {
                        Some(payload) => {
                            state.set_score(id, visible_at);
                            claimed.push(Task { id, scheduled_at: millis_to_utc(score), payload });
                        },
                        None => state.remove(id),
                    }
                }
                Ok(claimed)
            })
        }

        fn delete(
            &self,
            ids: Vec<AttemptId>,
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.check_failure()?;
                for id in ids {
                    state.remove(id);
                }
                Ok(())
            })
        }

        fn stats(&self) -> Pin<Box<dyn Future<Output = Result<QueueStats>> + Send + '_>> {
            Box::pin(async move {
                let mut state = self.state.lock().await;
                state.check_failure()?;

                let now = self.clock.now_millis();
                let lag = state
                    .index
                    .iter()
                    .next()
                    .filter(|(score, _)| *score <= now)
                    .map_or(0, |(score, _)| now - score);

                Ok(QueueStats {
                    depth: state.scores.len() as u64,
                    backlog_latency: Duration::from_millis(u64::try_from(lag).unwrap_or(0)),
                })
            })
        }
    }
}
