//! Core domain models and strongly-typed identifiers.
//!
//! Defines events, endpoints, delivery attempts and their detail records,
//! plus newtype ID wrappers for compile-time type safety. Includes database
//! serialization traits and the retry arithmetic that drives the attempt
//! state machine.

use std::{collections::HashMap, fmt, str::FromStr, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgRow = sqlx::postgres::PgRow;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult =
    Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync + 'static>>;
type BoxDynError = sqlx::error::BoxDynError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Creates a new random identifier.
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <Uuid as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let uuid = <Uuid as sqlx::Decode<PgDb>>::decode(value)?;
                Ok(Self(uuid))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <Uuid as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

/// Enums persisted as TEXT columns, round-tripped through `as_str`/`FromStr`.
macro_rules! text_column {
    ($name:ident) => {
        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <str as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
                s.parse::<Self>().map_err(Into::into)
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
            }
        }
    };
}

uuid_id!(
    /// Strongly-typed event identifier.
    ///
    /// Events are immutable once created, and this ID follows them through
    /// every attempt made on their behalf.
    ///
    /// # Example
    ///
    /// ```
    /// use hookwire_core::models::EventId;
    /// let event_id = EventId::new();
    /// println!("Dispatching event: {}", event_id);
    /// ```
    EventId
);

uuid_id!(
    /// Strongly-typed endpoint identifier.
    EndpointId
);

uuid_id!(
    /// Strongly-typed attempt identifier.
    ///
    /// Doubles as the queue task id: a queued task and the attempt it
    /// delivers always share this value.
    AttemptId
);

uuid_id!(
    /// Strongly-typed workspace identifier.
    ///
    /// Workspaces scope endpoints and events; every registry entry is keyed
    /// by one.
    WorkspaceId
);

/// HTTP methods supported for webhook delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    /// HTTP GET method.
    Get,
    /// HTTP POST method (default).
    #[default]
    Post,
    /// HTTP PUT method.
    Put,
    /// HTTP PATCH method.
    Patch,
    /// HTTP DELETE method.
    Delete,
}

impl HttpMethod {
    /// Wire representation of the method.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl FromStr for HttpMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            _ => Err(format!("invalid http method: {s}")),
        }
    }
}

text_column!(HttpMethod);

/// Attempt lifecycle status.
///
/// ```text
/// INIT -> QUEUED -> SUCCESS
///   |        |   -> FAILED
///   |        └-----> CANCELED
///   └--------------> (picked up by the requeue sweep)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// Persisted but not yet handed to the queue.
    Init,
    /// A task for this attempt exists in the queue.
    Queued,
    /// Endpoint answered with a 2xx.
    Success,
    /// Delivery did not succeed.
    Failed,
    /// Delivery was abandoned without contacting the endpoint.
    Canceled,
}

impl AttemptStatus {
    /// Column representation of the status.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "INIT",
            Self::Queued => "QUEUED",
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
        }
    }

    /// Terminal statuses are never changed again.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Canceled)
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INIT" => Ok(Self::Init),
            "QUEUED" => Ok(Self::Queued),
            "SUCCESS" => Ok(Self::Success),
            "FAILED" => Ok(Self::Failed),
            "CANCELED" => Ok(Self::Canceled),
            _ => Err(format!("invalid attempt status: {s}")),
        }
    }
}

text_column!(AttemptStatus);

/// What created an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TriggerMode {
    /// First attempt created by dispatch.
    Initial,
    /// Retry created by the worker after a failure.
    Automatic,
    /// Operator-initiated delivery to explicit endpoints.
    Manual,
}

impl TriggerMode {
    /// Column representation of the mode.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Initial => "INITIAL",
            Self::Automatic => "AUTOMATIC",
            Self::Manual => "MANUAL",
        }
    }
}

impl FromStr for TriggerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIAL" => Ok(Self::Initial),
            "AUTOMATIC" => Ok(Self::Automatic),
            "MANUAL" => Ok(Self::Manual),
            _ => Err(format!("invalid trigger mode: {s}")),
        }
    }
}

text_column!(TriggerMode);

/// Classification recorded on failed or canceled attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The endpoint did not answer within its timeout.
    Timeout,
    /// The egress ACL rejected the destination.
    Denied,
    /// Any other transport failure.
    Unknown,
    /// The endpoint was disabled or deleted when the attempt came due.
    EndpointDisabled,
}

impl ErrorCode {
    /// Column representation of the code.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::Denied => "DENIED",
            Self::Unknown => "UNKNOWN",
            Self::EndpointDisabled => "ENDPOINT_DISABLED",
        }
    }
}

impl FromStr for ErrorCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "TIMEOUT" => Ok(Self::Timeout),
            "DENIED" => Ok(Self::Denied),
            "UNKNOWN" => Ok(Self::Unknown),
            "ENDPOINT_DISABLED" => Ok(Self::EndpointDisabled),
            _ => Err(format!("invalid error code: {s}")),
        }
    }
}

text_column!(ErrorCode);

/// Adds whole seconds to a timestamp, saturating at the chrono maximum.
pub fn offset_secs(at: DateTime<Utc>, secs: u64) -> DateTime<Utc> {
    chrono::Duration::try_seconds(i64::try_from(secs).unwrap_or(i64::MAX))
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Application event accepted for delivery.
///
/// `data` is opaque to the pipeline; it is stored and sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event.
    pub id: EventId,

    /// Workspace the event was dispatched into.
    pub workspace_id: WorkspaceId,

    /// Type used to match endpoint subscriptions.
    pub event_type: String,

    /// Opaque payload.
    pub data: serde_json::Value,

    /// Caller-supplied deduplication key, unique per workspace.
    pub unique_id: Option<String>,

    /// When the event entered the system.
    pub ingested_at: DateTime<Utc>,
}

impl Event {
    /// Creates an event with a fresh id. The workspace is stamped at dispatch.
    pub fn new(event_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: EventId::new(),
            workspace_id: WorkspaceId(Uuid::nil()),
            event_type: event_type.into(),
            data,
            unique_id: None,
            ingested_at: Utc::now(),
        }
    }

    /// Sets the deduplication key.
    #[must_use]
    pub fn with_unique_id(mut self, unique_id: impl Into<String>) -> Self {
        self.unique_id = Some(unique_id.into());
        self
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Event {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let data: sqlx::types::Json<serde_json::Value> = row.try_get("data")?;

        Ok(Self {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            event_type: row.try_get("event_type")?,
            data: data.0,
            unique_id: row.try_get("unique_id")?,
            ingested_at: row.try_get("ingested_at")?,
        })
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

/// How to reach an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Target URL.
    pub url: String,

    /// HTTP method, POST unless configured otherwise.
    #[serde(default)]
    pub method: HttpMethod,

    /// Extra headers sent with every delivery.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Per-request timeout in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl RequestConfig {
    /// Creates a POST configuration with the default timeout.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: HttpMethod::Post,
            headers: HashMap::new(),
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Retry schedule strategy. Only fixed offsets exist today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RetryStrategy {
    /// Offsets are read directly from `RetryConfig::attempts`.
    #[default]
    Fixed,
}

fn default_retry_attempts() -> Vec<u64> {
    vec![0, 60, 3600]
}

/// Retry policy of an endpoint.
///
/// `attempts[i]` is the delay in seconds before attempt `i + 1`, measured
/// from dispatch for the first attempt and from the previous attempt's
/// start for every later one. Its length bounds the number of attempts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Strategy, always `fixed`.
    #[serde(default)]
    pub strategy: RetryStrategy,

    /// Ordered second offsets.
    #[serde(default = "default_retry_attempts")]
    pub attempts: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { strategy: RetryStrategy::Fixed, attempts: default_retry_attempts() }
    }
}

impl RetryConfig {
    /// Creates a fixed schedule from second offsets.
    pub fn fixed(attempts: impl Into<Vec<u64>>) -> Self {
        Self { strategy: RetryStrategy::Fixed, attempts: attempts.into() }
    }

    /// Maximum number of attempts per (event, endpoint).
    pub fn max_attempts(&self) -> u32 {
        u32::try_from(self.attempts.len()).unwrap_or(u32::MAX)
    }

    /// Delay before the given 1-based attempt, if the schedule has one.
    pub fn delay_before(&self, attempt_number: u32) -> Option<Duration> {
        let index = usize::try_from(attempt_number.checked_sub(1)?).ok()?;
        self.attempts.get(index).copied().map(Duration::from_secs)
    }

    /// True once `attempt_number` has used up the schedule.
    pub fn is_exhausted(&self, attempt_number: u32) -> bool {
        attempt_number >= self.max_attempts()
    }
}

/// Webhook endpoint configuration.
///
/// Read-only for the delivery pipeline; administration happens elsewhere.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Unique identifier for this endpoint.
    pub id: EndpointId,

    /// Owning workspace.
    pub workspace_id: WorkspaceId,

    /// Human-readable name.
    pub name: Option<String>,

    /// Disabled endpoints receive no new attempts and cancel pending ones.
    pub enabled: bool,

    /// Request configuration.
    pub request: RequestConfig,

    /// Retry policy.
    pub retry: RetryConfig,

    /// Subscribed event types.
    pub events: Vec<String>,

    /// When this endpoint was created.
    pub created_at: DateTime<Utc>,

    /// When configuration was last modified.
    pub updated_at: DateTime<Utc>,
}

impl Endpoint {
    /// Creates an enabled endpoint with default retry and request settings.
    pub fn new(workspace_id: WorkspaceId, url: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: EndpointId::new(),
            workspace_id,
            name: None,
            enabled: true,
            request: RequestConfig::new(url),
            retry: RetryConfig::default(),
            events: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the endpoint subscribes to `event_type`.
    pub fn subscribes_to(&self, event_type: &str) -> bool {
        self.events.iter().any(|e| e == event_type)
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Endpoint {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let request: sqlx::types::Json<RequestConfig> = row.try_get("request")?;
        let retry: sqlx::types::Json<RetryConfig> = row.try_get("retry")?;

        Ok(Self {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            request: request.0,
            retry: retry.0,
            events: row.try_get("events")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

/// Request snapshot stored on the attempt row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRequest {
    /// Method used.
    pub method: HttpMethod,
    /// URL targeted.
    pub url: String,
}

/// Response snapshot stored on the attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptResponse {
    /// HTTP status code.
    pub status: u16,
    /// Time from request start to full body, in milliseconds.
    pub latency_ms: u64,
}

/// One delivery of one event to one endpoint.
///
/// Rows are created in `INIT`; the worker moves them to a terminal status
/// exactly once and, on a non-exhausted failure, creates the successor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attempt {
    /// Unique identifier, shared with the queue task.
    pub id: AttemptId,
    /// Event being delivered.
    pub event_id: EventId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// 1-based position in the retry schedule.
    pub attempt_number: u32,
    /// Lifecycle status.
    pub status: AttemptStatus,
    /// Earliest time the attempt may run.
    pub scheduled_at: DateTime<Utc>,
    /// When delivery started.
    pub attempted_at: Option<DateTime<Utc>>,
    /// What created the attempt.
    pub trigger_mode: TriggerMode,
    /// True when no successor will be created.
    pub exhausted: bool,
    /// Failure or cancellation classification.
    pub error_code: Option<ErrorCode>,
    /// Request snapshot.
    pub request: Option<AttemptRequest>,
    /// Response snapshot.
    pub response: Option<AttemptResponse>,
    /// When the row was created.
    pub created_at: DateTime<Utc>,
}

impl Attempt {
    /// First attempt of `event` towards `endpoint`.
    pub fn first(
        event: &Event,
        endpoint: &Endpoint,
        trigger_mode: TriggerMode,
        now: DateTime<Utc>,
    ) -> Self {
        let delay = endpoint.retry.delay_before(1).unwrap_or_default();
        Self {
            id: AttemptId::new(),
            event_id: event.id,
            endpoint_id: endpoint.id,
            workspace_id: event.workspace_id,
            attempt_number: 1,
            status: AttemptStatus::Init,
            scheduled_at: offset_secs(now, delay.as_secs()),
            attempted_at: None,
            trigger_mode,
            exhausted: false,
            error_code: None,
            request: None,
            response: None,
            created_at: now,
        }
    }

    /// Successor after a failed attempt, or `None` once the schedule is used up.
    ///
    /// The delay is measured from `attempted_at` of this attempt.
    pub fn successor(&self, retry: &RetryConfig, now: DateTime<Utc>) -> Option<Self> {
        let key = AttemptKey {
            event_id: self.event_id,
            endpoint_id: self.endpoint_id,
            workspace_id: self.workspace_id,
        };
        Self::retry_of(key, self.attempt_number, self.attempted_at.unwrap_or(now), retry, now)
    }

    /// Attempt `failed_number + 1` of `key`, scheduled `attempts[failed_number]`
    /// seconds after `attempted_at`.
    pub fn retry_of(
        key: AttemptKey,
        failed_number: u32,
        attempted_at: DateTime<Utc>,
        retry: &RetryConfig,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        if retry.is_exhausted(failed_number) {
            return None;
        }
        let next_number = failed_number + 1;
        let delay = retry.delay_before(next_number)?;

        Some(Self {
            id: AttemptId::new(),
            event_id: key.event_id,
            endpoint_id: key.endpoint_id,
            workspace_id: key.workspace_id,
            attempt_number: next_number,
            status: AttemptStatus::Init,
            scheduled_at: offset_secs(attempted_at, delay.as_secs()),
            attempted_at: None,
            trigger_mode: TriggerMode::Automatic,
            exhausted: false,
            error_code: None,
            request: None,
            response: None,
            created_at: now,
        })
    }
}

/// The (event, endpoint) pair a chain of attempts belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttemptKey {
    /// Event being delivered.
    pub event_id: EventId,
    /// Target endpoint.
    pub endpoint_id: EndpointId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
}

/// Columns the worker writes when an attempt reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptResult {
    /// `Success` or `Failed`.
    pub status: AttemptStatus,
    /// When delivery started.
    pub attempted_at: DateTime<Utc>,
    /// True when no successor follows.
    pub exhausted: bool,
    /// Transport classification of a failure.
    pub error_code: Option<ErrorCode>,
    /// Request snapshot.
    pub request: AttemptRequest,
    /// Response snapshot, absent when no response arrived.
    pub response: Option<AttemptResponse>,
}

impl Attempt {
    /// Applies a terminal result to this attempt.
    pub fn apply(&mut self, result: &AttemptResult) {
        self.status = result.status;
        self.attempted_at = Some(result.attempted_at);
        self.exhausted = result.exhausted;
        self.error_code = result.error_code;
        self.request = Some(result.request.clone());
        self.response = result.response;
    }
}

impl<'r> sqlx::FromRow<'r, PgRow> for Attempt {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let request: Option<sqlx::types::Json<AttemptRequest>> = row.try_get("request")?;
        let response: Option<sqlx::types::Json<AttemptResponse>> = row.try_get("response")?;

        Ok(Self {
            id: row.try_get("id")?,
            event_id: row.try_get("event_id")?,
            endpoint_id: row.try_get("endpoint_id")?,
            workspace_id: row.try_get("workspace_id")?,
            attempt_number: {
                let val: i32 = row.try_get("attempt_number")?;
                val.try_into()
                    .map_err(|_| sqlx::Error::Decode("attempt_number cannot be negative".into()))?
            },
            status: row.try_get("status")?,
            scheduled_at: row.try_get("scheduled_at")?,
            attempted_at: row.try_get("attempted_at")?,
            trigger_mode: row.try_get("trigger_mode")?,
            exhausted: row.try_get("exhausted")?,
            error_code: row.try_get("error_code")?,
            request: request.map(|r| r.0),
            response: response.map(|r| r.0),
            created_at: row.try_get("created_at")?,
        })
    }
}

/// Bulky request/response material for one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptDetail {
    /// Same as the attempt id.
    pub id: AttemptId,
    /// Owning workspace.
    pub workspace_id: WorkspaceId,
    /// Headers sent.
    pub request_headers: HashMap<String, String>,
    /// Body sent.
    pub request_body: Option<String>,
    /// Headers received.
    pub response_headers: Option<HashMap<String, String>>,
    /// Body received, possibly truncated.
    pub response_body: Option<String>,
    /// When the detail was recorded.
    pub created_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for AttemptDetail {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        use sqlx::Row;

        let request_headers: sqlx::types::Json<HashMap<String, String>> =
            row.try_get("request_headers")?;
        let response_headers: Option<sqlx::types::Json<HashMap<String, String>>> =
            row.try_get("response_headers")?;

        Ok(Self {
            id: row.try_get("id")?,
            workspace_id: row.try_get("workspace_id")?,
            request_headers: request_headers.0,
            request_body: row.try_get("request_body")?,
            response_headers: response_headers.map(|h| h.0),
            response_body: row.try_get("response_body")?,
            created_at: row.try_get("created_at")?,
        })
    }
}
