use serde::{Deserialize, Serialize};

/// Terminal classification of a build, as consumed by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultKind {
    Success,
    Failure,
    PostFailure,
    TimedOut,
    MergerFailure,
    NodeFailure,
    Unreachable,
    Aborted,
    DiskFull,
    RetryLimit,
    Error,
}

impl ResultKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::Failure => "FAILURE",
            Self::PostFailure => "POST_FAILURE",
            Self::TimedOut => "TIMED_OUT",
            Self::MergerFailure => "MERGER_FAILURE",
            Self::NodeFailure => "NODE_FAILURE",
            Self::Unreachable => "UNREACHABLE",
            Self::Aborted => "ABORTED",
            Self::DiskFull => "DISK_FULL",
            Self::RetryLimit => "RETRY_LIMIT",
            Self::Error => "ERROR",
        }
    }

    /// Whether the scheduler may requeue a build reporting this kind.
    pub const fn retriable(&self) -> bool {
        matches!(self, Self::NodeFailure | Self::Unreachable | Self::Aborted)
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The payload of a completion event.
///
/// `result == None` means "indeterminate, run it again" and is upgraded to
/// `RetryLimit` by the executor once `max_attempts` is reached.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct BuildResult {
    pub result: Option<ResultKind>,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default)]
    pub secret_data: serde_json::Value,
    #[serde(default)]
    pub warnings: Vec<String>,
    pub error_detail: Option<String>,
    #[serde(default)]
    pub held: bool,
    pub start_time: Option<f64>,
    pub end_time: Option<f64>,
}

impl BuildResult {
    pub fn of(kind: ResultKind) -> Self {
        Self { result: Some(kind), ..Default::default() }
    }

    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            result: Some(ResultKind::Error),
            error_detail: Some(detail.into()),
            ..Default::default()
        }
    }

    /// No explicit result; the scheduler decides whether to requeue.
    pub fn indeterminate() -> Self {
        Self::default()
    }
}

/// Published on the sharded `(tenant, pipeline)` result substream after the
/// request transitions to COMPLETED.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildCompletedEvent {
    pub uuid: String,
    pub build_set_uuid: String,
    pub job_name: String,
    pub event_id: String,
    pub result: BuildResult,
}
