use serde::{Deserialize, Serialize};

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildRequestState {
    #[default]
    Requested,
    Running,
    Paused,
    Completed,
}

impl std::fmt::Display for BuildRequestState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Requested => write!(f, "requested"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// Contact details of the executor owning a build, written into the shared
/// queue at lease time so log streaming clients can find the live console.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub hostname: String,
    pub log_port: u16,
}

/// One unit of work as stored in the shared queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildRequest {
    pub uuid: String,
    pub tenant: String,
    pub pipeline: String,
    pub job_name: String,
    pub build_set_uuid: String,
    pub event_id: String,
    pub zone: Option<String>,
    pub state: BuildRequestState,
    pub worker_info: Option<WorkerInfo>,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Submission sequence assigned by the queue; best-effort ordering only.
    #[serde(default)]
    pub sequence: u64,
}

impl BuildRequest {
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, BuildRequestState::Completed)
    }
}

impl std::fmt::Display for BuildRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "<BuildRequest {} {}/{}/{} state={}>",
            self.uuid, self.tenant, self.pipeline, self.job_name, self.state
        )
    }
}
