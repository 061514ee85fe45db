use serde::{Deserialize, Serialize};

/// Administrative rule that retains the nodes of matching failed builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoholdRequest {
    pub id: String,
    pub tenant: String,
    pub project: String,
    pub job: String,
    /// Regex matched against the build's ref. `.*` scopes the request to
    /// the whole job; a trailing `.*` to a change; anything else to one ref.
    pub ref_filter: String,
    pub max_count: u32,
    #[serde(default)]
    pub current_count: u32,
    /// Seconds the held nodes may outlive the hold, if set.
    pub node_expiration: Option<u64>,
}

impl AutoholdRequest {
    pub fn exhausted(&self) -> bool {
        self.current_count >= self.max_count
    }
}
