use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{NodeSet, RepoState};

pub type VarMap = serde_json::Map<String, serde_json::Value>;

/// A repository taking part in a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectSpec {
    pub connection: String,
    pub name: String,
    /// `hostname/name`, unique across connections.
    pub canonical_name: String,
    pub override_branch: Option<String>,
    pub override_checkout: Option<String>,
    #[serde(default = "default_branch")]
    pub default_branch: String,
}

fn default_branch() -> String {
    "master".to_string()
}

/// A role checked out next to a playbook.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleSpec {
    pub connection: String,
    pub project: String,
    /// Directory name the role is exposed under in the role path.
    pub target_name: String,
    pub branch: Option<String>,
}

/// An encrypted secret attached to a playbook, decrypted by the executor
/// with the key named by `key_ref` just before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub name: String,
    pub blob: String,
    pub key_ref: String,
}

/// One playbook to run, located inside a project working tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybookSpec {
    pub connection: String,
    /// Canonical name of the project holding the playbook.
    pub project: String,
    pub branch: String,
    /// Path of the playbook relative to the project root.
    pub path: String,
    pub trusted: bool,
    #[serde(default)]
    pub roles: Vec<RoleSpec>,
    #[serde(default)]
    pub secrets: Vec<SecretSpec>,
}

/// A speculative change to merge on top of the frozen repo state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeItem {
    pub connection: String,
    pub project: String,
    pub branch: String,
    /// Ref to fetch for this change, if it is not already part of the
    /// frozen state.
    pub refname: Option<String>,
    pub newrev: Option<String>,
}

/// The opaque parameter blob of a build request, stored separately in the
/// queue and cleared once the executor has loaded it.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct BuildParams {
    pub projects: Vec<ProjectSpec>,
    #[serde(default)]
    pub pre_playbooks: Vec<PlaybookSpec>,
    pub run_playbooks: Vec<PlaybookSpec>,
    #[serde(default)]
    pub post_playbooks: Vec<PlaybookSpec>,
    #[serde(default)]
    pub cleanup_playbooks: Vec<PlaybookSpec>,

    #[serde(default)]
    pub repo_state: RepoState,
    #[serde(default)]
    pub merge_items: Vec<MergeItem>,

    pub nodeset: NodeSet,
    /// Id of the node allocation the scheduler already submitted.
    pub node_request_id: Option<String>,

    /// The ref named by the triggering event (`refs/heads/...`, tags, or a
    /// review ref).
    pub refname: Option<String>,
    /// The branch of the change under test, used as a checkout fallback.
    pub target_branch: Option<String>,
    pub override_branch: Option<String>,
    pub override_checkout: Option<String>,

    #[serde(default)]
    pub vars: VarMap,
    #[serde(default)]
    pub extra_vars: VarMap,
    #[serde(default)]
    pub group_vars: BTreeMap<String, VarMap>,
    #[serde(default)]
    pub host_vars: BTreeMap<String, VarMap>,

    #[serde(default)]
    pub ssh_keys: Vec<SecretSpec>,

    /// Wall-clock budget for pre + run, seconds.
    pub timeout: Option<u64>,
    /// Budget applied freshly to each post playbook, seconds.
    pub post_timeout: Option<u64>,
}

impl BuildParams {
    /// All playbooks in execution order.
    pub fn all_playbooks(&self) -> impl Iterator<Item = &PlaybookSpec> {
        self.pre_playbooks
            .iter()
            .chain(self.run_playbooks.iter())
            .chain(self.post_playbooks.iter())
            .chain(self.cleanup_playbooks.iter())
    }

    pub fn project(&self, canonical_name: &str) -> Option<&ProjectSpec> {
        self.projects.iter().find(|p| p.canonical_name == canonical_name)
    }
}
