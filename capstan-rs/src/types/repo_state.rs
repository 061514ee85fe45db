use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Frozen git state: `connection -> project -> ref -> sha`.
///
/// Every executor reconstructing a working tree for the same build-set must
/// arrive at identical contents, so the maps are ordered.
#[derive(Default, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RepoState(pub BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>);

impl RepoState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn set(&mut self, connection: &str, project: &str, refname: &str, sha: &str) {
        self.0
            .entry(connection.to_string())
            .or_default()
            .entry(project.to_string())
            .or_default()
            .insert(refname.to_string(), sha.to_string());
    }

    pub fn get(&self, connection: &str, project: &str, refname: &str) -> Option<&str> {
        self.0
            .get(connection)?
            .get(project)?
            .get(refname)
            .map(String::as_str)
    }

    pub fn project(
        &self,
        connection: &str,
        project: &str,
    ) -> Option<&BTreeMap<String, String>> {
        self.0.get(connection)?.get(project)
    }

    /// Fold another state into this one; the other state wins on conflicts.
    pub fn merge(&mut self, other: &RepoState) {
        for (connection, projects) in &other.0 {
            for (project, refs) in projects {
                for (refname, sha) in refs {
                    self.set(connection, project, refname, sha);
                }
            }
        }
    }
}
