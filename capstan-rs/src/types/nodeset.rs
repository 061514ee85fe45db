use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A single remote host assigned to a build.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub name: String,
    pub label: String,
    pub interface_ip: Option<String>,
    #[serde(default = "default_connection_type")]
    pub connection_type: String,
    pub connection_port: Option<u16>,
    #[serde(default)]
    pub host_keys: Vec<String>,
    pub username: Option<String>,
    /// Extra per-connection-type parameters (kubernetes context, winrm
    /// options and the like), passed through to the inventory untouched.
    #[serde(default)]
    pub connection_extra: BTreeMap<String, serde_json::Value>,
}

fn default_connection_type() -> String {
    "ssh".to_string()
}

impl Node {
    pub fn new(name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            label: label.into(),
            interface_ip: None,
            connection_type: default_connection_type(),
            connection_port: None,
            host_keys: Vec::new(),
            username: None,
            connection_extra: BTreeMap::new(),
        }
    }
}

/// A named subset of the nodes in a nodeset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    pub nodes: Vec<String>,
}

/// An ordered set of nodes plus named groups, acquired from the node
/// allocator just before playbook execution.
#[derive(Default, Debug, Clone, Serialize, Deserialize)]
pub struct NodeSet {
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub groups: Vec<Group>,
}

impl NodeSet {
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.name == name)
    }

    /// Groups in sorted-name order; group variable application depends on
    /// this ordering being stable.
    pub fn sorted_groups(&self) -> Vec<&Group> {
        let mut groups: Vec<&Group> = self.groups.iter().collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        groups
    }
}
