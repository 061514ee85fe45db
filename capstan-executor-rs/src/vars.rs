//! Variable precedence and inventory construction.
//!
//! Ansible's hash behavior is left at `replace`, so precedence is a flat
//! per-key override chain and no deep merging happens anywhere.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use capstan_rs::types::{NodeSet, VarMap};

/// Inventory variables a job must not override; written to
/// `ansible/vars_blacklist.yaml` and stripped from frozen hostvars.
pub const VARS_BLACKLIST: &[&str] = &[
    "ansible_become",
    "ansible_become_method",
    "ansible_become_password",
    "ansible_become_user",
    "ansible_connection",
    "ansible_host",
    "ansible_password",
    "ansible_port",
    "ansible_python_interpreter",
    "ansible_shell_executable",
    "ansible_ssh_common_args",
    "ansible_ssh_executable",
    "ansible_ssh_extra_args",
    "ansible_ssh_private_key_file",
    "ansible_user",
];

/// Connection types the setup playbook cannot run `setup` against.
pub const SETUP_BLACKLISTED_CONNECTIONS: &[&str] = &["local", "kubectl", "winrm"];

/// One inventory host: its name plus every variable already attached to it
/// (connection vars merged with the job's host_vars).
#[derive(Debug, Clone)]
pub struct Host {
    pub name: String,
    pub vars: VarMap,
}

/// Combine job variable parameters into a single hostvars map, simulating
/// ansible variable precedence: job vars, then group vars (group `all`
/// first, the rest in sorted-name order), then host vars, then extra vars,
/// with the later source winning per key.
pub fn squash_variables(
    hosts: &[Host],
    nodeset: &NodeSet,
    job_vars: &VarMap,
    group_vars: &BTreeMap<String, VarMap>,
    extra_vars: &VarMap,
) -> BTreeMap<String, VarMap> {
    let mut result = BTreeMap::new();
    let groups = nodeset.sorted_groups();
    for host in hosts {
        let mut vars = job_vars.clone();
        if let Some(all_vars) = group_vars.get("all") {
            extend(&mut vars, all_vars);
        }
        for group in &groups {
            if group.nodes.iter().any(|n| n == &host.name) {
                if let Some(gv) = group_vars.get(&group.name) {
                    extend(&mut vars, gv);
                }
            }
        }
        extend(&mut vars, &host.vars);
        extend(&mut vars, extra_vars);
        result.insert(host.name.clone(), vars);
    }
    result
}

fn extend(target: &mut VarMap, source: &VarMap) {
    for (key, value) in source {
        target.insert(key.clone(), value.clone());
    }
}

/// Inventory for the setup playbook: every reachable host, no groups.
pub fn make_setup_inventory(
    hosts: &[Host],
    hostvars: &BTreeMap<String, VarMap>,
) -> serde_json::Value {
    let mut inventory_hosts = serde_json::Map::new();
    for host in hosts {
        let Some(vars) = hostvars.get(&host.name) else { continue };
        let connection = vars
            .get("ansible_connection")
            .and_then(|v| v.as_str())
            .unwrap_or("ssh");
        if SETUP_BLACKLISTED_CONNECTIONS.contains(&connection) {
            continue;
        }
        inventory_hosts.insert(host.name.clone(), serde_json::Value::Object(vars.clone()));
    }
    serde_json::json!({ "all": { "hosts": inventory_hosts } })
}

/// Full inventory with hostvars and group children.
pub fn make_inventory(
    hosts: &[Host],
    nodeset: &NodeSet,
    hostvars: &BTreeMap<String, VarMap>,
    remove_keys: &[&str],
) -> serde_json::Value {
    let mut inventory_hosts = serde_json::Map::new();
    for host in hosts {
        let Some(vars) = hostvars.get(&host.name) else { continue };
        let mut vars = vars.clone();
        for key in remove_keys {
            vars.remove(*key);
        }
        inventory_hosts.insert(host.name.clone(), serde_json::Value::Object(vars));
    }

    let mut all = serde_json::Map::new();
    all.insert("hosts".to_string(), serde_json::Value::Object(inventory_hosts));

    // What was frozen for localhost becomes the 'all' vars, visible in
    // turn to localhost plays.
    if let Some(local_vars) = hostvars.get("localhost") {
        let mut vars = local_vars.clone();
        for key in remove_keys {
            vars.remove(*key);
        }
        all.insert("vars".to_string(), serde_json::Value::Object(vars));
    }

    if !nodeset.groups.is_empty() {
        let mut children = serde_json::Map::new();
        for group in &nodeset.groups {
            let mut group_hosts = serde_json::Map::new();
            for node_name in &group.nodes {
                group_hosts.insert(node_name.clone(), serde_json::Value::Null);
            }
            children.insert(
                group.name.clone(),
                serde_json::json!({ "hosts": group_hosts }),
            );
        }
        all.insert("children".to_string(), serde_json::Value::Object(children));
    }

    serde_json::json!({ "all": all })
}

pub fn write_inventory(path: &Path, inventory: &serde_json::Value) -> io::Result<()> {
    let yaml = serde_yaml::to_string(inventory)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    std::fs::write(path, yaml)
}

pub fn write_vars_blacklist(path: &Path) -> io::Result<()> {
    let yaml = serde_yaml::to_string(&VARS_BLACKLIST)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    std::fs::write(path, yaml)
}
