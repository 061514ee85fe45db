//! The per-build worker: everything that happens between leasing a build
//! request and publishing its completion event.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use capstan_rs::queue::QueueError;
use capstan_rs::types::{
    BuildParams, BuildRequest, BuildRequestState, BuildResult, NodeSet, PlaybookSpec,
    RepoState, ResultKind, SecretSpec, VarMap,
};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::ansible::{
    block_plugin_dirs, emit_playbook_banner, find_playbook, log_final_playbook_error, log_line,
    write_ansible_config, AnsibleRunner, RunStatus,
};
use crate::autohold;
use crate::builds::BuildHandle;
use crate::jobdir::JobDir;
use crate::kubectl::KubePortForward;
use crate::merger::MergerError;
use crate::metrics;
use crate::service::ExecutorContext;
use crate::ssh_agent::SshAgent;
use crate::update_queue::UpdateTask;
use crate::vars::{
    make_inventory, make_setup_inventory, squash_variables, write_inventory,
    write_vars_blacklist, Host, VARS_BLACKLIST,
};

const CLEANUP_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{0}")]
    Executor(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Ansible(#[from] crate::ansible::AnsibleError),
    #[error(transparent)]
    SshAgent(#[from] crate::ssh_agent::SshAgentError),
    #[error(transparent)]
    Keystore(#[from] capstan_rs::keystore::KeystoreError),
    #[error(transparent)]
    Merger(#[from] MergerError),
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Checkout resolution, most specific source first.
#[allow(clippy::too_many_arguments)]
pub fn resolve_branch(
    canonical_name: &str,
    refname: Option<&str>,
    target_branch: Option<&str>,
    job_override_branch: Option<&str>,
    job_override_checkout: Option<&str>,
    project_override_branch: Option<&str>,
    project_override_checkout: Option<&str>,
    default_branch: &str,
    branches: &[String],
    refs: &BTreeSet<String>,
) -> Result<(String, &'static str), BuildError> {
    let has_branch = |name: Option<&str>| {
        name.map(|n| branches.iter().any(|b| b == n)).unwrap_or(false)
    };
    let has_ref =
        |name: Option<&str>| name.map(|n| refs.contains(n)).unwrap_or(false);

    if has_ref(project_override_checkout) {
        Ok((project_override_checkout.unwrap().to_string(), "project override ref"))
    } else if has_branch(project_override_branch) {
        Ok((project_override_branch.unwrap().to_string(), "project override branch"))
    } else if has_ref(job_override_checkout) {
        Ok((job_override_checkout.unwrap().to_string(), "job override ref"))
    } else if has_branch(job_override_branch) {
        Ok((job_override_branch.unwrap().to_string(), "job override branch"))
    } else if let Some(branch) = refname.and_then(|r| r.strip_prefix("refs/heads/")) {
        Ok((branch.to_string(), "branch ref"))
    } else if let Some(tag) = refname.and_then(|r| r.strip_prefix("refs/tags/")) {
        Ok((tag.to_string(), "tag ref"))
    } else if has_branch(target_branch) {
        Ok((target_branch.unwrap().to_string(), "target branch"))
    } else if branches.iter().any(|b| b == default_branch) {
        Ok((default_branch.to_string(), "project default branch"))
    } else {
        Err(BuildError::Executor(format!(
            "project {canonical_name} does not have the default branch {default_branch}"
        )))
    }
}

fn epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub struct BuildWorker {
    context: Arc<ExecutorContext>,
    request: BuildRequest,
    params: BuildParams,
    handle: Arc<BuildHandle>,

    jobdir: Option<JobDir>,
    nodeset: Option<NodeSet>,
    ssh_agent: Option<SshAgent>,
    port_forwards: Vec<KubePortForward>,
    repo_state: RepoState,
    frozen_hostvars: BTreeMap<String, VarMap>,
    hosts: Vec<Host>,
    warnings: Vec<String>,
    /// Branch head the speculative merge was based on, kept for comment
    /// line mapping.
    orig_commit: Option<String>,
    start_time: f64,
}

impl BuildWorker {
    pub fn new(
        context: Arc<ExecutorContext>,
        request: BuildRequest,
        params: BuildParams,
        handle: Arc<BuildHandle>,
    ) -> Self {
        let repo_state = params.repo_state.clone();
        Self {
            context,
            request,
            params,
            handle,
            jobdir: None,
            nodeset: None,
            ssh_agent: None,
            port_forwards: Vec::new(),
            repo_state,
            frozen_hostvars: BTreeMap::new(),
            hosts: Vec::new(),
            warnings: Vec::new(),
            orig_commit: None,
            start_time: epoch_secs(),
        }
    }

    pub async fn run(mut self) {
        metrics::inc_builds();
        let result = match self.execute().await {
            Ok(result) => result,
            Err(err) => {
                warn!(build = %self.request.uuid, %err, "build worker failed");
                BuildResult::error(err.to_string())
            }
        };
        self.complete(result).await;
        self.context.registry.remove(&self.request.uuid);
        self.context.wake.notify_one();
    }

    /// Result of an abort observed at a phase boundary.
    fn abort_result(&self) -> Option<BuildResult> {
        if self.handle.is_aborted() {
            let kind = self.handle.abort_reason().unwrap_or(ResultKind::Aborted);
            Some(BuildResult::of(kind))
        } else {
            None
        }
    }

    async fn execute(&mut self) -> Result<BuildResult, BuildError> {
        // Phase 0: ssh agent and job directory.
        let keep = self.context.keep_jobdir();
        let jobdir = JobDir::new(&self.context.config.job_dir, keep, &self.request.uuid)?;
        write_vars_blacklist(&jobdir.vars_blacklist)?;
        std::fs::write(&jobdir.logging_json, "{}\n")?;
        self.jobdir = Some(jobdir);

        match SshAgent::start().await {
            Ok(agent) => {
                for key in &self.params.ssh_keys.clone() {
                    let material = self.decrypt_secret(key)?;
                    let material = material
                        .as_str()
                        .map(str::to_string)
                        .unwrap_or_else(|| material.to_string());
                    agent.add_data(&key.name, &material).await?;
                }
                self.ssh_agent = Some(agent);
            }
            // A build with no keys to load can proceed without an agent.
            Err(err) if self.params.ssh_keys.is_empty() => {
                warn!(build = %self.request.uuid, %err, "running without ssh agent");
            }
            Err(err) => return Err(err.into()),
        }

        // Phase 1: node lock.
        if let Some(request_id) = self.params.node_request_id.clone() {
            match self.context.allocator.lock_nodeset(&request_id).await {
                Ok(nodeset) => self.nodeset = Some(nodeset),
                Err(err) => {
                    warn!(build = %self.request.uuid, %err, "could not lock nodeset");
                    return Ok(BuildResult::of(ResultKind::NodeFailure));
                }
            }
        } else {
            self.nodeset = Some(self.params.nodeset.clone());
        }
        if let Some(result) = self.abort_result() {
            return Ok(result);
        }

        // Phase 2: repository updates, deduplicated across builds.
        let mut project_branches: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut tasks = Vec::new();
        let mut seen = BTreeSet::new();
        for (connection, project, canonical) in self.involved_projects() {
            if !seen.insert((connection.clone(), project.clone())) {
                continue;
            }
            let task = self.context.update_queue.put(Arc::new(UpdateTask::new(
                connection,
                project,
                Some(self.repo_state.clone()),
            )));
            tasks.push((canonical, task));
        }
        for (canonical, task) in &tasks {
            task.wait().await;
            if !task.succeeded() {
                if self.context.merger.is_broken() {
                    // Transient subprocess-environment breakage: reset and
                    // let the scheduler retry the build.
                    self.context.merger.reset();
                    return Ok(BuildResult::indeterminate());
                }
                warn!(build = %self.request.uuid, project = %task.project,
                      "repository update failed");
                return Ok(BuildResult::indeterminate());
            }
            if let Some(branches) = task.branches() {
                project_branches.insert(canonical.clone(), branches);
            }
        }
        if let Some(result) = self.abort_result() {
            return Ok(result);
        }

        // Phase 3: speculative merge.
        if !self.params.merge_items.is_empty() {
            let items = self.params.merge_items.clone();
            match self.context.merger.merge_changes(&items, &self.repo_state).await {
                Ok(Some(outcome)) => {
                    self.repo_state = outcome.repo_state;
                    self.orig_commit = Some(outcome.orig_commit);
                }
                Ok(None) => return Ok(BuildResult::of(ResultKind::MergerFailure)),
                Err(MergerError::Fetch(err)) => {
                    warn!(build = %self.request.uuid, err, "merge fetch failure, retrying");
                    return Ok(BuildResult::of(ResultKind::Aborted));
                }
                Err(MergerError::Broken(err)) => {
                    warn!(build = %self.request.uuid, err, "merger broken during merge");
                    self.context.merger.reset();
                    return Ok(BuildResult::indeterminate());
                }
                Err(err) => return Err(err.into()),
            }
        }
        if let Some(result) = self.abort_result() {
            return Ok(result);
        }

        // Phase 4: source checkouts.
        for project in self.params.projects.clone() {
            let empty = Vec::new();
            let branches =
                project_branches.get(&project.canonical_name).unwrap_or(&empty);
            let refs = self.known_refs(&project.connection, &project.name);
            let (refname, description) = resolve_branch(
                &project.canonical_name,
                self.params.refname.as_deref(),
                self.params.target_branch.as_deref(),
                self.params.override_branch.as_deref(),
                self.params.override_checkout.as_deref(),
                project.override_branch.as_deref(),
                project.override_checkout.as_deref(),
                &project.default_branch,
                branches,
                &refs,
            )?;
            info!(build = %self.request.uuid, project = %project.canonical_name,
                  %refname, description, "checking out");
            let dest = self.jobdir().src_root.join(&project.canonical_name);
            self.context
                .merger
                .checkout_branch(
                    &project.connection,
                    &project.name,
                    &dest,
                    &refname,
                    &self.repo_state,
                )
                .await?;
        }

        // Phase 5: playbook preparation.
        self.prepare_nodes()?;
        self.prepare_port_forwards().await;
        self.prepare_playbooks().await?;
        if let Some(result) = self.abort_result() {
            return Ok(result);
        }

        // Phases 6 through 9 share the console log.
        let result = self.run_playbooks().await?;
        Ok(result)
    }

    fn jobdir(&self) -> &JobDir {
        self.jobdir.as_ref().expect("jobdir allocated in phase 0")
    }

    fn decrypt_secret(&self, secret: &SecretSpec) -> Result<serde_json::Value, BuildError> {
        Ok(self.context.keystore.decrypt(&secret.key_ref, &secret.blob)?)
    }

    /// Job projects plus every project a playbook or role lives in.
    fn involved_projects(&self) -> Vec<(String, String, String)> {
        let mut projects = Vec::new();
        for project in &self.params.projects {
            projects.push((
                project.connection.clone(),
                project.name.clone(),
                project.canonical_name.clone(),
            ));
        }
        for playbook in self.params.all_playbooks() {
            projects.push((
                playbook.connection.clone(),
                playbook.project.clone(),
                playbook.project.clone(),
            ));
            for role in &playbook.roles {
                projects.push((role.connection.clone(), role.project.clone(), role.project.clone()));
            }
        }
        projects
    }

    /// Everything the frozen repo state names for a project, refs and
    /// shas alike, for override-checkout resolution.
    fn known_refs(&self, connection: &str, project: &str) -> BTreeSet<String> {
        let mut known = BTreeSet::new();
        if let Some(refs) = self.repo_state.project(connection, project) {
            for (refname, sha) in refs {
                known.insert(refname.clone());
                if let Some(short) = refname.strip_prefix("refs/heads/") {
                    known.insert(short.to_string());
                }
                known.insert(sha.clone());
            }
        }
        known
    }

    /// Build the inventory host list: connection vars merged with the
    /// job's host vars, plus the known_hosts file.
    fn prepare_nodes(&mut self) -> Result<(), BuildError> {
        let nodeset = self.nodeset.clone().unwrap_or_default();
        let mut known_hosts = String::new();
        let mut hosts = Vec::new();
        for node in &nodeset.nodes {
            let mut vars = VarMap::new();
            let address = node.interface_ip.clone().unwrap_or_else(|| node.name.clone());
            vars.insert("ansible_host".to_string(), address.clone().into());
            vars.insert(
                "ansible_connection".to_string(),
                node.connection_type.clone().into(),
            );
            let username = node
                .username
                .clone()
                .unwrap_or_else(|| self.context.config.default_username.clone());
            vars.insert("ansible_user".to_string(), username.into());
            if let Some(port) = node.connection_port {
                vars.insert("ansible_port".to_string(), port.into());
            }
            for (key, value) in &node.connection_extra {
                vars.insert(key.clone(), value.clone());
            }
            if let Some(host_vars) = self.params.host_vars.get(&node.name) {
                for (key, value) in host_vars {
                    vars.insert(key.clone(), value.clone());
                }
            }
            for key in &node.host_keys {
                known_hosts.push_str(&format!("{address} {key}\n"));
            }
            hosts.push(Host { name: node.name.clone(), vars });
        }
        if !known_hosts.is_empty() {
            std::fs::write(&self.jobdir().known_hosts, known_hosts)?;
        }
        if nodeset.nodes.iter().any(|n| n.connection_type == "kubectl") {
            // Contexts are resolved by the per-node connection extras; the
            // file only has to exist inside the sandbox.
            std::fs::write(&self.jobdir().kube_config, "apiVersion: v1\nkind: Config\n")?;
        }
        self.hosts = hosts;
        Ok(())
    }

    /// Open a console port-forward for every cluster-hosted node; the
    /// forwards live as long as the build.
    async fn prepare_port_forwards(&mut self) {
        let nodeset = self.nodeset.clone().unwrap_or_default();
        for node in &nodeset.nodes {
            if node.connection_type != "kubectl" {
                continue;
            }
            let Some(context) = node
                .connection_extra
                .get("kubernetes_context")
                .and_then(|v| v.as_str())
            else {
                continue;
            };
            let namespace = node
                .connection_extra
                .get("kubernetes_namespace")
                .and_then(|v| v.as_str())
                .unwrap_or("default");
            match KubePortForward::start(
                &self.jobdir().kube_config,
                context,
                namespace,
                &node.name,
                self.context.config.log_console_port,
            )
            .await
            {
                Ok(forward) => self.port_forwards.push(forward),
                Err(err) => {
                    warn!(build = %self.request.uuid, node = %node.name, %err,
                          "could not establish console port-forward");
                    self.warnings.push(format!(
                        "no console stream for {}: port-forward failed",
                        node.name
                    ));
                }
            }
        }
    }

    async fn prepare_playbooks(&mut self) -> Result<(), BuildError> {
        let params = self.params.clone();
        for (phase, specs) in [
            ("pre", &params.pre_playbooks),
            ("run", &params.run_playbooks),
            ("post", &params.post_playbooks),
            ("cleanup", &params.cleanup_playbooks),
        ] {
            if phase == "run" && specs.is_empty() {
                return Err(BuildError::Executor("job has no run playbook".to_string()));
            }
            for spec in specs {
                self.prepare_playbook(phase, spec).await?;
            }
        }

        // The generated setup and freeze playbooks live outside any
        // checkout and always run trusted.
        let setup = self.jobdir().setup_playbook.root.join("setup.yaml");
        std::fs::write(&setup, "- hosts: all\n  gather_facts: true\n")?;
        let freeze = self.jobdir().freeze_playbook.root.join("freeze.yaml");
        std::fs::write(
            &freeze,
            "- hosts: all\n  gather_facts: false\n  tasks:\n    - include_vars: {}\n",
        )?;
        {
            let jobdir = self.jobdir.as_mut().expect("jobdir allocated in phase 0");
            jobdir.setup_playbook.playbook_path = Some(setup);
            jobdir.setup_playbook.trusted = true;
            jobdir.freeze_playbook.playbook_path = Some(freeze);
            jobdir.freeze_playbook.trusted = true;
        }
        Ok(())
    }

    async fn prepare_playbook(
        &mut self,
        phase: &'static str,
        spec: &PlaybookSpec,
    ) -> Result<(), BuildError> {
        // Locate (or create) the checkout holding this playbook, shared
        // across playbooks on the same project and branch.
        let branch = spec.branch.clone();
        let checkout = {
            let jobdir = self.jobdir.as_mut().expect("jobdir allocated in phase 0");
            let existing = if spec.trusted {
                jobdir.get_trusted_project(&spec.project, &branch).cloned()
            } else {
                jobdir.get_untrusted_project(&spec.project, &branch).cloned()
            };
            match existing {
                Some(path) => path,
                None => {
                    let path = if spec.trusted {
                        jobdir.add_trusted_project(&spec.project, &branch)?
                    } else {
                        jobdir.add_untrusted_project(&spec.project, &branch)?
                    };
                    self.context
                        .merger
                        .checkout_branch(
                            &spec.connection,
                            &spec.project,
                            &path,
                            &branch,
                            &self.repo_state,
                        )
                        .await?;
                    path
                }
            }
        };

        let playbook_path = find_playbook(&checkout, &spec.path, spec.trusted)?;

        let secret_vars = self.merge_secret_vars(spec)?;

        let merger = self.context.merger.clone();
        let repo_state = self.repo_state.clone();
        let jobdir = self.jobdir.as_mut().expect("jobdir allocated in phase 0");
        let playbook = match phase {
            "pre" => jobdir.add_pre_playbook()?,
            "run" => jobdir.add_playbook()?,
            "post" => jobdir.add_post_playbook()?,
            _ => jobdir.add_cleanup_playbook()?,
        };
        playbook.trusted = spec.trusted;
        playbook.playbook_path = Some(playbook_path);
        playbook.project_canonical_name = Some(spec.project.clone());
        playbook.branch = Some(branch.clone());

        if !secret_vars.is_empty() {
            let secrets_file = playbook.secrets_root.join("all.yaml");
            let yaml = serde_yaml::to_string(&serde_json::Value::Object(secret_vars))
                .map_err(|err| BuildError::Executor(err.to_string()))?;
            std::fs::write(secrets_file, yaml)?;
        }

        // Role checkouts land in the playbook's role path under the name
        // the playbook refers to them by.
        for role in &spec.roles {
            let role_branch = role.branch.clone().unwrap_or_else(|| branch.clone());
            let dest = playbook.roles_root.join(&role.target_name);
            merger
                .checkout_branch(&role.connection, &role.project, &dest, &role_branch, &repo_state)
                .await?;
            if !spec.trusted {
                block_plugin_dirs(&dest)?;
            }
            playbook.role_paths.push(dest);
        }
        Ok(())
    }

    /// Decrypt a playbook's secrets into group_vars, warning when a secret
    /// shadows a job variable.
    fn merge_secret_vars(&mut self, spec: &PlaybookSpec) -> Result<VarMap, BuildError> {
        let mut secret_vars = VarMap::new();
        for secret in &spec.secrets {
            let value = self.decrypt_secret(secret)?;
            if self.params.vars.contains_key(&secret.name)
                || self.params.extra_vars.contains_key(&secret.name)
            {
                self.warnings.push(format!(
                    "secret `{}` shadows a job variable of the same name",
                    secret.name
                ));
            }
            if VARS_BLACKLIST.contains(&secret.name.as_str()) {
                self.warnings.push(format!(
                    "secret `{}` conflicts with a reserved variable and was dropped",
                    secret.name
                ));
                continue;
            }
            secret_vars.insert(secret.name.clone(), value);
        }
        Ok(secret_vars)
    }

    /// Phases 6-9: setup, freeze, pre/run, pause, post, cleanup.
    async fn run_playbooks(&mut self) -> Result<BuildResult, BuildError> {
        let nodeset = self.nodeset.clone().unwrap_or_default();

        log_line(&self.jobdir().job_output_file, "Running Ansible setup...");
        // Site-wide variables from the configured file seed the job vars;
        // anything the job sets itself wins.
        let mut job_vars = VarMap::new();
        if let Some(path) = &self.context.config.variables {
            match std::fs::read_to_string(path) {
                Ok(data) => match serde_yaml::from_str::<VarMap>(&data) {
                    Ok(vars) => job_vars = vars,
                    Err(err) => self
                        .warnings
                        .push(format!("could not parse executor variables file: {err}")),
                },
                Err(err) => self
                    .warnings
                    .push(format!("could not read executor variables file: {err}")),
            }
        }
        for (key, value) in &self.params.vars {
            job_vars.insert(key.clone(), value.clone());
        }
        let original_hostvars = squash_variables(
            &self.hosts,
            &nodeset,
            &job_vars,
            &self.params.group_vars,
            &self.params.extra_vars,
        );
        write_inventory(
            &self.jobdir().setup_inventory,
            &make_setup_inventory(&self.hosts, &original_hostvars),
        )?;
        std::fs::copy(&self.jobdir().setup_inventory, &self.jobdir().setup_playbook.inventory)?;

        let setup_timeout = Duration::from_secs(self.context.config.ansible_setup_timeout);
        let setup = self
            .runner()
            .run_playbook(&self.jobdir().setup_playbook, Some(setup_timeout), false)
            .await?;
        if !setup.ok() {
            // Likely a network problem between here and the nodes; give
            // the nodes back and let the scheduler reschedule.
            metrics::inc_phase_result("setup", status_label(setup.status, setup.code));
            return Ok(BuildResult::indeterminate());
        }

        // Freeze the variables so trusted playbooks never re-evaluate
        // job-controlled templates.
        write_inventory(
            &self.jobdir().freeze_inventory,
            &make_inventory(&self.hosts, &nodeset, &original_hostvars, &[]),
        )?;
        std::fs::copy(&self.jobdir().freeze_inventory, &self.jobdir().freeze_playbook.inventory)?;
        let freeze = self
            .runner()
            .run_playbook(&self.jobdir().freeze_playbook, Some(setup_timeout), false)
            .await?;
        if !freeze.ok() {
            metrics::inc_phase_result("freeze", status_label(freeze.status, freeze.code));
            return Ok(BuildResult::indeterminate());
        }
        self.load_frozen_hostvars(&original_hostvars)?;
        self.write_playbook_inventories(&nodeset)?;

        self.handle.mark_started();
        let time_started = Instant::now();
        let job_timeout = self.params.timeout.map(Duration::from_secs);

        let mut result: Option<ResultKind> = None;
        let mut pre_failed = false;
        let mut run_unreachable = false;
        let mut success = false;

        let pre_specs = self.params.pre_playbooks.clone();
        for (index, spec) in pre_specs.iter().enumerate() {
            let outcome = self
                .run_one(spec, "pre", index, remaining(job_timeout, time_started))
                .await?;
            if outcome.status == RunStatus::Timeout {
                pre_failed = true;
                result = Some(ResultKind::TimedOut);
                break;
            }
            if !outcome.ok() {
                // Pre playbooks should never fail; no result means the
                // scheduler runs the build again.
                pre_failed = true;
                break;
            }
        }

        if !pre_failed {
            let run_specs = self.params.run_playbooks.clone();
            for (index, spec) in run_specs.iter().enumerate() {
                let outcome = self
                    .run_one(spec, "run", index, remaining(job_timeout, time_started))
                    .await?;
                match outcome.status {
                    RunStatus::Aborted => {
                        return Ok(self
                            .abort_result()
                            .unwrap_or_else(|| BuildResult::of(ResultKind::Aborted)))
                    }
                    RunStatus::Timeout => {
                        pre_failed = true;
                        result = Some(ResultKind::TimedOut);
                        break;
                    }
                    RunStatus::Unreachable => {
                        pre_failed = true;
                        run_unreachable = true;
                        break;
                    }
                    RunStatus::Normal => {
                        success = outcome.code == Some(0);
                        if success {
                            result = Some(ResultKind::Success);
                        } else {
                            result = Some(ResultKind::Failure);
                            break;
                        }
                    }
                }
            }
        }

        // Phase 8: pause on request of the run playbook.
        let (data, secret_data) = self.read_result_data();
        let pause_requested = data
            .get("capstan")
            .and_then(|c| c.get("pause"))
            .and_then(|p| p.as_bool())
            .unwrap_or(false);
        if success && pause_requested {
            self.pause_build().await?;
        }
        if self.handle.is_aborted() && result != Some(ResultKind::TimedOut) {
            // Post playbooks still run so logs get copied out; the final
            // result is decided now.
            result = Some(self.handle.abort_reason().unwrap_or(ResultKind::Aborted));
        }

        // Phase 9: post playbooks run even on failure, with a fresh
        // timeout each.
        let post_timeout = self.params.post_timeout.map(Duration::from_secs);
        let mut post_unreachable = false;
        let post_specs = self.params.post_playbooks.clone();
        let post_count = post_specs.len();
        for (index, spec) in post_specs.iter().enumerate() {
            let outcome = self.run_one(spec, "post", index, post_timeout).await?;
            if outcome.status == RunStatus::Aborted
                && !matches!(
                    result,
                    Some(ResultKind::Aborted) | Some(ResultKind::DiskFull)
                )
            {
                return Ok(self
                    .abort_result()
                    .unwrap_or_else(|| BuildResult::of(ResultKind::Aborted)));
            }
            if outcome.status == RunStatus::Unreachable {
                // Keep running the remaining post playbooks for their log
                // uploads, then let the scheduler retry.
                post_unreachable = true;
            }
            if !outcome.ok() {
                success = false;
                if !pre_failed {
                    result = Some(ResultKind::PostFailure);
                }
                if index + 1 == post_count {
                    log_final_playbook_error(self.jobdir());
                }
            }
        }

        let cleanup_specs = self.params.cleanup_playbooks.clone();
        if !cleanup_specs.is_empty() {
            log_line(&self.jobdir().job_output_file, "Running Ansible cleanup...");
            for (index, spec) in cleanup_specs.iter().enumerate() {
                // Cleanup failures never change the reported result.
                let _ = self.run_one(spec, "cleanup", index, Some(CLEANUP_TIMEOUT)).await;
            }
        }

        if run_unreachable || post_unreachable {
            return Ok(BuildResult::indeterminate());
        }

        // The scheduler maps review comments back onto pre-merge lines
        // using the commit the speculative merge was based on.
        let mut data = data;
        if let Some(orig_commit) = &self.orig_commit {
            if let Some(map) = data.as_object_mut() {
                let section = map
                    .entry("capstan".to_string())
                    .or_insert_with(|| serde_json::json!({}));
                if let Some(section) = section.as_object_mut() {
                    section.insert("orig_commit".to_string(), orig_commit.clone().into());
                }
            }
        }

        let mut build_result = BuildResult {
            result,
            data,
            secret_data,
            warnings: std::mem::take(&mut self.warnings),
            ..Default::default()
        };
        if self.handle.is_aborted() && build_result.result.is_none() {
            build_result.result =
                Some(self.handle.abort_reason().unwrap_or(ResultKind::Aborted));
        }
        Ok(build_result)
    }

    fn runner(&self) -> AnsibleRunner<'_> {
        let env = self
            .ssh_agent
            .as_ref()
            .map(|agent| {
                agent
                    .env()
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default();
        AnsibleRunner {
            config: &self.context.config,
            jobdir: self.jobdir.as_ref().expect("jobdir allocated in phase 0"),
            handle: &self.handle,
            env,
            verbose: self.context.verbose(),
        }
    }

    async fn run_one(
        &self,
        spec: &PlaybookSpec,
        phase: &'static str,
        index: usize,
        timeout: Option<Duration>,
    ) -> Result<crate::ansible::RunOutcome, BuildError> {
        emit_playbook_banner(self.jobdir(), spec, phase, "START", None);
        let jobdir = self.jobdir();
        let list = match phase {
            "pre" => &jobdir.pre_playbooks,
            "run" => &jobdir.playbooks,
            "post" => &jobdir.post_playbooks,
            _ => &jobdir.cleanup_playbooks,
        };
        let playbook = &list[index];
        let outcome = self
            .runner()
            .run_playbook(playbook, timeout, phase == "cleanup")
            .await?;
        let label = status_label(outcome.status, outcome.code);
        metrics::inc_phase_result(phase, label);
        emit_playbook_banner(self.jobdir(), spec, phase, "END", Some(label));
        Ok(outcome)
    }

    /// After the freeze playbook, per-host fact caches hold the rendered
    /// variables. Fall back to the squashed vars when a host produced no
    /// cache entry.
    fn load_frozen_hostvars(
        &mut self,
        original: &BTreeMap<String, VarMap>,
    ) -> Result<(), BuildError> {
        let mut frozen = BTreeMap::new();
        for (host, vars) in original {
            let cache_file = self.jobdir().fact_cache.join(host);
            let mut vars = match std::fs::read_to_string(&cache_file)
                .ok()
                .and_then(|data| serde_json::from_str::<VarMap>(&data).ok())
            {
                Some(cached) => cached,
                None => vars.clone(),
            };
            for key in VARS_BLACKLIST {
                vars.remove(*key);
            }
            // Connection details come back in; they were never
            // job-controlled.
            if let Some(connection_vars) = original.get(host) {
                for key in VARS_BLACKLIST {
                    if let Some(value) = connection_vars.get(*key) {
                        vars.insert((*key).to_string(), value.clone());
                    }
                }
            }
            frozen.insert(host.clone(), vars);
        }
        let yaml = serde_yaml::to_string(&frozen)
            .map_err(|err| BuildError::Executor(err.to_string()))?;
        std::fs::write(&self.jobdir().frozen_hostvars_file, yaml)?;
        self.frozen_hostvars = frozen;
        Ok(())
    }

    fn write_playbook_inventories(&mut self, nodeset: &NodeSet) -> Result<(), BuildError> {
        let inventory = make_inventory(&self.hosts, nodeset, &self.frozen_hostvars, &[]);
        let jobdir = self.jobdir.as_mut().expect("jobdir allocated in phase 0");
        let write_all = |playbooks: &[crate::jobdir::JobDirPlaybook]| -> Result<(), BuildError> {
            for playbook in playbooks {
                write_inventory(&playbook.inventory, &inventory)?;
            }
            Ok(())
        };
        write_all(&jobdir.pre_playbooks)?;
        write_all(&jobdir.playbooks)?;
        write_all(&jobdir.post_playbooks)?;
        write_all(&jobdir.cleanup_playbooks)?;
        for playbook in jobdir
            .pre_playbooks
            .iter()
            .chain(jobdir.playbooks.iter())
            .chain(jobdir.post_playbooks.iter())
            .chain(jobdir.cleanup_playbooks.iter())
        {
            write_ansible_config(playbook, jobdir, &self.context.config)?;
        }
        write_ansible_config(&jobdir.setup_playbook, jobdir, &self.context.config)?;
        write_ansible_config(&jobdir.freeze_playbook, jobdir, &self.context.config)?;
        Ok(())
    }

    fn read_result_data(&self) -> (serde_json::Value, serde_json::Value) {
        let empty = serde_json::json!({});
        let Ok(raw) = std::fs::read_to_string(&self.jobdir().results_json) else {
            return (empty.clone(), empty);
        };
        let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
            return (empty.clone(), empty);
        };
        match value {
            serde_json::Value::Object(mut map) => {
                let secret = map.remove("secret_data").unwrap_or_else(|| empty.clone());
                match map.remove("data") {
                    Some(data) => (data, secret),
                    None => (serde_json::Value::Object(map), secret),
                }
            }
            other => (other, empty),
        }
    }

    /// Phase 8: hold the build until an external resume (or cancel).
    async fn pause_build(&mut self) -> Result<(), BuildError> {
        info!(build = %self.request.uuid, "pausing build");
        log_line(&self.jobdir().job_output_file, "Build paused");
        self.handle.set_paused(true);
        self.request.state = BuildRequestState::Paused;
        self.update_request_with_retry().await;

        while !self.handle.is_aborted() && !self.handle.is_resume_requested() {
            tokio::select! {
                _ = self.handle.resume.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(500)) => {}
            }
        }

        if self.handle.is_resume_requested() {
            let _ = self.context.queue.fulfill_resume(&self.request).await;
        }
        self.handle.set_paused(false);
        self.request.state = BuildRequestState::Running;
        self.update_request_with_retry().await;
        log_line(&self.jobdir().job_output_file, "Build resumed");
        info!(build = %self.request.uuid, "resumed build");
        Ok(())
    }

    async fn update_request_with_retry(&self) -> bool {
        retry_queue(|| async { self.context.queue.update(&self.request).await }).await.is_ok()
    }

    /// Phase 10: autohold, state transition, completion event, cleanup.
    async fn complete(&mut self, mut result: BuildResult) {
        result.start_time = Some(self.start_time);
        result.end_time = Some(epoch_secs());

        // A retriable no-result upgrades to RETRY_LIMIT at the attempt
        // cap, so autohold can see a final failure.
        if result.result.is_none() && self.request.attempts >= self.request.max_attempts {
            result.result = Some(ResultKind::RetryLimit);
        }

        if let Some(nodeset) = self.nodeset.take() {
            let mut held = false;
            if autohold::should_hold(result.result) {
                match self.context.allocator.hold_requests().await {
                    Ok(requests) => {
                        let refname = self.params.refname.clone().unwrap_or_default();
                        let project = self
                            .params
                            .projects
                            .first()
                            .map(|p| p.canonical_name.clone())
                            .unwrap_or_default();
                        if let Some(request) = autohold::match_request(
                            &requests,
                            &self.request.tenant,
                            &project,
                            &self.request.job_name,
                            &refname,
                        ) {
                            info!(build = %self.request.uuid, hold = %request.id,
                                  "holding nodeset for autohold request");
                            held = self
                                .context
                                .allocator
                                .hold_nodeset(nodeset.clone(), request, &self.request.uuid)
                                .await
                                .is_ok();
                        }
                    }
                    Err(err) => {
                        warn!(build = %self.request.uuid, %err, "could not list autoholds")
                    }
                }
            }
            result.held = held;
            if !held {
                if let Err(err) = self.context.allocator.return_nodeset(nodeset).await {
                    warn!(build = %self.request.uuid, %err, "could not return nodeset");
                }
            }
        }

        self.request.state = BuildRequestState::Completed;
        let found = retry_queue(|| async { self.context.queue.update(&self.request).await })
            .await
            .is_ok();
        let lock_valid = self.context.queue.lock_valid(&self.request).await;
        if lock_valid {
            let _ =
                retry_queue(|| async { self.context.queue.unlock(&self.request).await }).await;
        }

        if found && lock_valid {
            let _ = retry_queue(|| async {
                self.context
                    .queue
                    .submit_completed_event(&self.request, &result)
                    .await
            })
            .await;
        } else {
            // Without a valid lock the scheduler will synthesize an error
            // for this build; publishing would race it.
            info!(build = %self.request.uuid, found, lock_valid,
                  "not publishing completion event");
        }

        for forward in &mut self.port_forwards {
            forward.stop();
        }
        self.port_forwards.clear();
        if let Some(mut agent) = self.ssh_agent.take() {
            agent.stop();
        }
        if let Some(jobdir) = self.jobdir.take() {
            jobdir.cleanup();
        }
        debug!(build = %self.request.uuid, result = ?result.result, "build complete");
    }
}

fn remaining(timeout: Option<Duration>, since: Instant) -> Option<Duration> {
    timeout.map(|total| total.saturating_sub(since.elapsed()))
}

fn status_label(status: RunStatus, code: Option<i32>) -> &'static str {
    match status {
        RunStatus::Timeout => "timeout",
        RunStatus::Aborted => "aborted",
        RunStatus::Unreachable => "unreachable",
        RunStatus::Normal => {
            if code == Some(0) {
                "success"
            } else {
                "failure"
            }
        }
    }
}

/// Bounded exponential retry for shared-queue operations; transient
/// failures repeat, not-found and lock-lost are definitive.
pub async fn retry_queue<F, Fut, T>(operation: F) -> Result<T, QueueError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, QueueError>>,
{
    let policy = backoff::ExponentialBackoff {
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..Default::default()
    };
    backoff::future::retry(policy, || async {
        operation().await.map_err(|err| {
            if err.is_transient() {
                backoff::Error::transient(err)
            } else {
                backoff::Error::permanent(err)
            }
        })
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn branches(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_resolve_branch_precedence() {
        let refs: BTreeSet<String> =
            ["refs/tags/v1", "deadbeef"].iter().map(|s| s.to_string()).collect();
        let all = branches(&["master", "stable", "feature/x"]);

        // Project override checkout wins over everything.
        let (selected, description) = resolve_branch(
            "example.com/demo",
            Some("refs/heads/feature/x"),
            Some("stable"),
            Some("stable"),
            None,
            Some("stable"),
            Some("deadbeef"),
            "master",
            &all,
            &refs,
        )
        .unwrap();
        assert_eq!(selected, "deadbeef");
        assert_eq!(description, "project override ref");

        // Then project override branch.
        let (selected, _) = resolve_branch(
            "example.com/demo",
            Some("refs/heads/feature/x"),
            None,
            Some("master"),
            None,
            Some("stable"),
            None,
            "master",
            &all,
            &refs,
        )
        .unwrap();
        assert_eq!(selected, "stable");

        // A branch ref beats the target branch.
        let (selected, description) = resolve_branch(
            "example.com/demo",
            Some("refs/heads/feature/x"),
            Some("stable"),
            None,
            None,
            None,
            None,
            "master",
            &all,
            &refs,
        )
        .unwrap();
        assert_eq!(selected, "feature/x");
        assert_eq!(description, "branch ref");

        // Tag refs check out the tag.
        let (selected, description) = resolve_branch(
            "example.com/demo",
            Some("refs/tags/v1"),
            None,
            None,
            None,
            None,
            None,
            "master",
            &all,
            &refs,
        )
        .unwrap();
        assert_eq!(selected, "v1");
        assert_eq!(description, "tag ref");

        // Fall through to the target branch, then the default.
        let (selected, _) = resolve_branch(
            "example.com/demo",
            None,
            Some("stable"),
            None,
            None,
            None,
            None,
            "master",
            &all,
            &refs,
        )
        .unwrap();
        assert_eq!(selected, "stable");

        let (selected, description) = resolve_branch(
            "example.com/demo",
            None,
            None,
            None,
            None,
            None,
            None,
            "master",
            &all,
            &refs,
        )
        .unwrap();
        assert_eq!(selected, "master");
        assert_eq!(description, "project default branch");

        // Nothing matches: hard error.
        assert!(resolve_branch(
            "example.com/demo",
            None,
            None,
            None,
            None,
            None,
            None,
            "main",
            &branches(&["master"]),
            &refs,
        )
        .is_err());
    }
}
