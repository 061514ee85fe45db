//! The on-disk tree backing one build.
//!
//! The root is named after the build id so the log streamer can find the
//! console log knowing nothing but the id. `work/` is writable inside the
//! sandbox, `ansible/` is read-only to the job, and trusted and untrusted
//! checkouts never share a tree.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub struct JobDirPlaybook {
    pub root: PathBuf,
    pub index: usize,
    pub phase: &'static str,
    pub trusted: bool,
    pub inventory: PathBuf,
    pub secrets_root: PathBuf,
    pub ansible_cfg: PathBuf,
    pub roles_root: PathBuf,
    /// Set once the playbook file is located inside its checkout.
    pub playbook_path: Option<PathBuf>,
    pub project_canonical_name: Option<String>,
    pub branch: Option<String>,
    pub role_paths: Vec<PathBuf>,
}

impl JobDirPlaybook {
    fn new(root: PathBuf, index: usize, phase: &'static str) -> io::Result<Self> {
        fs::create_dir_all(&root)?;
        let secrets_root = root.join("group_vars");
        fs::create_dir_all(&secrets_root)?;
        let roles_root = root.join("roles");
        fs::create_dir_all(&roles_root)?;
        Ok(Self {
            inventory: root.join("inventory.yaml"),
            ansible_cfg: root.join("ansible.cfg"),
            secrets_root,
            roles_root,
            root,
            index,
            phase,
            trusted: false,
            playbook_path: None,
            project_canonical_name: None,
            branch: None,
            role_paths: Vec::new(),
        })
    }
}

pub struct JobDir {
    pub root: PathBuf,
    keep: bool,

    pub work_root: PathBuf,
    pub src_root: PathBuf,
    pub log_root: PathBuf,
    pub job_output_file: PathBuf,
    pub job_unreachable_file: PathBuf,
    pub tmp_root: PathBuf,
    pub results_json: PathBuf,
    pub known_hosts: PathBuf,
    pub kube_config: PathBuf,

    pub ansible_root: PathBuf,
    pub logging_json: PathBuf,
    pub vars_blacklist: PathBuf,
    pub frozen_hostvars_file: PathBuf,
    pub setup_inventory: PathBuf,
    pub freeze_inventory: PathBuf,
    pub ansible_cache_root: PathBuf,
    pub fact_cache: PathBuf,

    pub trusted_root: PathBuf,
    pub untrusted_root: PathBuf,

    pub setup_playbook: JobDirPlaybook,
    pub freeze_playbook: JobDirPlaybook,
    pub pre_playbooks: Vec<JobDirPlaybook>,
    pub playbooks: Vec<JobDirPlaybook>,
    pub post_playbooks: Vec<JobDirPlaybook>,
    pub cleanup_playbooks: Vec<JobDirPlaybook>,

    playbook_count: usize,
    trusted_projects: HashMap<(String, String), PathBuf>,
    untrusted_projects: HashMap<(String, String), PathBuf>,
}

impl JobDir {
    pub fn new(base: &Path, keep: bool, build_uuid: &str) -> io::Result<Self> {
        let root = base.join(build_uuid);
        fs::create_dir_all(&root)?;

        let work_root = root.join("work");
        let src_root = work_root.join("src");
        let log_root = work_root.join("logs");
        let tmp_root = work_root.join("tmp");
        let ssh_root = work_root.join(".ssh");
        let kube_root = work_root.join(".kube");
        let ansible_root = root.join("ansible");
        let trusted_root = root.join("trusted");
        let untrusted_root = root.join("untrusted");
        let ansible_cache_root = root.join(".ansible");
        let fact_cache = ansible_cache_root.join("fact-cache");
        for dir in [
            &src_root,
            &log_root,
            &tmp_root,
            &ssh_root,
            &kube_root,
            &ansible_root,
            &trusted_root,
            &untrusted_root,
            &fact_cache,
        ] {
            fs::create_dir_all(dir)?;
        }

        // Created empty right away so streamers can open it before the
        // first byte is written.
        let job_output_file = log_root.join("job-output.txt");
        fs::File::create(&job_output_file)?;

        let setup_playbook =
            JobDirPlaybook::new(ansible_root.join("setup_playbook"), 0, "setup")?;
        let freeze_playbook =
            JobDirPlaybook::new(ansible_root.join("freeze_playbook"), 0, "freeze")?;

        Ok(Self {
            work_root,
            src_root,
            job_unreachable_file: log_root.join("job-output.unreachable"),
            log_root,
            job_output_file,
            tmp_root,
            results_json: root.join("work/results.json"),
            known_hosts: ssh_root.join("known_hosts"),
            kube_config: kube_root.join("config"),
            logging_json: ansible_root.join("logging.json"),
            vars_blacklist: ansible_root.join("vars_blacklist.yaml"),
            frozen_hostvars_file: ansible_root.join("capstan_vars.yaml"),
            setup_inventory: ansible_root.join("setup-inventory.yaml"),
            freeze_inventory: ansible_root.join("inventory.yaml"),
            ansible_root,
            ansible_cache_root,
            fact_cache,
            trusted_root,
            untrusted_root,
            setup_playbook,
            freeze_playbook,
            pre_playbooks: Vec::new(),
            playbooks: Vec::new(),
            post_playbooks: Vec::new(),
            cleanup_playbooks: Vec::new(),
            playbook_count: 0,
            trusted_projects: HashMap::new(),
            untrusted_projects: HashMap::new(),
            root,
            keep,
        })
    }

    pub fn build_uuid(&self) -> &str {
        self.root
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or_default()
    }

    fn new_playbook(&mut self, phase: &'static str) -> io::Result<JobDirPlaybook> {
        let index = self.playbook_count;
        self.playbook_count += 1;
        JobDirPlaybook::new(self.ansible_root.join(format!("playbook_{index}")), index, phase)
    }

    pub fn add_pre_playbook(&mut self) -> io::Result<&mut JobDirPlaybook> {
        let playbook = self.new_playbook("pre")?;
        self.pre_playbooks.push(playbook);
        Ok(self.pre_playbooks.last_mut().unwrap())
    }

    pub fn add_playbook(&mut self) -> io::Result<&mut JobDirPlaybook> {
        let playbook = self.new_playbook("run")?;
        self.playbooks.push(playbook);
        Ok(self.playbooks.last_mut().unwrap())
    }

    pub fn add_post_playbook(&mut self) -> io::Result<&mut JobDirPlaybook> {
        let playbook = self.new_playbook("post")?;
        self.post_playbooks.push(playbook);
        Ok(self.post_playbooks.last_mut().unwrap())
    }

    pub fn add_cleanup_playbook(&mut self) -> io::Result<&mut JobDirPlaybook> {
        let playbook = self.new_playbook("cleanup")?;
        self.cleanup_playbooks.push(playbook);
        Ok(self.cleanup_playbooks.last_mut().unwrap())
    }

    /// Directory for a trusted checkout, shared between playbooks on the
    /// same project and branch.
    pub fn add_trusted_project(
        &mut self,
        canonical_name: &str,
        branch: &str,
    ) -> io::Result<PathBuf> {
        let key = (canonical_name.to_string(), branch.to_string());
        if let Some(path) = self.trusted_projects.get(&key) {
            return Ok(path.clone());
        }
        let index = self.trusted_projects.len();
        let path = self
            .trusted_root
            .join(format!("project_{index}"))
            .join(canonical_name);
        fs::create_dir_all(path.parent().unwrap())?;
        self.trusted_projects.insert(key, path.clone());
        Ok(path)
    }

    pub fn get_trusted_project(&self, canonical_name: &str, branch: &str) -> Option<&PathBuf> {
        self.trusted_projects
            .get(&(canonical_name.to_string(), branch.to_string()))
    }

    pub fn add_untrusted_project(
        &mut self,
        canonical_name: &str,
        branch: &str,
    ) -> io::Result<PathBuf> {
        let key = (canonical_name.to_string(), branch.to_string());
        if let Some(path) = self.untrusted_projects.get(&key) {
            return Ok(path.clone());
        }
        let index = self.untrusted_projects.len();
        let path = self
            .untrusted_root
            .join(format!("project_{index}"))
            .join(canonical_name);
        fs::create_dir_all(path.parent().unwrap())?;
        self.untrusted_projects.insert(key, path.clone());
        Ok(path)
    }

    pub fn get_untrusted_project(
        &self,
        canonical_name: &str,
        branch: &str,
    ) -> Option<&PathBuf> {
        self.untrusted_projects
            .get(&(canonical_name.to_string(), branch.to_string()))
    }

    pub fn cleanup(&self) {
        if self.keep {
            debug!(root = %self.root.display(), "keeping job dir");
            return;
        }
        if let Err(err) = fs::remove_dir_all(&self.root) {
            warn!(root = %self.root.display(), %err, "could not remove job dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_output_created_empty() {
        let base = tempfile::tempdir().unwrap();
        let jobdir = JobDir::new(base.path(), false, "abcdef012345").unwrap();
        let metadata = fs::metadata(&jobdir.job_output_file).unwrap();
        assert_eq!(metadata.len(), 0);
    }

    #[test]
    fn test_checkouts_shared_per_branch() {
        let base = tempfile::tempdir().unwrap();
        let mut jobdir = JobDir::new(base.path(), false, "abcdef012345").unwrap();
        let a = jobdir.add_untrusted_project("example.com/demo", "main").unwrap();
        let b = jobdir.add_untrusted_project("example.com/demo", "main").unwrap();
        let c = jobdir.add_untrusted_project("example.com/demo", "stable").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        // Trusted and untrusted trees are separate.
        let d = jobdir.add_trusted_project("example.com/demo", "main").unwrap();
        assert_ne!(a, d);
        assert!(d.starts_with(&jobdir.trusted_root));
    }

    #[test]
    fn test_cleanup_respects_keep() {
        let base = tempfile::tempdir().unwrap();
        let jobdir = JobDir::new(base.path(), true, "abcdef012345").unwrap();
        jobdir.cleanup();
        assert!(jobdir.root.exists());
        let jobdir = JobDir::new(base.path(), false, "0123456789ab").unwrap();
        jobdir.cleanup();
        assert!(!jobdir.root.exists());
    }
}
