use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;

use serde::Deserialize;

fn default_host() -> IpAddr {
    "::".parse().unwrap()
}

fn default_finger_port() -> u16 {
    7900
}

fn default_console_port() -> u16 {
    19885
}

fn default_job_dir() -> PathBuf {
    PathBuf::from("/var/lib/capstan/builds")
}

fn default_merger_dir() -> PathBuf {
    PathBuf::from("/var/lib/capstan/merger")
}

fn default_command_socket() -> PathBuf {
    PathBuf::from("/var/lib/capstan/executor.socket")
}

fn default_min_avail_mem() -> f64 {
    5.0
}

fn default_min_avail_hdd() -> f64 {
    5.0
}

fn default_max_load_avg() -> f64 {
    0.0
}

fn default_disk_limit_per_job() -> i64 {
    250
}

fn default_setup_timeout() -> u64 {
    60
}

fn default_username() -> String {
    "capstan-worker".to_string()
}

fn default_wrapper() -> String {
    "bwrap".to_string()
}

fn default_ansible_command() -> String {
    "ansible-playbook".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Only lease requests in this zone.
    pub zone: Option<String>,
    /// Also lease requests without a zone.
    #[serde(default)]
    pub allow_unzoned: bool,

    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Log streamer port; 0 picks an ephemeral port.
    #[serde(default = "default_finger_port")]
    pub finger_port: u16,
    /// Port for the live console module on the remote nodes.
    #[serde(default = "default_console_port")]
    pub log_console_port: u16,
    /// Unprivileged user to drop to after binding the streamer port.
    pub finger_user: Option<String>,

    #[serde(default = "default_job_dir")]
    pub job_dir: PathBuf,
    #[serde(default = "default_merger_dir")]
    pub merger_dir: PathBuf,
    #[serde(default = "default_command_socket")]
    pub command_socket: PathBuf,

    #[serde(default = "default_min_avail_mem")]
    pub min_avail_mem: f64,
    #[serde(default = "default_min_avail_hdd")]
    pub min_avail_hdd: f64,
    /// 0 means "number of cpus".
    #[serde(default = "default_max_load_avg")]
    pub max_load_avg: f64,
    /// Per-build MB cap; negative disables the disk accountant.
    #[serde(default = "default_disk_limit_per_job")]
    pub disk_limit_per_job: i64,

    #[serde(default)]
    pub paused_on_start: bool,
    #[serde(default)]
    pub keep_jobdir: bool,

    #[serde(default = "default_setup_timeout")]
    pub ansible_setup_timeout: u64,
    #[serde(default = "default_username")]
    pub default_username: String,
    /// Extra vars file prepended to every run.
    pub variables: Option<PathBuf>,

    /// `connection name -> base URL` for repository fetches.
    #[serde(default)]
    pub sources: HashMap<String, String>,

    /// Sandbox wrapper: `bwrap` or `nullwrap` (no sandbox, tests only).
    #[serde(default = "default_wrapper")]
    pub wrapper: String,
    #[serde(default = "default_ansible_command")]
    pub ansible_command: String,

    #[serde(default)]
    pub trusted_ro_paths: Vec<PathBuf>,
    #[serde(default)]
    pub trusted_rw_paths: Vec<PathBuf>,
    #[serde(default)]
    pub untrusted_ro_paths: Vec<PathBuf>,
    #[serde(default)]
    pub untrusted_rw_paths: Vec<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            zone: None,
            allow_unzoned: true,
            host: default_host(),
            finger_port: default_finger_port(),
            log_console_port: default_console_port(),
            finger_user: None,
            job_dir: default_job_dir(),
            merger_dir: default_merger_dir(),
            command_socket: default_command_socket(),
            min_avail_mem: default_min_avail_mem(),
            min_avail_hdd: default_min_avail_hdd(),
            max_load_avg: default_max_load_avg(),
            disk_limit_per_job: default_disk_limit_per_job(),
            paused_on_start: false,
            keep_jobdir: false,
            ansible_setup_timeout: default_setup_timeout(),
            default_username: default_username(),
            variables: None,
            sources: HashMap::new(),
            wrapper: default_wrapper(),
            ansible_command: default_ansible_command(),
            trusted_ro_paths: Vec::new(),
            trusted_rw_paths: Vec::new(),
            untrusted_ro_paths: Vec::new(),
            untrusted_rw_paths: Vec::new(),
        }
    }
}

impl Config {
    /// The zones this executor leases from.
    pub fn zone_filter(&self) -> capstan_rs::queue::ZoneFilter {
        capstan_rs::queue::ZoneFilter {
            zones: self.zone.iter().cloned().collect(),
            unzoned: self.allow_unzoned || self.zone.is_none(),
        }
    }

    pub fn effective_max_load(&self) -> f64 {
        if self.max_load_avg > 0.0 {
            self.max_load_avg
        } else {
            num_cpus() as f64
        }
    }
}

pub(crate) fn num_cpus() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.finger_port, 7900);
        assert_eq!(config.log_console_port, 19885);
        assert_eq!(config.disk_limit_per_job, 250);
        assert_eq!(config.ansible_setup_timeout, 60);
        assert_eq!(config.wrapper, "bwrap");
        // Without a zone the executor serves the unzoned pool.
        let filter = config.zone_filter();
        assert!(filter.matches(None));
        assert!(!filter.matches(Some("eu-central")));
    }

    #[test]
    fn test_parse_toml() {
        let doc = r#"
            zone = "eu-central"
            allow_unzoned = false
            finger_port = 0
            job_dir = "/srv/capstan/builds"
            disk_limit_per_job = 500
            max_load_avg = 8.5
            paused_on_start = true

            [sources]
            gerrit = "https://gerrit.example.com"
        "#;
        let config: Config = toml::from_str(doc).unwrap();
        assert_eq!(config.zone.as_deref(), Some("eu-central"));
        assert_eq!(config.finger_port, 0);
        assert_eq!(config.disk_limit_per_job, 500);
        assert_eq!(config.max_load_avg, 8.5);
        assert!(config.paused_on_start);
        assert_eq!(config.sources["gerrit"], "https://gerrit.example.com");
        // Defaults fill everything unspecified.
        assert_eq!(config.command_socket, default_command_socket());

        let filter = config.zone_filter();
        assert!(filter.matches(Some("eu-central")));
        assert!(!filter.matches(Some("us-west")));
        assert!(!filter.matches(None));
    }
}
