use std::net::IpAddr;

use serde::Deserialize;

fn default_host() -> IpAddr {
    "::".parse().unwrap()
}

fn default_port() -> u16 {
    79
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub listen_address: IpAddr,
    /// 0 picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Unprivileged user to drop to after binding the finger port.
    pub user: Option<String>,
    /// Gateways with a zone serve their zone's builds directly and
    /// forward other zones' builds to the gateway registered there.
    pub zone: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self { listen_address: default_host(), port: default_port(), user: None, zone: None }
    }
}
