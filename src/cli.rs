use std::path::PathBuf;

use clap::{ArgAction, Parser};

pub const NAME: &str = "netcage";

#[derive(Parser, Debug, Clone)]
#[clap(name = NAME, version)]
#[clap(about = "Process-aware firewall for containers")]
pub struct NetcageOpts {
    /// Allowlist policy file
    #[clap(long, default_value = "/etc/netcage/policy.yml")]
    pub policy: PathBuf,

    /// Netfilter queue number to bind
    #[clap(long, default_value_t = 2)]
    pub queue_num: u16,

    /// Maximum packets held by the userspace queue
    #[clap(long, default_value_t = 100)]
    pub queue_len: usize,

    /// Iptables chain receiving the NFQUEUE rule
    #[clap(long, default_value = "DOCKER-USER")]
    pub chain: String,

    /// Docker daemon unix socket
    #[clap(long, default_value = netcage_docker::DEFAULT_SOCKET)]
    pub docker_socket: String,

    /// Docker daemon pidfile, used for the runtime DNS exemption
    #[clap(long, default_value = netcage_docker::DEFAULT_PIDFILE)]
    pub docker_pidfile: PathBuf,

    /// Subject the runtime's embedded DNS proxy to the allowlist too
    #[clap(long)]
    pub no_trust_runtime_dns: bool,

    /// Pass many times for a more verbose output. Passing `-v` adds debug
    /// logs, `-vv` enables trace logging
    #[clap(short, long, action = ArgAction::Count)]
    pub verbose: u8,
}

impl NetcageOpts {
    pub fn override_log_level(&self) -> Option<log::LevelFilter> {
        match self.verbose {
            0 => None,
            1 => Some(log::LevelFilter::Debug),
            _ => Some(log::LevelFilter::Trace),
        }
    }
}
