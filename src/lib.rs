//! Netcage is a process-aware firewall for containerized workloads. It binds
//! a netfilter queue, attributes every queued packet to the container and
//! the OS process that owns it, and enforces a per-container allowlist of
//! communications. Packets that cannot be fully attributed are dropped.

pub mod cli;
pub mod daemon;
pub mod iptables;
pub mod notify;
pub mod pipeline;
pub mod queue;

pub mod metadata {
    pub const VERSION: &str = env!("CARGO_PKG_VERSION");
}

/// Init logger. We log from info level and above, hide timestamp
/// and module path.
/// If RUST_LOG is set, we assume the user wants to debug something
/// and use env_logger default behaviour.
pub fn init_logger(override_log_level: Option<log::LevelFilter>) {
    if std::env::var_os("RUST_LOG").is_some() {
        env_logger::init();
    } else {
        let level_filter = override_log_level.unwrap_or(log::LevelFilter::Info);

        env_logger::builder().filter_level(level_filter).init();
    }
}
