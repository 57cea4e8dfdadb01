//! Policy evaluation with verdict memoization and hot reload.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use log::debug;
use nix::unistd::Pid;

use crate::cache::TtlCache;
use crate::container::Container;
use crate::packet::Proto;
use crate::policy::Policy;
use crate::proc::Process;
use crate::socket::Socket;

/// Evaluates the loaded allowlist for resolved communications.
///
/// Verdicts are cached per (container, process, socket) tuple; the cache is
/// flushed whenever the policy set is replaced, so a reload takes effect for
/// already-seen flows too.
pub struct PolicyEngine {
    policies: RwLock<Vec<Policy>>,
    verdicts: TtlCache<u64, bool>,
    evaluations: AtomicU64,
    /// Resolver hits on this PID over UDP port 53 bypass the allowlist; the
    /// container runtime proxies DNS through its own daemon.
    trusted_dns_pid: Option<Pid>,
}

impl PolicyEngine {
    pub fn new(policies: Vec<Policy>, trusted_dns_pid: Option<Pid>) -> Self {
        PolicyEngine {
            policies: RwLock::new(policies),
            verdicts: TtlCache::default(),
            evaluations: AtomicU64::new(0),
            trusted_dns_pid,
        }
    }

    /// Decides whether the communication is allowed.
    pub fn decide(&self, container: &Container, process: &Process, socket: &Socket) -> bool {
        let key = cache_key(container, process, socket);
        if let Some(allowed) = self.verdicts.get(&key) {
            return allowed;
        }

        if let Some(dns_pid) = self.trusted_dns_pid
            && socket.protocol == Proto::Udp
            && socket.remote_port == 53
            && process.pid == dns_pid
        {
            debug!("trusting runtime DNS for {container}");
            self.verdicts.insert(key, true);
            return true;
        }

        self.evaluations.fetch_add(1, Ordering::Relaxed);
        let allowed = self
            .policies
            .read()
            .expect("policy lock poisoned")
            .iter()
            .any(|policy| policy.permits(container, process, socket));
        self.verdicts.insert(key, allowed);
        allowed
    }

    /// Swaps in a new policy set and drops every cached verdict.
    pub fn replace(&self, policies: Vec<Policy>) {
        *self.policies.write().expect("policy lock poisoned") = policies;
        self.verdicts.flush();
    }

    pub fn flush_cache(&self) {
        self.verdicts.flush();
    }

    pub fn policy_count(&self) -> usize {
        self.policies.read().expect("policy lock poisoned").len()
    }

    /// Number of full allowlist traversals, for observing cache behavior.
    pub fn evaluations(&self) -> u64 {
        self.evaluations.load(Ordering::Relaxed)
    }
}

fn cache_key(container: &Container, process: &Process, socket: &Socket) -> u64 {
    let mut hasher = DefaultHasher::new();
    container.identity().hash(&mut hasher);
    process.executable.hash(&mut hasher);
    process.path.hash(&mut hasher);
    socket.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Communication, ProcessRule, SocketRule};

    fn netcat_container() -> Container {
        let mut container = Container::selector("25f561f3d081", "/netcat");
        container.ip_addresses.push("172.17.0.2".parse().unwrap());
        container.pid = Pid::from_raw(100);
        container
    }

    fn nc_process() -> Process {
        Process {
            pid: Pid::from_raw(101),
            executable: "nc".into(),
            path: "/usr/bin/nc".into(),
            inode: None,
        }
    }

    fn web_socket() -> Socket {
        Socket {
            protocol: Proto::Tcp,
            local_ip: "172.17.0.2".parse().unwrap(),
            remote_ip: "158.217.2.147".parse().unwrap(),
            local_port: 43210,
            remote_port: 80,
        }
    }

    fn allow_nc_policy() -> Policy {
        Policy {
            container: Container::selector("", "netcat"),
            communications: vec![Communication {
                processes: vec![ProcessRule {
                    executable: "nc".into(),
                    path: String::new(),
                }],
                sockets: vec![SocketRule {
                    protocol: Proto::Tcp,
                    remote_net: Some("158.217.2.147".parse().unwrap()),
                    local_port: 0,
                    remote_port: 80,
                }],
            }],
        }
    }

    #[test]
    fn verdicts_are_cached() {
        let engine = PolicyEngine::new(vec![allow_nc_policy()], None);
        let container = netcat_container();
        assert!(engine.decide(&container, &nc_process(), &web_socket()));
        assert!(engine.decide(&container, &nc_process(), &web_socket()));
        assert_eq!(engine.evaluations(), 1);
    }

    #[test]
    fn reload_invalidates_cached_verdicts() {
        let engine = PolicyEngine::new(vec![allow_nc_policy()], None);
        let container = netcat_container();
        assert!(engine.decide(&container, &nc_process(), &web_socket()));
        engine.replace(Vec::new());
        assert!(!engine.decide(&container, &nc_process(), &web_socket()));
        assert_eq!(engine.evaluations(), 2);
    }

    #[test]
    fn unmatched_communication_is_denied() {
        let engine = PolicyEngine::new(vec![allow_nc_policy()], None);
        let mut socket = web_socket();
        socket.remote_port = 443;
        assert!(!engine.decide(&netcat_container(), &nc_process(), &socket));
    }

    #[test]
    fn runtime_dns_bypasses_the_allowlist() {
        let engine = PolicyEngine::new(Vec::new(), Some(Pid::from_raw(4242)));
        let dns_socket = Socket {
            protocol: Proto::Udp,
            local_ip: "172.17.0.2".parse().unwrap(),
            remote_ip: "127.0.0.11".parse().unwrap(),
            local_port: 43210,
            remote_port: 53,
        };
        let mut dockerd = nc_process();
        dockerd.pid = Pid::from_raw(4242);
        dockerd.executable = "dockerd".into();
        assert!(engine.decide(&netcat_container(), &dockerd, &dns_socket));

        // Same socket, untrusted PID: the (empty) allowlist applies.
        let mut other = dockerd.clone();
        other.pid = Pid::from_raw(4243);
        other.executable = "resolver".into();
        assert!(!engine.decide(&netcat_container(), &other, &dns_socket));
        assert_eq!(engine.evaluations(), 1);
    }
}
