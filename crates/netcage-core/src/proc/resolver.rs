//! Finds the OS process owning the container side of a communication.
//!
//! TCP and UDP go through the protocol socket tables exposed under the
//! container root's `net` directory: the matching row yields the socket
//! inode, and a walk over the supervisor's descendants finds the process
//! holding a descriptor for it. ICMP has no reliable reverse table, so all
//! candidate owners are collected and disambiguated by the echo identifier.

use std::collections::HashSet;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::net::IpAddr;

use log::{debug, warn};
use thiserror::Error;

use crate::cache::TtlCache;
use crate::container::Container;
use crate::packet::{IpPacket, Proto};
use crate::proc::Process;
use crate::proc::procfs::{NetTable, Procfs, ProcfsError};
use crate::socket::Socket;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no socket table entry matches {0}")]
    InodeNotFound(Socket),

    #[error("no process under the container supervisor owns socket inode {0}")]
    ProcessNotFound(u64),

    #[error("no process in the container holds {0} sockets")]
    NoCandidateProcess(Proto),

    #[error("ambiguous owner for {proto} traffic: {candidates:?}")]
    ProcessAmbiguous {
        proto: Proto,
        candidates: Vec<Process>,
    },

    #[error("cannot resolve the owner of {0} traffic")]
    UnsupportedProtocol(Proto),

    #[error(transparent)]
    Procfs(#[from] ProcfsError),
}

#[derive(Clone, PartialEq, Eq, Hash)]
struct InodeKey {
    container: String,
    socket: u64,
    inode: u64,
}

pub struct ProcessResolver {
    procfs: Procfs,
    /// Memoizes inode -> process lookups to spare redundant tree walks
    /// while a connection keeps producing packets.
    inode_cache: TtlCache<InodeKey, Process>,
}

impl Default for ProcessResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessResolver {
    pub fn new() -> Self {
        Self::with_procfs(Procfs::default())
    }

    pub fn with_procfs(procfs: Procfs) -> Self {
        ProcessResolver {
            procfs,
            inode_cache: TtlCache::default(),
        }
    }

    /// Drops all memoized inode lookups.
    pub fn flush_cache(&self) {
        self.inode_cache.flush();
    }

    pub fn resolve(
        &self,
        socket: &Socket,
        container: &Container,
        packet: &IpPacket,
    ) -> Result<Process, ResolveError> {
        match socket.protocol {
            Proto::Tcp | Proto::Udp => self.resolve_by_port(socket, container),
            Proto::Icmp4 | Proto::Icmp6 => self.resolve_icmp(socket, container, packet),
            proto => Err(ResolveError::UnsupportedProtocol(proto)),
        }
    }

    fn resolve_by_port(
        &self,
        socket: &Socket,
        container: &Container,
    ) -> Result<Process, ResolveError> {
        let table = match (socket.protocol, socket.local_ip) {
            (Proto::Tcp, IpAddr::V4(_)) => NetTable::Tcp,
            (Proto::Tcp, IpAddr::V6(_)) => NetTable::Tcp6,
            (Proto::Udp, IpAddr::V4(_)) => NetTable::Udp,
            (Proto::Udp, IpAddr::V6(_)) => NetTable::Udp6,
            (proto, _) => return Err(ResolveError::UnsupportedProtocol(proto)),
        };

        // An exact remote endpoint beats the wildcard row of a listening or
        // unconnected socket, deterministically.
        let mut exact = None;
        let mut wildcard = None;
        for entry in self.procfs.socket_table(container.pid, table)? {
            if entry.inode == 0 || entry.local_port != socket.local_port {
                continue;
            }
            if entry.remote_addr == socket.remote_ip && entry.remote_port == socket.remote_port {
                exact = Some(entry.inode);
                break;
            }
            if entry.has_wildcard_remote() && wildcard.is_none() {
                wildcard = Some(entry.inode);
            }
        }
        let inode = exact
            .or(wildcard)
            .ok_or_else(|| ResolveError::InodeNotFound(socket.clone()))?;

        let key = InodeKey {
            container: container.identity().to_owned(),
            socket: socket_key(socket),
            inode,
        };
        if let Some(process) = self.inode_cache.get(&key) {
            return Ok(process);
        }

        let process = self
            .find_inode_owner(container, inode)?
            .ok_or(ResolveError::ProcessNotFound(inode))?;
        self.inode_cache.insert(key, process.clone());
        Ok(process)
    }

    fn resolve_icmp(
        &self,
        socket: &Socket,
        container: &Container,
        packet: &IpPacket,
    ) -> Result<Process, ResolveError> {
        let tables = match socket.local_ip {
            IpAddr::V4(_) => [NetTable::Icmp, NetTable::Raw],
            IpAddr::V6(_) => [NetTable::Icmp6, NetTable::Raw6],
        };

        let mut inodes = HashSet::new();
        for table in tables {
            match self.procfs.socket_table(container.pid, table) {
                Ok(entries) => inodes.extend(
                    entries
                        .into_iter()
                        .filter(|e| e.inode != 0)
                        .map(|e| e.inode),
                ),
                Err(err) => debug!("socket table {table:?} unavailable: {err}"),
            }
        }

        let mut candidates: Vec<Process> = Vec::new();
        for inode in inodes {
            match self.find_inode_owner(container, inode) {
                Ok(Some(process)) => {
                    if !candidates.iter().any(|c| c.matches(&process)) {
                        candidates.push(process);
                    }
                }
                Ok(None) => {}
                Err(err) => debug!("owner lookup for inode {inode} failed: {err}"),
            }
        }

        if candidates.is_empty() {
            return Err(ResolveError::NoCandidateProcess(socket.protocol));
        }
        if candidates.len() == 1 {
            return Ok(candidates.remove(0));
        }

        // Several processes hold ICMP sockets. The echo identifier usually
        // carries the sender's namespaced PID; cross-reference it.
        if let Some(identifier) = packet.echo_identifier() {
            for candidate in &candidates {
                match self.procfs.ns_pids(candidate.pid) {
                    Ok(ns_pids) if ns_pids.contains(&i32::from(identifier)) => {
                        return Ok(candidate.clone());
                    }
                    Ok(_) => {}
                    Err(err) => debug!("NSpid of {} unreadable: {err}", candidate.pid),
                }
            }
        }

        warn!(
            "cannot disambiguate {} candidates for {socket}: {candidates:?}",
            candidates.len()
        );
        Err(ResolveError::ProcessAmbiguous {
            proto: socket.protocol,
            candidates,
        })
    }

    /// Iterative depth-first walk over the descendants of the container
    /// supervisor (the parent of the container's root process), looking for
    /// the holder of a socket descriptor with the given inode. An explicit
    /// PID stack bounds the traversal depth.
    fn find_inode_owner(
        &self,
        container: &Container,
        inode: u64,
    ) -> Result<Option<Process>, ProcfsError> {
        let supervisor = self.procfs.parent_pid(container.pid)?;
        let mut stack = vec![supervisor];
        while let Some(pid) = stack.pop() {
            match self.procfs.children(pid) {
                Ok(children) => stack.extend(children),
                // The process may have exited mid-walk; its subtree was
                // reparented and will not hold the socket anymore.
                Err(err) => debug!("children of {pid} unreadable: {err}"),
            }
            let inodes = match self.procfs.socket_inodes(pid) {
                Ok(inodes) => inodes,
                Err(err) => {
                    debug!("descriptors of {pid} unreadable: {err}");
                    continue;
                }
            };
            if inodes.contains(&inode) {
                return Ok(Some(Process {
                    pid,
                    executable: self.procfs.comm(pid)?,
                    path: self.procfs.exe_path(pid)?,
                    inode: Some(inode),
                }));
            }
        }
        Ok(None)
    }
}

fn socket_key(socket: &Socket) -> u64 {
    let mut hasher = DefaultHasher::new();
    socket.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::tests::{ipv4_packet, tcp_header};
    use crate::proc::testutil::FakeProc;
    use nix::unistd::Pid;

    fn container(pid: i32, ip: &str) -> Container {
        let mut container = Container::selector("25f561f3d081", "/netcat");
        container.ip_addresses.push(ip.parse().unwrap());
        container.pid = Pid::from_raw(pid);
        container
    }

    fn tcp_socket(local_port: u16, remote_ip: &str, remote_port: u16) -> Socket {
        Socket {
            protocol: Proto::Tcp,
            local_ip: "172.17.0.2".parse().unwrap(),
            remote_ip: remote_ip.parse().unwrap(),
            local_port,
            remote_port,
        }
    }

    fn icmp_socket() -> Socket {
        Socket {
            protocol: Proto::Icmp4,
            local_ip: "172.17.0.2".parse().unwrap(),
            remote_ip: "8.8.8.8".parse().unwrap(),
            local_port: 0,
            remote_port: 0,
        }
    }

    fn any_packet() -> IpPacket {
        let data = ipv4_packet(6, [172, 17, 0, 2], [158, 217, 2, 147], &tcp_header(43210, 80));
        IpPacket::parse(&data).unwrap()
    }

    fn echo_packet(identifier: u16) -> IpPacket {
        let mut icmp = vec![8, 0, 0, 0];
        icmp.extend_from_slice(&identifier.to_be_bytes());
        icmp.extend_from_slice(&[0, 1]);
        let data = ipv4_packet(1, [172, 17, 0, 2], [8, 8, 8, 8], &icmp);
        IpPacket::parse(&data).unwrap()
    }

    /// Supervisor 50 -> container root 100 (sh) -> given children, among
    /// which 101 is always nc.
    fn base_tree(proc: &FakeProc, root_children: &[i32]) {
        proc.add_process(50, 1, "containerd-shim", "/usr/bin/containerd-shim", &[100]);
        proc.add_process(100, 50, "sh", "/bin/sh", root_children);
        proc.add_process(101, 100, "nc", "/usr/bin/nc", &[]);
    }

    #[test]
    fn resolves_tcp_owner_through_the_tree() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101]);
        proc.add_socket_fd(101, 3, 3011779);
        proc.write_net_table(
            100,
            NetTable::Tcp,
            &[("172.17.0.2", 43210, "158.217.2.147", 80, 3011779)],
        );

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let process = resolver
            .resolve(
                &tcp_socket(43210, "158.217.2.147", 80),
                &container(100, "172.17.0.2"),
                &any_packet(),
            )
            .unwrap();
        assert_eq!(process.pid, Pid::from_raw(101));
        assert_eq!(process.executable, "nc");
        assert_eq!(process.path, "/usr/bin/nc");
        assert_eq!(process.inode, Some(3011779));
    }

    #[test]
    fn exact_remote_beats_wildcard() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101, 102]);
        proc.add_process(102, 100, "srv", "/bin/srv", &[]);
        // The wildcard listener row comes first; the connected row must win.
        proc.add_socket_fd(102, 3, 111);
        proc.add_socket_fd(101, 3, 222);
        proc.write_net_table(
            100,
            NetTable::Tcp,
            &[
                ("0.0.0.0", 8080, "0.0.0.0", 0, 111),
                ("172.17.0.2", 8080, "158.217.2.147", 80, 222),
            ],
        );

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let process = resolver
            .resolve(
                &tcp_socket(8080, "158.217.2.147", 80),
                &container(100, "172.17.0.2"),
                &any_packet(),
            )
            .unwrap();
        assert_eq!(process.executable, "nc");

        // Without an exact row the wildcard one is used.
        let process = resolver
            .resolve(
                &tcp_socket(8080, "1.2.3.4", 9999),
                &container(100, "172.17.0.2"),
                &any_packet(),
            )
            .unwrap();
        assert_eq!(process.executable, "srv");
    }

    #[test]
    fn unused_slots_are_skipped() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101]);
        proc.write_net_table(100, NetTable::Tcp, &[("172.17.0.2", 43210, "0.0.0.0", 0, 0)]);

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let err = resolver
            .resolve(
                &tcp_socket(43210, "158.217.2.147", 80),
                &container(100, "172.17.0.2"),
                &any_packet(),
            )
            .unwrap_err();
        assert!(matches!(err, ResolveError::InodeNotFound(_)));
    }

    #[test]
    fn missing_owner_is_process_not_found() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101]);
        proc.write_net_table(
            100,
            NetTable::Tcp,
            &[("172.17.0.2", 43210, "158.217.2.147", 80, 3011779)],
        );

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let err = resolver
            .resolve(
                &tcp_socket(43210, "158.217.2.147", 80),
                &container(100, "172.17.0.2"),
                &any_packet(),
            )
            .unwrap_err();
        assert!(matches!(err, ResolveError::ProcessNotFound(3011779)));
    }

    #[test]
    fn cached_lookup_survives_process_exit() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101]);
        proc.add_socket_fd(101, 3, 3011779);
        proc.write_net_table(
            100,
            NetTable::Tcp,
            &[("172.17.0.2", 43210, "158.217.2.147", 80, 3011779)],
        );

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let socket = tcp_socket(43210, "158.217.2.147", 80);
        let target = container(100, "172.17.0.2");
        resolver.resolve(&socket, &target, &any_packet()).unwrap();

        // Make the walk impossible; the memoized entry still answers.
        std::fs::remove_file(
            proc.procfs_root().join("101").join("fd").join("3"),
        )
        .unwrap();
        let process = resolver.resolve(&socket, &target, &any_packet()).unwrap();
        assert_eq!(process.executable, "nc");

        resolver.flush_cache();
        assert!(resolver.resolve(&socket, &target, &any_packet()).is_err());
    }

    #[test]
    fn single_icmp_candidate_wins() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101, 103]);
        proc.add_process(103, 100, "ping", "/bin/ping", &[]);
        proc.add_socket_fd(103, 3, 555);
        proc.write_net_table(100, NetTable::Icmp, &[("172.17.0.2", 7, "0.0.0.0", 0, 555)]);

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let process = resolver
            .resolve(&icmp_socket(), &container(100, "172.17.0.2"), &echo_packet(7))
            .unwrap();
        assert_eq!(process.executable, "ping");
    }

    #[test]
    fn icmp_disambiguated_by_namespaced_pid() {
        let proc = FakeProc::new();
        base_tree(&proc, &[101, 103, 104]);
        proc.add_process(103, 100, "ping", "/bin/ping", &[]);
        proc.add_process(104, 100, "mtr", "/usr/bin/mtr", &[]);
        proc.add_socket_fd(103, 3, 555);
        proc.add_socket_fd(104, 3, 556);
        proc.set_ns_pids(103, &[103, 7]);
        proc.set_ns_pids(104, &[104, 9]);
        proc.write_net_table(
            100,
            NetTable::Icmp,
            &[
                ("172.17.0.2", 7, "0.0.0.0", 0, 555),
                ("172.17.0.2", 9, "0.0.0.0", 0, 556),
            ],
        );

        let resolver = ProcessResolver::with_procfs(proc.procfs());
        let process = resolver
            .resolve(&icmp_socket(), &container(100, "172.17.0.2"), &echo_packet(7))
            .unwrap();
        assert_eq!(process.executable, "ping");

        let err = resolver
            .resolve(&icmp_socket(), &container(100, "172.17.0.2"), &echo_packet(42))
            .unwrap_err();
        assert!(matches!(err, ResolveError::ProcessAmbiguous { .. }));
    }
}
