//! Fabricated procfs trees for resolver tests.

use std::fs;
use std::net::IpAddr;
use std::os::unix::fs::symlink;
use std::path::Path;

use tempfile::TempDir;

use super::procfs::{NetTable, Procfs};

/// A throwaway directory laid out like /proc, removed on drop.
pub(crate) struct FakeProc {
    dir: TempDir,
}

impl FakeProc {
    pub fn new() -> Self {
        FakeProc {
            dir: TempDir::new().unwrap(),
        }
    }

    pub fn procfs(&self) -> Procfs {
        Procfs::at(self.dir.path())
    }

    pub fn procfs_root(&self) -> &Path {
        self.dir.path()
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn add_process(&self, pid: i32, ppid: i32, comm: &str, exe: &str, children: &[i32]) {
        let dir = self.root().join(pid.to_string());
        fs::create_dir_all(dir.join("fd")).unwrap();
        fs::create_dir_all(dir.join("net")).unwrap();
        let task = dir.join("task").join(pid.to_string());
        fs::create_dir_all(&task).unwrap();

        fs::write(dir.join("comm"), format!("{comm}\n")).unwrap();
        fs::write(
            dir.join("status"),
            format!("Name:\t{comm}\nPPid:\t{ppid}\n"),
        )
        .unwrap();
        symlink(exe, dir.join("exe")).unwrap();

        let list = children
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(" ");
        fs::write(task.join("children"), list).unwrap();
    }

    pub fn set_ns_pids(&self, pid: i32, ns_pids: &[i32]) {
        let path = self.root().join(pid.to_string()).join("status");
        let mut status = fs::read_to_string(&path).unwrap();
        status.push_str("NSpid:");
        for ns_pid in ns_pids {
            status.push('\t');
            status.push_str(&ns_pid.to_string());
        }
        status.push('\n');
        fs::write(path, status).unwrap();
    }

    pub fn add_socket_fd(&self, pid: i32, fd: u32, inode: u64) {
        let path = self
            .root()
            .join(pid.to_string())
            .join("fd")
            .join(fd.to_string());
        symlink(format!("socket:[{inode}]"), path).unwrap();
    }

    /// Writes a socket table in the kernel's hex format. Entries are
    /// `(local_ip, local_port, remote_ip, remote_port, inode)`.
    pub fn write_net_table(
        &self,
        pid: i32,
        table: NetTable,
        entries: &[(&str, u16, &str, u16, u64)],
    ) {
        let file_name = match table {
            NetTable::Tcp => "tcp",
            NetTable::Tcp6 => "tcp6",
            NetTable::Udp => "udp",
            NetTable::Udp6 => "udp6",
            NetTable::Icmp => "icmp",
            NetTable::Icmp6 => "icmp6",
            NetTable::Raw => "raw",
            NetTable::Raw6 => "raw6",
        };
        let mut body = String::from(
            "  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode\n",
        );
        for (i, (local_ip, local_port, remote_ip, remote_port, inode)) in
            entries.iter().enumerate()
        {
            body.push_str(&format!(
                "{i:4}: {}:{local_port:04X} {}:{remote_port:04X} 0A 00000000:00000000 00:00000000 00000000     0        0 {inode} 1 0000000000000000 100 0 0 10 0\n",
                hex_addr(local_ip),
                hex_addr(remote_ip),
            ));
        }
        fs::write(
            self.root().join(pid.to_string()).join("net").join(file_name),
            body,
        )
        .unwrap();
    }
}

fn hex_addr(ip: &str) -> String {
    match ip.parse::<IpAddr>().unwrap() {
        IpAddr::V4(v4) => format!("{:08X}", u32::from_ne_bytes(v4.octets())),
        IpAddr::V6(v6) => {
            let octets = v6.octets();
            let mut out = String::new();
            for chunk in octets.chunks_exact(4) {
                let group = u32::from_ne_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
                out.push_str(&format!("{group:08X}"));
            }
            out
        }
    }
}
