//! Utility functions used to extract data from procfs.
//!
//! All readers hang off a [`Procfs`] handle rooted at the procfs mount
//! point, so the resolver can be exercised against a fabricated tree.

use std::fs::{self, File};
use std::io::{self, BufRead, BufReader};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

use nix::unistd::Pid;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("parent for process {0} not found")]
    ParentNotFound(Pid),

    #[error("malformed socket table line {line:?} in {path}")]
    MalformedTable { path: String, line: String },

    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// A protocol-specific socket table under `/proc/<pid>/net`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetTable {
    Tcp,
    Tcp6,
    Udp,
    Udp6,
    Icmp,
    Icmp6,
    Raw,
    Raw6,
}

impl NetTable {
    fn file_name(self) -> &'static str {
        match self {
            NetTable::Tcp => "tcp",
            NetTable::Tcp6 => "tcp6",
            NetTable::Udp => "udp",
            NetTable::Udp6 => "udp6",
            NetTable::Icmp => "icmp",
            NetTable::Icmp6 => "icmp6",
            NetTable::Raw => "raw",
            NetTable::Raw6 => "raw6",
        }
    }
}

/// One row of a socket table. Rows with inode 0 are unused slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub inode: u64,
}

impl NetEntry {
    /// The all-zero remote endpoint of listening/unconnected sockets.
    pub fn has_wildcard_remote(&self) -> bool {
        self.remote_addr.is_unspecified() && self.remote_port == 0
    }
}

/// Handle to a procfs mount point.
#[derive(Debug, Clone)]
pub struct Procfs {
    root: PathBuf,
}

impl Default for Procfs {
    fn default() -> Self {
        Procfs::at("/proc")
    }
}

impl Procfs {
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Procfs { root: root.into() }
    }

    fn pid_dir(&self, pid: Pid) -> PathBuf {
        self.root.join(pid.to_string())
    }

    /// Returns the command name for the given process.
    pub fn comm(&self, pid: Pid) -> Result<String, ProcfsError> {
        let path = self.pid_dir(pid).join("comm");
        Ok(read_to_string(&path)?.trim().to_owned())
    }

    /// Returns the resolved path of the executable image of a given process.
    pub fn exe_path(&self, pid: Pid) -> Result<String, ProcfsError> {
        let path = self.pid_dir(pid).join("exe");
        let target = fs::read_link(&path).map_err(|source| ProcfsError::ReadFile {
            source,
            path: path.display().to_string(),
        })?;
        Ok(target.to_string_lossy().into_owned())
    }

    /// Returns the parent of a given process, from its status file.
    pub fn parent_pid(&self, pid: Pid) -> Result<Pid, ProcfsError> {
        for line in self.status_lines(pid)? {
            if let Some(value) = line.strip_prefix("PPid:") {
                return Ok(Pid::from_raw(value.trim().parse()?));
            }
        }
        Err(ProcfsError::ParentNotFound(pid))
    }

    /// Returns the PIDs of a process in every namespace it belongs to,
    /// outermost first.
    pub fn ns_pids(&self, pid: Pid) -> Result<Vec<i32>, ProcfsError> {
        for line in self.status_lines(pid)? {
            if let Some(value) = line.strip_prefix("NSpid:") {
                return value
                    .split_whitespace()
                    .map(|v| v.parse().map_err(ProcfsError::from))
                    .collect();
            }
        }
        // Kernels without pid-namespace reporting only know the global PID.
        Ok(vec![pid.as_raw()])
    }

    /// Returns the direct children of a process, across all its threads.
    pub fn children(&self, pid: Pid) -> Result<Vec<Pid>, ProcfsError> {
        let task_dir = self.pid_dir(pid).join("task");
        let entries = fs::read_dir(&task_dir).map_err(|source| ProcfsError::ReadFile {
            source,
            path: task_dir.display().to_string(),
        })?;

        let mut children = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ProcfsError::ReadFile {
                source,
                path: task_dir.display().to_string(),
            })?;
            let path = entry.path().join("children");
            for value in read_to_string(&path)?.split_whitespace() {
                children.push(Pid::from_raw(value.parse()?));
            }
        }
        Ok(children)
    }

    /// Returns the socket inodes among the open file descriptors of a
    /// process.
    pub fn socket_inodes(&self, pid: Pid) -> Result<Vec<u64>, ProcfsError> {
        let fd_dir = self.pid_dir(pid).join("fd");
        let entries = fs::read_dir(&fd_dir).map_err(|source| ProcfsError::ReadFile {
            source,
            path: fd_dir.display().to_string(),
        })?;

        let mut inodes = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| ProcfsError::ReadFile {
                source,
                path: fd_dir.display().to_string(),
            })?;
            // Descriptors may be closed while we scan; skip the ones gone.
            let Ok(target) = fs::read_link(entry.path()) else {
                continue;
            };
            if let Some(inode) = target
                .to_str()
                .and_then(|t| t.strip_prefix("socket:["))
                .and_then(|t| t.strip_suffix(']'))
            {
                inodes.push(inode.parse()?);
            }
        }
        Ok(inodes)
    }

    /// Parses a protocol socket table as seen by the given process.
    pub fn socket_table(&self, pid: Pid, table: NetTable) -> Result<Vec<NetEntry>, ProcfsError> {
        let path = self.pid_dir(pid).join("net").join(table.file_name());
        let file = File::open(&path).map_err(|source| ProcfsError::ReadFile {
            source,
            path: path.display().to_string(),
        })?;

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines().skip(1) {
            let line = line.map_err(|source| ProcfsError::ReadFile {
                source,
                path: path.display().to_string(),
            })?;
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_table_line(&path, &line)?);
        }
        Ok(entries)
    }

    fn status_lines(&self, pid: Pid) -> Result<Vec<String>, ProcfsError> {
        let path = self.pid_dir(pid).join("status");
        Ok(read_to_string(&path)?.lines().map(str::to_owned).collect())
    }
}

fn read_to_string(path: &Path) -> Result<String, ProcfsError> {
    fs::read_to_string(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.display().to_string(),
    })
}

fn parse_table_line(path: &Path, line: &str) -> Result<NetEntry, ProcfsError> {
    let malformed = || ProcfsError::MalformedTable {
        path: path.display().to_string(),
        line: line.to_owned(),
    };

    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 10 {
        return Err(malformed());
    }
    let (local_addr, local_port) = parse_table_endpoint(fields[1]).ok_or_else(malformed)?;
    let (remote_addr, remote_port) = parse_table_endpoint(fields[2]).ok_or_else(malformed)?;
    let inode = fields[9].parse()?;

    Ok(NetEntry {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        inode,
    })
}

/// Decodes the `ADDRESS:PORT` hex pair of a socket table row. Addresses are
/// printed as native-endian 32-bit groups.
fn parse_table_endpoint(field: &str) -> Option<(IpAddr, u16)> {
    let (addr_hex, port_hex) = field.split_once(':')?;
    let port = u16::from_str_radix(port_hex, 16).ok()?;
    let addr = match addr_hex.len() {
        8 => {
            let group = u32::from_str_radix(addr_hex, 16).ok()?;
            IpAddr::V4(Ipv4Addr::from(group.to_ne_bytes()))
        }
        32 => {
            let mut octets = [0u8; 16];
            for (i, chunk) in octets.chunks_exact_mut(4).enumerate() {
                let group = u32::from_str_radix(&addr_hex[i * 8..(i + 1) * 8], 16).ok()?;
                chunk.copy_from_slice(&group.to_ne_bytes());
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };
    Some((addr, port))
}
