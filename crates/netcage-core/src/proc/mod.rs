//! Process identity and the packet-to-process resolution engine.

use std::fmt;

use nix::unistd::Pid;

pub mod procfs;
pub mod resolver;

#[cfg(test)]
pub(crate) mod testutil;

pub use procfs::{Procfs, ProcfsError};
pub use resolver::{ProcessResolver, ResolveError};

/// An OS process owning one end of a communication.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pub pid: Pid,
    /// Short command name (`comm`).
    pub executable: String,
    /// Resolved path of the binary image.
    pub path: String,
    /// Kernel inode of the owning socket, when resolved from one.
    pub inode: Option<u64>,
}

impl Process {
    /// Reports whether two processes are the same program for policy
    /// purposes.
    ///
    /// When both paths are known the path comparison is decisive; a path
    /// mismatch is final even if the executables agree. Otherwise a
    /// non-empty executable name on both sides decides.
    pub fn matches(&self, other: &Process) -> bool {
        if !self.path.is_empty() && !other.path.is_empty() {
            return self.path == other.path;
        }
        !self.executable.is_empty() && self.executable == other.executable
    }
}

impl fmt::Display for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{pid:{} executable:{} path:{}}}",
            self.pid, self.executable, self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn process(executable: &str, path: &str) -> Process {
        Process {
            pid: Pid::from_raw(9925),
            executable: executable.into(),
            path: path.into(),
            inode: None,
        }
    }

    #[test]
    fn executable_only_selector_matches() {
        assert!(process("nc", "").matches(&process("nc", "/usr/bin/nc")));
    }

    #[test]
    fn path_only_selector_matches() {
        assert!(process("", "/usr/bin/nc").matches(&process("nc", "/usr/bin/nc")));
    }

    #[test]
    fn path_mismatch_is_final_despite_equal_executables() {
        assert!(!process("nc", "/usr/local/bin/nc").matches(&process("nc", "/usr/bin/nc")));
    }

    #[test]
    fn equal_paths_win_despite_different_executables() {
        assert!(process("telnet", "/usr/bin/nc").matches(&process("nc", "/usr/bin/nc")));
    }

    #[test]
    fn empty_identities_never_match() {
        assert!(!process("", "").matches(&process("nc", "/usr/bin/nc")));
    }
}
