//! Known containers and the thread-safe registry holding them.

use std::fmt;
use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use nix::unistd::Pid;

/// Information about a container needed to judge its communications.
#[derive(Debug, Clone)]
pub struct Container {
    /// Full container ID as reported by the runtime; may be empty on
    /// policy-side selectors.
    pub id: String,
    pub ip_addresses: Vec<IpAddr>,
    /// Runtime-reported name; Docker may prepend a slash.
    pub name: String,
    /// PID of the container's main running process.
    pub pid: Pid,
}

impl Container {
    /// Selector without runtime state, as found in policy documents.
    pub fn selector(id: impl Into<String>, name: impl Into<String>) -> Self {
        Container {
            id: id.into(),
            ip_addresses: Vec::new(),
            name: name.into(),
            pid: Pid::from_raw(0),
        }
    }

    /// Reports whether two containers refer to the same instance.
    ///
    /// When both IDs are known, one being a prefix of the other is enough:
    /// Docker truncates IDs in several contexts. Otherwise names are
    /// compared after stripping the leading slash the daemon adds.
    pub fn matches(&self, other: &Container) -> bool {
        if !self.id.is_empty() && !other.id.is_empty() {
            return self.id.starts_with(&other.id) || other.id.starts_with(&self.id);
        }
        let name = self.name.strip_prefix('/').unwrap_or(&self.name);
        let other_name = other.name.strip_prefix('/').unwrap_or(&other.name);
        !name.is_empty() && name == other_name
    }

    /// Stable identity string used in cache keys.
    pub fn identity(&self) -> &str {
        if !self.id.is_empty() {
            &self.id
        } else {
            self.name.strip_prefix('/').unwrap_or(&self.name)
        }
    }
}

impl fmt::Display for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id:{} name:{} pid:{} addresses:{:?}}}",
            self.id, self.name, self.pid, self.ip_addresses
        )
    }
}

/// Mutable list of the containers currently under enforcement.
///
/// Mutations are serialized by the write lock; packet judgments only take
/// short read locks to copy the current snapshot.
#[derive(Default)]
pub struct ContainerRegistry {
    inner: RwLock<Vec<Arc<Container>>>,
}

impl ContainerRegistry {
    /// Returns a stable view of the registered containers.
    pub fn snapshot(&self) -> Vec<Arc<Container>> {
        self.inner.read().expect("registry lock poisoned").clone()
    }

    pub fn add(&self, container: Container) {
        let mut list = self.inner.write().expect("registry lock poisoned");
        list.push(Arc::new(container));
    }

    /// Removes the container whose full ID starts with `id` and returns it.
    /// An empty ID identifies nothing.
    pub fn remove(&self, id: &str) -> Option<Arc<Container>> {
        if id.is_empty() {
            return None;
        }
        let mut list = self.inner.write().expect("registry lock poisoned");
        let position = list.iter().position(|c| c.id.starts_with(id))?;
        Some(list.remove(position))
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(name: &str, id: &str) -> Container {
        Container::selector(id, name)
    }

    #[test]
    fn id_prefix_matches() {
        let full = named(
            "/hoge",
            "25f561f3d0812dd6c1d97bb72d99a24437fedbe985c776896ccb328253ff7d90",
        );
        let short = named("", "25f56");
        assert!(full.matches(&short));
        assert!(short.matches(&full));
        assert!(full.matches(&full));
    }

    #[test]
    fn id_wins_over_name_when_both_present() {
        let hoge = named(
            "/hoge",
            "25f561f3d0812dd6c1d97bb72d99a24437fedbe985c776896ccb328253ff7d90",
        );
        let fuga = named(
            "/fuga",
            "f977b4e21a57cb2ecb5d0954eac55ec018f0f5939e8cae4494c3cd996ee945fe",
        );
        let fuga_with_hoge_id = named("fuga", "25f56");
        assert!(!hoge.matches(&fuga));
        assert!(hoge.matches(&fuga_with_hoge_id));
        assert!(!fuga.matches(&fuga_with_hoge_id));
    }

    #[test]
    fn name_matches_with_stripped_slash() {
        let full = named(
            "/hoge",
            "25f561f3d0812dd6c1d97bb72d99a24437fedbe985c776896ccb328253ff7d90",
        );
        assert!(full.matches(&named("hoge", "")));
        assert!(!named("/hoge", "").matches(&named("/fuga", "")));
        assert!(!named("", "").matches(&named("", "")));
    }

    #[test]
    fn registry_add_remove() {
        let registry = ContainerRegistry::default();
        let mut c = named("/web", "25f561f3d081");
        c.ip_addresses.push("172.17.0.2".parse().unwrap());
        registry.add(c);
        assert_eq!(registry.len(), 1);
        assert!(registry.remove("25f561f3d081").is_some());
        assert!(registry.remove("25f561f3d081").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn empty_id_removes_nothing() {
        let registry = ContainerRegistry::default();
        registry.add(named("/web", "25f561f3d081"));
        assert!(registry.remove("").is_none());
        assert_eq!(registry.len(), 1);
    }
}
