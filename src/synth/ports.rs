//! Host port allocation across projects.

use std::collections::{BTreeMap, BTreeSet};
use std::net::TcpListener;
use std::path::{Path, PathBuf};

use super::StackPlan;

/// Who holds a host port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortOwner {
    /// Owning project directory
    pub project: PathBuf,

    /// Owning instance name
    pub instance: String,
}

/// Checks whether something outside devstack listens on a host port.
pub trait PortProbe: Send + Sync {
    /// Whether `port` can be bound on the host.
    fn is_free(&self, port: u16) -> bool;
}

/// Probes by binding a TCP listener on all interfaces.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn is_free(&self, port: u16) -> bool {
        TcpListener::bind(("0.0.0.0", port)).is_ok()
    }
}

/// Host port → owner map for one invocation.
///
/// Rebuilt from recorded plans each time; never persisted on its own.
#[derive(Default)]
pub struct PortAllocation {
    owners: BTreeMap<u16, PortOwner>,
    probe: Option<Box<dyn PortProbe>>,
}

impl std::fmt::Debug for PortAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortAllocation")
            .field("owners", &self.owners)
            .field("probe", &self.probe.is_some())
            .finish()
    }
}

impl PortAllocation {
    /// Empty allocation without a host probe.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use `probe` to skip ports that are busy on the host.
    #[must_use]
    pub fn with_probe(mut self, probe: impl PortProbe + 'static) -> Self {
        self.probe = Some(Box::new(probe));
        self
    }

    /// Build from recorded plans.
    pub fn from_plans<'a>(plans: impl IntoIterator<Item = &'a StackPlan>) -> Self {
        let mut allocation = Self::new();
        for plan in plans {
            allocation.register_plan(plan);
        }
        allocation
    }

    /// Register every host port of a plan.
    pub fn register_plan(&mut self, plan: &StackPlan) {
        for instance in &plan.instances {
            self.claim(instance.host_port, &plan.project.path, &instance.name);
        }
    }

    /// Record `port` as held by an instance.
    pub fn claim(&mut self, port: u16, project: &Path, instance: &str) {
        self.owners.insert(port, PortOwner { project: project.to_path_buf(), instance: instance.to_string() });
    }

    /// Release every port held by a project. Returns the released ports.
    pub fn release_project(&mut self, project: &Path) -> BTreeSet<u16> {
        let released: BTreeSet<u16> =
            self.owners.iter().filter(|(_, o)| o.project == project).map(|(p, _)| *p).collect();
        for port in &released {
            self.owners.remove(port);
        }
        released
    }

    /// Current owner of a port.
    pub fn owner(&self, port: u16) -> Option<&PortOwner> {
        self.owners.get(&port)
    }

    /// All claimed ports.
    pub fn ports(&self) -> impl Iterator<Item = (u16, &PortOwner)> {
        self.owners.iter().map(|(p, o)| (*p, o))
    }

    /// Whether `port` can go to `instance` of `project`.
    ///
    /// Ports claimed by someone else are never available. Unclaimed ports
    /// are checked with the host probe unless `trusted` is set, which is
    /// used for ports the project's own containers may be holding.
    pub fn is_available(&self, port: u16, project: &Path, instance: &str, trusted: bool) -> bool {
        if let Some(owner) = self.owners.get(&port) {
            return owner.project == project && owner.instance == instance;
        }
        trusted || self.probe.as_ref().map_or(true, |p| p.is_free(port))
    }

    /// First available port at or above `from`.
    pub fn next_available(
        &self,
        from: u16,
        project: &Path,
        instance: &str,
        trusted: &BTreeSet<u16>,
    ) -> Option<u16> {
        (from..=u16::MAX).find(|p| self.is_available(*p, project, instance, trusted.contains(p)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct BusyPorts(Vec<u16>);

    impl PortProbe for BusyPorts {
        fn is_free(&self, port: u16) -> bool {
            !self.0.contains(&port)
        }
    }

    #[test]
    fn test_claimed_port_unavailable_to_others() {
        let mut alloc = PortAllocation::new();
        alloc.claim(8080, Path::new("/work/a"), "a-app");

        assert!(alloc.is_available(8080, Path::new("/work/a"), "a-app", false));
        assert!(!alloc.is_available(8080, Path::new("/work/b"), "b-app", false));
        assert_eq!(
            alloc.next_available(8080, Path::new("/work/b"), "b-app", &BTreeSet::new()),
            Some(8081)
        );
    }

    #[test]
    fn test_probe_skips_busy_unless_trusted() {
        let alloc = PortAllocation::new().with_probe(BusyPorts(vec![8080, 8081]));
        let project = Path::new("/work/a");

        assert_eq!(alloc.next_available(8080, project, "a-app", &BTreeSet::new()), Some(8082));
        let trusted = BTreeSet::from([8080]);
        assert_eq!(alloc.next_available(8080, project, "a-app", &trusted), Some(8080));
    }

    #[test]
    fn test_exhaustion_at_top_of_range() {
        let mut alloc = PortAllocation::new();
        alloc.claim(u16::MAX, Path::new("/work/a"), "a-app");
        assert_eq!(alloc.next_available(u16::MAX, Path::new("/work/b"), "b-app", &BTreeSet::new()), None);
    }

    #[test]
    fn test_release_project() {
        let mut alloc = PortAllocation::new();
        alloc.claim(8080, Path::new("/work/a"), "a-app");
        alloc.claim(3306, Path::new("/work/a"), "a-db");
        alloc.claim(8081, Path::new("/work/b"), "b-app");

        let released = alloc.release_project(Path::new("/work/a"));
        assert_eq!(released, BTreeSet::from([3306, 8080]));
        assert!(alloc.owner(8080).is_none());
        assert_eq!(alloc.owner(8081).unwrap().instance, "b-app");
    }
}
