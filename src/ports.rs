//! TCP port allocation per project.
//!
//! `PortAllocator` hands out the first free port at or above a preferred one and
//! remembers the reservation until the project releases it.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, TcpListener};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::{OrchestratorError, OrchestratorResult};

/// One allocated port and the role it was allocated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortAllocation {
    pub role: String,
    pub port: u16,
}

/// Returns whether `port` can currently be bound.
pub type PortProbe = fn(u16) -> bool;

/// Checks whether the OS would let us bind `port` on localhost right now.
pub fn port_is_free(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Reservations keyed by project, then role.
#[derive(Debug)]
pub struct PortAllocator {
    held: BTreeMap<String, BTreeMap<String, u16>>,
    span: u16,
    probe: PortProbe,
}

impl PortAllocator {
    /// Creates an allocator that searches `span` ports above the preferred one.
    pub fn new(span: u16) -> Self {
        Self::with_probe(span, port_is_free)
    }

    pub fn with_probe(span: u16, probe: PortProbe) -> Self {
        Self {
            held: BTreeMap::new(),
            span,
            probe,
        }
    }

    /// Reserves a port for `role` within `project_id`.
    ///
    /// An existing reservation is returned as-is when its port is still free; otherwise it is
    /// dropped and a new port is searched from `preferred` upwards, skipping ports reserved by
    /// any project.
    pub fn allocate(
        &mut self,
        project_id: &str,
        role: &str,
        preferred: u16,
    ) -> OrchestratorResult<u16> {
        if let Some(port) = self.held.get(project_id).and_then(|roles| roles.get(role)).copied() {
            if (self.probe)(port) {
                return Ok(port);
            }
            warn!(project_id, role, port, "reserved port was taken out of band, reallocating");
            if let Some(roles) = self.held.get_mut(project_id) {
                roles.remove(role);
            }
        }

        let end = preferred.saturating_add(self.span);
        for port in preferred..=end {
            if self.is_reserved(port) || !(self.probe)(port) {
                continue;
            }
            self.held
                .entry(project_id.to_string())
                .or_default()
                .insert(role.to_string(), port);
            debug!(project_id, role, port, "port allocated");
            return Ok(port);
        }
        Err(OrchestratorError::NoPortAvailable {
            project_id: project_id.to_string(),
            start: preferred,
            end,
        })
    }

    /// Frees every port held by `project_id`. Unknown projects are a no-op.
    pub fn release(&mut self, project_id: &str) -> Vec<u16> {
        self.held
            .remove(project_id)
            .map(|roles| roles.into_values().collect())
            .unwrap_or_default()
    }

    /// Whether `port` is neither reserved here nor bound by anyone else.
    pub fn is_available(&self, port: u16) -> bool {
        !self.is_reserved(port) && (self.probe)(port)
    }

    /// Whether `project_id` still holds `port`.
    pub fn holds(&self, project_id: &str, port: u16) -> bool {
        self.held
            .get(project_id)
            .map(|roles| roles.values().any(|p| *p == port))
            .unwrap_or(false)
    }

    pub fn allocations(&self, project_id: &str) -> Vec<PortAllocation> {
        self.held
            .get(project_id)
            .map(|roles| {
                roles
                    .iter()
                    .map(|(role, port)| PortAllocation {
                        role: role.clone(),
                        port: *port,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    fn is_reserved(&self, port: u16) -> bool {
        self.held
            .values()
            .any(|roles| roles.values().any(|p| *p == port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn always_free(_: u16) -> bool {
        true
    }

    fn even_only(port: u16) -> bool {
        port % 2 == 0
    }

    fn never_free(_: u16) -> bool {
        false
    }

    #[test]
    fn prefers_requested_port_then_searches_upwards() {
        let mut ports = PortAllocator::with_probe(10, even_only);
        assert_eq!(ports.allocate("a", "aggregator", 3000).unwrap(), 3000);
        assert_eq!(ports.allocate("b", "aggregator", 3000).unwrap(), 3002);
        assert_eq!(ports.allocate("c", "aggregator", 3001).unwrap(), 3004);
    }

    #[test]
    fn exhausted_range_fails() {
        let mut ports = PortAllocator::with_probe(5, never_free);
        let err = ports.allocate("a", "aggregator", 9000).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::NoPortAvailable { start: 9000, end: 9005, .. }
        ));
    }

    #[test]
    fn range_is_capped_at_max_port() {
        let mut ports = PortAllocator::with_probe(100, always_free);
        assert_eq!(ports.allocate("a", "x", 65535).unwrap(), 65535);
        assert!(ports.allocate("b", "x", 65535).is_err());
    }

    #[test]
    fn live_allocations_never_share_a_port() {
        let mut ports = PortAllocator::with_probe(50, always_free);
        for round in 0..5 {
            for project in 0..8 {
                let id = format!("p{}", project);
                ports.allocate(&id, "frontend", 3000).unwrap();
                ports.allocate(&id, "backend", 3000).unwrap();
            }
            ports.release(&format!("p{}", round));
            let mut seen = HashSet::new();
            for project in 0..8 {
                for alloc in ports.allocations(&format!("p{}", project)) {
                    assert!(seen.insert(alloc.port), "port {} held twice", alloc.port);
                }
            }
        }
    }

    #[test]
    fn repeated_allocation_keeps_reservation() {
        let mut ports = PortAllocator::with_probe(10, always_free);
        let first = ports.allocate("a", "frontend", 4000).unwrap();
        let second = ports.allocate("a", "frontend", 4000).unwrap();
        assert_eq!(first, second);
        assert_eq!(ports.allocations("a").len(), 1);
    }

    #[test]
    fn stolen_reservation_is_reallocated() {
        fn odd_only(port: u16) -> bool {
            port % 2 == 1
        }
        let mut ports = PortAllocator::with_probe(10, always_free);
        assert_eq!(ports.allocate("a", "frontend", 4000).unwrap(), 4000);
        ports.probe = odd_only;
        assert_eq!(ports.allocate("a", "frontend", 4000).unwrap(), 4001);
        assert!(!ports.holds("a", 4000));
    }

    #[test]
    fn release_is_idempotent() {
        let mut ports = PortAllocator::with_probe(10, always_free);
        ports.allocate("a", "frontend", 4000).unwrap();
        assert!(!ports.is_available(4000));
        assert_eq!(ports.release("a"), vec![4000]);
        assert!(ports.release("a").is_empty());
        assert!(ports.release("unknown").is_empty());
        assert!(ports.is_available(4000));
    }

    #[test]
    fn real_probe_detects_bound_port() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(!port_is_free(port));
        drop(listener);
    }
}
