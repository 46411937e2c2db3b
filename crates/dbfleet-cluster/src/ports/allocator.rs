//! Disjoint HTTP/Raft port pair allocation with a local bind probe.

use crate::config::Range;
use crate::error::{ClusterError, Result};
use crate::placement::PortPair;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashSet;
use std::net::TcpListener;

const MAX_ALLOCATE_ATTEMPTS: u32 = 20;

/// Hands out and recycles disjoint `(http, raft)` port pairs. A single
/// mutex protects the allocated set; the bind probe itself is best-effort
/// racy (a subprocess may still fail to bind a freshly-probed port, in
/// which case the caller releases and retries).
pub struct PortAllocator {
    http_range: Range,
    raft_range: Range,
    allocated: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    pub fn new(http_range: Range, raft_range: Range) -> Self {
        Self {
            http_range,
            raft_range,
            allocated: Mutex::new(HashSet::new()),
        }
    }

    /// Try up to [`MAX_ALLOCATE_ATTEMPTS`] random `(http, raft)` pairs,
    /// accepting the first where neither port is allocated and both bind
    /// successfully.
    pub fn allocate_pair(&self) -> Result<PortPair> {
        let mut rng = rand::thread_rng();
        let mut guard = self.allocated.lock();

        for _ in 0..MAX_ALLOCATE_ATTEMPTS {
            let http_port = rng.gen_range(self.http_range.start..self.http_range.end);
            let raft_port = rng.gen_range(self.raft_range.start..self.raft_range.end);

            if guard.contains(&http_port) || guard.contains(&raft_port) {
                continue;
            }
            if !probe_bind(http_port) || !probe_bind(raft_port) {
                continue;
            }

            guard.insert(http_port);
            guard.insert(raft_port);
            return Ok(PortPair {
                http_port,
                raft_port,
            });
        }

        Err(ClusterError::NoPortsAvailable {
            attempts: MAX_ALLOCATE_ATTEMPTS,
        })
    }

    /// Allocate an exact pair, failing if either port is out of range,
    /// already allocated, or not bindable.
    pub fn allocate_specific_pair(&self, pair: PortPair) -> Result<()> {
        if !self.http_range.contains(pair.http_port) {
            return Err(ClusterError::PortOutOfRange(pair.http_port));
        }
        if !self.raft_range.contains(pair.raft_port) {
            return Err(ClusterError::PortOutOfRange(pair.raft_port));
        }

        let mut guard = self.allocated.lock();
        if guard.contains(&pair.http_port) {
            return Err(ClusterError::AlreadyAllocated(pair.http_port));
        }
        if guard.contains(&pair.raft_port) {
            return Err(ClusterError::AlreadyAllocated(pair.raft_port));
        }
        if !probe_bind(pair.http_port) {
            return Err(ClusterError::AlreadyAllocated(pair.http_port));
        }
        if !probe_bind(pair.raft_port) {
            return Err(ClusterError::AlreadyAllocated(pair.raft_port));
        }

        guard.insert(pair.http_port);
        guard.insert(pair.raft_port);
        Ok(())
    }

    /// Idempotent: releasing a pair that is not held is a no-op.
    pub fn release_pair(&self, pair: PortPair) {
        let mut guard = self.allocated.lock();
        guard.remove(&pair.http_port);
        guard.remove(&pair.raft_port);
    }

    pub fn is_allocated(&self, port: u16) -> bool {
        self.allocated.lock().contains(&port)
    }
}

fn probe_bind(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn narrow_allocator() -> PortAllocator {
        PortAllocator::new(
            Range {
                start: 18000,
                end: 18010,
            },
            Range {
                start: 19000,
                end: 19010,
            },
        )
    }

    #[test]
    fn allocate_pair_returns_distinct_ports_in_range() {
        let alloc = narrow_allocator();
        let pair = alloc.allocate_pair().unwrap();
        assert!(pair.http_port >= 18000 && pair.http_port < 18010);
        assert!(pair.raft_port >= 19000 && pair.raft_port < 19010);
        assert!(alloc.is_allocated(pair.http_port));
        assert!(alloc.is_allocated(pair.raft_port));
    }

    #[test]
    fn release_pair_is_idempotent() {
        let alloc = narrow_allocator();
        let pair = alloc.allocate_pair().unwrap();
        alloc.release_pair(pair);
        alloc.release_pair(pair);
        assert!(!alloc.is_allocated(pair.http_port));
    }

    #[test]
    fn allocate_specific_pair_rejects_out_of_range() {
        let alloc = narrow_allocator();
        let err = alloc
            .allocate_specific_pair(PortPair {
                http_port: 1,
                raft_port: 19000,
            })
            .unwrap_err();
        assert!(matches!(err, ClusterError::PortOutOfRange(1)));
    }

    #[test]
    fn allocate_specific_pair_rejects_already_allocated() {
        let alloc = narrow_allocator();
        let pair = alloc.allocate_pair().unwrap();
        let err = alloc.allocate_specific_pair(pair).unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyAllocated(_)));
    }

    #[test]
    fn exhausting_the_range_returns_no_ports_available() {
        let alloc = PortAllocator::new(
            Range {
                start: 18100,
                end: 18101,
            },
            Range {
                start: 19100,
                end: 19101,
            },
        );
        let _first = alloc.allocate_pair().unwrap();
        let err = alloc.allocate_pair().unwrap_err();
        assert!(matches!(err, ClusterError::NoPortsAvailable { .. }));
    }
}
