//! Local tunnel port pool
//!
//! Process-wide pool of locally bindable ports for SSH forwards. A port is
//! handed out only if it is untracked *and* an OS-level bind probe succeeds,
//! so two live tunnels can never share a port. The pool has its own mutex,
//! separate from any registry lock.

use std::collections::HashSet;
use std::net::TcpListener;

use parking_lot::Mutex;
use tracing::debug;

use fleet_core::{Error, Result};

/// Thread-safe allocator over a fixed local port range
pub struct PortAllocator {
    start: u16,
    end: u16,
    used: Mutex<HashSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator over `[start, end]` inclusive
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            used: Mutex::new(HashSet::new()),
        }
    }

    /// Check out the first free port in the range.
    ///
    /// Free means: not held by this allocator, and bindable on 127.0.0.1
    /// right now. Fails with `ResourceExhausted` when the range is
    /// saturated.
    pub fn acquire(&self) -> Result<u16> {
        let mut used = self.used.lock();

        for port in self.start..=self.end {
            if used.contains(&port) {
                continue;
            }
            if !probe_free(port) {
                continue;
            }

            used.insert(port);
            debug!(port = port, "Acquired tunnel port");
            return Ok(port);
        }

        Err(Error::ResourceExhausted {
            message: format!("no free tunnel ports in {}-{}", self.start, self.end),
        })
    }

    /// Return a port to the pool; idempotent
    pub fn release(&self, port: u16) {
        if self.used.lock().remove(&port) {
            debug!(port = port, "Released tunnel port");
        }
    }

    /// Number of ports currently checked out
    pub fn in_use(&self) -> usize {
        self.used.lock().len()
    }
}

/// OS-level probe: can we bind a listener on this port right now?
fn probe_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquired_ports_are_unique() {
        let allocator = PortAllocator::new(51200, 51210);

        let mut seen = HashSet::new();
        for _ in 0..5 {
            let port = allocator.acquire().unwrap();
            assert!(seen.insert(port), "port {} handed out twice", port);
        }
        assert_eq!(allocator.in_use(), 5);
    }

    #[test]
    fn test_exhaustion() {
        let allocator = PortAllocator::new(51220, 51221);
        allocator.acquire().unwrap();
        allocator.acquire().unwrap();

        assert!(matches!(
            allocator.acquire(),
            Err(Error::ResourceExhausted { .. })
        ));
    }

    #[test]
    fn test_release_is_idempotent_and_reusable() {
        let allocator = PortAllocator::new(51230, 51230);
        let port = allocator.acquire().unwrap();

        allocator.release(port);
        allocator.release(port);
        assert_eq!(allocator.in_use(), 0);

        assert_eq!(allocator.acquire().unwrap(), port);
    }

    #[test]
    fn test_probe_skips_occupied_port() {
        let allocator = PortAllocator::new(51240, 51241);

        // Hold the first port at the OS level, outside the allocator
        let _listener = TcpListener::bind(("127.0.0.1", 51240)).unwrap();

        assert_eq!(allocator.acquire().unwrap(), 51241);
    }
}
