use std::net::TcpListener;
use std::sync::atomic::{AtomicU16, Ordering};

const FIRST_PORT: u16 = 9222;
const LAST_PORT: u16 = 65500;

/// Hands out remote-debugging ports, skipping ones already bound on localhost.
#[derive(Debug)]
pub struct PortAllocator {
    next: AtomicU16,
}

impl PortAllocator {
    pub fn new(start: u16) -> Self {
        Self {
            next: AtomicU16::new(start),
        }
    }

    fn bump(&self) -> u16 {
        let port = self.next.fetch_add(1, Ordering::SeqCst);
        if port > LAST_PORT {
            self.next.store(FIRST_PORT + 1, Ordering::SeqCst);
            return FIRST_PORT;
        }
        port
    }

    /// Next port that can currently be bound; falls back to the counter value
    /// after a bounded number of probes.
    pub fn allocate(&self) -> u16 {
        let first = self.bump();
        if is_free(first) {
            return first;
        }
        for _ in 0..32 {
            let port = self.bump();
            if is_free(port) {
                return port;
            }
        }
        tracing::warn!("No free DevTools port found near {}, using it anyway", first);
        first
    }
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(FIRST_PORT)
    }
}

fn is_free(port: u16) -> bool {
    TcpListener::bind(("127.0.0.1", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allocate_increments() {
        let alloc = PortAllocator::new(40100);
        let p1 = alloc.allocate();
        let p2 = alloc.allocate();
        assert!(p2 > p1);
    }

    #[test]
    fn test_allocate_skips_bound_port() {
        let held = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let busy = held.local_addr().unwrap().port();
        let alloc = PortAllocator::new(busy);
        assert_ne!(alloc.allocate(), busy);
    }

    #[test]
    fn test_wraps_at_upper_bound() {
        let alloc = PortAllocator::new(LAST_PORT + 1);
        assert_eq!(alloc.bump(), FIRST_PORT);
        assert_eq!(alloc.bump(), FIRST_PORT + 1);
    }
}
