//! Process-wide port registry scoped by session.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// A claimed port: (port, project, session-id, claimed-at-ms).
#[derive(Debug, Clone)]
pub struct PortClaim {
    pub port: u16,
    pub project: String,
    pub session_id: String,
    pub claimed_at_ms: u64,
}

struct Inner {
    range_start: u16,
    range_end: u16,
    claims: Mutex<HashMap<u16, PortClaim>>,
}

/// Process-wide singleton port allocator with an explicit reset entry point
/// for tests.
#[derive(Clone)]
pub struct PortAllocator {
    inner: Arc<Inner>,
}

/// Sentinel returned by [`PortAllocator::allocate`] when the range is exhausted.
pub const NONE: Option<u16> = None;

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(9000, 9999)
    }
}

impl PortAllocator {
    pub fn new(range_start: u16, range_end: u16) -> Self {
        Self {
            inner: Arc::new(Inner {
                range_start,
                range_end,
                claims: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Resets all claims. Intended for test isolation only.
    pub fn reset(&self) {
        self.inner.claims.lock().clear();
    }

    /// Claims `port` for `session_id` if unclaimed or already owned by the
    /// same session. Returns whether the claim (now) belongs to `session_id`.
    pub fn claim(&self, port: u16, project: &str, session_id: &str) -> bool {
        let mut claims = self.inner.claims.lock();
        match claims.get(&port) {
            Some(existing) if existing.session_id != session_id => false,
            _ => {
                claims.insert(
                    port,
                    PortClaim {
                        port,
                        project: project.to_string(),
                        session_id: session_id.to_string(),
                        claimed_at_ms: now_ms(),
                    },
                );
                true
            }
        }
    }

    /// Releases `port` iff it is owned by `session_id`.
    pub fn release(&self, port: u16, session_id: &str) {
        let mut claims = self.inner.claims.lock();
        if claims.get(&port).map(|c| c.session_id.as_str()) == Some(session_id) {
            claims.remove(&port);
        }
    }

    /// Releases every claim owned by `session_id`.
    pub fn release_session(&self, session_id: &str) {
        let mut claims = self.inner.claims.lock();
        claims.retain(|_, c| c.session_id != session_id);
    }

    /// Searches linearly starting at `max(preferred, range_start)`, wrapping
    /// modulo the range size, walking the entire range exactly once. The
    /// first candidate that is neither claimed in-memory nor reported busy
    /// by the OS is claimed and returned atomically with respect to other
    /// allocator calls.
    pub fn allocate(&self, preferred: u16, project: &str, session_id: &str) -> Option<u16> {
        let start = self.inner.range_start;
        let end = self.inner.range_end;
        let span = (end - start) as u32 + 1;
        let offset = preferred.max(start) as u32 - start as u32;

        let mut claims = self.inner.claims.lock();
        for i in 0..span {
            let candidate = start as u32 + ((offset + i) % span);
            let candidate = candidate as u16;

            if claims.contains_key(&candidate) {
                continue;
            }
            if is_port_in_use(candidate) {
                continue;
            }

            claims.insert(
                candidate,
                PortClaim {
                    port: candidate,
                    project: project.to_string(),
                    session_id: session_id.to_string(),
                    claimed_at_ms: now_ms(),
                },
            );
            return Some(candidate);
        }
        None
    }

    pub fn claims_for_session(&self, session_id: &str) -> Vec<PortClaim> {
        self.inner
            .claims
            .lock()
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect()
    }
}

/// Best-effort OS probe; bind failures other than "in use" are treated as
/// free so a transient probe error never blocks allocation of a port that
/// may in fact be available.
fn is_port_in_use(port: u16) -> bool {
    match TcpListener::bind(("127.0.0.1", port)) {
        Ok(_) => false,
        Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_then_allocate_reuses_freed_port_in_range_order() {
        let alloc = PortAllocator::new(9000, 9002);
        assert!(alloc.claim(9001, "p", "A"));
        let got = alloc.allocate(9001, "p", "B");
        assert_eq!(got, Some(9002));
        alloc.release(9001, "A");
        let got2 = alloc.allocate(9000, "p", "B");
        assert_eq!(got2, Some(9000));
    }

    #[test]
    fn allocate_returns_none_when_exhausted() {
        let alloc = PortAllocator::new(9000, 9000);
        assert_eq!(alloc.allocate(9000, "p", "A"), Some(9000));
        assert_eq!(alloc.allocate(9000, "p", "B"), None);
    }

    #[test]
    fn claim_same_session_is_idempotent() {
        let alloc = PortAllocator::new(9000, 9005);
        assert!(alloc.claim(9000, "p", "A"));
        assert!(alloc.claim(9000, "p", "A"));
        assert!(!alloc.claim(9000, "p", "B"));
    }

    #[test]
    fn release_session_clears_only_its_claims() {
        let alloc = PortAllocator::new(9000, 9005);
        alloc.claim(9000, "p", "A");
        alloc.claim(9001, "p", "B");
        alloc.release_session("A");
        assert!(alloc.claim(9000, "p", "B"));
        assert!(!alloc.claim(9001, "p", "A"));
    }
}
