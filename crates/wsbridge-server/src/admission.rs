//! Admission control for inbound sockets.
//!
//! [`AdmissionControl`] owns an atomic live-socket counter. A slot is taken
//! with a compare-and-swap once the WebSocket upgrade has completed and is
//! released when the returned [`ConnectionGuard`] is dropped, so the count
//! can neither exceed the limit nor go negative.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Live-socket limit for one inbound bridge.
#[derive(Debug)]
pub struct AdmissionControl {
    max_connections: usize,
    active: Arc<AtomicUsize>,
}

impl AdmissionControl {
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Cheap pre-check used while the upgrade request is still pending.
    pub fn is_full(&self) -> bool {
        self.active.load(Ordering::Acquire) >= self.max_connections
    }

    /// Take a slot, or `None` when the limit is reached.
    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_connections).then_some(n + 1)
            })
            .ok()
            .map(|_| ConnectionGuard {
                counter: self.active.clone(),
            })
    }

    pub fn active(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    pub fn max_connections(&self) -> usize {
        self.max_connections
    }
}

/// RAII slot; decrements the live count on drop.
/// Owns an `Arc<AtomicUsize>` so it can live inside a socket handle.
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refuses_past_limit() {
        let admission = AdmissionControl::new(2);
        let g1 = admission.try_acquire();
        let g2 = admission.try_acquire();
        assert!(g1.is_some() && g2.is_some());
        assert!(admission.is_full());
        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.active(), 2);
    }

    #[test]
    fn guard_release_frees_slot() {
        let admission = AdmissionControl::new(1);
        {
            let _guard = admission.try_acquire().unwrap();
            assert!(admission.try_acquire().is_none());
        }
        assert_eq!(admission.active(), 0);
        assert!(admission.try_acquire().is_some());
    }

    #[test]
    fn concurrent_acquire_never_overshoots() {
        let admission = Arc::new(AdmissionControl::new(10));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let admission = admission.clone();
                std::thread::spawn(move || {
                    (0..100)
                        .filter_map(|_| admission.try_acquire())
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let guards: Vec<ConnectionGuard> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 10);
        assert_eq!(admission.active(), 10);
        drop(guards);
        assert_eq!(admission.active(), 0);
    }
}
