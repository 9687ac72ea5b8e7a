//! Counting limiter for scarce resources.
//!
//! External extractor processes and large hashing jobs are memory and I/O heavy,
//! so they are bounded separately from the worker pool. A ticket is held for the
//! duration of one unit of work and released on drop.

use std::sync::{Condvar, Mutex};
use tracing::trace;

#[derive(Debug, Default)]
struct State {
    in_use: usize,
    peak: usize,
    total: u64,
}

/// Named counting semaphore.
#[derive(Debug)]
pub struct Resource {
    name: String,
    max: usize,
    state: Mutex<State>,
    available: Condvar,
}

/// Held while a unit of work uses the resource.
#[must_use = "the resource is released as soon as the ticket is dropped"]
pub struct Ticket<'a> {
    resource: &'a Resource,
}

impl Resource {
    /// `max` is clamped to at least one ticket.
    pub fn new(name: impl Into<String>, max: usize) -> Self {
        Self {
            name: name.into(),
            max: max.max(1),
            state: Mutex::new(State::default()),
            available: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Block until a ticket is free.
    pub fn acquire(&self) -> Ticket<'_> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        while state.in_use >= self.max {
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|p| p.into_inner());
        }
        state.in_use += 1;
        state.total += 1;
        state.peak = state.peak.max(state.in_use);
        trace!(resource = %self.name, in_use = state.in_use, "ticket acquired");
        Ticket { resource: self }
    }

    pub fn try_acquire(&self) -> Option<Ticket<'_>> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.in_use >= self.max {
            return None;
        }
        state.in_use += 1;
        state.total += 1;
        state.peak = state.peak.max(state.in_use);
        Some(Ticket { resource: self })
    }

    pub fn in_use(&self) -> usize {
        self.state.lock().map(|s| s.in_use).unwrap_or(0)
    }

    /// Highest number of tickets held at once since creation.
    pub fn peak(&self) -> usize {
        self.state.lock().map(|s| s.peak).unwrap_or(0)
    }

    /// Tickets handed out since creation.
    pub fn total(&self) -> u64 {
        self.state.lock().map(|s| s.total).unwrap_or(0)
    }

    fn release(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        self.resource.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_bound_is_respected() {
        let res = Arc::new(Resource::new("extract", 2));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let res = Arc::clone(&res);
                std::thread::spawn(move || {
                    let _t = res.acquire();
                    std::thread::sleep(Duration::from_millis(5));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(res.peak() <= 2);
        assert_eq!(res.in_use(), 0);
        assert_eq!(res.total(), 8);
    }

    #[test]
    fn test_try_acquire() {
        let res = Resource::new("hash", 1);
        let held = res.try_acquire();
        assert!(held.is_some());
        assert!(res.try_acquire().is_none());
        drop(held);
        assert!(res.try_acquire().is_some());
    }

    #[test]
    fn test_zero_is_clamped() {
        assert_eq!(Resource::new("x", 0).max(), 1);
    }
}
