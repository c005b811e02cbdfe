//! Bounded-staleness waits.
//!
//! A reader that asks for data as of time `t` before any commit at or after
//! `t` has reached the table parks on the table's [`Locker`]. The producer
//! learns about pending thresholds by polling ([`PingServer::pending`]) and
//! flushes through them; every recorded commit signals all thresholds at or
//! below its time.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::Timestamp;

#[derive(Debug, Default)]
struct LockerState {
    /// Pending thresholds and the number of readers parked on each.
    waiters: BTreeMap<Timestamp, usize>,
    satisfied_through: Timestamp,
    closed: bool,
}

/// A sorted set of pending commit-time thresholds with signal-all-below.
#[derive(Debug, Default)]
pub struct Locker {
    state: Mutex<LockerState>,
    cond: Condvar,
}

impl Locker {
    pub fn new(satisfied_through: Timestamp) -> Self {
        Self {
            state: Mutex::new(LockerState {
                satisfied_through,
                ..Default::default()
            }),
            cond: Condvar::new(),
        }
    }

    /// Blocks until a commit at or after `threshold` is signaled. A wait
    /// that runs out of time is withdrawn and reported as
    /// [`Error::Timeout`].
    pub fn await_time(&self, threshold: Timestamp, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock()?;
        if state.satisfied_through >= threshold {
            return Ok(());
        }
        *state.waiters.entry(threshold).or_insert(0) += 1;
        tracing::debug!(threshold, "Reader waiting for commit");

        loop {
            if state.satisfied_through >= threshold {
                return Ok(());
            }
            if state.closed {
                Self::withdraw(&mut state, threshold);
                return Err(Error::InvalidState("accuracy wait cancelled".to_string()));
            }
            let now = Instant::now();
            if now >= deadline {
                Self::withdraw(&mut state, threshold);
                return Err(Error::Timeout(threshold));
            }
            state = match self.cond.wait_timeout(state, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }

    /// Records a commit at `time`, waking and removing every threshold at or
    /// below it.
    pub fn signal(&self, time: Timestamp) {
        let Ok(mut state) = self.lock() else { return };
        if time > state.satisfied_through {
            state.satisfied_through = time;
        }
        let still_pending = state.waiters.split_off(&(time + 1));
        let woken: usize = std::mem::replace(&mut state.waiters, still_pending)
            .values()
            .sum();
        if woken > 0 {
            tracing::debug!(time, woken, "Signaled waiting readers");
        }
        self.cond.notify_all();
    }

    /// The highest threshold any reader is waiting for.
    pub fn pending(&self) -> Option<Timestamp> {
        self.lock()
            .ok()
            .and_then(|s| s.waiters.keys().next_back().copied())
    }

    pub fn waiting(&self) -> usize {
        self.lock().map(|s| s.waiters.values().sum()).unwrap_or(0)
    }

    pub fn satisfied_through(&self) -> Timestamp {
        self.lock().map(|s| s.satisfied_through).unwrap_or(0)
    }

    /// Fails every current and future wait.
    pub fn close(&self) {
        if let Ok(mut state) = self.lock() {
            state.closed = true;
        }
        self.cond.notify_all();
    }

    fn withdraw(state: &mut LockerState, threshold: Timestamp) {
        if let Some(count) = state.waiters.get_mut(&threshold) {
            *count -= 1;
            if *count == 0 {
                state.waiters.remove(&threshold);
            }
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, LockerState>> {
        self.state
            .lock()
            .map_err(|_| Error::InvalidState("locker mutex poisoned".to_string()))
    }
}

/// Per-table accuracy endpoint. The protocol only applies once a producer
/// has connected its ping channel; instant-flush producers never do.
#[derive(Debug, Default)]
pub struct PingServer {
    active: AtomicBool,
    locker: Locker,
}

impl PingServer {
    pub fn new(last_commit_time: Timestamp) -> Self {
        Self {
            active: AtomicBool::new(false),
            locker: Locker::new(last_commit_time),
        }
    }

    pub fn connect(&self) {
        if !self.active.swap(true, Ordering::SeqCst) {
            tracing::info!("Accuracy protocol activated");
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn locker(&self) -> &Locker {
        &self.locker
    }

    /// The commit time the producer should flush through, if any reader is
    /// waiting.
    pub fn pending(&self) -> Option<Timestamp> {
        self.locker.pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn wait_for_waiters(locker: &Locker, n: usize) {
        let start = Instant::now();
        while locker.waiting() < n {
            assert!(start.elapsed() < Duration::from_secs(5), "waiters never parked");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_satisfied_wait_returns_immediately() -> Result<()> {
        let locker = Locker::new(200);
        locker.await_time(150, Duration::ZERO)?;
        locker.await_time(200, Duration::ZERO)?;
        assert_eq!(locker.pending(), None);
        Ok(())
    }

    #[test]
    fn test_signal_wakes_at_or_below() {
        let locker = Arc::new(Locker::new(0));
        let handles: Vec<_> = [100, 250, 400]
            .into_iter()
            .map(|t| {
                let locker = locker.clone();
                thread::spawn(move || locker.await_time(t, Duration::from_secs(5)))
            })
            .collect();
        wait_for_waiters(&locker, 3);
        assert_eq!(locker.pending(), Some(400));

        locker.signal(300);
        wait_for_waiters_below(&locker, 1);
        assert_eq!(locker.pending(), Some(400));

        locker.signal(400);
        for handle in handles {
            assert!(handle.join().unwrap().is_ok());
        }
        assert_eq!(locker.pending(), None);
    }

    fn wait_for_waiters_below(locker: &Locker, n: usize) {
        let start = Instant::now();
        while locker.waiting() > n {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_timeout_withdraws_threshold() {
        let locker = Locker::new(0);
        let err = locker.await_time(500, Duration::from_millis(20)).unwrap_err();
        assert!(matches!(err, Error::Timeout(500)));
        assert_eq!(locker.pending(), None);
        assert_eq!(locker.waiting(), 0);
    }

    #[test]
    fn test_close_cancels_waiters() {
        let locker = Arc::new(Locker::new(0));
        let waiter = {
            let locker = locker.clone();
            thread::spawn(move || locker.await_time(10, Duration::from_secs(5)))
        };
        wait_for_waiters(&locker, 1);
        locker.close();
        assert!(matches!(
            waiter.join().unwrap(),
            Err(Error::InvalidState(_))
        ));
        assert_eq!(locker.waiting(), 0);
    }

    #[test]
    fn test_ping_server_activation() {
        let ping = PingServer::new(0);
        assert!(!ping.is_active());
        ping.connect();
        ping.connect();
        assert!(ping.is_active());
        assert_eq!(ping.pending(), None);
    }
}
