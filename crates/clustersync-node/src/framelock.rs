use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::lock;
use crate::role::Side;

/// Frame counters wrap at this value.
pub const FRAME_COUNTER_MODULUS: i32 = 10_000;

/// How strictly a node waits for its peers each frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Every node presents the same frame number.
    #[default]
    Firm,
    /// Clients present as soon as any new master frame arrived; the master
    /// never waits.
    Loose,
}

/// Result of one frame-lock wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    /// The peers caught up.
    Synced,
    /// The sync timeout elapsed first.
    TimedOut,
    /// The manager stopped running while waiting.
    Stopped,
}

/// The per-connection piece of frame-counter state.
#[derive(Debug, Clone)]
pub struct FrameState {
    pub send_current: i32,
    pub recv_current: i32,
    pub recv_previous: i32,
    pub updated: bool,
    send_timestamp: Instant,
    loop_time: Duration,
}

impl FrameState {
    pub fn new() -> Self {
        Self {
            send_current: 0,
            recv_current: 0,
            recv_previous: -1,
            updated: false,
            send_timestamp: Instant::now(),
            loop_time: Duration::ZERO,
        }
    }

    /// Advance the send counter for the next outgoing frame.
    pub fn iterate(&mut self) -> i32 {
        self.send_current = (self.send_current + 1) % FRAME_COUNTER_MODULUS;
        self.updated = false;
        self.send_timestamp = Instant::now();
        self.send_current
    }

    /// Record an inbound frame number.
    pub fn stamp_received(&mut self, frame: i32) {
        self.recv_previous = self.recv_current;
        self.recv_current = frame;
        self.updated = true;
        self.loop_time = self.send_timestamp.elapsed();
    }

    /// Whether the peer has answered the current frame.
    pub fn is_updated(&self, side: Side, mode: LockMode) -> bool {
        match (side, mode) {
            (Side::Server, LockMode::Firm) => self.recv_current == self.send_current,
            (Side::Server, LockMode::Loose) => true,
            (Side::Client, LockMode::Firm) => self.recv_previous == self.send_current,
            (Side::Client, LockMode::Loose) => self.updated,
        }
    }

    /// Time from the last send to the peer's reply.
    pub fn loop_time(&self) -> Duration {
        self.loop_time
    }
}

impl Default for FrameState {
    fn default() -> Self {
        Self::new()
    }
}

/// Wakes frame-lock waiters whenever sync state changes.
///
/// A generation counter makes wake-ups impossible to miss: a waiter records
/// the generation, checks its condition, then sleeps only while the
/// generation is unchanged.
#[derive(Debug, Default)]
pub struct SyncSignal {
    generation: Mutex<u64>,
    cond: Condvar,
}

impl SyncSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bump the generation and wake every waiter.
    pub fn notify(&self) {
        let mut generation = lock(&self.generation);
        *generation = generation.wrapping_add(1);
        self.cond.notify_all();
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        *lock(&self.generation)
    }

    /// Sleep until the generation moves past `seen` or `timeout` elapses.
    pub fn wait_since(&self, seen: u64, timeout: Duration) -> u64 {
        let guard = lock(&self.generation);
        let (guard, _) = self
            .cond
            .wait_timeout_while(guard, timeout, |generation| *generation == seen)
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *guard
    }
}

const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// Block on `signal` until `ready` yields an outcome or `timeout` elapses.
///
/// `report` runs at most once per second while waiting. Never fails: a
/// timeout is logged and reported as [`SyncOutcome::TimedOut`].
pub(crate) fn wait_for_peers<F, R>(
    signal: &SyncSignal,
    stage: &'static str,
    timeout: Duration,
    mut ready: F,
    mut report: R,
) -> SyncOutcome
where
    F: FnMut() -> Option<SyncOutcome>,
    R: FnMut(Duration),
{
    let start = Instant::now();
    let mut last_report = start;

    loop {
        let seen = signal.generation();
        if let Some(outcome) = ready() {
            return outcome;
        }

        let elapsed = start.elapsed();
        if elapsed >= timeout {
            warn!(
                stage,
                waited_ms = elapsed.as_millis() as u64,
                "frame lock timed out, continuing without peers"
            );
            return SyncOutcome::TimedOut;
        }

        if last_report.elapsed() >= REPORT_INTERVAL {
            report(elapsed);
            last_report = Instant::now();
        }

        let slice = (timeout - elapsed).min(REPORT_INTERVAL);
        signal.wait_since(seen, slice);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread;

    use super::*;

    #[test]
    fn initial_state() {
        let state = FrameState::new();
        assert_eq!(state.send_current, 0);
        assert_eq!(state.recv_current, 0);
        assert_eq!(state.recv_previous, -1);
        assert!(!state.updated);
    }

    #[test]
    fn counter_wraps_after_modulus() {
        let mut state = FrameState::new();
        for _ in 0..FRAME_COUNTER_MODULUS - 1 {
            state.iterate();
        }
        assert_eq!(state.send_current, FRAME_COUNTER_MODULUS - 1);
        assert_eq!(state.iterate(), 0);
        assert_eq!(state.iterate(), 1);
    }

    #[test]
    fn counter_value_after_many_increments() {
        let mut state = FrameState::new();
        let increments = 123_457;
        for _ in 0..increments {
            state.iterate();
        }
        assert_eq!(state.send_current, increments % FRAME_COUNTER_MODULUS);
    }

    #[test]
    fn server_firm_waits_for_matching_reply() {
        let mut state = FrameState::new();
        state.iterate();
        assert!(!state.is_updated(Side::Server, LockMode::Firm));
        assert!(state.is_updated(Side::Server, LockMode::Loose));

        state.stamp_received(1);
        assert!(state.is_updated(Side::Server, LockMode::Firm));
    }

    #[test]
    fn client_firm_compares_previous_frame() {
        let mut state = FrameState::new();
        assert!(!state.is_updated(Side::Client, LockMode::Firm));

        // master frame 1 arrives before the client acknowledged anything
        state.stamp_received(1);
        assert_eq!(state.recv_previous, 0);
        assert!(state.is_updated(Side::Client, LockMode::Firm));

        state.iterate();
        assert!(!state.is_updated(Side::Client, LockMode::Firm));
        state.stamp_received(2);
        assert!(state.is_updated(Side::Client, LockMode::Firm));
    }

    #[test]
    fn client_loose_uses_updated_flag() {
        let mut state = FrameState::new();
        assert!(!state.is_updated(Side::Client, LockMode::Loose));
        state.stamp_received(77);
        assert!(state.is_updated(Side::Client, LockMode::Loose));
        state.iterate();
        assert!(!state.is_updated(Side::Client, LockMode::Loose));
    }

    #[test]
    fn wait_returns_when_signalled() {
        let signal = Arc::new(SyncSignal::new());
        let ready = Arc::new(AtomicBool::new(false));

        let notifier = {
            let signal = Arc::clone(&signal);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(50));
                ready.store(true, Ordering::SeqCst);
                signal.notify();
            })
        };

        let outcome = wait_for_peers(
            &signal,
            "test",
            Duration::from_secs(5),
            || ready.load(Ordering::SeqCst).then_some(SyncOutcome::Synced),
            |_| {},
        );
        assert_eq!(outcome, SyncOutcome::Synced);
        notifier.join().expect("notifier thread should finish");
    }

    #[test]
    fn wait_times_out_without_failing() {
        let signal = SyncSignal::new();
        let start = Instant::now();
        let outcome = wait_for_peers(&signal, "test", Duration::from_millis(100), || None, |_| {});
        assert_eq!(outcome, SyncOutcome::TimedOut);
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[test]
    fn wait_reports_once_per_second() {
        let signal = SyncSignal::new();
        let mut reports = 0;
        let outcome = wait_for_peers(
            &signal,
            "test",
            Duration::from_millis(2500),
            || None,
            |_| reports += 1,
        );
        assert_eq!(outcome, SyncOutcome::TimedOut);
        assert_eq!(reports, 2);
    }

    #[test]
    fn generation_advances_on_notify() {
        let signal = SyncSignal::new();
        let before = signal.generation();
        signal.notify();
        assert_eq!(signal.wait_since(before, Duration::from_millis(10)), before + 1);
    }
}
