//! Per-container lifecycle state.
//!
//! [`State`] couples the running/pid/exit-code fields with the lock that
//! guards them. Callers only ever see copies taken under that lock, so a
//! reader racing the reaper observes either the state before a transition or
//! the state after it, never a mix.

use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Copy of a container's state taken under its lock.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StateSnapshot {
    /// Whether the container process is alive.
    pub running: bool,
    /// PID of the container process, `0` when stopped.
    pub pid: u32,
    /// Exit code of the last run.
    pub exit_code: i32,
    /// When the current (or last) run started.
    pub started_at: Option<DateTime<Utc>>,
    /// Running, but not supervised by this daemon instance.
    pub ghost: bool,
}

impl StateSnapshot {
    /// Human-readable status, e.g. `Up 5 seconds`, `Ghost` or `Exit 137`.
    #[must_use]
    pub fn describe(&self, now: DateTime<Utc>) -> String {
        if self.running {
            if self.ghost {
                return "Ghost".to_string();
            }
            let elapsed = self.started_at.map_or(TimeDelta::zero(), |t| now - t);
            return format!("Up {}", human_duration(elapsed));
        }
        format!("Exit {}", self.exit_code)
    }
}

/// Lock-guarded state of one container.
///
/// Every transition also bumps a change counter so that [`State::wait_stopped`]
/// can register interest before its final check.
#[derive(Debug)]
pub struct State {
    inner: Mutex<StateSnapshot>,
    changes: watch::Sender<u64>,
}

impl Default for State {
    fn default() -> Self {
        Self::new()
    }
}

impl State {
    /// Creates a stopped state with all fields zeroed.
    #[must_use]
    pub fn new() -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            inner: Mutex::new(StateSnapshot::default()),
            changes,
        }
    }

    fn guard(&self) -> MutexGuard<'_, StateSnapshot> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_change(&self) {
        self.changes.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Marks the container running under `pid`, with a fresh start time.
    pub fn set_running(&self, pid: u32) {
        debug_assert!(pid > 0, "running state requires a pid");
        let mut state = self.guard();
        state.running = true;
        state.ghost = false;
        state.exit_code = 0;
        state.pid = pid;
        state.started_at = Some(Utc::now());
        self.publish_change();
    }

    /// Marks the container running under `pid` without supervising it.
    pub fn set_ghost(&self, pid: u32) {
        debug_assert!(pid > 0, "ghost state requires a pid");
        let mut state = self.guard();
        state.running = true;
        state.ghost = true;
        state.exit_code = 0;
        state.pid = pid;
        state.started_at = Some(Utc::now());
        self.publish_change();
    }

    /// Marks the container stopped with `exit_code`.
    pub fn set_stopped(&self, exit_code: i32) {
        let mut state = self.guard();
        state.running = false;
        state.pid = 0;
        state.exit_code = exit_code;
        self.publish_change();
    }

    /// Returns a consistent copy of every field.
    #[must_use]
    pub fn snapshot(&self) -> StateSnapshot {
        *self.guard()
    }

    /// Whether the process is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.guard().running
    }

    /// Human-readable status computed under the lock.
    #[must_use]
    pub fn description(&self) -> String {
        self.guard().describe(Utc::now())
    }

    /// Suspends until the container is stopped and returns its exit code.
    ///
    /// Returns immediately when the container is not running.
    pub async fn wait_stopped(&self) -> i32 {
        let mut changes = self.changes.subscribe();
        loop {
            {
                let state = self.guard();
                if !state.running {
                    return state.exit_code;
                }
            }
            if changes.changed().await.is_err() {
                return self.snapshot().exit_code;
            }
        }
    }
}

/// Formats an elapsed time the way container listings show uptime.
#[must_use]
pub fn human_duration(elapsed: TimeDelta) -> String {
    let seconds = elapsed.num_seconds();
    if seconds < 1 {
        return "Less than a second".to_string();
    }
    if seconds < 60 {
        return format!("{seconds} seconds");
    }
    let minutes = elapsed.num_minutes();
    if minutes == 1 {
        return "About a minute".to_string();
    }
    if minutes < 60 {
        return format!("{minutes} minutes");
    }
    let hours = elapsed.num_hours();
    if hours == 1 {
        return "About an hour".to_string();
    }
    if hours < 48 {
        return format!("{hours} hours");
    }
    if hours < 24 * 7 * 2 {
        return format!("{} days", hours / 24);
    }
    if hours < 24 * 30 * 3 {
        return format!("{} weeks", hours / 24 / 7);
    }
    if hours < 24 * 365 * 2 {
        return format!("{} months", hours / 24 / 30);
    }
    format!("{} years", hours / 24 / 365)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[test]
    fn new_state_is_stopped_and_zeroed() {
        let state = State::new();
        assert_eq!(state.snapshot(), StateSnapshot::default());
        assert_eq!(state.description(), "Exit 0");
    }

    #[test]
    fn running_then_stopped_clears_pid() {
        let state = State::new();
        state.set_running(42);
        let running = state.snapshot();
        assert!(running.running);
        assert_eq!(running.pid, 42);
        assert!(running.started_at.is_some());

        state.set_stopped(0);
        let stopped = state.snapshot();
        assert!(!stopped.running);
        assert_eq!(stopped.pid, 0);
        assert_eq!(stopped.exit_code, 0);
    }

    #[test]
    fn stopped_description_carries_exit_code() {
        let state = State::new();
        state.set_running(7);
        state.set_stopped(137);
        assert_eq!(state.description(), "Exit 137");
    }

    #[test]
    fn set_running_clears_previous_exit_code_and_ghost() {
        let state = State::new();
        state.set_ghost(9);
        assert_eq!(state.description(), "Ghost");
        state.set_stopped(1);
        state.set_running(10);
        let snap = state.snapshot();
        assert!(!snap.ghost);
        assert_eq!(snap.exit_code, 0);
        assert!(state.description().starts_with("Up "));
    }

    #[test]
    fn describe_uses_elapsed_time() {
        let now = Utc::now();
        let snap = StateSnapshot {
            running: true,
            pid: 3,
            started_at: Some(now - TimeDelta::seconds(5)),
            ..StateSnapshot::default()
        };
        assert_eq!(snap.describe(now), "Up 5 seconds");
    }

    #[test]
    fn human_duration_table() {
        assert_eq!(human_duration(TimeDelta::milliseconds(200)), "Less than a second");
        assert_eq!(human_duration(TimeDelta::seconds(59)), "59 seconds");
        assert_eq!(human_duration(TimeDelta::seconds(61)), "About a minute");
        assert_eq!(human_duration(TimeDelta::minutes(30)), "30 minutes");
        assert_eq!(human_duration(TimeDelta::minutes(65)), "About an hour");
        assert_eq!(human_duration(TimeDelta::hours(47)), "47 hours");
        assert_eq!(human_duration(TimeDelta::days(3)), "3 days");
        assert_eq!(human_duration(TimeDelta::days(21)), "3 weeks");
        assert_eq!(human_duration(TimeDelta::days(120)), "4 months");
        assert_eq!(human_duration(TimeDelta::days(365 * 3)), "3 years");
    }

    #[tokio::test]
    async fn wait_on_stopped_container_returns_immediately() {
        let state = State::new();
        state.set_running(5);
        state.set_stopped(3);
        assert_eq!(state.wait_stopped().await, 3);
    }

    #[tokio::test]
    async fn wait_wakes_on_transition_to_stopped() {
        let state = Arc::new(State::new());
        state.set_running(11);

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        state.set_stopped(2);
        let code = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait should complete")
            .expect("join");
        assert_eq!(code, 2);
    }

    #[tokio::test]
    async fn wait_ignores_restarts_until_stopped() {
        let state = Arc::new(State::new());
        state.set_running(11);

        let waiter = {
            let state = Arc::clone(&state);
            tokio::spawn(async move { state.wait_stopped().await })
        };
        state.set_running(12);
        state.set_stopped(0);
        let code = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("wait should complete")
            .expect("join");
        assert_eq!(code, 0);
    }

    #[test]
    fn concurrent_readers_never_see_torn_state() {
        let state = Arc::new(State::new());
        let writer = {
            let state = Arc::clone(&state);
            std::thread::spawn(move || {
                for pid in 1..2_000u32 {
                    state.set_running(pid);
                    state.set_stopped(i32::try_from(pid % 256).unwrap_or(0));
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || {
                    for _ in 0..2_000 {
                        let snap = state.snapshot();
                        assert_eq!(snap.running, snap.pid > 0);
                    }
                })
            })
            .collect();
        writer.join().expect("writer");
        for reader in readers {
            reader.join().expect("reader");
        }
    }
}
