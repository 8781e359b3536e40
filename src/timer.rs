//! Injectable timers. Production code gets real, randomized election
//! timeouts off a Tokio sleep, the way the original `run_election_timer`
//! and `run_heartbeat_sender` tasks did; tests get either a driver that
//! never fires on its own (scenarios inject `Input::Timer` directly), or a
//! `SimulatedTimerDriver` backed by a `VirtualClock` for scenarios that want
//! to drive an entire cluster's timers deterministically off one shared
//! logical clock.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::Rng;
use tokio::sync::oneshot;

use crate::message::{Input, TimerKind};

/// Anything that can receive an `Input` -- implemented by `NodeHandle` so a
/// `TimerDriver` doesn't need to know about the actor plumbing around it.
pub trait InputSink: std::fmt::Debug + Send + Sync {
    fn send(&self, input: Input);
}

pub trait TimerHandle: std::fmt::Debug + Send {
    fn cancel(&mut self);
}

pub trait TimerDriver: std::fmt::Debug + Send {
    fn schedule_receive_heartbeat(&self) -> Box<dyn TimerHandle>;
    fn schedule_send_heartbeat(&self) -> Box<dyn TimerHandle>;
}

#[derive(Debug)]
pub struct TokioTimerDriver {
    sink: std::sync::Arc<dyn InputSink>,
    election_timeout_min: Duration,
    election_timeout_max: Duration,
    heartbeat_interval: Duration,
}

impl TokioTimerDriver {
    pub fn new(
        sink: std::sync::Arc<dyn InputSink>,
        election_timeout_min: Duration,
        election_timeout_max: Duration,
        heartbeat_interval: Duration,
    ) -> Self {
        TokioTimerDriver { sink, election_timeout_min, election_timeout_max, heartbeat_interval }
    }

    fn spawn_timer(&self, dur: Duration, kind: TimerKind) -> Box<dyn TimerHandle> {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let sink = self.sink.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(dur) => {
                    sink.send(Input::Timer(kind));
                }
                _ = cancel_rx => {}
            }
        });
        Box::new(TokioTimerHandle { cancel_tx: Some(cancel_tx) })
    }
}

impl TimerDriver for TokioTimerDriver {
    fn schedule_receive_heartbeat(&self) -> Box<dyn TimerHandle> {
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::thread_rng().gen_range(min_ms..=max_ms);
        self.spawn_timer(Duration::from_millis(timeout_ms), TimerKind::ReceiveHeartbeatTimeout)
    }

    fn schedule_send_heartbeat(&self) -> Box<dyn TimerHandle> {
        self.spawn_timer(self.heartbeat_interval, TimerKind::SendHeartbeatTimeout)
    }
}

#[derive(Debug)]
struct TokioTimerHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl TimerHandle for TokioTimerHandle {
    fn cancel(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TokioTimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// A driver that never fires on its own. Tests hand `Input::Timer(..)` to
/// the node directly; this only exists so `Node` always has *some*
/// `TimerDriver` to call `schedule_*` against without spawning real tasks.
#[derive(Debug, Default)]
pub struct NullTimerDriver;

impl TimerDriver for NullTimerDriver {
    fn schedule_receive_heartbeat(&self) -> Box<dyn TimerHandle> {
        Box::new(NullTimerHandle)
    }

    fn schedule_send_heartbeat(&self) -> Box<dyn TimerHandle> {
        Box::new(NullTimerHandle)
    }
}

#[derive(Debug)]
struct NullTimerHandle;

impl TimerHandle for NullTimerHandle {
    fn cancel(&mut self) {}
}

// --- simulated time, for deterministic multi-node scenarios -------------

#[derive(Debug)]
struct PendingTimer {
    deadline: Duration,
    kind: TimerKind,
}

#[derive(Debug, Default)]
struct ClockState {
    now: Duration,
    next_id: u64,
    pending: HashMap<u64, PendingTimer>,
}

/// A logical clock shared by every `SimulatedTimerDriver` in a test harness.
/// Nothing here ever sleeps; `advance` is the only thing that makes time
/// pass, and it hands back exactly the timers that became due, in deadline
/// order, so a test can feed them into the right node one at a time and get
/// the same sequence of outputs on every run.
#[derive(Debug, Clone, Default)]
pub struct VirtualClock {
    inner: Arc<Mutex<ClockState>>,
}

impl VirtualClock {
    pub fn new() -> Self {
        VirtualClock::default()
    }

    pub fn now(&self) -> Duration {
        self.inner.lock().unwrap().now
    }

    fn schedule(&self, delay: Duration, kind: TimerKind) -> u64 {
        let mut state = self.inner.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        let deadline = state.now + delay;
        state.pending.insert(id, PendingTimer { deadline, kind });
        id
    }

    fn cancel(&self, id: u64) {
        self.inner.lock().unwrap().pending.remove(&id);
    }

    /// Move the clock forward by `dur` and return every timer that is now
    /// due, ordered by deadline (ties broken by scheduling order). Due
    /// timers are consumed -- they won't be returned again by a later call.
    pub fn advance(&self, dur: Duration) -> Vec<TimerKind> {
        let mut state = self.inner.lock().unwrap();
        state.now += dur;
        let now = state.now;
        let mut due: Vec<(u64, Duration, TimerKind)> =
            state.pending.iter().filter(|(_, t)| t.deadline <= now).map(|(id, t)| (*id, t.deadline, t.kind)).collect();
        due.sort_by_key(|(id, deadline, _)| (*deadline, *id));
        for (id, _, _) in &due {
            state.pending.remove(id);
        }
        due.into_iter().map(|(_, _, kind)| kind).collect()
    }
}

/// Test implementation of `TimerDriver`: records a pending deadline on a
/// shared `VirtualClock` instead of spawning a sleep. Unlike
/// `TokioTimerDriver`, timeouts are fixed rather than drawn from `rand` --
/// determinism requires the same inputs to produce the same schedule on
/// every run, and a harness that wants jitter can vary the fixed value per
/// node instead.
#[derive(Debug, Clone)]
pub struct SimulatedTimerDriver {
    clock: VirtualClock,
    election_timeout: Duration,
    heartbeat_interval: Duration,
}

impl SimulatedTimerDriver {
    pub fn new(clock: VirtualClock, election_timeout: Duration, heartbeat_interval: Duration) -> Self {
        SimulatedTimerDriver { clock, election_timeout, heartbeat_interval }
    }
}

impl TimerDriver for SimulatedTimerDriver {
    fn schedule_receive_heartbeat(&self) -> Box<dyn TimerHandle> {
        let id = self.clock.schedule(self.election_timeout, TimerKind::ReceiveHeartbeatTimeout);
        Box::new(SimulatedTimerHandle { clock: self.clock.clone(), id: Some(id) })
    }

    fn schedule_send_heartbeat(&self) -> Box<dyn TimerHandle> {
        let id = self.clock.schedule(self.heartbeat_interval, TimerKind::SendHeartbeatTimeout);
        Box::new(SimulatedTimerHandle { clock: self.clock.clone(), id: Some(id) })
    }
}

#[derive(Debug)]
struct SimulatedTimerHandle {
    clock: VirtualClock,
    id: Option<u64>,
}

impl TimerHandle for SimulatedTimerHandle {
    fn cancel(&mut self) {
        if let Some(id) = self.id.take() {
            self.clock.cancel(id);
        }
    }
}
