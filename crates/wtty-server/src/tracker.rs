//! Active-session accounting.
//!
//! Every terminal session holds a [`SessionGuard`] for its whole lifetime.
//! The tracker turns the resulting count into the three things the gateway
//! cares about: draining on shutdown, exiting when nobody connects within
//! the idle timeout, and stopping after the first session in once mode.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Conditions the tracker reports to the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerSignal {
    /// No session was open for the whole idle timeout.
    IdleTimeout,
    /// Once mode: the single permitted session has ended.
    SessionCompleted,
}

struct TrackerState {
    active: usize,
    ever_registered: bool,
    once_signalled: bool,
    /// Bumped on every arm/disarm so a timer that lost the race stays quiet.
    idle_generation: u64,
    idle_timer: Option<JoinHandle<()>>,
}

/// Counts live sessions. See the module docs.
pub struct ConnectionTracker {
    state: Mutex<TrackerState>,
    count_tx: watch::Sender<usize>,
    signal_tx: mpsc::UnboundedSender<TrackerSignal>,
    idle_timeout: Option<Duration>,
    once: bool,
    runtime: Handle,
}

impl ConnectionTracker {
    /// Create a tracker with no sessions and start the idle timer.
    ///
    /// A zero `idle_timeout` disables the timer. Must be called from within
    /// a Tokio runtime; the timer runs on it.
    pub fn new(
        idle_timeout: Duration,
        once: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<TrackerSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let tracker = Arc::new(Self {
            state: Mutex::new(TrackerState {
                active: 0,
                ever_registered: false,
                once_signalled: false,
                idle_generation: 0,
                idle_timer: None,
            }),
            count_tx: watch::channel(0).0,
            signal_tx,
            idle_timeout: (!idle_timeout.is_zero()).then_some(idle_timeout),
            once,
            runtime: Handle::current(),
        });
        {
            let mut state = tracker.lock();
            tracker.arm_idle_timer(&mut state);
        }
        (tracker, signal_rx)
    }

    /// Register a new session. Dropping the guard unregisters it.
    pub fn register(self: &Arc<Self>) -> SessionGuard {
        let mut state = self.lock();
        state.active += 1;
        state.ever_registered = true;
        Self::disarm_idle_timer(&mut state);
        self.count_tx.send_replace(state.active);
        let number = state.active;
        drop(state);

        debug!(active = number, "session registered");
        SessionGuard {
            tracker: self.clone(),
            number,
        }
    }

    fn unregister(self: &Arc<Self>) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        let active = state.active;
        self.count_tx.send_replace(active);

        if active == 0 {
            if self.once && state.ever_registered && !state.once_signalled {
                state.once_signalled = true;
                info!("single session finished, requesting shutdown");
                let _ = self.signal_tx.send(TrackerSignal::SessionCompleted);
            }
            self.arm_idle_timer(&mut state);
        }
        drop(state);

        debug!(active, "session unregistered");
    }

    /// Current number of registered sessions.
    pub fn count(&self) -> usize {
        self.lock().active
    }

    /// Wait until no session is registered.
    pub async fn wait(&self) {
        let mut rx = self.count_tx.subscribe();
        let _ = rx.wait_for(|active| *active == 0).await;
    }

    fn arm_idle_timer(self: &Arc<Self>, state: &mut TrackerState) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        Self::disarm_idle_timer(state);
        let generation = state.idle_generation;
        let tracker: Weak<Self> = Arc::downgrade(self);
        state.idle_timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(tracker) = tracker.upgrade() else {
                return;
            };
            let state = tracker.lock();
            if state.idle_generation == generation && state.active == 0 {
                info!(timeout_secs = timeout.as_secs_f64(), "no client connected within idle timeout");
                let _ = tracker.signal_tx.send(TrackerSignal::IdleTimeout);
            }
        }));
    }

    fn disarm_idle_timer(state: &mut TrackerState) {
        state.idle_generation += 1;
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ConnectionTracker {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = state.idle_timer.take() {
            timer.abort();
        }
    }
}

/// Proof of registration. Unregisters on drop, including on unwind.
pub struct SessionGuard {
    tracker: Arc<ConnectionTracker>,
    number: usize,
}

impl SessionGuard {
    /// Number of active sessions right after this one registered.
    pub fn number(&self) -> usize {
        self.number
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.tracker.unregister();
    }
}
