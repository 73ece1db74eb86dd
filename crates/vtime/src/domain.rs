//! Synchronization domains: barriers that keep several emulated machines in
//! lock step.
//!
//! Every participant obtains a [`Synchronizer`] from the domain and calls
//! [`Synchronizer::sync`] at its sync points. A phase completes when all
//! registered participants have arrived; the last one to arrive runs the
//! post-phase work (queued actions, the sync-point hook and listeners) before
//! anybody is released, so everything done in phase `n` is visible to every
//! participant in phase `n + 1`.

use core::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};

use crate::error::{SyncError, SyncResult};
use crate::sync::{Arc, Condvar, Mutex, MutexGuard, ReentrantMutex};

/// Work deferred to the nearest sync point.
pub type SyncAction = Box<dyn FnOnce() + Send>;

/// Callback invoked with the number of the phase being completed.
pub type SyncPointHook = Arc<dyn Fn(i64) + Send + Sync>;

thread_local! {
    static ON_SYNC_THREAD: Cell<bool> = const { Cell::new(false) };
}

/// Sets the "inside a sync callback" flag of the current thread until dropped.
struct SyncThreadGuard {
    previous: bool,
}

impl SyncThreadGuard {
    fn enter() -> Self {
        Self {
            previous: ON_SYNC_THREAD.with(|flag| flag.replace(true)),
        }
    }
}

impl Drop for SyncThreadGuard {
    fn drop(&mut self) {
        ON_SYNC_THREAD.with(|flag| flag.set(self.previous));
    }
}

/// One participant's handle on a domain.
pub trait Synchronizer: Send + Sync {
    /// Blocks until every participant of the domain has arrived.
    ///
    /// Returns [`SyncError::Cancelled`] without blocking when the sync was
    /// cancelled beforehand, or as soon as it is cancelled while waiting.
    fn sync(&self) -> SyncResult<()>;

    /// Releases a pending or future `sync` until [`restore_sync`](Self::restore_sync).
    fn cancel_sync(&self);

    fn restore_sync(&self);

    /// Leaves the domain for good.
    fn exit(&self);
}

/// A group of participants synchronized at common points in virtual time.
pub trait SyncDomain: Send + Sync {
    /// Registers a new participant.
    fn provide_synchronizer(&self) -> Arc<dyn Synchronizer>;

    /// Number of completed phases.
    fn synchronizations_count(&self) -> i64;

    /// Queues `action` to run once, at the end of the current phase.
    fn execute_on_nearest_sync(&self, action: SyncAction);

    fn set_hook_on_sync_point(&self, hook: SyncPointHook);

    fn clear_hook_on_sync_point(&self);

    /// Whether the calling thread is running this domain's post-phase work.
    fn on_sync_point_thread(&self) -> bool;

    /// Whether the domain actually synchronizes anything.
    fn is_dummy(&self) -> bool {
        false
    }
}

struct Barrier {
    participants: usize,
    arrived: usize,
    phase: i64,
    /// Set while the last arriver runs the post-phase work.
    completing: bool,
}

struct DomainShared {
    barrier: Mutex<Barrier>,
    released: Condvar,
    actions: Mutex<VecDeque<SyncAction>>,
    hook: Mutex<Option<SyncPointHook>>,
    listeners: Mutex<Vec<SyncPointHook>>,
    /// Held for the whole post-phase work; hook changes wait for it.
    /// Reentrant so that callbacks may replace the hook themselves.
    post_phase: ReentrantMutex<()>,
}

impl DomainShared {
    fn sync(&self, cancelled: &AtomicBool) -> SyncResult<()> {
        let mut barrier = self.barrier.lock();
        // A cancelled participant never waits, not even for a completing phase.
        loop {
            if cancelled.load(Ordering::Acquire) {
                return Err(SyncError::Cancelled);
            }
            if !barrier.completing {
                break;
            }
            self.released.wait(&mut barrier);
        }
        barrier.arrived += 1;
        let phase = barrier.phase;
        if barrier.arrived >= barrier.participants {
            self.complete_phase(barrier);
            return Ok(());
        }
        loop {
            self.released.wait(&mut barrier);
            if barrier.phase != phase {
                return Ok(());
            }
            // Once completion has started the participant is counted in.
            if !barrier.completing && cancelled.load(Ordering::Acquire) {
                barrier.arrived -= 1;
                return Err(SyncError::Cancelled);
            }
        }
    }

    fn add_participant(&self) {
        let mut barrier = self.barrier.lock();
        barrier.participants += 1;
        debug!("sync domain: participant joined ({} total)", barrier.participants);
    }

    fn remove_participant(&self) {
        let mut barrier = self.barrier.lock();
        barrier.participants = barrier.participants.saturating_sub(1);
        debug!("sync domain: participant left ({} total)", barrier.participants);
        if !barrier.completing && barrier.arrived > 0 && barrier.arrived >= barrier.participants {
            self.complete_phase(barrier);
        }
    }

    /// Runs the post-phase work outside the barrier lock and releases the waiters.
    fn complete_phase(&self, mut barrier: MutexGuard<'_, Barrier>) {
        barrier.completing = true;
        let phase = barrier.phase;
        drop(barrier);

        self.post_phase(phase);

        let mut barrier = self.barrier.lock();
        barrier.arrived = 0;
        barrier.phase += 1;
        barrier.completing = false;
        trace!("sync domain: phase {phase} completed");
        self.released.notify_all();
    }

    fn post_phase(&self, phase: i64) {
        let _post_phase = self.post_phase.lock();
        let _on_sync_thread = SyncThreadGuard::enter();
        // Actions queued by other actions run in the same phase.
        loop {
            let action = self.actions.lock().pop_front();
            match action {
                Some(action) => action(),
                None => break,
            }
        }
        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(phase);
        }
        let listeners = self.listeners.lock().clone();
        for listener in &listeners {
            listener(phase);
        }
    }

    /// Wakes waiters so they can observe a cancellation.
    fn wake_all(&self) {
        let _barrier = self.barrier.lock();
        self.released.notify_all();
    }
}

/// Barrier-backed [`SyncDomain`] with a dynamic number of participants.
pub struct SynchronizationDomain {
    shared: Arc<DomainShared>,
}

impl Default for SynchronizationDomain {
    fn default() -> Self {
        Self::new()
    }
}

impl SynchronizationDomain {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(DomainShared {
                barrier: Mutex::new(Barrier {
                    participants: 0,
                    arrived: 0,
                    phase: 0,
                    completing: false,
                }),
                released: Condvar::new(),
                actions: Mutex::new(VecDeque::new()),
                hook: Mutex::new(None),
                listeners: Mutex::new(Vec::new()),
                post_phase: ReentrantMutex::new(()),
            }),
        }
    }

    pub fn participants(&self) -> usize {
        self.shared.barrier.lock().participants
    }

    /// Adds a listener called after the hook at every sync point.
    ///
    /// Unlike the hook, listeners cannot be replaced or removed.
    pub fn add_sync_point_listener(&self, listener: SyncPointHook) {
        self.shared.listeners.lock().push(listener);
    }
}

impl SyncDomain for SynchronizationDomain {
    fn provide_synchronizer(&self) -> Arc<dyn Synchronizer> {
        self.shared.add_participant();
        Arc::new(DomainSynchronizer {
            domain: Arc::clone(&self.shared),
            cancelled: Mutex::new(Arc::new(AtomicBool::new(false))),
            exited: AtomicBool::new(false),
        })
    }

    fn synchronizations_count(&self) -> i64 {
        self.shared.barrier.lock().phase
    }

    fn execute_on_nearest_sync(&self, action: SyncAction) {
        self.shared.actions.lock().push_back(action);
    }

    fn set_hook_on_sync_point(&self, hook: SyncPointHook) {
        let _post_phase = self.shared.post_phase.lock();
        *self.shared.hook.lock() = Some(hook);
    }

    fn clear_hook_on_sync_point(&self) {
        let _post_phase = self.shared.post_phase.lock();
        *self.shared.hook.lock() = None;
    }

    fn on_sync_point_thread(&self) -> bool {
        ON_SYNC_THREAD.with(Cell::get)
    }
}

struct DomainSynchronizer {
    domain: Arc<DomainShared>,
    /// Replaced, never reset, by `restore_sync`.
    cancelled: Mutex<Arc<AtomicBool>>,
    exited: AtomicBool,
}

impl Synchronizer for DomainSynchronizer {
    fn sync(&self) -> SyncResult<()> {
        if self.exited.load(Ordering::Acquire) {
            return Err(SyncError::Exited);
        }
        let token = self.cancelled.lock().clone();
        self.domain.sync(&token)
    }

    fn cancel_sync(&self) {
        self.cancelled.lock().store(true, Ordering::Release);
        self.domain.wake_all();
    }

    fn restore_sync(&self) {
        *self.cancelled.lock() = Arc::new(AtomicBool::new(false));
    }

    fn exit(&self) {
        if !self.exited.swap(true, Ordering::AcqRel) {
            self.domain.remove_participant();
        }
    }
}

impl Drop for DomainSynchronizer {
    fn drop(&mut self) {
        self.exit();
    }
}

/// Domain of a machine that is not synchronized with anything.
///
/// `sync` never blocks and deferred actions run immediately on the caller.
#[derive(Debug, Default)]
pub struct DummySynchronizationDomain;

impl DummySynchronizationDomain {
    pub fn new() -> Self {
        Self
    }
}

impl SyncDomain for DummySynchronizationDomain {
    fn provide_synchronizer(&self) -> Arc<dyn Synchronizer> {
        Arc::new(DummySynchronizer)
    }

    fn synchronizations_count(&self) -> i64 {
        0
    }

    fn execute_on_nearest_sync(&self, action: SyncAction) {
        action();
    }

    fn set_hook_on_sync_point(&self, _hook: SyncPointHook) {}

    fn clear_hook_on_sync_point(&self) {}

    fn on_sync_point_thread(&self) -> bool {
        false
    }

    fn is_dummy(&self) -> bool {
        true
    }
}

struct DummySynchronizer;

impl Synchronizer for DummySynchronizer {
    fn sync(&self) -> SyncResult<()> {
        Ok(())
    }

    fn cancel_sync(&self) {}

    fn restore_sync(&self) {}

    fn exit(&self) {}
}
