//! Typed lifecycle event bus.
//!
//! Three topics: agent spawned, agent exited, and "the agent list changed
//! for an external reason". Listeners run synchronously in registration
//! order on the emitting task; a panicking listener is logged and the rest
//! still run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Exit information attached to an `Exit` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub exit_code: Option<i32>,
    pub signal: Option<String>,
}

#[derive(Debug, Clone)]
pub enum LifecycleEvent {
    Spawn { agent_id: String },
    Exit { agent_id: String, exit: AgentExit },
    ListChanged,
}

type Listener = Arc<dyn Fn(&LifecycleEvent) + Send + Sync>;

/// Handle for removing a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Vec<(ListenerId, Listener)>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&LifecycleEvent) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .push((id, Arc::new(listener)));
        id
    }

    pub fn unsubscribe(&self, id: ListenerId) {
        self.listeners
            .lock()
            .expect("listener lock poisoned")
            .retain(|(listener_id, _)| *listener_id != id);
    }

    /// Deliver one event to every listener, in registration order.
    ///
    /// Listener handles are cloned out of the lock before invocation so a
    /// listener may subscribe or unsubscribe without deadlocking.
    pub fn emit(&self, event: &LifecycleEvent) {
        let listeners: Vec<Listener> = self
            .listeners
            .lock()
            .expect("listener lock poisoned")
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                tracing::error!("lifecycle listener panicked");
            }
        }
    }
}
