//! libptyhub — a process-local pool of pseudo-terminal agent processes.
//!
//! Each agent is one PTY child whose output is batched, recorded into a
//! bounded scrollback, and fanned out to an in-process desktop sink plus any
//! number of remote subscribers. Lifecycle changes (spawn, exit, list
//! refresh) travel over a typed event bus.

pub mod error;
pub mod events;
pub mod scrollback;
pub mod session;
pub mod sinks;

pub use error::PoolError;
pub use events::{AgentExit, EventBus, LifecycleEvent, ListenerId};
pub use scrollback::Scrollback;
pub use session::{PoolConfig, SessionMeta, SessionPool, SpawnOptions, SubscriberId};
pub use sinks::{AgentDirectory, AgentStatus, DesktopFrame, DesktopSink, NullSink};
