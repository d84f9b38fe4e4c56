//! PTY session pool: spawning, output batching, subscriber fan-out, and
//! lifecycle bookkeeping.
//!
//! Each session owns one PTY child. A dedicated reader thread performs the
//! blocking PTY reads and forwards raw chunks to an async batcher task,
//! which coalesces them (single-shot flush timer), records scrollback, and
//! fans flushed batches out to the desktop sink and any subscribers.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use portable_pty::{Child, ChildKiller, CommandBuilder, MasterPty, PtySize, native_pty_system};
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{error, info, warn};

use crate::error::PoolError;
use crate::events::{AgentExit, EventBus, LifecycleEvent};
use crate::scrollback::Scrollback;
use crate::sinks::{DesktopFrame, DesktopSink};

/// Characters that get a command rejected outright. Commands are spawned
/// directly, never through a shell, so metacharacters only ever appear in
/// hostile or confused input.
const COMMAND_METACHARS: &[char] = &[';', '&', '|', '`', '$', '(', ')', '{', '}', '\n'];

/// Caller-supplied environment overrides that are never honored.
const ENV_DENY_LIST: &[&str] = &[
    "PATH",
    "HOME",
    "USER",
    "SHELL",
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "DYLD_INSERT_LIBRARIES",
    "NODE_OPTIONS",
    "ELECTRON_RUN_AS_NODE",
];

/// Removed unconditionally so spawned agents do not detect a parent agent
/// session and refuse to start.
const ENV_SCRUBBED: &[&str] = &["CLAUDECODE", "CLAUDE_CODE_SESSION", "CLAUDE_CODE_ENTRYPOINT"];

/// Batching and buffering knobs. The defaults match the desktop app; tests
/// and embedders may tune them.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Flush as soon as the pending batch reaches this size.
    pub batch_max: usize,
    /// Coalescing window armed when a large chunk arrives.
    pub batch_interval: Duration,
    /// Chunks below this size flush immediately; small reads are usually
    /// interactive prompt fragments that must not sit in the batch.
    pub small_chunk_flush: usize,
    /// Raw bytes retained for the exit report.
    pub tail_cap: usize,
    /// Lines of the tail reported on exit.
    pub max_tail_lines: usize,
    /// Scrollback ring capacity per agent.
    pub scrollback_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            batch_max: 64 * 1024,
            batch_interval: Duration::from_millis(8),
            small_chunk_flush: 1024,
            tail_cap: 8 * 1024,
            max_tail_lines: 50,
            scrollback_capacity: crate::scrollback::DEFAULT_CAPACITY,
        }
    }
}

/// Inputs for spawning one agent.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub agent_id: String,
    pub task_id: String,
    /// Executable name or path. Empty means the user's shell.
    pub command: String,
    pub args: Vec<String>,
    /// Working directory. Empty means `$HOME`, falling back to `/`.
    pub cwd: String,
    pub env: HashMap<String, String>,
    pub cols: u16,
    pub rows: u16,
}

/// Static and current metadata for one live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionMeta {
    pub agent_id: String,
    pub task_id: String,
    pub command: String,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

/// Identity handle for one registered output subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

type OutputSubscriber = Arc<dyn Fn(&str) + Send + Sync>;

struct Session {
    agent_id: String,
    task_id: String,
    command: String,
    cwd: PathBuf,
    dims: Mutex<(u16, u16)>,
    master: Mutex<Box<dyn MasterPty + Send>>,
    writer: Mutex<Box<dyn Write + Send>>,
    killer: Mutex<Box<dyn ChildKiller + Send + Sync>>,
    scrollback: Mutex<Scrollback>,
    subscribers: Mutex<HashMap<SubscriberId, OutputSubscriber>>,
    kill_requested: AtomicBool,
    sink: Arc<dyn DesktopSink>,
}

impl Session {
    fn write(&self, data: &[u8]) -> Result<(), PoolError> {
        let mut writer = self.writer.lock().expect("writer lock poisoned");
        writer.write_all(data)?;
        writer.flush()?;
        Ok(())
    }

    fn resize(&self, cols: u16, rows: u16) -> Result<(), PoolError> {
        *self.dims.lock().expect("dims lock poisoned") = (cols, rows);
        self.master
            .lock()
            .expect("master lock poisoned")
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PoolError::Pty(e.to_string()))
    }

    /// Fire-and-forget termination. Subscribers are cleared first so the
    /// final exit flush does not notify stale listeners; removal from the
    /// pool happens in the exit path once the child is reaped.
    fn kill(&self) {
        self.kill_requested.store(true, Ordering::SeqCst);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .clear();
        if let Err(err) = self.killer.lock().expect("killer lock poisoned").kill() {
            error!(agent_id = %self.agent_id, %err, "failed to kill agent process");
        }
    }

    /// Deliver the pending batch: desktop sink, then scrollback, then every
    /// subscriber registered at flush time. No-op on an empty batch.
    fn flush(&self, batch: &mut Vec<u8>) {
        if batch.is_empty() {
            return;
        }
        let bytes = std::mem::take(batch);
        let encoded = STANDARD.encode(&bytes);

        self.sink.send(
            &self.agent_id,
            DesktopFrame::Data {
                data: encoded.clone(),
            },
        );
        self.scrollback
            .lock()
            .expect("scrollback lock poisoned")
            .write(&bytes);

        let subscribers: Vec<OutputSubscriber> = self
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .values()
            .cloned()
            .collect();
        for subscriber in subscribers {
            subscriber(&encoded);
        }
    }

    fn meta(&self) -> SessionMeta {
        let (cols, rows) = *self.dims.lock().expect("dims lock poisoned");
        SessionMeta {
            agent_id: self.agent_id.clone(),
            task_id: self.task_id.clone(),
            command: self.command.clone(),
            cwd: self.cwd.clone(),
            cols,
            rows,
        }
    }
}

struct PoolInner {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    events: EventBus,
    sink: Arc<dyn DesktopSink>,
    cfg: PoolConfig,
    next_subscriber_id: AtomicU64,
}

/// Process-wide registry of PTY sessions keyed by agent id. Cheap to clone;
/// all clones share one pool.
#[derive(Clone)]
pub struct SessionPool {
    inner: Arc<PoolInner>,
}

impl SessionPool {
    pub fn new(cfg: PoolConfig, sink: Arc<dyn DesktopSink>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                sessions: RwLock::new(HashMap::new()),
                events: EventBus::new(),
                sink,
                cfg,
                next_subscriber_id: AtomicU64::new(1),
            }),
        }
    }

    /// Lifecycle event bus shared by this pool. The owning application may
    /// also publish `ListChanged` here when task metadata moves under it.
    pub fn events(&self) -> &EventBus {
        &self.inner.events
    }

    /// Spawn a new agent and insert it into the pool.
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<(), PoolError> {
        validate_command(&opts.command)?;
        if self
            .inner
            .sessions
            .read()
            .await
            .contains_key(&opts.agent_id)
        {
            return Err(PoolError::AgentExists(opts.agent_id));
        }

        let command = if opts.command.is_empty() {
            default_shell()
        } else {
            opts.command.clone()
        };
        let resolved = resolve_command(&command);
        let cwd = if opts.cwd.is_empty() {
            default_cwd()
        } else {
            PathBuf::from(&opts.cwd)
        };

        info!(
            agent_id = %opts.agent_id,
            task_id = %opts.task_id,
            command = %command,
            cwd = %cwd.display(),
            "spawning agent"
        );

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: opts.rows,
                cols: opts.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| PoolError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&resolved);
        cmd.args(&opts.args);
        cmd.cwd(&cwd);
        apply_environment(&mut cmd, &opts.env);

        let child = pair.slave.spawn_command(cmd).map_err(|e| {
            PoolError::Pty(format!(
                "failed to spawn '{command}' (resolved: '{resolved}'): {e}"
            ))
        })?;
        // Only the master side is needed from here on.
        drop(pair.slave);

        let killer = child.clone_killer();
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| PoolError::Pty(e.to_string()))?;
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| PoolError::Pty(e.to_string()))?;

        let session = Arc::new(Session {
            agent_id: opts.agent_id.clone(),
            task_id: opts.task_id,
            command,
            cwd,
            dims: Mutex::new((opts.cols, opts.rows)),
            master: Mutex::new(pair.master),
            writer: Mutex::new(writer),
            killer: Mutex::new(killer),
            scrollback: Mutex::new(Scrollback::new(self.inner.cfg.scrollback_capacity)),
            subscribers: Mutex::new(HashMap::new()),
            kill_requested: AtomicBool::new(false),
            sink: Arc::clone(&self.inner.sink),
        });

        let (chunk_tx, chunk_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        thread::Builder::new()
            .name(format!("pty-reader-{}", opts.agent_id))
            .spawn(move || read_loop(reader, child, chunk_tx, exit_tx))?;

        self.inner
            .sessions
            .write()
            .await
            .insert(opts.agent_id.clone(), Arc::clone(&session));
        self.inner.events.emit(&LifecycleEvent::Spawn {
            agent_id: opts.agent_id,
        });

        // Started only after the session is registered and announced, so an
        // instantly-exiting child cannot race its own spawn event.
        tokio::spawn(batch_loop(
            Arc::downgrade(&self.inner),
            session,
            chunk_rx,
            exit_rx,
            self.inner.cfg.clone(),
        ));

        Ok(())
    }

    pub async fn write(&self, agent_id: &str, data: &[u8]) -> Result<(), PoolError> {
        self.get(agent_id).await?.write(data)
    }

    pub async fn resize(&self, agent_id: &str, cols: u16, rows: u16) -> Result<(), PoolError> {
        self.get(agent_id).await?.resize(cols, rows)
    }

    /// Terminate an agent. No-op for unknown ids.
    pub async fn kill(&self, agent_id: &str) {
        let session = self.inner.sessions.read().await.get(agent_id).cloned();
        if let Some(session) = session {
            session.kill();
        }
    }

    pub async fn kill_all(&self) {
        let sessions: Vec<Arc<Session>> =
            self.inner.sessions.read().await.values().cloned().collect();
        for session in sessions {
            session.kill();
        }
    }

    /// Register an output subscriber. Returns `None` when the agent no
    /// longer exists. The callback receives each flushed batch base64
    /// encoded and must be fast and non-blocking.
    pub async fn subscribe<F>(&self, agent_id: &str, callback: F) -> Option<SubscriberId>
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let session = self.inner.sessions.read().await.get(agent_id).cloned()?;
        let id = SubscriberId(self.inner.next_subscriber_id.fetch_add(1, Ordering::Relaxed));
        session
            .subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, Arc::new(callback));
        Some(id)
    }

    /// Remove a subscriber by handle. Silent when the agent or handle is
    /// already gone.
    pub async fn unsubscribe(&self, agent_id: &str, id: SubscriberId) {
        let session = self.inner.sessions.read().await.get(agent_id).cloned();
        if let Some(session) = session {
            session
                .subscribers
                .lock()
                .expect("subscriber lock poisoned")
                .remove(&id);
        }
    }

    /// Base64 snapshot of an agent's scrollback, or `None` if unknown.
    pub async fn scrollback(&self, agent_id: &str) -> Option<String> {
        let session = self.inner.sessions.read().await.get(agent_id).cloned()?;
        let snapshot = session
            .scrollback
            .lock()
            .expect("scrollback lock poisoned")
            .to_base64();
        Some(snapshot)
    }

    pub async fn active_ids(&self) -> Vec<String> {
        self.inner.sessions.read().await.keys().cloned().collect()
    }

    pub async fn meta(&self, agent_id: &str) -> Option<SessionMeta> {
        let session = self.inner.sessions.read().await.get(agent_id).cloned()?;
        Some(session.meta())
    }

    pub async fn cols(&self, agent_id: &str) -> Option<u16> {
        let session = self.inner.sessions.read().await.get(agent_id).cloned()?;
        let (cols, _) = *session.dims.lock().expect("dims lock poisoned");
        Some(cols)
    }

    pub async fn running_count(&self) -> usize {
        self.inner.sessions.read().await.len()
    }

    async fn get(&self, agent_id: &str) -> Result<Arc<Session>, PoolError> {
        self.inner
            .sessions
            .read()
            .await
            .get(agent_id)
            .cloned()
            .ok_or_else(|| PoolError::AgentNotFound(agent_id.to_string()))
    }
}

/// Blocking read loop, one OS thread per session. Forwards chunks to the
/// batcher and reports the child's exit status once the stream ends.
fn read_loop(
    mut reader: Box<dyn Read + Send>,
    mut child: Box<dyn Child + Send + Sync>,
    chunk_tx: mpsc::UnboundedSender<Vec<u8>>,
    exit_tx: oneshot::Sender<AgentExit>,
) {
    let mut buf = [0u8; 16384];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if chunk_tx.send(buf[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(_) => break,
        }
    }
    drop(chunk_tx);

    let status = child.wait().ok();
    let exit = AgentExit {
        exit_code: status.as_ref().and_then(|s| i32::try_from(s.exit_code()).ok()),
        signal: status.as_ref().and_then(|s| s.signal().map(String::from)),
    };
    let _ = exit_tx.send(exit);
}

/// Per-session batcher. Owns the pending batch, the exit tail, and the
/// single-shot coalescing timer; nothing else mutates them.
async fn batch_loop(
    pool: Weak<PoolInner>,
    session: Arc<Session>,
    mut chunks: mpsc::UnboundedReceiver<Vec<u8>>,
    exit_rx: oneshot::Receiver<AgentExit>,
    cfg: PoolConfig,
) {
    let mut batch: Vec<u8> = Vec::new();
    let mut tail: Vec<u8> = Vec::with_capacity(cfg.tail_cap);
    let mut deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            maybe = chunks.recv() => {
                let Some(chunk) = maybe else { break };
                push_tail(&mut tail, &chunk, cfg.tail_cap);
                batch.extend_from_slice(&chunk);
                if batch.len() >= cfg.batch_max || chunk.len() < cfg.small_chunk_flush {
                    session.flush(&mut batch);
                    deadline = None;
                } else if deadline.is_none() {
                    deadline = Some(Instant::now() + cfg.batch_interval);
                }
            }
            _ = sleep_until(deadline.unwrap_or_else(far_future)), if deadline.is_some() => {
                deadline = None;
                if !session.kill_requested.load(Ordering::SeqCst) {
                    session.flush(&mut batch);
                }
            }
        }
    }

    // Stream ended: flush whatever is left, then report the exit.
    session.flush(&mut batch);

    let exit = exit_rx.await.unwrap_or(AgentExit {
        exit_code: None,
        signal: None,
    });
    let last_output = tail_lines(&tail, cfg.max_tail_lines);
    session.sink.send(
        &session.agent_id,
        DesktopFrame::Exit {
            exit_code: exit.exit_code,
            signal: exit.signal.clone(),
            last_output,
        },
    );

    info!(
        agent_id = %session.agent_id,
        exit_code = ?exit.exit_code,
        signal = ?exit.signal,
        "agent exited"
    );

    if let Some(pool) = pool.upgrade() {
        pool.events.emit(&LifecycleEvent::Exit {
            agent_id: session.agent_id.clone(),
            exit,
        });
        pool.sessions.write().await.remove(&session.agent_id);
    }
}

fn far_future() -> Instant {
    Instant::now() + Duration::from_secs(86400)
}

/// Keep at most `cap` trailing bytes of raw output for the exit report.
fn push_tail(tail: &mut Vec<u8>, chunk: &[u8], cap: usize) {
    if chunk.len() >= cap {
        tail.clear();
        tail.extend_from_slice(&chunk[chunk.len() - cap..]);
        return;
    }
    tail.extend_from_slice(chunk);
    if tail.len() > cap {
        let excess = tail.len() - cap;
        tail.drain(..excess);
    }
}

/// Decode the raw tail into at most `max_lines` trailing non-empty lines.
fn tail_lines(tail: &[u8], max_lines: usize) -> Vec<String> {
    let text = String::from_utf8_lossy(tail);
    let mut lines: VecDeque<String> = text
        .split('\n')
        .map(|line| line.trim_end_matches('\r').to_string())
        .filter(|line| !line.is_empty())
        .collect();
    while lines.len() > max_lines {
        lines.pop_front();
    }
    lines.into()
}

fn validate_command(command: &str) -> Result<(), PoolError> {
    if command.contains(COMMAND_METACHARS) {
        return Err(PoolError::InvalidCommand(format!(
            "shell metacharacters are not allowed in '{command}'"
        )));
    }
    Ok(())
}

fn default_shell() -> String {
    if cfg!(windows) {
        std::env::var("COMSPEC").unwrap_or_else(|_| "cmd".to_string())
    } else {
        std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
    }
}

fn default_cwd() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/"))
}

/// Resolve a bare command name against `PATH` so spawns still work when the
/// inherited lookup path is minimal. Anything containing a separator passes
/// through untouched.
fn resolve_command(command: &str) -> String {
    if command.contains(std::path::MAIN_SEPARATOR) {
        return command.to_string();
    }
    let Some(path) = std::env::var_os("PATH") else {
        return command.to_string();
    };
    for dir in std::env::split_paths(&path) {
        let candidate = dir.join(command);
        if is_executable(&candidate) {
            return candidate.to_string_lossy().into_owned();
        }
    }
    command.to_string()
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Build the child environment: the full process environment, fixed
/// terminal overrides, deny-filtered caller overrides, then the scrub list.
fn apply_environment(cmd: &mut CommandBuilder, overrides: &HashMap<String, String>) {
    for (key, value) in std::env::vars() {
        cmd.env(key, value);
    }
    cmd.env("TERM", "xterm-256color");
    cmd.env("COLORTERM", "truecolor");
    for (key, value) in overrides {
        if ENV_DENY_LIST.contains(&key.as_str()) {
            warn!(key = %key, "dropping deny-listed environment override");
            continue;
        }
        cmd.env(key, value);
    }
    for key in ENV_SCRUBBED {
        cmd.env_remove(key);
    }
}
