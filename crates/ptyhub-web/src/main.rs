use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use libptyhub::{
    AgentDirectory, AgentStatus, NullSink, PoolConfig, SessionPool, SpawnOptions,
};
use ptyhub_protocol::AgentRunState;
use ptyhub_web::{RemoteServerConfig, server};

#[derive(Parser, Debug)]
#[command(name = "ptyhub", about = "Remote PTY multiplexer host")]
struct Args {
    /// HTTP listen port.
    #[arg(long, default_value_t = server::DEFAULT_PORT)]
    port: u16,

    /// Directory holding the built SPA.
    #[arg(long, default_value = "web-dist")]
    static_dir: PathBuf,

    /// Command to spawn as an agent at startup (repeatable). The first
    /// word is the executable, the rest are arguments. Defaults to the
    /// user's shell when omitted.
    #[arg(long = "spawn")]
    spawn: Vec<String>,

    /// Initial terminal size for spawned agents.
    #[arg(long, default_value_t = 120)]
    cols: u16,
    #[arg(long, default_value_t = 32)]
    rows: u16,
}

/// Directory for a standalone host: every pooled agent is running and the
/// task is named after itself.
struct HostDirectory;

impl AgentDirectory for HostDirectory {
    fn task_name(&self, task_id: &str) -> String {
        task_id.to_string()
    }

    fn agent_status(&self, _agent_id: &str) -> AgentStatus {
        AgentStatus {
            state: AgentRunState::Running,
            exit_code: None,
            last_line: String::new(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| "ptyhub=info".into()),
        )
        .init();

    let args = Args::parse();
    let pool = SessionPool::new(PoolConfig::default(), Arc::new(NullSink));

    let commands = if args.spawn.is_empty() {
        vec![String::new()]
    } else {
        args.spawn.clone()
    };
    for (index, line) in commands.iter().enumerate() {
        let mut words = line.split_whitespace().map(str::to_string);
        let command = words.next().unwrap_or_default();
        let agent_id = format!("agent-{}", index + 1);
        pool.spawn(SpawnOptions {
            agent_id: agent_id.clone(),
            task_id: agent_id,
            command,
            args: words.collect(),
            cwd: String::new(),
            env: Default::default(),
            cols: args.cols,
            rows: args.rows,
        })
        .await?;
    }

    let handle = server::start(
        RemoteServerConfig {
            port: args.port,
            static_dir: args.static_dir,
        },
        pool.clone(),
        Arc::new(HostDirectory),
    )
    .await?;

    info!(url = %handle.urls.primary, "ptyhub ready");
    if let Some(lan) = &handle.urls.lan {
        info!(url = %lan, "lan access");
    }
    if let Some(mesh) = &handle.urls.mesh {
        info!(url = %mesh, "mesh access");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    pool.kill_all().await;
    handle.shutdown().await;
    Ok(())
}
