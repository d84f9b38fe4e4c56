use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("command rejected: {0}")]
    InvalidCommand(String),

    #[error("agent not found: {0}")]
    AgentNotFound(String),

    #[error("agent already exists: {0}")]
    AgentExists(String),

    #[error("pty error: {0}")]
    Pty(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
