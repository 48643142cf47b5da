use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::journal::JournalError;

#[derive(Error, Debug)]
pub enum QuorumError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("journal error: {0}")]
    Journal(#[from] JournalError),

    #[error("node {0} not found")]
    NodeNotFound(Uuid),

    #[error("node {0} is already part of the cluster")]
    DuplicatePeer(Uuid),

    #[error("node {0} is already running")]
    AlreadyRunning(Uuid),

    #[error("node {0} panicked")]
    NodePanicked(Uuid),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QuorumError>;
