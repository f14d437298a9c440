use thiserror::Error;

#[derive(Error, Debug)]
pub enum TreeSyncError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("topology error: {0}")]
    Topology(String),

    #[error("transfer error: {0}")]
    Transfer(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("interrupted")]
    Interrupted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, TreeSyncError>;
