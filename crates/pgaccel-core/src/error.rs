#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("canceling statement due to user request")]
    QueryCancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("catalog lookup failed: {0}")]
    Catalog(String),

    #[error("corrupt value: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
