use thiserror::Error;

pub type XipherResult<T> = Result<T, XipherError>;

#[derive(Debug, Error)]
pub enum XipherError {
    #[error("engine error: {0}")]
    Engine(String),

    #[error("vault error: {0}")]
    Vault(String),

    #[error("stream error: {0}")]
    Stream(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
