use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("analyzer component already registered: {0}")]
    DuplicateComponent(String),

    #[error("missing required configuration: {0}")]
    MissingConfig(&'static str),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
