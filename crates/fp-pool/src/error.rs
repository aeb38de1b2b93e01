use thiserror::Error;

#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(String),
}
