use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is full")]
    Full,

    #[error("queue is closed")]
    Closed,
}
