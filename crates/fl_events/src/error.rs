use thiserror::Error;

#[derive(Debug, Error)]
pub enum EventError {
    #[error("Ring buffer capacity must be at least 1, got {0}")]
    InvalidCapacity(usize),
}
