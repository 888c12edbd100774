use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    #[error("Insufficient data: `{remaining}` bytes remaining, `{required}` required")]
    InsufficientData { remaining: usize, required: usize },

    #[error("Length of the archive index `{0}` is not a multiple of the entry size")]
    IndexLengthMismatch(usize),

    #[error("Invalid compacted flag `{0}`")]
    InvalidFlag(u8),
}
