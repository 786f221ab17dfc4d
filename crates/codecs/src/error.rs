use thiserror::Error;

/// Errors produced while parsing elementary-stream payloads.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("bitstream exhausted")]
    OutOfData,

    #[error("invalid exp-Golomb code")]
    InvalidGolomb,

    #[error("malformed {structure}: {reason}")]
    Malformed {
        structure: &'static str,
        reason: &'static str,
    },
}
