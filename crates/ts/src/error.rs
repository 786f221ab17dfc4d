use thiserror::Error;

/// Errors produced while parsing Transport Stream structures.
///
/// These cover structurally impossible input only. Recoverable stream noise
/// (garbage between sync bytes, a PES cut short by packet loss) is dropped
/// by the stages without surfacing an error.
#[derive(Error, Debug)]
pub enum TsError {
    #[error("invalid TS packet size: {0} (expected 188)")]
    InvalidPacketSize(usize),

    #[error("invalid sync byte: {0:#04x} (expected 0x47)")]
    InvalidSyncByte(u8),
}
