//! Elementary-stream parsers for the transmux pipeline
//!
//! The demuxed PES packets carry raw codec payloads; this crate turns them
//! into typed records: H.264 NAL units with decoded SPS configuration
//! ([`h264`]), AAC ADTS frames ([`adts`]), CEA-608 caption cues extracted
//! from H.264 SEI messages ([`caption`]), and ID3 timed-metadata tags
//! ([`metadata`]).

pub mod adts;
pub mod bits;
pub mod caption;
pub mod error;
pub mod h264;
pub mod metadata;
pub mod silence;

pub use adts::{AdtsFrame, AdtsStream};
pub use bits::BitReader;
pub use caption::{Caption, CaptionStream};
pub use error::CodecError;
pub use h264::{H264Stream, NalUnit, NalUnitType, SpsConfig};
pub use metadata::{Id3Frame, Id3Tag, MetadataStream};
pub use silence::silent_frame;

/// Result type for codec parsing operations
pub type Result<T> = std::result::Result<T, CodecError>;
