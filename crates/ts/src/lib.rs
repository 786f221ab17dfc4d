//! Transport Stream (TS) demultiplexing for the transmux pipeline
//!
//! This crate provides the TS-facing stages of the pipeline: packet
//! resynchronization ([`PacketSplitter`]), TS header parsing and PAT/PMT
//! routing ([`PacketParser`]), PES reassembly with PTS/DTS recovery
//! ([`ElementaryStream`]), and 33-bit timestamp rollover extension
//! ([`TimestampRollover`]).

pub mod crc32;
pub mod demux;
pub mod descriptor;
pub mod error;
pub mod packet;
pub mod pes;
pub mod psi;
pub mod rollover;
pub mod sync;

pub use crc32::{mpeg2_crc32, validate_section_crc32};
pub use demux::{PacketParser, PesFragment, TsDemuxEvent};
pub use descriptor::{DescriptorIterator, DescriptorRef, LanguageEntry};
pub use error::TsError;
pub use packet::{PID_NULL, PID_PAT, TS_PACKET_SIZE, TsPacket};
pub use pes::{ElementaryStream, PesPacket};
pub use psi::{AudioEntry, PidRole, PrivateDataEntry, ProgramMap, StreamType, SubtitleKind};
pub use rollover::{LogicalStreamType, TimestampRollover};
pub use sync::PacketSplitter;

/// Result type for TS parsing operations
pub type Result<T> = std::result::Result<T, TsError>;
