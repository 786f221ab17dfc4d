//! ISO BMFF (fragmented MP4) generation
//!
//! Produces the byte-exact boxes an MSE byte-stream sink expects: one init
//! segment (`ftyp` + `moov`) per track set, and one `moof` + `mdat` pair per
//! media segment. A small box reader supports tests and segment inspection.

pub mod codec;
pub mod fragment;
pub mod init;
pub mod reader;
pub(crate) mod writer;

pub use codec::{aac_codec_string, avc_codec_string};
pub use fragment::{FragmentTrack, Sample, SampleFlags, mdat, moof};
pub use init::{InitTrack, TrackKind, init_segment};
pub use reader::{BoxView, box_at, find_box, find_box_path};
