//! # transmux
//!
//! Streaming MPEG-2 Transport Stream → fragmented MP4 transmuxer.
//!
//! Feed arbitrarily-chunked TS bytes into a [`Transmuxer`]; it demuxes the
//! elementary streams, regroups H.264 access units into keyframe-clean
//! GOPs, aligns AAC audio against the video timeline, and repackages both
//! as `moof`+`mdat` fragments an MSE byte-stream sink can append directly.
//! Captions (CEA-608 in SEI) and ID3 timed metadata surface as side events.
//!
//! ```no_run
//! use transmux::{TransmuxConfig, Transmuxer, TransmuxEvent};
//!
//! let mut muxer = Transmuxer::new(TransmuxConfig::default());
//! let chunk: bytes::Bytes = std::fs::read("input.ts").unwrap().into();
//! let mut events = muxer.push(chunk).unwrap();
//! events.extend(muxer.flush().unwrap());
//! for event in events {
//!     if let TransmuxEvent::Data(segment) = event {
//!         // append segment.init_segment / segment.data to the sink
//!         let _ = segment.data.len();
//!     }
//! }
//! ```

pub mod audio;
pub mod audio_frames;
pub mod clock;
pub mod coalesce;
pub mod events;
pub mod frame;
pub mod track;
pub mod transmuxer;
pub mod video;

pub use coalesce::Coalescer;
pub use events::{
    AudioTrackInfo, CaptionCue, GopInfo, MediaInfo, SegmentData, SegmentTimingInfo, SegmentType,
    SubtitleTrackInfo, TimestampPair, TimingInfo, TrackInfo, TrackType, TransmuxEvent,
    VideoTrackInfo,
};
pub use pipeline_common::PipelineError;
pub use track::Track;
pub use transmuxer::{TransmuxConfig, TransmuxConfigBuilder, Transmuxer};
