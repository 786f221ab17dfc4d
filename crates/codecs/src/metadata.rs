//! ID3 timed metadata extraction
//!
//! Timed-metadata PES packets carry ID3v2 tags. This stage parses the tag
//! header and its frames (text, URL, TXXX/WXXX with descriptions, PRIV) and
//! emits one record per tag; the coalescer stamps the cue time relative to
//! the media timeline.

use std::sync::Arc;

use bytes::Bytes;
use pipeline_common::{PipelineError, Stage, StreamerContext};
use tracing::debug;
use ts::PesPacket;

/// One parsed ID3 frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Id3Frame {
    /// Four-character frame identifier, e.g. "TXXX", "PRIV".
    pub id: String,
    /// Description for TXXX/WXXX frames.
    pub description: Option<String>,
    /// Decoded text for T*** frames, URL for W*** frames.
    pub value: Option<String>,
    /// Owner identifier for PRIV frames.
    pub owner: Option<String>,
    /// Raw frame body.
    pub data: Bytes,
}

/// One ID3 tag with the timestamps of its PES packet.
#[derive(Debug, Clone, PartialEq)]
pub struct Id3Tag {
    pub pts: u64,
    pub dts: u64,
    pub frames: Vec<Id3Frame>,
    /// Seconds on the media timeline, stamped by the coalescer.
    pub cue_time: Option<f64>,
}

/// Decode a syncsafe (7 bits per byte) 32-bit integer.
fn syncsafe_u32(bytes: &[u8]) -> u32 {
    ((bytes[0] as u32 & 0x7F) << 21)
        | ((bytes[1] as u32 & 0x7F) << 14)
        | ((bytes[2] as u32 & 0x7F) << 7)
        | (bytes[3] as u32 & 0x7F)
}

/// Read a null-terminated string, returning it and the remaining bytes.
fn read_cstring(data: &[u8]) -> (String, &[u8]) {
    match data.iter().position(|&b| b == 0) {
        Some(end) => (
            String::from_utf8_lossy(&data[..end]).into_owned(),
            &data[end + 1..],
        ),
        None => (String::from_utf8_lossy(data).into_owned(), &[]),
    }
}

/// Strip an optional ID3v2.4 text-encoding byte (UTF-8 / Latin-1 only).
fn text_body(data: &[u8]) -> &[u8] {
    match data.first() {
        Some(0x00 | 0x03) => &data[1..],
        _ => data,
    }
}

fn parse_frame(id: &str, body: &[u8]) -> Id3Frame {
    let data = Bytes::copy_from_slice(body);
    match id {
        "TXXX" => {
            let (description, rest) = read_cstring(text_body(body));
            Id3Frame {
                id: id.to_string(),
                description: Some(description),
                value: Some(String::from_utf8_lossy(rest).into_owned()),
                owner: None,
                data,
            }
        }
        "WXXX" => {
            let (description, rest) = read_cstring(text_body(body));
            Id3Frame {
                id: id.to_string(),
                description: Some(description),
                value: Some(String::from_utf8_lossy(rest).into_owned()),
                owner: None,
                data,
            }
        }
        "PRIV" => {
            let (owner, _) = read_cstring(body);
            Id3Frame {
                id: id.to_string(),
                description: None,
                value: None,
                owner: Some(owner),
                data,
            }
        }
        _ if id.starts_with('T') => Id3Frame {
            id: id.to_string(),
            description: None,
            value: Some(String::from_utf8_lossy(text_body(body)).into_owned()),
            owner: None,
            data,
        },
        _ if id.starts_with('W') => Id3Frame {
            id: id.to_string(),
            description: None,
            value: Some(String::from_utf8_lossy(body).into_owned()),
            owner: None,
            data,
        },
        _ => Id3Frame {
            id: id.to_string(),
            description: None,
            value: None,
            owner: None,
            data,
        },
    }
}

/// Parse a complete ID3v2 tag. Returns `None` when the magic is absent.
fn parse_id3(data: &[u8]) -> Option<Vec<Id3Frame>> {
    if data.len() < 10 || &data[0..3] != b"ID3" {
        return None;
    }
    let flags = data[5];
    let size = syncsafe_u32(&data[6..10]) as usize;
    let mut offset = 10;
    // An extended header precedes the frames when flagged.
    if flags & 0x40 != 0 {
        if data.len() < offset + 4 {
            return None;
        }
        offset += syncsafe_u32(&data[offset..offset + 4]) as usize;
    }
    let tag_end = (10 + size).min(data.len());

    let mut frames = Vec::new();
    while offset + 10 <= tag_end {
        let id = &data[offset..offset + 4];
        if id.iter().all(|&b| b == 0) {
            break; // padding
        }
        let frame_size = syncsafe_u32(&data[offset + 4..offset + 8]) as usize;
        let body_start = offset + 10;
        let body_end = body_start + frame_size;
        if body_end > tag_end {
            break;
        }
        let id = String::from_utf8_lossy(id).into_owned();
        frames.push(parse_frame(&id, &data[body_start..body_end]));
        offset = body_end;
    }

    Some(frames)
}

/// Timed-metadata stage: private PES packets in, ID3 tags out.
pub struct MetadataStream {
    context: Arc<StreamerContext>,
}

impl MetadataStream {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self { context }
    }
}

impl Stage for MetadataStream {
    type In = PesPacket;
    type Out = Id3Tag;

    fn push(&mut self, input: PesPacket, out: &mut Vec<Id3Tag>) -> Result<(), PipelineError> {
        let (Some(pts), Some(dts)) = (input.pts, input.dts) else {
            // Metadata without a timestamp cannot be cued.
            return Ok(());
        };
        match parse_id3(&input.data) {
            Some(frames) if !frames.is_empty() => out.push(Id3Tag {
                pts,
                dts,
                frames,
                cue_time: None,
            }),
            Some(_) => {}
            None => debug!(
                "{} timed-metadata PES without ID3 magic dropped",
                self.context.name
            ),
        }
        Ok(())
    }

    fn flush(&mut self, _out: &mut Vec<Id3Tag>) -> Result<(), PipelineError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "MetadataStream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::test_utils::create_test_context;
    use ts::psi::PidRole;

    fn syncsafe(value: u32) -> [u8; 4] {
        [
            ((value >> 21) & 0x7F) as u8,
            ((value >> 14) & 0x7F) as u8,
            ((value >> 7) & 0x7F) as u8,
            (value & 0x7F) as u8,
        ]
    }

    /// Build an ID3v2.4 tag holding the given (id, body) frames.
    pub(crate) fn id3_tag(frames: &[(&str, &[u8])]) -> Vec<u8> {
        let mut body = Vec::new();
        for (id, frame_body) in frames {
            body.extend_from_slice(id.as_bytes());
            body.extend_from_slice(&syncsafe(frame_body.len() as u32));
            body.extend_from_slice(&[0, 0]); // frame flags
            body.extend_from_slice(frame_body);
        }
        let mut tag = Vec::new();
        tag.extend_from_slice(b"ID3");
        tag.extend_from_slice(&[0x04, 0x00, 0x00]); // version 2.4, no flags
        tag.extend_from_slice(&syncsafe(body.len() as u32));
        tag.extend_from_slice(&body);
        tag
    }

    fn pes(data: Vec<u8>, pts: Option<u64>) -> PesPacket {
        PesPacket {
            pid: 0x102,
            role: PidRole::TimedMetadata,
            stream_type: 0x15,
            pts,
            dts: pts,
            data_alignment: false,
            packet_length: 0,
            data: data.into(),
        }
    }

    #[test]
    fn test_txxx_frame() {
        let mut stream = MetadataStream::new(create_test_context());
        let mut out = Vec::new();
        let mut body = vec![0x03]; // UTF-8 encoding
        body.extend_from_slice(b"com.example.key\0");
        body.extend_from_slice(b"payload");
        let tag = id3_tag(&[("TXXX", &body)]);
        stream.push(pes(tag, Some(123_456)), &mut out).unwrap();

        assert_eq!(out.len(), 1);
        assert_eq!(out[0].pts, 123_456);
        let frame = &out[0].frames[0];
        assert_eq!(frame.id, "TXXX");
        assert_eq!(frame.description.as_deref(), Some("com.example.key"));
        assert_eq!(frame.value.as_deref(), Some("payload"));
    }

    #[test]
    fn test_priv_frame() {
        let mut stream = MetadataStream::new(create_test_context());
        let mut out = Vec::new();
        let mut body = Vec::new();
        body.extend_from_slice(b"com.apple.streaming.transportStreamTimestamp\0");
        body.extend_from_slice(&[0, 0, 0, 0, 0, 1, 0x86, 0xA0]);
        let tag = id3_tag(&[("PRIV", &body)]);
        stream.push(pes(tag, Some(0)), &mut out).unwrap();

        let frame = &out[0].frames[0];
        assert_eq!(frame.id, "PRIV");
        assert_eq!(
            frame.owner.as_deref(),
            Some("com.apple.streaming.transportStreamTimestamp")
        );
    }

    #[test]
    fn test_multiple_frames_one_tag() {
        let mut stream = MetadataStream::new(create_test_context());
        let mut out = Vec::new();
        let tag = id3_tag(&[("TIT2", b"\x03title"), ("WOAF", b"https://a.example")]);
        stream.push(pes(tag, Some(1)), &mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].frames.len(), 2);
        assert_eq!(out[0].frames[0].value.as_deref(), Some("title"));
        assert_eq!(out[0].frames[1].value.as_deref(), Some("https://a.example"));
    }

    #[test]
    fn test_not_id3_dropped() {
        let mut stream = MetadataStream::new(create_test_context());
        let mut out = Vec::new();
        stream
            .push(pes(b"garbage".to_vec(), Some(0)), &mut out)
            .unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_missing_timestamp_dropped() {
        let mut stream = MetadataStream::new(create_test_context());
        let mut out = Vec::new();
        let tag = id3_tag(&[("TIT2", b"\x03x")]);
        stream.push(pes(tag, None), &mut out).unwrap();
        assert!(out.is_empty());
    }
}
