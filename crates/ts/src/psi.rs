//! PAT/PMT section parsing and the program map
//!
//! The program map is the routing table of the demuxer: it assigns each
//! elementary PID a single role. A PMT update replaces the whole map
//! atomically; there is never a partial merge.

use bytes::Bytes;
use rustc_hash::FxHashMap;

use crate::descriptor::{
    DescriptorIterator, TAG_ISO_639_LANGUAGE, TAG_SUBTITLING, TAG_TELETEXT,
    parse_iso639_language, parse_subtitling_language, parse_teletext_language,
};

/// H.264 / AVC elementary stream
pub const STREAM_TYPE_H264: u8 = 0x1B;
/// AAC in ADTS framing
pub const STREAM_TYPE_ADTS: u8 = 0x0F;
/// Timed metadata (ID3) carried in PES
pub const STREAM_TYPE_METADATA: u8 = 0x15;
/// PES private data (DVB subtitles, teletext)
pub const STREAM_TYPE_PRIVATE: u8 = 0x06;

/// Elementary stream type, as carried in the PMT stream loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamType(pub u8);

impl StreamType {
    /// Video-family stream types per the ITU-T H.222.0 / ATSC assignment.
    pub fn is_video_family(self) -> bool {
        matches!(
            self.0,
            0x01 | 0x02 | 0x10 | 0x1B | 0x20 | 0x24 | 0x42 | 0xD1 | 0xEA
        )
    }

    /// Audio-family stream types per the ITU-T H.222.0 / ATSC assignment.
    pub fn is_audio_family(self) -> bool {
        matches!(self.0, 0x03 | 0x04 | 0x0F | 0x11 | 0x1C | 0x81 | 0x87 | 0x8A)
    }

    pub fn is_h264(self) -> bool {
        self.0 == STREAM_TYPE_H264
    }

    pub fn is_adts(self) -> bool {
        self.0 == STREAM_TYPE_ADTS
    }
}

/// Descriptor tags that mark an elementary stream as audio even when the
/// stream type alone is ambiguous (AC-3/E-AC-3/DTS/AAC descriptors).
fn descriptor_marks_audio(tag: u8) -> bool {
    matches!(tag, 0x6A | 0x7A | 0x7B | 0x7C)
}

/// Descriptor tags that mark an elementary stream as video (AVC/HEVC video
/// descriptors).
fn descriptor_marks_video(tag: u8) -> bool {
    matches!(tag, 0x28 | 0x38)
}

/// Role a PID plays in the demuxed program. A PID has at most one role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PidRole {
    Video,
    Audio,
    TimedMetadata,
    PrivateData,
}

/// Kind of private-data stream advertised by PMT descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubtitleKind {
    DvbSubtitle,
    Teletext,
}

/// One advertised audio elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioEntry {
    pub pid: u16,
    pub stream_type: u8,
    /// ISO 639 language codes from the descriptor loop, in descriptor order.
    pub languages: Vec<String>,
}

/// One advertised private-data elementary stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrivateDataEntry {
    pub pid: u16,
    pub kind: SubtitleKind,
    pub language: Option<String>,
}

/// The demuxer's routing table, produced whole by each accepted PMT.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramMap {
    /// The unique video PID (first video stream in descriptor order).
    pub video_pid: Option<u16>,
    pub video_stream_type: u8,
    /// Advertised audio streams, in descriptor order.
    pub audio: Vec<AudioEntry>,
    /// Timed-metadata PIDs with their stream types.
    pub timed_metadata: Vec<(u16, u8)>,
    /// Private-data streams (DVB subtitles / teletext), advertised only.
    pub private_data: Vec<PrivateDataEntry>,
    /// PID → (role, stream_type) lookup covering every entry above.
    roles: FxHashMap<u16, (PidRole, u8)>,
}

impl ProgramMap {
    pub fn role_of(&self, pid: u16) -> Option<PidRole> {
        self.roles.get(&pid).map(|&(role, _)| role)
    }

    pub fn entry_of(&self, pid: u16) -> Option<(PidRole, u8)> {
        self.roles.get(&pid).copied()
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty()
    }

    /// Lowest advertised audio PID, the default coalescer selection.
    pub fn default_audio_pid(&self) -> Option<u16> {
        self.audio.iter().map(|a| a.pid).min()
    }

    fn assign(&mut self, pid: u16, role: PidRole, stream_type: u8) -> bool {
        // First role wins; a PID never carries two roles.
        if self.roles.contains_key(&pid) {
            return false;
        }
        self.roles.insert(pid, (role, stream_type));
        true
    }
}

/// Parse a PAT section (after the PSI pointer field) and return the first
/// program's PMT PID.
pub fn parse_pat(payload: &[u8]) -> Option<u16> {
    if payload.len() < 12 || payload[0] != 0x00 {
        return None;
    }
    // current_next_indicator: a "next" PAT is not yet applicable
    if payload[5] & 0x01 == 0 {
        return None;
    }
    Some(((payload[10] as u16 & 0x1F) << 8) | payload[11] as u16)
}

/// Parse a PMT section (after the PSI pointer field) into a [`ProgramMap`].
///
/// Returns `None` for sections that are not applicable
/// (`current_next_indicator == 0`) or structurally impossible; both are
/// dropped silently per the recoverable-input policy.
pub fn parse_pmt(payload: &[u8], broad_stream_detection: bool) -> Option<ProgramMap> {
    if payload.len() < 12 || payload[0] != 0x02 {
        return None;
    }
    if payload[5] & 0x01 == 0 {
        return None;
    }

    let section_length = ((payload[1] as usize & 0x0F) << 8) | payload[2] as usize;
    // The CRC_32 occupies the last four bytes of the section.
    let table_end = (3 + section_length).checked_sub(4)?;
    if table_end > payload.len() {
        return None;
    }

    let program_info_length = ((payload[10] as usize & 0x0F) << 8) | payload[11] as usize;
    let mut offset = 12 + program_info_length;

    let mut map = ProgramMap::default();

    while offset + 5 <= table_end {
        let stream_type = StreamType(payload[offset]);
        let pid = ((payload[offset + 1] as u16 & 0x1F) << 8) | payload[offset + 2] as u16;
        let es_info_length = ((payload[offset + 3] as usize & 0x0F) << 8) | payload[offset + 4] as usize;
        let descriptor_end = offset + 5 + es_info_length;
        if descriptor_end > table_end {
            // Impossible descriptor length; discard the whole section.
            return None;
        }
        let descriptors: Vec<_> = DescriptorIterator::new(Bytes::copy_from_slice(
            &payload[offset + 5..descriptor_end],
        ))
        .collect();

        let is_video = if broad_stream_detection {
            stream_type.is_video_family()
                || descriptors.iter().any(|d| descriptor_marks_video(d.tag))
        } else {
            stream_type.is_h264()
        };
        let is_audio = if broad_stream_detection {
            stream_type.is_audio_family()
                || descriptors.iter().any(|d| descriptor_marks_audio(d.tag))
        } else {
            stream_type.is_adts()
        };

        if is_video {
            // Only the first video stream becomes the program's video PID.
            if map.video_pid.is_none() && map.assign(pid, PidRole::Video, stream_type.0) {
                map.video_pid = Some(pid);
                map.video_stream_type = stream_type.0;
            }
        } else if is_audio {
            if map.assign(pid, PidRole::Audio, stream_type.0) {
                let languages = descriptors
                    .iter()
                    .filter(|d| d.tag == TAG_ISO_639_LANGUAGE)
                    .flat_map(|d| parse_iso639_language(&d.data))
                    .map(|entry| String::from_utf8_lossy(&entry.language_code).into_owned())
                    .collect();
                map.audio.push(AudioEntry {
                    pid,
                    stream_type: stream_type.0,
                    languages,
                });
            }
        } else if stream_type.0 == STREAM_TYPE_METADATA {
            if map.assign(pid, PidRole::TimedMetadata, stream_type.0) {
                map.timed_metadata.push((pid, stream_type.0));
            }
        } else if stream_type.0 == STREAM_TYPE_PRIVATE {
            let subtitle = descriptors.iter().find_map(|d| match d.tag {
                TAG_SUBTITLING => Some((SubtitleKind::DvbSubtitle, parse_subtitling_language(&d.data))),
                TAG_TELETEXT => Some((SubtitleKind::Teletext, parse_teletext_language(&d.data))),
                _ => None,
            });
            if let Some((kind, language)) = subtitle
                && map.assign(pid, PidRole::PrivateData, stream_type.0)
            {
                map.private_data.push(PrivateDataEntry {
                    pid,
                    kind,
                    language: language.map(|l| String::from_utf8_lossy(&l).into_owned()),
                });
            }
        }

        offset = descriptor_end;
    }

    Some(map)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Build a PMT section with the given `(stream_type, pid, descriptors)` loop.
    pub(crate) fn build_pmt(streams: &[(u8, u16, &[u8])]) -> Vec<u8> {
        let es_loop: Vec<u8> = streams
            .iter()
            .flat_map(|&(stream_type, pid, descriptors)| {
                let mut entry = vec![
                    stream_type,
                    0xE0 | (pid >> 8) as u8,
                    pid as u8,
                    0xF0 | (descriptors.len() >> 8) as u8,
                    descriptors.len() as u8,
                ];
                entry.extend_from_slice(descriptors);
                entry
            })
            .collect();

        // section_length counts from after its own field through the CRC
        let section_length = 9 + es_loop.len() + 4;
        let mut section = vec![
            0x02,
            0xB0 | (section_length >> 8) as u8,
            section_length as u8,
            0x00,
            0x01, // program_number
            0xC1, // version 0, current_next = 1
            0x00,
            0x00,
            0xE1,
            0x00, // PCR PID
            0xF0,
            0x00, // program_info_length = 0
        ];
        section.extend_from_slice(&es_loop);
        section.extend_from_slice(&[0, 0, 0, 0]); // CRC placeholder
        section
    }

    #[test]
    fn test_parse_pat() {
        let pat = [
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC1, 0x00, 0x00, // header
            0x00, 0x01, // program_number 1
            0xE1, 0x00, // PMT PID 0x100
            0, 0, 0, 0, // CRC
        ];
        assert_eq!(parse_pat(&pat), Some(0x100));
    }

    #[test]
    fn test_parse_pat_not_current() {
        let mut pat = [
            0x00, 0xB0, 0x0D, 0x00, 0x01, 0xC0, 0x00, 0x00, 0x00, 0x01, 0xE1, 0x00, 0, 0, 0, 0,
        ];
        assert_eq!(parse_pat(&pat), None);
        pat[5] = 0xC1;
        assert_eq!(parse_pat(&pat), Some(0x100));
    }

    #[test]
    fn test_parse_pmt_roles() {
        let lang: &[u8] = &[0x0A, 0x04, b'e', b'n', b'g', 0x00];
        let section = build_pmt(&[
            (STREAM_TYPE_H264, 0x100, &[]),
            (STREAM_TYPE_ADTS, 0x101, lang),
            (STREAM_TYPE_METADATA, 0x102, &[]),
        ]);
        let map = parse_pmt(&section, false).unwrap();
        assert_eq!(map.video_pid, Some(0x100));
        assert_eq!(map.audio.len(), 1);
        assert_eq!(map.audio[0].pid, 0x101);
        assert_eq!(map.audio[0].languages, vec!["eng"]);
        assert_eq!(map.timed_metadata, vec![(0x102, STREAM_TYPE_METADATA)]);
        assert_eq!(map.role_of(0x100), Some(PidRole::Video));
        assert_eq!(map.role_of(0x101), Some(PidRole::Audio));
        assert_eq!(map.role_of(0x102), Some(PidRole::TimedMetadata));
        assert_eq!(map.role_of(0x103), None);
    }

    #[test]
    fn test_parse_pmt_first_video_wins() {
        let section = build_pmt(&[
            (STREAM_TYPE_H264, 0x100, &[]),
            (STREAM_TYPE_H264, 0x105, &[]),
        ]);
        let map = parse_pmt(&section, false).unwrap();
        assert_eq!(map.video_pid, Some(0x100));
        assert_eq!(map.role_of(0x105), None);
    }

    #[test]
    fn test_parse_pmt_not_current_ignored() {
        let mut section = build_pmt(&[(STREAM_TYPE_H264, 0x100, &[])]);
        section[5] = 0xC0; // current_next_indicator = 0
        assert!(parse_pmt(&section, false).is_none());
    }

    #[test]
    fn test_parse_pmt_broad_mode() {
        let section = build_pmt(&[
            (0x24, 0x100, &[]), // HEVC
            (0x81, 0x101, &[]), // AC-3
        ]);
        let strict = parse_pmt(&section, false).unwrap();
        assert_eq!(strict.video_pid, None);
        assert!(strict.audio.is_empty());

        let broad = parse_pmt(&section, true).unwrap();
        assert_eq!(broad.video_pid, Some(0x100));
        assert_eq!(broad.video_stream_type, 0x24);
        assert_eq!(broad.audio[0].pid, 0x101);
    }

    #[test]
    fn test_parse_pmt_subtitles() {
        let sub: &[u8] = &[0x59, 0x08, b'd', b'e', b'u', 0x10, 0x00, 0x01, 0x00, 0x02];
        let section = build_pmt(&[(STREAM_TYPE_PRIVATE, 0x103, sub)]);
        let map = parse_pmt(&section, false).unwrap();
        assert_eq!(map.private_data.len(), 1);
        assert_eq!(map.private_data[0].kind, SubtitleKind::DvbSubtitle);
        assert_eq!(map.private_data[0].language.as_deref(), Some("deu"));
        assert_eq!(map.role_of(0x103), Some(PidRole::PrivateData));
    }

    #[test]
    fn test_parse_pmt_impossible_descriptor_length() {
        let mut section = build_pmt(&[(STREAM_TYPE_H264, 0x100, &[])]);
        // Stream loop starts at byte 12: corrupt es_info_length upward.
        section[12 + 3] = 0xFF;
        section[12 + 4] = 0xFF;
        assert!(parse_pmt(&section, false).is_none());
    }
}
