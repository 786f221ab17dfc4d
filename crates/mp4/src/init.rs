//! Init segment generation: `ftyp` + `moov`
//!
//! One init segment covers every track the coalescer advertises; each track
//! contributes a `trak` (sample description with `avcC` or `esds`) and a
//! `trex` default entry under `mvex`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::writer::{write_box, write_full_box};

/// Movie timescale, the 90 kHz transport clock.
const MOVIE_TIMESCALE: u32 = 90_000;

/// Sampling frequencies by MPEG-4 sampling_frequency_index.
const SAMPLING_FREQUENCIES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

/// Codec-specific track parameters for the init segment.
#[derive(Debug, Clone)]
pub enum TrackKind {
    Video {
        width: u16,
        height: u16,
        sps: Vec<Bytes>,
        pps: Vec<Bytes>,
        profile_idc: u8,
        profile_compatibility: u8,
        level_idc: u8,
        /// Pixel aspect ratio; a `pasp` box is written when not square.
        sar_ratio: (u16, u16),
    },
    Audio {
        samplerate: u32,
        channelcount: u8,
        samplesize: u16,
        /// MPEG-4 audio object type (2 = AAC-LC).
        audioobjecttype: u8,
    },
}

/// One track of an init segment.
#[derive(Debug, Clone)]
pub struct InitTrack {
    pub id: u32,
    /// Media timescale: 90 000 for video, the samplerate for audio.
    pub timescale: u32,
    pub kind: TrackKind,
}

impl InitTrack {
    fn is_video(&self) -> bool {
        matches!(self.kind, TrackKind::Video { .. })
    }
}

/// Generate a complete init segment (`ftyp` + `moov`) for the given tracks.
pub fn init_segment(tracks: &[InitTrack]) -> Bytes {
    let mut out = BytesMut::new();
    write_ftyp(&mut out);
    write_box(&mut out, b"moov", |out| {
        write_mvhd(out);
        for track in tracks {
            write_trak(out, track);
        }
        write_box(out, b"mvex", |out| {
            for track in tracks {
                write_trex(out, track.id);
            }
        });
    });
    out.freeze()
}

fn write_ftyp(out: &mut BytesMut) {
    write_box(out, b"ftyp", |out| {
        out.extend_from_slice(b"isom"); // major_brand
        out.put_u32(1); // minor_version
        out.extend_from_slice(b"isom");
        out.extend_from_slice(b"avc1");
    });
}

fn write_mvhd(out: &mut BytesMut) {
    write_full_box(out, b"mvhd", 0, 0, |out| {
        out.put_u32(0); // creation_time
        out.put_u32(0); // modification_time
        out.put_u32(MOVIE_TIMESCALE);
        out.put_u32(0xFFFF_FFFF); // duration: unknown for live content
        out.put_u32(0x0001_0000); // rate 1.0
        out.put_u16(0x0100); // volume 1.0
        out.put_u16(0); // reserved
        out.put_u64(0); // reserved
        write_unity_matrix(out);
        out.extend_from_slice(&[0u8; 24]); // pre_defined
        out.put_u32(0xFFFF_FFFF); // next_track_ID
    });
}

fn write_unity_matrix(out: &mut BytesMut) {
    const MATRIX: [u32; 9] = [
        0x0001_0000, 0, 0, //
        0, 0x0001_0000, 0, //
        0, 0, 0x4000_0000,
    ];
    for value in MATRIX {
        out.put_u32(value);
    }
}

fn write_trak(out: &mut BytesMut, track: &InitTrack) {
    write_box(out, b"trak", |out| {
        write_tkhd(out, track);
        write_mdia(out, track);
    });
}

fn write_tkhd(out: &mut BytesMut, track: &InitTrack) {
    // flags: track_enabled | track_in_movie | track_in_preview
    write_full_box(out, b"tkhd", 0, 0x000007, |out| {
        out.put_u32(0); // creation_time
        out.put_u32(0); // modification_time
        out.put_u32(track.id);
        out.put_u32(0); // reserved
        out.put_u32(0); // duration
        out.put_u64(0); // reserved
        out.put_u16(0); // layer
        out.put_u16(0); // alternate_group
        out.put_u16(if track.is_video() { 0 } else { 0x0100 }); // volume
        out.put_u16(0); // reserved
        write_unity_matrix(out);
        match &track.kind {
            TrackKind::Video { width, height, .. } => {
                out.put_u32((*width as u32) << 16);
                out.put_u32((*height as u32) << 16);
            }
            TrackKind::Audio { .. } => {
                out.put_u32(0);
                out.put_u32(0);
            }
        }
    });
}

fn write_mdia(out: &mut BytesMut, track: &InitTrack) {
    write_box(out, b"mdia", |out| {
        write_full_box(out, b"mdhd", 0, 0, |out| {
            out.put_u32(0); // creation_time
            out.put_u32(0); // modification_time
            out.put_u32(track.timescale);
            out.put_u32(0); // duration
            out.put_u16(0x55C4); // language: und
            out.put_u16(0); // pre_defined
        });
        write_hdlr(out, track.is_video());
        write_box(out, b"minf", |out| {
            if track.is_video() {
                write_full_box(out, b"vmhd", 0, 0x000001, |out| {
                    out.put_u64(0); // graphicsmode + opcolor
                });
            } else {
                write_full_box(out, b"smhd", 0, 0, |out| {
                    out.put_u32(0); // balance + reserved
                });
            }
            write_dinf(out);
            write_stbl(out, track);
        });
    });
}

fn write_hdlr(out: &mut BytesMut, is_video: bool) {
    write_full_box(out, b"hdlr", 0, 0, |out| {
        out.put_u32(0); // pre_defined
        out.extend_from_slice(if is_video { b"vide" } else { b"soun" });
        out.extend_from_slice(&[0u8; 12]); // reserved
        out.extend_from_slice(if is_video {
            b"VideoHandler\0"
        } else {
            b"SoundHandler\0"
        });
    });
}

fn write_dinf(out: &mut BytesMut) {
    write_box(out, b"dinf", |out| {
        write_full_box(out, b"dref", 0, 0, |out| {
            out.put_u32(1); // entry_count
            // Self-contained data reference
            write_full_box(out, b"url ", 0, 0x000001, |_| {});
        });
    });
}

fn write_stbl(out: &mut BytesMut, track: &InitTrack) {
    write_box(out, b"stbl", |out| {
        write_full_box(out, b"stsd", 0, 0, |out| {
            out.put_u32(1); // entry_count
            match &track.kind {
                TrackKind::Video { .. } => write_avc1(out, track),
                TrackKind::Audio { .. } => write_mp4a(out, track),
            }
        });
        // Fragmented files keep their sample tables in the fragments.
        write_full_box(out, b"stts", 0, 0, |out| out.put_u32(0));
        write_full_box(out, b"stsc", 0, 0, |out| out.put_u32(0));
        write_full_box(out, b"stsz", 0, 0, |out| {
            out.put_u32(0); // sample_size
            out.put_u32(0); // sample_count
        });
        write_full_box(out, b"stco", 0, 0, |out| out.put_u32(0));
    });
}

fn write_avc1(out: &mut BytesMut, track: &InitTrack) {
    let TrackKind::Video {
        width,
        height,
        sps,
        pps,
        profile_idc,
        profile_compatibility,
        level_idc,
        sar_ratio,
    } = &track.kind
    else {
        return;
    };

    write_box(out, b"avc1", |out| {
        out.extend_from_slice(&[0u8; 6]); // reserved
        out.put_u16(1); // data_reference_index
        out.put_u16(0); // pre_defined
        out.put_u16(0); // reserved
        out.extend_from_slice(&[0u8; 12]); // pre_defined
        out.put_u16(*width);
        out.put_u16(*height);
        out.put_u32(0x0048_0000); // horizresolution: 72 dpi
        out.put_u32(0x0048_0000); // vertresolution
        out.put_u32(0); // reserved
        out.put_u16(1); // frame_count
        out.extend_from_slice(&[0u8; 32]); // compressorname
        out.put_u16(0x0018); // depth
        out.put_u16(0xFFFF); // pre_defined = -1

        write_box(out, b"avcC", |out| {
            out.put_u8(1); // configurationVersion
            out.put_u8(*profile_idc);
            out.put_u8(*profile_compatibility);
            out.put_u8(*level_idc);
            out.put_u8(0xFF); // lengthSizeMinusOne = 3
            out.put_u8(0xE0 | (sps.len() as u8 & 0x1F));
            for nal in sps {
                out.put_u16(nal.len() as u16);
                out.extend_from_slice(nal);
            }
            out.put_u8(pps.len() as u8);
            for nal in pps {
                out.put_u16(nal.len() as u16);
                out.extend_from_slice(nal);
            }
        });

        if *sar_ratio != (1, 1) {
            write_box(out, b"pasp", |out| {
                out.put_u32(sar_ratio.0 as u32);
                out.put_u32(sar_ratio.1 as u32);
            });
        }
    });
}

fn write_mp4a(out: &mut BytesMut, track: &InitTrack) {
    let TrackKind::Audio {
        samplerate,
        channelcount,
        samplesize,
        audioobjecttype,
    } = &track.kind
    else {
        return;
    };

    write_box(out, b"mp4a", |out| {
        out.extend_from_slice(&[0u8; 6]); // reserved
        out.put_u16(1); // data_reference_index
        out.put_u64(0); // version + revision + vendor
        out.put_u16(*channelcount as u16);
        out.put_u16(*samplesize);
        out.put_u32(0); // pre_defined + reserved
        // 16.16 fixed point; the integer part is 16 bits on the wire, the
        // mdhd timescale carries the authoritative rate.
        out.put_u32((*samplerate & 0xFFFF) << 16);

        write_esds(out, *samplerate, *channelcount, *audioobjecttype);
    });
}

fn write_esds(out: &mut BytesMut, samplerate: u32, channelcount: u8, audioobjecttype: u8) {
    let frequency_index = SAMPLING_FREQUENCIES
        .iter()
        .position(|&rate| rate == samplerate)
        .unwrap_or(4) as u8; // default to 44.1 kHz when off-table

    // AudioSpecificConfig: 5 bits object type, 4 bits frequency, 4 bits channels
    let asc: u16 = ((audioobjecttype as u16) << 11)
        | ((frequency_index as u16) << 7)
        | ((channelcount as u16) << 3);

    write_full_box(out, b"esds", 0, 0, |out| {
        // ES_Descriptor
        out.extend_from_slice(&[0x03, 0x19, 0x00, 0x00, 0x00]);
        // DecoderConfigDescriptor: Audio ISO/IEC 14496-3, MainStream
        out.extend_from_slice(&[0x04, 0x11, 0x40, 0x15]);
        out.extend_from_slice(&[0x00, 0x00, 0x00]); // bufferSizeDB
        out.put_u32(0); // maxBitrate
        out.put_u32(0); // avgBitrate
        // DecoderSpecificInfo
        out.put_u8(0x05);
        out.put_u8(0x02);
        out.put_u16(asc);
        // SLConfigDescriptor
        out.extend_from_slice(&[0x06, 0x01, 0x02]);
    });
}

fn write_trex(out: &mut BytesMut, track_id: u32) {
    write_full_box(out, b"trex", 0, 0, |out| {
        out.put_u32(track_id);
        out.put_u32(1); // default_sample_description_index
        out.put_u32(0); // default_sample_duration
        out.put_u32(0); // default_sample_size
        out.put_u32(0x0001_0001); // default_sample_flags
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{find_box, find_box_path};

    pub(crate) fn video_track(id: u32) -> InitTrack {
        InitTrack {
            id,
            timescale: 90_000,
            kind: TrackKind::Video {
                width: 320,
                height: 240,
                sps: vec![Bytes::from_static(&[0x67, 0x42, 0xC0, 0x1E])],
                pps: vec![Bytes::from_static(&[0x68, 0xCE, 0x3C, 0x80])],
                profile_idc: 66,
                profile_compatibility: 0xC0,
                level_idc: 30,
                sar_ratio: (1, 1),
            },
        }
    }

    pub(crate) fn audio_track(id: u32) -> InitTrack {
        InitTrack {
            id,
            timescale: 44_100,
            kind: TrackKind::Audio {
                samplerate: 44_100,
                channelcount: 2,
                samplesize: 16,
                audioobjecttype: 2,
            },
        }
    }

    #[test]
    fn test_init_segment_structure() {
        let init = init_segment(&[video_track(1), audio_track(2)]);
        assert!(find_box(&init, b"ftyp").is_some());
        let moov = find_box(&init, b"moov").unwrap();
        assert_eq!(moov.fourcc, *b"moov");

        // Two traks, one mvex with two trex entries
        let avcc = find_box_path(&init, &[b"moov", b"trak", b"mdia", b"minf", b"stbl"]);
        assert!(avcc.is_some());
        let mvex = find_box_path(&init, &[b"moov", b"mvex", b"trex"]).unwrap();
        let body = &init[mvex.body_start..mvex.body_end];
        // trex full box: version/flags then track_ID
        assert_eq!(u32::from_be_bytes([body[4], body[5], body[6], body[7]]), 1);
    }

    #[test]
    fn test_avcc_carries_parameter_sets() {
        let init = init_segment(&[video_track(1)]);
        let stsd = find_box_path(
            &init,
            &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
        )
        .unwrap();
        // avc1 entry begins after the stsd full-box header + entry_count
        let avc1_start = stsd.body_start + 8;
        let avc1 = crate::reader::box_at(&init, avc1_start, stsd.body_end).unwrap();
        assert_eq!(avc1.fourcc, *b"avc1");
        let avcc = find_box_in(&init, avc1.body_start + 78, avc1.body_end);
        let avcc = avcc.expect("avcC present");
        assert_eq!(avcc.fourcc, *b"avcC");
        let body = &init[avcc.body_start..avcc.body_end];
        assert_eq!(body[0], 1); // configurationVersion
        assert_eq!(body[1], 66); // profile
        assert_eq!(body[3], 30); // level
        assert_eq!(body[4], 0xFF);
        assert_eq!(body[5] & 0x1F, 1); // one SPS
    }

    fn find_box_in(data: &Bytes, start: usize, end: usize) -> Option<crate::reader::BoxView> {
        crate::reader::box_at(data, start, end)
    }

    #[test]
    fn test_esds_audio_specific_config() {
        let init = init_segment(&[audio_track(1)]);
        let stsd = find_box_path(
            &init,
            &[b"moov", b"trak", b"mdia", b"minf", b"stbl", b"stsd"],
        )
        .unwrap();
        let mp4a = crate::reader::box_at(&init, stsd.body_start + 8, stsd.body_end).unwrap();
        assert_eq!(mp4a.fourcc, *b"mp4a");
        let body = &init[mp4a.body_start..mp4a.body_end];
        // channelcount at offset 16, samplerate 16.16 at offset 24
        assert_eq!(u16::from_be_bytes([body[16], body[17]]), 2);
        assert_eq!(
            u32::from_be_bytes([body[24], body[25], body[26], body[27]]) >> 16,
            44_100
        );
        // ASC: AAC-LC (2), frequency index 4, 2 channels
        let esds = crate::reader::box_at(&init, mp4a.body_start + 28, mp4a.body_end).unwrap();
        // esds body: 4 bytes version/flags, then 22 descriptor bytes before
        // the two-byte AudioSpecificConfig.
        let esds_body = &init[esds.body_start..esds.body_end];
        let asc = u16::from_be_bytes([esds_body[26], esds_body[27]]);
        assert_eq!(asc >> 11, 2);
        assert_eq!((asc >> 7) & 0x0F, 4);
        assert_eq!((asc >> 3) & 0x0F, 2);
    }
}
