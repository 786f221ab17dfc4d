//! Media fragment generation: `moof` + `mdat`
//!
//! Each media segment carries one `moof` per track followed by that track's
//! `mdat`. The `trun` data offset is patched after the `moof` is complete so
//! it always lands on the first byte of the `mdat` payload.

use bytes::{BufMut, Bytes, BytesMut};

use crate::writer::{write_box, write_full_box};

/// Per-sample dependency and sync flags, as carried in `trun` and `sdtp`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SampleFlags {
    pub is_leading: u8,
    /// 1 = depends on others (non-keyframe), 2 = independent (keyframe).
    pub depends_on: u8,
    pub is_depended_on: u8,
    pub has_redundancy: u8,
    pub padding_value: u8,
    pub is_non_sync: bool,
    pub degradation_priority: u16,
}

impl SampleFlags {
    /// Flags for a sync sample (keyframe).
    pub fn sync() -> Self {
        SampleFlags {
            depends_on: 2,
            is_non_sync: false,
            ..Default::default()
        }
    }

    /// Flags for a dependent (non-sync) sample.
    pub fn non_sync() -> Self {
        SampleFlags {
            depends_on: 1,
            is_depended_on: 1,
            is_non_sync: true,
            ..Default::default()
        }
    }

    fn to_u32(self) -> u32 {
        ((self.is_leading as u32 & 0x03) << 26)
            | ((self.depends_on as u32 & 0x03) << 24)
            | ((self.is_depended_on as u32 & 0x03) << 22)
            | ((self.has_redundancy as u32 & 0x03) << 20)
            | ((self.padding_value as u32 & 0x07) << 17)
            | ((self.is_non_sync as u32) << 16)
            | self.degradation_priority as u32
    }
}

/// One sample row of the `trun`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub size: u32,
    /// Duration in the track timescale.
    pub duration: u32,
    /// Composition time offset (pts − dts) in the track timescale.
    pub composition_time_offset: i32,
    pub flags: SampleFlags,
}

/// Everything `moof` needs to describe one track's fragment.
#[derive(Debug, Clone)]
pub struct FragmentTrack {
    pub id: u32,
    pub base_media_decode_time: u64,
    pub samples: Vec<Sample>,
    /// Video truns carry per-sample flags and composition offsets plus an
    /// `sdtp`; audio truns carry only sizes and durations.
    pub is_video: bool,
}

/// Build a `moof` for one track fragment.
pub fn moof(sequence_number: u32, track: &FragmentTrack) -> Bytes {
    let mut out = BytesMut::new();
    let mut data_offset_pos = 0usize;

    write_box(&mut out, b"moof", |out| {
        write_full_box(out, b"mfhd", 0, 0, |out| {
            out.put_u32(sequence_number);
        });
        write_box(out, b"traf", |out| {
            write_tfhd(out, track.id);
            // tfdt version 1: 64-bit decode times survive rollover extension.
            write_full_box(out, b"tfdt", 1, 0, |out| {
                out.put_u64(track.base_media_decode_time);
            });
            data_offset_pos = write_trun(out, track);
            if track.is_video {
                write_sdtp(out, &track.samples);
            }
        });
    });

    // Point the run at the first byte after the upcoming mdat header.
    let data_offset = (out.len() + 8) as u32;
    out[data_offset_pos..data_offset_pos + 4].copy_from_slice(&data_offset.to_be_bytes());
    out.freeze()
}

/// Wrap a media payload in an `mdat`.
pub fn mdat(payload: Bytes) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 8);
    write_box(&mut out, b"mdat", |out| {
        out.extend_from_slice(&payload);
    });
    out.freeze()
}

fn write_tfhd(out: &mut BytesMut, track_id: u32) {
    // flags: sample-description-index + default duration/size/flags present
    write_full_box(out, b"tfhd", 0, 0x00003A, |out| {
        out.put_u32(track_id);
        out.put_u32(1); // sample_description_index
        out.put_u32(0); // default_sample_duration
        out.put_u32(0); // default_sample_size
        out.put_u32(0); // default_sample_flags
    });
}

/// Write the `trun`; returns the absolute position of its data-offset field
/// for later patching.
fn write_trun(out: &mut BytesMut, track: &FragmentTrack) -> usize {
    let flags = if track.is_video {
        // data-offset, duration, size, flags, composition-time-offset
        0x000F01
    } else {
        // data-offset, duration, size
        0x000301
    };
    let mut data_offset_pos = 0usize;
    write_full_box(out, b"trun", 0, flags, |out| {
        out.put_u32(track.samples.len() as u32);
        data_offset_pos = out.len();
        out.put_u32(0); // patched by the caller
        for sample in &track.samples {
            out.put_u32(sample.duration);
            out.put_u32(sample.size);
            if track.is_video {
                out.put_u32(sample.flags.to_u32());
                out.put_i32(sample.composition_time_offset);
            }
        }
    });
    data_offset_pos
}

fn write_sdtp(out: &mut BytesMut, samples: &[Sample]) {
    write_full_box(out, b"sdtp", 0, 0, |out| {
        for sample in samples {
            out.put_u8(
                (sample.flags.depends_on << 4)
                    | (sample.flags.is_depended_on << 2)
                    | sample.flags.has_redundancy,
            );
        }
    });
}
