//! H.264 Annex-B elementary stream parsing
//!
//! Splits PES payloads on start codes into NAL units, carrying partial
//! units across PES boundaries, classifies the unit types the segmenter
//! cares about, and decodes the active SPS into the track configuration
//! (profile, level, dimensions, pixel aspect ratio).

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use pipeline_common::{PipelineError, Stage, StreamerContext};
use tracing::debug;
use ts::PesPacket;

use crate::bits::BitReader;
use crate::{CodecError, Result};

/// NAL unit types the pipeline distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NalUnitType {
    /// slice_layer_without_partitioning_rbsp (non-IDR), type 1
    SliceNonIdr,
    /// slice_layer_without_partitioning_rbsp_idr, type 5
    SliceIdr,
    /// sei_rbsp, type 6
    Sei,
    /// seq_parameter_set_rbsp, type 7
    SeqParamSet,
    /// pic_parameter_set_rbsp, type 8
    PicParamSet,
    /// access_unit_delimiter_rbsp, type 9
    AccessUnitDelimiter,
    /// Anything else, carried through untyped
    Other(u8),
}

impl NalUnitType {
    fn from_header(byte: u8) -> Self {
        match byte & 0x1F {
            0x01 => NalUnitType::SliceNonIdr,
            0x05 => NalUnitType::SliceIdr,
            0x06 => NalUnitType::Sei,
            0x07 => NalUnitType::SeqParamSet,
            0x08 => NalUnitType::PicParamSet,
            0x09 => NalUnitType::AccessUnitDelimiter,
            other => NalUnitType::Other(other),
        }
    }
}

/// Track configuration decoded from an SPS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpsConfig {
    pub profile_idc: u8,
    pub profile_compatibility: u8,
    pub level_idc: u8,
    pub width: u32,
    pub height: u32,
    /// Pixel aspect ratio (width, height)
    pub sar_ratio: (u16, u16),
}

/// One NAL unit with the timestamps of the access unit it belongs to.
#[derive(Debug, Clone)]
pub struct NalUnit {
    pub nal_unit_type: NalUnitType,
    /// EBSP payload including the NAL header byte, without the start code.
    pub data: Bytes,
    pub pts: u64,
    pub dts: u64,
    /// Present on SPS units.
    pub config: Option<SpsConfig>,
}

impl NalUnit {
    pub fn is_aud(&self) -> bool {
        self.nal_unit_type == NalUnitType::AccessUnitDelimiter
    }

    pub fn is_idr(&self) -> bool {
        self.nal_unit_type == NalUnitType::SliceIdr
    }
}

/// Remove H.264 emulation-prevention bytes (0x000003 → 0x0000).
pub fn ebsp_to_rbsp(data: &[u8]) -> Vec<u8> {
    let mut rbsp = Vec::with_capacity(data.len());
    let mut zeros = 0usize;
    for &byte in data {
        if zeros >= 2 && byte == 0x03 {
            zeros = 0;
            continue;
        }
        if byte == 0x00 {
            zeros += 1;
        } else {
            zeros = 0;
        }
        rbsp.push(byte);
    }
    rbsp
}

/// Profiles that carry chroma/bit-depth/scaling fields before the
/// log2_max_frame_num field.
fn profile_has_chroma_info(profile_idc: u8) -> bool {
    matches!(
        profile_idc,
        100 | 110 | 122 | 244 | 44 | 83 | 86 | 118 | 128 | 138 | 139 | 134
    )
}

/// Pixel aspect ratios by aspect_ratio_idc (1..=16).
const SAR_TABLE: [(u16, u16); 16] = [
    (1, 1),
    (12, 11),
    (10, 11),
    (16, 11),
    (40, 33),
    (24, 11),
    (20, 11),
    (32, 11),
    (80, 33),
    (18, 11),
    (15, 11),
    (64, 33),
    (160, 99),
    (4, 3),
    (3, 2),
    (2, 1),
];

fn skip_scaling_list(reader: &mut BitReader, size: u32) -> Result<()> {
    let mut last_scale = 8i32;
    let mut next_scale = 8i32;
    for _ in 0..size {
        if next_scale != 0 {
            let delta = reader.read_se()?;
            next_scale = (last_scale + delta + 256) % 256;
        }
        if next_scale != 0 {
            last_scale = next_scale;
        }
    }
    Ok(())
}

/// Decode an SPS NAL (EBSP, including the NAL header byte) into a config.
pub fn parse_sps(data: &[u8]) -> Result<SpsConfig> {
    if data.len() < 4 {
        return Err(CodecError::Malformed {
            structure: "SPS",
            reason: "too short",
        });
    }
    let rbsp = ebsp_to_rbsp(&data[1..]);
    let mut reader = BitReader::new(&rbsp);

    let profile_idc = reader.read_bits(8)? as u8;
    let profile_compatibility = reader.read_bits(8)? as u8;
    let level_idc = reader.read_bits(8)? as u8;
    reader.read_ue()?; // seq_parameter_set_id

    if profile_has_chroma_info(profile_idc) {
        let chroma_format_idc = reader.read_ue()?;
        if chroma_format_idc == 3 {
            reader.skip_bits(1)?; // separate_colour_plane_flag
        }
        reader.read_ue()?; // bit_depth_luma_minus8
        reader.read_ue()?; // bit_depth_chroma_minus8
        reader.skip_bits(1)?; // qpprime_y_zero_transform_bypass_flag
        if reader.read_bit()? {
            // seq_scaling_matrix_present_flag
            let count = if chroma_format_idc == 3 { 12 } else { 8 };
            for i in 0..count {
                if reader.read_bit()? {
                    skip_scaling_list(&mut reader, if i < 6 { 16 } else { 64 })?;
                }
            }
        }
    }

    reader.read_ue()?; // log2_max_frame_num_minus4
    let pic_order_cnt_type = reader.read_ue()?;
    match pic_order_cnt_type {
        0 => {
            reader.read_ue()?; // log2_max_pic_order_cnt_lsb_minus4
        }
        1 => {
            reader.skip_bits(1)?; // delta_pic_order_always_zero_flag
            reader.read_se()?; // offset_for_non_ref_pic
            reader.read_se()?; // offset_for_top_to_bottom_field
            let cycle_length = reader.read_ue()?;
            for _ in 0..cycle_length {
                reader.read_se()?; // offset_for_ref_frame
            }
        }
        _ => {}
    }

    reader.read_ue()?; // max_num_ref_frames
    reader.skip_bits(1)?; // gaps_in_frame_num_value_allowed_flag
    let pic_width_in_mbs_minus1 = reader.read_ue()?;
    let pic_height_in_map_units_minus1 = reader.read_ue()?;
    let frame_mbs_only_flag = reader.read_bits(1)?;
    if frame_mbs_only_flag == 0 {
        reader.skip_bits(1)?; // mb_adaptive_frame_field_flag
    }
    reader.skip_bits(1)?; // direct_8x8_inference_flag

    let (mut crop_left, mut crop_right, mut crop_top, mut crop_bottom) = (0, 0, 0, 0);
    if reader.read_bit()? {
        // frame_cropping_flag
        crop_left = reader.read_ue()?;
        crop_right = reader.read_ue()?;
        crop_top = reader.read_ue()?;
        crop_bottom = reader.read_ue()?;
    }

    let mut sar_ratio = (1u16, 1u16);
    if reader.read_bit()? {
        // vui_parameters_present_flag
        if reader.read_bit()? {
            // aspect_ratio_info_present_flag
            let aspect_ratio_idc = reader.read_bits(8)? as u8;
            sar_ratio = match aspect_ratio_idc {
                255 => (reader.read_bits(16)? as u16, reader.read_bits(16)? as u16),
                idc @ 1..=16 => SAR_TABLE[idc as usize - 1],
                _ => (1, 1),
            };
        }
    }

    Ok(SpsConfig {
        profile_idc,
        profile_compatibility,
        level_idc,
        width: (pic_width_in_mbs_minus1 + 1) * 16 - crop_left * 2 - crop_right * 2,
        height: (2 - frame_mbs_only_flag) * (pic_height_in_map_units_minus1 + 1) * 16
            - crop_top * 2
            - crop_bottom * 2,
        sar_ratio,
    })
}

/// Accumulates Annex-B bytes and yields NAL payloads between start codes.
#[derive(Debug, Default)]
struct NalByteStream {
    buffer: BytesMut,
    /// Offset of the first byte after the opening start code of the current
    /// NAL, once one has been seen.
    nal_start: Option<usize>,
}

impl NalByteStream {
    fn push(&mut self, data: &[u8], out: &mut Vec<Bytes>) {
        self.buffer.extend_from_slice(data);

        loop {
            let search_from = match self.nal_start {
                Some(start) => start,
                None => {
                    // Locate the opening start code.
                    match find_start_code(&self.buffer, 0) {
                        Some((_, code_end)) => {
                            // Everything before the first start code is discarded.
                            let _ = self.buffer.split_to(code_end);
                            self.nal_start = Some(0);
                            0
                        }
                        None => {
                            // Keep a tail that could be a split start code.
                            let keep = self.buffer.len().saturating_sub(3);
                            let _ = self.buffer.split_to(keep);
                            return;
                        }
                    }
                }
            };

            match find_start_code(&self.buffer, search_from) {
                Some((code_start, code_end)) => {
                    let mut nal = self.buffer.split_to(code_start).freeze();
                    // A 4-byte start code leaves its leading zero on the
                    // previous NAL; strip trailing zeros.
                    while nal.last() == Some(&0) {
                        nal.truncate(nal.len() - 1);
                    }
                    let _ = self.buffer.split_to(code_end - code_start);
                    self.nal_start = Some(0);
                    if !nal.is_empty() {
                        out.push(nal);
                    }
                }
                None => {
                    // Resume the next scan just shy of the buffer end so a
                    // start code split across pushes is still found.
                    self.nal_start = Some(self.buffer.len().saturating_sub(2).max(search_from));
                    return;
                }
            }
        }
    }

    fn flush(&mut self, out: &mut Vec<Bytes>) {
        if self.nal_start.is_some() {
            let mut nal = self.buffer.split().freeze();
            while nal.last() == Some(&0) {
                nal.truncate(nal.len() - 1);
            }
            if !nal.is_empty() {
                out.push(nal);
            }
        }
        self.buffer.clear();
        self.nal_start = None;
    }

    fn reset(&mut self) {
        self.buffer.clear();
        self.nal_start = None;
    }
}

/// Find a 0x000001 start code at or after `from`.
///
/// Returns `(start, end)` byte offsets of the code itself, where `start`
/// points at its first zero (not including a third zero of a four-byte
/// code, which is treated as NAL trailing data).
fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    if data.len() < 3 {
        return None;
    }
    let mut i = from;
    while i + 2 < data.len() {
        if data[i] == 0x00 && data[i + 1] == 0x00 && data[i + 2] == 0x01 {
            return Some((i, i + 3));
        }
        i += 1;
    }
    None
}

/// H.264 elementary-stream stage: PES packets in, typed NAL units out.
pub struct H264Stream {
    context: Arc<StreamerContext>,
    byte_stream: NalByteStream,
    /// Timestamps of the PES packet currently feeding the byte stream.
    pts: u64,
    dts: u64,
}

impl H264Stream {
    pub fn new(context: Arc<StreamerContext>) -> Self {
        Self {
            context,
            byte_stream: NalByteStream::default(),
            pts: 0,
            dts: 0,
        }
    }

    pub fn reset(&mut self) {
        self.byte_stream.reset();
        self.pts = 0;
        self.dts = 0;
    }

    fn emit(&self, raw: Vec<Bytes>, out: &mut Vec<NalUnit>) {
        for data in raw {
            let nal_unit_type = NalUnitType::from_header(data[0]);
            let config = if nal_unit_type == NalUnitType::SeqParamSet {
                match parse_sps(&data) {
                    Ok(config) => Some(config),
                    Err(e) => {
                        debug!("{} undecodable SPS: {e}", self.context.name);
                        None
                    }
                }
            } else {
                None
            };
            out.push(NalUnit {
                nal_unit_type,
                data,
                pts: self.pts,
                dts: self.dts,
                config,
            });
        }
    }
}

impl Stage for H264Stream {
    type In = PesPacket;
    type Out = NalUnit;

    fn push(&mut self, input: PesPacket, out: &mut Vec<NalUnit>) -> std::result::Result<(), PipelineError> {
        if let (Some(pts), Some(dts)) = (input.pts, input.dts) {
            self.pts = pts;
            self.dts = dts;
        }
        let mut raw = Vec::new();
        self.byte_stream.push(&input.data, &mut raw);
        self.emit(raw, out);
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<NalUnit>) -> std::result::Result<(), PipelineError> {
        let mut raw = Vec::new();
        self.byte_stream.flush(&mut raw);
        self.emit(raw, out);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "H264Stream"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_common::test_utils::create_test_context;
    use ts::psi::PidRole;

    fn pes(data: Vec<u8>, pts: u64, dts: u64) -> PesPacket {
        PesPacket {
            pid: 0x100,
            role: PidRole::Video,
            stream_type: 0x1B,
            pts: Some(pts),
            dts: Some(dts),
            data_alignment: false,
            packet_length: 0,
            data: data.into(),
        }
    }

    /// Baseline-profile 320x240 SPS: hand-assembled bit fields, no cropping,
    /// no VUI.
    pub(crate) fn test_sps() -> Vec<u8> {
        vec![0x67, 0x42, 0xC0, 0x1E, 0xF4, 0x0A, 0x0F, 0xC8]
    }

    #[test]
    fn test_nal_split_basic() {
        let mut stream = H264Stream::new(create_test_context());
        let mut out = Vec::new();
        let mut data = vec![0x00, 0x00, 0x01, 0x09, 0xF0]; // AUD
        data.extend_from_slice(&[0x00, 0x00, 0x01, 0x65, 0x88, 0x80]); // IDR
        stream.push(pes(data, 900, 890), &mut out).unwrap();
        stream.flush(&mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert!(out[0].is_aud());
        assert!(out[1].is_idr());
        assert_eq!(out[1].pts, 900);
        assert_eq!(out[1].dts, 890);
    }

    #[test]
    fn test_four_byte_start_codes() {
        let mut stream = H264Stream::new(create_test_context());
        let mut out = Vec::new();
        let mut data = vec![0x00, 0x00, 0x00, 0x01, 0x09, 0xF0];
        data.extend_from_slice(&[0x00, 0x00, 0x00, 0x01, 0x41, 0x9A]);
        stream.push(pes(data, 0, 0), &mut out).unwrap();
        stream.flush(&mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data[..], [0x09, 0xF0]);
        assert_eq!(out[1].nal_unit_type, NalUnitType::SliceNonIdr);
    }

    #[test]
    fn test_nal_split_across_pes_packets() {
        let mut stream = H264Stream::new(create_test_context());
        let mut out = Vec::new();
        stream
            .push(pes(vec![0x00, 0x00, 0x01, 0x65, 0x11], 100, 100), &mut out)
            .unwrap();
        stream
            .push(pes(vec![0x22, 0x33, 0x00, 0x00, 0x01, 0x09, 0xF0], 200, 200), &mut out)
            .unwrap();
        stream.flush(&mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].data[..], [0x65, 0x11, 0x22, 0x33]);
        // The IDR completed during the second PES push, so it carries the
        // later packet's timestamps, like the access unit it belongs to.
        assert_eq!(out[0].pts, 200);
        assert!(out[1].is_aud());
    }

    #[test]
    fn test_ebsp_to_rbsp() {
        assert_eq!(
            ebsp_to_rbsp(&[0x00, 0x00, 0x03, 0x01, 0x00, 0x00, 0x03, 0x00]),
            vec![0x00, 0x00, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(ebsp_to_rbsp(&[0x01, 0x02, 0x03]), vec![0x01, 0x02, 0x03]);
    }

    #[test]
    fn test_parse_sps_baseline() {
        let config = parse_sps(&test_sps()).unwrap();
        assert_eq!(config.profile_idc, 66);
        assert_eq!(config.profile_compatibility, 0xC0);
        assert_eq!(config.level_idc, 30);
        assert_eq!(config.width, 320);
        assert_eq!(config.height, 240);
    }

    #[test]
    fn test_sps_config_attached() {
        let mut stream = H264Stream::new(create_test_context());
        let mut out = Vec::new();
        let mut data = vec![0x00, 0x00, 0x01];
        data.extend_from_slice(&test_sps());
        stream.push(pes(data, 0, 0), &mut out).unwrap();
        stream.flush(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].nal_unit_type, NalUnitType::SeqParamSet);
        let config = out[0].config.as_ref().unwrap();
        assert_eq!((config.width, config.height), (320, 240));
    }

    #[test]
    fn test_garbage_before_first_start_code_dropped() {
        let mut stream = H264Stream::new(create_test_context());
        let mut out = Vec::new();
        stream
            .push(
                pes(vec![0xDE, 0xAD, 0x00, 0x00, 0x01, 0x09, 0xF0], 0, 0),
                &mut out,
            )
            .unwrap();
        stream.flush(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert!(out[0].is_aud());
    }
}
