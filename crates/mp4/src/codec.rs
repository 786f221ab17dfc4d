//! Codec string derivation
//!
//! The RFC 6381 strings advertised in `trackinfo` and used by MSE
//! `addSourceBuffer` calls. Both are derived deterministically from the
//! elementary-stream configuration, so the advertised string always matches
//! the init segment.

/// `avc1.PPCCLL` from the SPS profile/compatibility/level bytes.
pub fn avc_codec_string(profile_idc: u8, profile_compatibility: u8, level_idc: u8) -> String {
    format!("avc1.{profile_idc:02x}{profile_compatibility:02x}{level_idc:02x}")
}

/// `mp4a.40.<AOT>` from the ADTS audio object type.
pub fn aac_codec_string(audioobjecttype: u8) -> String {
    format!("mp4a.40.{audioobjecttype}")
}
