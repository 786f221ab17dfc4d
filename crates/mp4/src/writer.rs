//! Box-writing primitives
//!
//! Boxes are written in place: the 4-byte size field is reserved up front
//! and patched once the content closure has run, so nested boxes cost no
//! intermediate copies.

use bytes::{BufMut, BytesMut};

/// Write `[size][fourcc][content]`, patching the size afterwards.
pub(crate) fn write_box(out: &mut BytesMut, fourcc: &[u8; 4], content: impl FnOnce(&mut BytesMut)) {
    let size_pos = out.len();
    out.put_u32(0);
    out.extend_from_slice(fourcc);
    content(out);
    let size = (out.len() - size_pos) as u32;
    out[size_pos..size_pos + 4].copy_from_slice(&size.to_be_bytes());
}

/// Write a full box: `[size][fourcc][version][flags24][content]`.
pub(crate) fn write_full_box(
    out: &mut BytesMut,
    fourcc: &[u8; 4],
    version: u8,
    flags: u32,
    content: impl FnOnce(&mut BytesMut),
) {
    write_box(out, fourcc, |out| {
        out.put_u32(((version as u32) << 24) | (flags & 0x00FF_FFFF));
        content(out);
    });
}
