//! Minimal ISOBMFF box reader
//!
//! Used by the workspace tests to walk generated segments and by callers
//! that need to peek at fragment structure. Handles 32-bit sizes, 64-bit
//! extended sizes (`size == 1`), and box-extends-to-EOF (`size == 0`).

use bytes::Bytes;

/// Parsed view over a single ISOBMFF box inside a parent byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxView {
    pub start: usize,
    pub end: usize,
    pub size: usize,
    pub header_size: usize,
    pub fourcc: [u8; 4],
    pub body_start: usize,
    pub body_end: usize,
}

/// Read a box header: returns `(total_box_size, fourcc, header_size)`.
fn read_box_header(data: &[u8]) -> Option<(usize, [u8; 4], usize)> {
    if data.len() < 8 {
        return None;
    }

    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as u64;
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];

    if size == 1 {
        if data.len() < 16 {
            return None;
        }
        let ext_size = u64::from_be_bytes([
            data[8], data[9], data[10], data[11], data[12], data[13], data[14], data[15],
        ]);
        Some((ext_size as usize, fourcc, 16))
    } else if size == 0 {
        Some((data.len(), fourcc, 8))
    } else {
        Some((size as usize, fourcc, 8))
    }
}

/// Parse a single box located at `offset` within `[0..end)`.
pub fn box_at(data: &Bytes, offset: usize, end: usize) -> Option<BoxView> {
    if offset >= end {
        return None;
    }

    let remaining = &data[offset..end];
    let (size, fourcc, header_size) = read_box_header(remaining)?;

    if size < header_size || offset + size > end {
        return None;
    }

    let body_start = offset + header_size;
    let body_end = offset + size;
    Some(BoxView {
        start: offset,
        end: offset + size,
        size,
        header_size,
        fourcc,
        body_start,
        body_end,
    })
}

/// Find the first top-level box with the given FourCC.
pub fn find_box(data: &Bytes, target: &[u8; 4]) -> Option<BoxView> {
    find_box_in(data, 0, data.len(), target)
}

fn find_box_in(data: &Bytes, start: usize, end: usize, target: &[u8; 4]) -> Option<BoxView> {
    let mut offset = start;
    while offset < end {
        let parsed = box_at(data, offset, end)?;
        if &parsed.fourcc == target {
            return Some(parsed);
        }
        offset = parsed.end;
    }
    None
}

/// Walk a path of nested boxes, e.g. `[b"moof", b"traf", b"trun"]`.
pub fn find_box_path(data: &Bytes, path: &[&[u8; 4]]) -> Option<BoxView> {
    let mut range = (0usize, data.len());
    let mut found = None;
    for target in path {
        let parsed = find_box_in(data, range.0, range.1, target)?;
        range = (parsed.body_start, parsed.body_end);
        found = Some(parsed);
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    fn simple_box(fourcc: &[u8; 4], body: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&((body.len() + 8) as u32).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn test_box_at() {
        let data = Bytes::from(simple_box(b"free", &[0xAA; 4]));
        let parsed = box_at(&data, 0, data.len()).unwrap();
        assert_eq!(parsed.fourcc, *b"free");
        assert_eq!(parsed.body_end - parsed.body_start, 4);
    }

    #[test]
    fn test_extended_size() {
        let mut out = BytesMut::new();
        out.put_u32(1);
        out.extend_from_slice(b"mdat");
        out.put_u64(20);
        out.extend_from_slice(&[0xBB; 4]);
        let data = out.freeze();
        let parsed = box_at(&data, 0, data.len()).unwrap();
        assert_eq!(parsed.header_size, 16);
        assert_eq!(parsed.size, 20);
    }

    #[test]
    fn test_find_box_path() {
        let inner = simple_box(b"innr", &[1, 2]);
        let outer = simple_box(b"outr", &inner);
        let data = Bytes::from(outer);
        let parsed = find_box_path(&data, &[b"outr", b"innr"]).unwrap();
        assert_eq!(data[parsed.body_start], 1);
    }

    #[test]
    fn test_truncated_box_is_none() {
        let mut raw = simple_box(b"trun", &[0; 16]);
        raw.truncate(10);
        let data = Bytes::from(raw);
        assert!(box_at(&data, 0, data.len()).is_none());
    }
}
