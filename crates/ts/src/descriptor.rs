use bytes::{Buf, Bytes};

/// ISO 639 language descriptor (tag 0x0A)
pub const TAG_ISO_639_LANGUAGE: u8 = 0x0A;
/// Teletext descriptor (tag 0x56)
pub const TAG_TELETEXT: u8 = 0x56;
/// Subtitling descriptor (tag 0x59)
pub const TAG_SUBTITLING: u8 = 0x59;

/// Zero-copy descriptor reference.
#[derive(Debug, Clone)]
pub struct DescriptorRef {
    pub tag: u8,
    pub data: Bytes,
}

/// Iterator over descriptors in a TLV descriptor loop.
///
/// Each descriptor is `[tag: u8][length: u8][data: length bytes]`.
#[derive(Debug, Clone)]
pub struct DescriptorIterator {
    data: Bytes,
}

impl DescriptorIterator {
    /// Create a new descriptor iterator from a descriptor loop byte sequence.
    pub fn new(data: Bytes) -> Self {
        DescriptorIterator { data }
    }
}

impl Iterator for DescriptorIterator {
    type Item = DescriptorRef;

    fn next(&mut self) -> Option<Self::Item> {
        if self.data.remaining() < 2 {
            return None;
        }
        let tag = self.data[0];
        let length = self.data[1] as usize;
        self.data.advance(2);

        if self.data.remaining() < length {
            // Malformed descriptor; consume remaining and stop
            self.data.advance(self.data.remaining());
            return None;
        }

        let data = self.data.split_to(length);
        Some(DescriptorRef { tag, data })
    }
}

/// A single ISO 639 language entry.
#[derive(Debug, Clone)]
pub struct LanguageEntry {
    /// 3-character ISO 639-2/T language code (e.g., b"eng", b"fra")
    pub language_code: [u8; 3],
    /// Audio type: 0=undefined, 1=clean effects, 2=hearing impaired, 3=visual impaired commentary
    pub audio_type: u8,
}

/// Parse ISO 639 language descriptor (tag 0x0A).
pub fn parse_iso639_language(data: &[u8]) -> Vec<LanguageEntry> {
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset + 4 <= data.len() {
        entries.push(LanguageEntry {
            language_code: [data[offset], data[offset + 1], data[offset + 2]],
            audio_type: data[offset + 3],
        });
        offset += 4;
    }
    entries
}

/// Parse the first language code of a DVB subtitling descriptor (tag 0x59).
///
/// Each entry is `[lang(3)][subtitling_type(1)][composition_page(2)][ancillary_page(2)]`.
pub fn parse_subtitling_language(data: &[u8]) -> Option<[u8; 3]> {
    if data.len() < 8 {
        return None;
    }
    Some([data[0], data[1], data[2]])
}

/// Parse the first language code of a teletext descriptor (tag 0x56).
///
/// Each entry is `[lang(3)][type(5 bits) | magazine(3 bits)][page(1)]`.
pub fn parse_teletext_language(data: &[u8]) -> Option<[u8; 3]> {
    if data.len() < 5 {
        return None;
    }
    Some([data[0], data[1], data[2]])
}
