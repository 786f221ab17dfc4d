//! Silent AAC-LC frames
//!
//! Raw (header-less) AAC frames decoding to silence, one per supported
//! samplerate. The audio segmenter prepends these to cover gaps between the
//! requested append point and the first real frame. Rates without an entry
//! fall back to repeating the caller's first real frame.

use bytes::Bytes;

/// Shared leading section of the silent frames for the higher samplerates.
const HIGH_PREFIX: &[u8] = &[33, 16, 5, 32, 164, 27];

/// Shared leading section of the silent frames for the lower samplerates.
const LOW_PREFIX: &[u8] = &[33, 65, 108, 84, 1, 2, 4, 8, 168, 2, 4, 8, 17, 191, 252];

enum Section {
    Lit(&'static [u8]),
    Zeros(usize),
}

use Section::{Lit, Zeros};

fn assemble(parts: &[Section]) -> Bytes {
    let mut frame = Vec::new();
    for part in parts {
        match part {
            Lit(bytes) => frame.extend_from_slice(bytes),
            Zeros(count) => frame.resize(frame.len() + count, 0),
        }
    }
    Bytes::from(frame)
}

/// Return a raw silent AAC-LC frame for the given samplerate, if one exists.
pub fn silent_frame(samplerate: u32) -> Option<Bytes> {
    let frame = match samplerate {
        96000 => assemble(&[Lit(HIGH_PREFIX), Lit(&[227, 64]), Zeros(154), Lit(&[56])]),
        88200 => assemble(&[Lit(HIGH_PREFIX), Lit(&[231]), Zeros(170), Lit(&[56])]),
        64000 => assemble(&[Lit(HIGH_PREFIX), Lit(&[248, 192]), Zeros(240), Lit(&[56])]),
        48000 => assemble(&[
            Lit(HIGH_PREFIX),
            Lit(&[255, 192]),
            Zeros(268),
            Lit(&[55, 148, 128]),
            Zeros(54),
            Lit(&[112]),
        ]),
        44100 => assemble(&[
            Lit(HIGH_PREFIX),
            Lit(&[255, 192]),
            Zeros(268),
            Lit(&[55, 163, 128]),
            Zeros(84),
            Lit(&[112]),
        ]),
        32000 => assemble(&[
            Lit(HIGH_PREFIX),
            Lit(&[255, 192]),
            Zeros(268),
            Lit(&[55, 234]),
            Zeros(226),
            Lit(&[112]),
        ]),
        24000 => assemble(&[
            Lit(HIGH_PREFIX),
            Lit(&[255, 192]),
            Zeros(268),
            Lit(&[55, 255, 128]),
            Zeros(268),
            Lit(&[111, 112]),
            Zeros(126),
            Lit(&[224]),
        ]),
        16000 => assemble(&[
            Lit(HIGH_PREFIX),
            Lit(&[255, 192]),
            Zeros(268),
            Lit(&[55, 255, 128]),
            Zeros(268),
            Lit(&[111, 255]),
            Zeros(269),
            Lit(&[223, 108]),
            Zeros(195),
            Lit(&[1, 192]),
        ]),
        12000 => assemble(&[
            Lit(LOW_PREFIX),
            Zeros(268),
            Lit(&[3, 127, 248]),
            Zeros(268),
            Lit(&[6, 255, 240]),
            Zeros(268),
            Lit(&[13, 255, 224]),
            Zeros(268),
            Lit(&[27, 253, 128]),
            Zeros(259),
            Lit(&[56]),
        ]),
        11025 => assemble(&[
            Lit(LOW_PREFIX),
            Zeros(268),
            Lit(&[3, 127, 248]),
            Zeros(268),
            Lit(&[6, 255, 240]),
            Zeros(268),
            Lit(&[13, 255, 224]),
            Zeros(268),
            Lit(&[27, 255]),
            Zeros(268),
            Lit(&[55, 175, 128]),
            Zeros(108),
            Lit(&[112]),
        ]),
        8000 => assemble(&[Lit(LOW_PREFIX), Zeros(268), Lit(&[3, 121, 16]), Zeros(47), Lit(&[7])]),
        _ => return None,
    };
    Some(frame)
}
