//! Packet resynchronization
//!
//! Byte chunks arriving from the host have arbitrary boundaries; this stage
//! re-aligns them into whole 188-byte TS packets. A packet is only emitted
//! when the sync byte 0x47 is confirmed at both its own offset and one
//! packet-stride later, so a stray 0x47 inside garbage does not produce a
//! bogus packet.

use bytes::{Bytes, BytesMut};
use memchr::memchr;
use pipeline_common::{PipelineError, Stage};

use crate::packet::{SYNC_BYTE, TS_PACKET_SIZE};

/// Splits an arbitrary byte stream into 188-byte TS packets.
///
/// Up to one packet's worth of unconsumed bytes is carried between pushes;
/// `flush` emits a trailing residual only when it is exactly one whole
/// packet starting with the sync byte.
#[derive(Debug, Default)]
pub struct PacketSplitter {
    residual: BytesMut,
}

impl PacketSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn scan(&mut self, out: &mut Vec<Bytes>) {
        let mut start = 0;

        loop {
            let buffered = &self.residual[start..];
            // Need the next packet's sync byte in view to confirm this one.
            if buffered.len() < TS_PACKET_SIZE + 1 {
                break;
            }

            let candidate = match memchr(SYNC_BYTE, &buffered[..buffered.len() - TS_PACKET_SIZE]) {
                Some(offset) => start + offset,
                None => {
                    // No sync byte can begin a confirmable packet yet.
                    start = self.residual.len() - TS_PACKET_SIZE;
                    break;
                }
            };

            if self.residual[candidate + TS_PACKET_SIZE] == SYNC_BYTE {
                // Drop any garbage preceding the confirmed packet.
                let _ = self.residual.split_to(candidate);
                let packet = self.residual.split_to(TS_PACKET_SIZE).freeze();
                out.push(packet);
                start = 0;
            } else {
                // False sync; resume the scan one byte past it.
                start = candidate + 1;
            }
        }

        // Bytes before `start` were refuted and can never begin a packet.
        if start > 0 {
            let _ = self.residual.split_to(start);
        }
    }

    pub fn reset(&mut self) {
        self.residual.clear();
    }
}

impl Stage for PacketSplitter {
    type In = Bytes;
    type Out = Bytes;

    fn push(&mut self, input: Bytes, out: &mut Vec<Bytes>) -> Result<(), PipelineError> {
        self.residual.extend_from_slice(&input);
        self.scan(out);
        Ok(())
    }

    fn flush(&mut self, out: &mut Vec<Bytes>) -> Result<(), PipelineError> {
        if self.residual.len() == TS_PACKET_SIZE && self.residual[0] == SYNC_BYTE {
            out.push(self.residual.split().freeze());
        }
        self.residual.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "PacketSplitter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(fill: u8) -> Vec<u8> {
        let mut p = vec![fill; TS_PACKET_SIZE];
        p[0] = SYNC_BYTE;
        p
    }

    fn push_all(splitter: &mut PacketSplitter, data: &[u8]) -> Vec<Bytes> {
        let mut out = Vec::new();
        splitter
            .push(Bytes::copy_from_slice(data), &mut out)
            .unwrap();
        out
    }

    #[test]
    fn test_two_packets_aligned() {
        let mut splitter = PacketSplitter::new();
        let mut data = packet(1);
        data.extend(packet(2));
        let packets = push_all(&mut splitter, &data);
        // The second packet has no confirming successor until flush.
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][1], 1);

        let mut out = Vec::new();
        splitter.flush(&mut out).unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][1], 2);
    }

    #[test]
    fn test_garbage_prefix_resync() {
        let mut splitter = PacketSplitter::new();
        let mut data = vec![0xAA, 0x47, 0xBB]; // stray 0x47 inside garbage
        data.extend(packet(1));
        data.extend(packet(2));
        let packets = push_all(&mut splitter, &data);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0][0], SYNC_BYTE);
        assert_eq!(packets[0][1], 1);
    }

    #[test]
    fn test_split_across_pushes() {
        let mut splitter = PacketSplitter::new();
        let mut data = packet(1);
        data.extend(packet(2));
        data.extend(packet(3));

        let mut all = Vec::new();
        for chunk in data.chunks(17) {
            all.extend(push_all(&mut splitter, chunk));
        }
        let mut out = Vec::new();
        splitter.flush(&mut out).unwrap();
        all.extend(out);

        assert_eq!(all.len(), 3);
        for (i, p) in all.iter().enumerate() {
            assert_eq!(p.len(), TS_PACKET_SIZE);
            assert_eq!(p[1], (i + 1) as u8);
        }
    }

    #[test]
    fn test_pure_garbage_emits_nothing() {
        let mut splitter = PacketSplitter::new();
        let packets = push_all(&mut splitter, &[0x55; 400]);
        assert!(packets.is_empty());
        let mut out = Vec::new();
        splitter.flush(&mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn test_flush_rejects_partial_residual() {
        let mut splitter = PacketSplitter::new();
        let data = &packet(1)[..100];
        push_all(&mut splitter, data);
        let mut out = Vec::new();
        splitter.flush(&mut out).unwrap();
        assert!(out.is_empty());
    }
}
