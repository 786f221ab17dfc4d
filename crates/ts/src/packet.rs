use crate::{Result, TsError};
use bytes::Bytes;

/// TS packet size in bytes
pub const TS_PACKET_SIZE: usize = 188;

/// TS sync byte
pub const SYNC_BYTE: u8 = 0x47;

/// PAT PID (always 0x0000)
pub const PID_PAT: u16 = 0x0000;

/// NULL PID (always 0x1FFF)
pub const PID_NULL: u16 = 0x1FFF;

/// Transport Stream packet structure
#[derive(Debug, Clone)]
pub struct TsPacket {
    /// Transport Error Indicator
    pub transport_error_indicator: bool,
    /// Payload Unit Start Indicator
    pub payload_unit_start_indicator: bool,
    /// Packet Identifier
    pub pid: u16,
    /// Adaptation Field Control
    pub adaptation_field_control: u8,
    /// Continuity Counter
    pub continuity_counter: u8,
    /// Payload data, past any adaptation field (if present)
    pub payload: Option<Bytes>,
}

impl TsPacket {
    /// Parse a TS packet from 188 bytes
    pub fn parse(data: Bytes) -> Result<Self> {
        if data.len() != TS_PACKET_SIZE {
            return Err(TsError::InvalidPacketSize(data.len()));
        }
        if data[0] != SYNC_BYTE {
            return Err(TsError::InvalidSyncByte(data[0]));
        }

        let byte1 = data[1];
        let byte3 = data[3];

        let transport_error_indicator = (byte1 & 0x80) != 0;
        let payload_unit_start_indicator = (byte1 & 0x40) != 0;
        let pid = ((byte1 as u16 & 0x1F) << 8) | data[2] as u16;
        let adaptation_field_control = (byte3 >> 4) & 0x03;
        let continuity_counter = byte3 & 0x0F;

        let mut offset = 4;

        // Skip the adaptation field when present
        if adaptation_field_control == 0x02 || adaptation_field_control == 0x03 {
            let adaptation_field_length = data[offset] as usize;
            offset += 1 + adaptation_field_length;
        }

        let payload = if (adaptation_field_control == 0x01 || adaptation_field_control == 0x03)
            && offset < data.len()
        {
            Some(data.slice(offset..))
        } else {
            None
        };

        Ok(TsPacket {
            transport_error_indicator,
            payload_unit_start_indicator,
            pid,
            adaptation_field_control,
            continuity_counter,
            payload,
        })
    }

    /// Check if this packet has a payload
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// Get the PSI payload (removes the pointer field if PUSI is set)
    pub fn psi_payload(&self) -> Option<Bytes> {
        let payload = self.payload.as_ref()?;
        if self.payload_unit_start_indicator {
            if payload.is_empty() {
                return None;
            }
            let pointer_field = payload[0] as usize;
            if 1 + pointer_field < payload.len() {
                return Some(payload.slice(1 + pointer_field..));
            }
            None
        } else {
            // Continuation packet, return payload as-is
            Some(payload.clone())
        }
    }
}
