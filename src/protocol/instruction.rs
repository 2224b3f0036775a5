use crate::protocol::codec::{crc16, stuff, unstuff};
use crate::protocol::dxl_def::*;
use crate::protocol::error::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InstructionCode {
    Ping = 0x01,
    Read = 0x02,
    Write = 0x03,
    RegWrite = 0x04,
    Action = 0x05,
    FactoryReset = 0x06,
    Reboot = 0x08,
    Clear = 0x10,
    ControlTableBackup = 0x20,
    Status = 0x55,
    SyncRead = 0x82,
    SyncWrite = 0x83,
    FastSyncRead = 0x8A,
    BulkRead = 0x92,
    BulkWrite = 0x93,
    FastBulkRead = 0x9A,
}

impl InstructionCode {
    pub fn from_byte(byte: u8) -> Option<InstructionCode> {
        match byte {
            0x01 => Some(InstructionCode::Ping),
            0x02 => Some(InstructionCode::Read),
            0x03 => Some(InstructionCode::Write),
            0x04 => Some(InstructionCode::RegWrite),
            0x05 => Some(InstructionCode::Action),
            0x06 => Some(InstructionCode::FactoryReset),
            0x08 => Some(InstructionCode::Reboot),
            0x10 => Some(InstructionCode::Clear),
            0x20 => Some(InstructionCode::ControlTableBackup),
            0x55 => Some(InstructionCode::Status),
            0x82 => Some(InstructionCode::SyncRead),
            0x83 => Some(InstructionCode::SyncWrite),
            0x8A => Some(InstructionCode::FastSyncRead),
            0x92 => Some(InstructionCode::BulkRead),
            0x93 => Some(InstructionCode::BulkWrite),
            0x9A => Some(InstructionCode::FastBulkRead),
            _ => None,
        }
    }
}

/// One outbound request: built per call, serialised once, not retained.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub id: u8,
    pub code: InstructionCode,
    pub params: Vec<u8>,
}

impl Instruction {
    pub fn new(id: u8, code: InstructionCode, params: Vec<u8>) -> Instruction {
        Instruction { id, code, params }
    }

    /// Serialises the instruction into its on-wire form.
    ///
    /// The parameter region is stuffed first; the length field and the CRC
    /// both cover the stuffed bytes.
    pub fn packet_bytes(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.id == 0xFD || self.id == 0xFF {
            return Err(ProtocolError::InvalidId(self.id));
        }

        let stuffed = stuff(&self.params);
        let length = (INSTRUCTION_BASE_LENGTH + stuffed.len()) as u16;

        let mut packet = Vec::with_capacity(MIN_INSTRUCTION_PACKET_LEN + stuffed.len());
        packet.extend_from_slice(&HEADER);
        packet.push(self.id);
        packet.extend_from_slice(&length.to_le_bytes());
        packet.push(self.code as u8);
        packet.extend_from_slice(&stuffed);
        let crc = crc16(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());
        Ok(packet)
    }
}

/// Decodes a complete instruction packet, the device-side view of the wire.
///
/// Returns `None` for anything a conforming device would drop on the floor:
/// bad header, inconsistent length, unknown instruction, failed CRC. Used by
/// the simulated bus and handy for sniffing real traffic.
pub fn parse_instruction_packet(packet: &[u8]) -> Option<Instruction> {
    if packet.len() < MIN_INSTRUCTION_PACKET_LEN || packet[..4] != HEADER {
        return None;
    }
    let length = u16::from_le_bytes([packet[PKT_LENGTH_L], packet[PKT_LENGTH_H]]) as usize;
    if length < INSTRUCTION_BASE_LENGTH || length + 7 != packet.len() {
        return None;
    }
    let code = InstructionCode::from_byte(packet[PKT_INSTRUCTION])?;
    if code == InstructionCode::Status {
        return None;
    }
    let crc = crc16(&packet[..packet.len() - 2]);
    let wire_crc = u16::from_le_bytes([packet[packet.len() - 2], packet[packet.len() - 1]]);
    if crc != wire_crc {
        return None;
    }
    let params = unstuff(&packet[PKT_INSTRUCTION_PARAM0..packet.len() - 2]);
    Some(Instruction {
        id: packet[PKT_ID],
        code,
        params,
    })
}
