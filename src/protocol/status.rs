use crate::protocol::codec::{crc16, unstuff};
use crate::protocol::dxl_def::*;
use crate::protocol::error::{DeviceError, ProtocolError};
use crate::protocol::instruction::InstructionCode;

/// A decoded device reply. Produced by the parser, consumed immediately by
/// the handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Status {
    pub id: u8,
    pub error: Option<DeviceError>,
    pub params: Vec<u8>,
}

/// Validates and decodes a fully assembled status packet.
///
/// The caller (the status reader, or a test vector) hands over the complete
/// wire bytes from the header through both CRC bytes. Checks run in the order
/// a device-side implementation would bail out: overall size, instruction
/// byte, length field consistency, CRC, then the error byte. Parameters are
/// unstuffed last, after the CRC has been verified on the wire form.
pub fn parse_status_packet(packet: &[u8]) -> Result<Status, ProtocolError> {
    if packet.len() < MIN_STATUS_PACKET_LEN {
        return Err(ProtocolError::TruncatedStatus);
    }
    if packet[..4] != HEADER {
        return Err(ProtocolError::MalformedStatus);
    }
    if packet[PKT_INSTRUCTION] != InstructionCode::Status as u8 {
        return Err(ProtocolError::MalformedStatus);
    }

    let length = u16::from_le_bytes([packet[PKT_LENGTH_L], packet[PKT_LENGTH_H]]) as usize;
    if length < STATUS_BASE_LENGTH || length + 7 != packet.len() {
        return Err(ProtocolError::InvalidStatusLength);
    }

    let crc = crc16(&packet[..packet.len() - 2]);
    let wire_crc = u16::from_le_bytes([packet[packet.len() - 2], packet[packet.len() - 1]]);
    if crc != wire_crc {
        return Err(ProtocolError::StatusCrcInvalid);
    }

    let error = DeviceError::from_error_byte(packet[PKT_ERROR])?;
    let params = unstuff(&packet[PKT_STATUS_PARAM0..packet.len() - 2]);

    Ok(Status {
        id: packet[PKT_ID],
        error,
        params,
    })
}
