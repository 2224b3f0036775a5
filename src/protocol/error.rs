use thiserror::Error;

/// Everything a bus transaction can fail with, from encoding to the error
/// flags a device reports back.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid device id 0x{0:02X}")]
    InvalidId(u8),

    #[error("status packet truncated")]
    TruncatedStatus,

    #[error("malformed status packet")]
    MalformedStatus,

    #[error("invalid status packet length value")]
    InvalidStatusLength,

    #[error("status packet crc check failed")]
    StatusCrcInvalid,

    #[error("read wait timeout")]
    ReadTimeout,

    #[error("unexpected parameter count")]
    UnexpectedParamCount,

    #[error("instruction does not respond to the broadcast id")]
    NoStatusOnBroadcast,

    #[error("at least one id is required")]
    MinOneIdRequired,

    #[error("device reported error: {0}")]
    Device(#[from] DeviceError),

    #[error("transport error: {0}")]
    Io(#[from] std::io::Error),
}

/// Decoded from the low 7 bits of the status error byte. `Alert` is the high
/// bit on its own: the device completed the instruction but its hardware
/// error register needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("result failed")]
    Result,
    #[error("instruction error")]
    Instruction,
    #[error("crc verification failed")]
    Crc,
    #[error("data range error")]
    DataRange,
    #[error("data length error")]
    DataLength,
    #[error("data limit error")]
    DataLimit,
    #[error("access error")]
    Access,
    #[error("hardware alert")]
    Alert,
}

impl DeviceError {
    /// Maps a raw status error byte onto the taxonomy. Zero means the
    /// instruction succeeded; a low-7-bit value outside the documented range
    /// means the packet cannot have come from a conforming device.
    pub fn from_error_byte(byte: u8) -> Result<Option<DeviceError>, ProtocolError> {
        match byte & 0x7F {
            0x00 => {
                if byte & super::dxl_def::ALERT_BIT != 0 {
                    Ok(Some(DeviceError::Alert))
                } else {
                    Ok(None)
                }
            }
            0x01 => Ok(Some(DeviceError::Result)),
            0x02 => Ok(Some(DeviceError::Instruction)),
            0x03 => Ok(Some(DeviceError::Crc)),
            0x04 => Ok(Some(DeviceError::DataRange)),
            0x05 => Ok(Some(DeviceError::DataLength)),
            0x06 => Ok(Some(DeviceError::DataLimit)),
            0x07 => Ok(Some(DeviceError::Access)),
            _ => Err(ProtocolError::MalformedStatus),
        }
    }
}
