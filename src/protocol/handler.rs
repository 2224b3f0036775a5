use std::io;
use std::time::{Duration, Instant};

use crate::protocol::dxl_def::*;
use crate::protocol::error::ProtocolError;
use crate::protocol::instruction::{Instruction, InstructionCode};
use crate::protocol::port_handler::PortHandler;
use crate::protocol::status::{parse_status_packet, Status};

/// Factory reset scope, as sent in the option byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FactoryResetKind {
    All = 0xFF,
    ExceptId = 0x01,
    ExceptIdBaud = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ClearKind {
    MultiRotationPos = 0x01,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BackupKind {
    Store = 0x01,
    Restore = 0x02,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PingResponse {
    pub id: u8,
    pub model: u16,
    pub firmware: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkReadDescriptor {
    pub id: u8,
    pub addr: u16,
    pub length: u16,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkWriteDescriptor {
    pub id: u8,
    pub addr: u16,
    pub data: Vec<u8>,
}

/// Request/response front end for one half-duplex bus.
///
/// Owns the port for its lifetime and runs one transaction at a time: write
/// the instruction, read the reply (or replies) to completion, return. Wrap
/// it in a mutex if it has to be shared across threads.
#[derive(Debug)]
pub struct PacketHandler<P: PortHandler> {
    port: P,
    read_timeout: Duration,
}

impl<P: PortHandler> PacketHandler<P> {
    /// A zero `read_timeout` selects the 20 ms default.
    pub fn new(port: P, read_timeout: Duration) -> PacketHandler<P> {
        let read_timeout = if read_timeout.is_zero() {
            DEFAULT_READ_TIMEOUT
        } else {
            read_timeout
        };
        PacketHandler { port, read_timeout }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn into_port(self) -> P {
        self.port
    }

    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Reads and discards everything currently buffered on the port.
    ///
    /// Call it after a framing error or timeout: the bus state is suspect
    /// and leftover bytes would otherwise poison the next transaction.
    pub fn flush(&mut self) -> Result<(), ProtocolError> {
        let mut scratch = [0u8; 256];
        loop {
            if self.port.read_port(&mut scratch)? == 0 {
                return Ok(());
            }
        }
    }

    fn write_instruction(
        &mut self,
        id: u8,
        code: InstructionCode,
        params: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        let packet = Instruction::new(id, code, params).packet_bytes()?;
        let mut written = 0;
        while written < packet.len() {
            let n = self.port.write_port(&packet[written..])?;
            if n == 0 {
                return Err(ProtocolError::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "port accepted no bytes",
                )));
            }
            written += n;
        }
        Ok(())
    }

    /// Reads the next status packet off the wire.
    ///
    /// Scans byte by byte for the `FF FF FD 00` header, discarding anything
    /// in front of it; echoes of our own instruction and line noise are
    /// normal on a half-duplex bus. Once the header is found the declared
    /// length is read out exactly, so a header-like pattern inside the body
    /// is just data. One deadline covers the whole call; it is armed on
    /// entry and never reset by progress, which bounds worst-case
    /// transaction latency even against a byte-at-a-time dribble.
    pub fn read_status(&mut self) -> Result<Status, ProtocolError> {
        let deadline = Instant::now() + self.read_timeout;

        let mut window = [0u8; 4];
        let mut filled = 0usize;
        loop {
            let byte = self.read_byte(deadline)?;
            if filled < window.len() {
                window[filled] = byte;
                filled += 1;
            } else {
                window.rotate_left(1);
                window[3] = byte;
            }
            if filled == window.len() && window == HEADER {
                break;
            }
        }

        let mut id_len = [0u8; 3];
        self.read_exact(&mut id_len, deadline)?;
        let length = u16::from_le_bytes([id_len[1], id_len[2]]) as usize;
        if length < STATUS_BASE_LENGTH {
            return Err(ProtocolError::InvalidStatusLength);
        }

        let mut packet = Vec::with_capacity(7 + length);
        packet.extend_from_slice(&HEADER);
        packet.extend_from_slice(&id_len);
        let body_start = packet.len();
        packet.resize(body_start + length, 0);
        self.read_exact(&mut packet[body_start..], deadline)?;

        parse_status_packet(&packet)
    }

    fn read_byte(&mut self, deadline: Instant) -> Result<u8, ProtocolError> {
        let mut buf = [0u8; 1];
        loop {
            if self.port.read_port(&mut buf)? == 1 {
                return Ok(buf[0]);
            }
            if Instant::now() >= deadline {
                return Err(ProtocolError::ReadTimeout);
            }
        }
    }

    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<(), ProtocolError> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.port.read_port(&mut buf[filled..])?;
            if n == 0 {
                if Instant::now() >= deadline {
                    return Err(ProtocolError::ReadTimeout);
                }
                continue;
            }
            filled += n;
        }
        Ok(())
    }

    fn read_checked_status(&mut self) -> Result<Status, ProtocolError> {
        let status = self.read_status()?;
        match status.error {
            Some(err) => Err(ProtocolError::Device(err)),
            None => Ok(status),
        }
    }

    // An instruction that only acknowledges: one empty status unless it was
    // broadcast, in which case devices stay silent by contract.
    fn write_acknowledged(
        &mut self,
        id: u8,
        code: InstructionCode,
        params: Vec<u8>,
    ) -> Result<(), ProtocolError> {
        self.write_instruction(id, code, params)?;
        if id != BROADCAST_ID {
            self.read_checked_status()?;
        }
        Ok(())
    }

    pub fn ping(&mut self, id: u8) -> Result<PingResponse, ProtocolError> {
        self.write_instruction(id, InstructionCode::Ping, Vec::new())?;
        let status = self.read_checked_status()?;
        if status.params.len() != 3 {
            return Err(ProtocolError::UnexpectedParamCount);
        }
        Ok(PingResponse {
            id: status.id,
            model: u16::from_le_bytes([status.params[0], status.params[1]]),
            firmware: status.params[2],
        })
    }

    /// Pings the broadcast id and collects every reply until the bus goes
    /// quiet. Each reply gets a fresh deadline, so a chain of n devices takes
    /// at most (n + 1) deadlines to enumerate.
    pub fn broadcast_ping(&mut self) -> Result<Vec<PingResponse>, ProtocolError> {
        self.write_instruction(BROADCAST_ID, InstructionCode::Ping, Vec::new())?;
        let mut found = Vec::new();
        loop {
            match self.read_checked_status() {
                Ok(status) => {
                    if status.params.len() != 3 {
                        return Err(ProtocolError::UnexpectedParamCount);
                    }
                    found.push(PingResponse {
                        id: status.id,
                        model: u16::from_le_bytes([status.params[0], status.params[1]]),
                        firmware: status.params[2],
                    });
                }
                Err(ProtocolError::ReadTimeout) => return Ok(found),
                Err(err) => return Err(err),
            }
        }
    }

    pub fn read(&mut self, id: u8, addr: u16, length: u16) -> Result<Vec<u8>, ProtocolError> {
        if id == BROADCAST_ID {
            return Err(ProtocolError::NoStatusOnBroadcast);
        }
        let mut params = Vec::with_capacity(4);
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        self.write_instruction(id, InstructionCode::Read, params)?;

        let status = self.read_checked_status()?;
        if status.params.len() != length as usize {
            return Err(ProtocolError::UnexpectedParamCount);
        }
        Ok(status.params)
    }

    pub fn write(&mut self, id: u8, addr: u16, data: &[u8]) -> Result<(), ProtocolError> {
        let mut params = Vec::with_capacity(2 + data.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(data);
        self.write_acknowledged(id, InstructionCode::Write, params)
    }

    /// Stages a write in the device's register buffer; `action` commits it.
    pub fn reg_write(&mut self, id: u8, addr: u16, data: &[u8]) -> Result<(), ProtocolError> {
        let mut params = Vec::with_capacity(2 + data.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(data);
        self.write_acknowledged(id, InstructionCode::RegWrite, params)
    }

    pub fn action(&mut self, id: u8) -> Result<(), ProtocolError> {
        self.write_acknowledged(id, InstructionCode::Action, Vec::new())
    }

    pub fn reboot(&mut self, id: u8) -> Result<(), ProtocolError> {
        self.write_acknowledged(id, InstructionCode::Reboot, Vec::new())
    }

    pub fn factory_reset(
        &mut self,
        id: u8,
        kind: FactoryResetKind,
    ) -> Result<(), ProtocolError> {
        self.write_acknowledged(id, InstructionCode::FactoryReset, vec![kind as u8])
    }

    pub fn clear(&mut self, id: u8, kind: ClearKind) -> Result<(), ProtocolError> {
        let mut params = Vec::with_capacity(1 + CLEAR_MAGIC.len());
        params.push(kind as u8);
        params.extend_from_slice(&CLEAR_MAGIC);
        self.write_acknowledged(id, InstructionCode::Clear, params)
    }

    pub fn control_table_backup(&mut self, id: u8, kind: BackupKind) -> Result<(), ProtocolError> {
        let mut params = Vec::with_capacity(1 + BACKUP_MAGIC.len());
        params.push(kind as u8);
        params.extend_from_slice(&BACKUP_MAGIC);
        self.write_acknowledged(id, InstructionCode::ControlTableBackup, params)
    }

    /// Reads the same window from several devices; one status per id, in the
    /// order the ids were given. The protocol makes devices answer in that
    /// order, so replies are consumed positionally.
    pub fn sync_read(
        &mut self,
        ids: &[u8],
        addr: u16,
        length: u16,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut params = Vec::with_capacity(4 + ids.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        params.extend_from_slice(ids);
        self.write_instruction(BROADCAST_ID, InstructionCode::SyncRead, params)?;

        let mut responses = Vec::with_capacity(ids.len());
        for _ in ids {
            let status = self.read_checked_status()?;
            if status.params.len() != length as usize {
                return Err(ProtocolError::UnexpectedParamCount);
            }
            responses.push(status.params);
        }
        Ok(responses)
    }

    /// `data` is the packed per-device payload: `id, bytes…` repeated, with
    /// `length` bytes per device. Broadcast, so nothing answers.
    pub fn sync_write(&mut self, addr: u16, length: u16, data: &[u8]) -> Result<(), ProtocolError> {
        let mut params = Vec::with_capacity(4 + data.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        params.extend_from_slice(data);
        self.write_instruction(BROADCAST_ID, InstructionCode::SyncWrite, params)
    }

    pub fn bulk_read(
        &mut self,
        descriptors: &[BulkReadDescriptor],
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        let mut params = Vec::with_capacity(descriptors.len() * 5);
        for desc in descriptors {
            params.push(desc.id);
            params.extend_from_slice(&desc.addr.to_le_bytes());
            params.extend_from_slice(&desc.length.to_le_bytes());
        }
        self.write_instruction(BROADCAST_ID, InstructionCode::BulkRead, params)?;

        let mut responses = Vec::with_capacity(descriptors.len());
        for desc in descriptors {
            let status = self.read_checked_status()?;
            if status.params.len() != desc.length as usize {
                return Err(ProtocolError::UnexpectedParamCount);
            }
            responses.push(status.params);
        }
        Ok(responses)
    }

    pub fn bulk_write(&mut self, descriptors: &[BulkWriteDescriptor]) -> Result<(), ProtocolError> {
        let mut params = Vec::new();
        for desc in descriptors {
            params.push(desc.id);
            params.extend_from_slice(&desc.addr.to_le_bytes());
            params.extend_from_slice(&(desc.data.len() as u16).to_le_bytes());
            params.extend_from_slice(&desc.data);
        }
        self.write_instruction(BROADCAST_ID, InstructionCode::BulkWrite, params)
    }

    /// Like `sync_read` but all devices answer inside one aggregated status
    /// packet instead of one packet each.
    pub fn fast_sync_read(
        &mut self,
        ids: &[u8],
        addr: u16,
        length: u16,
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if ids.is_empty() {
            return Err(ProtocolError::MinOneIdRequired);
        }
        let mut params = Vec::with_capacity(4 + ids.len());
        params.extend_from_slice(&addr.to_le_bytes());
        params.extend_from_slice(&length.to_le_bytes());
        params.extend_from_slice(ids);
        self.write_instruction(BROADCAST_ID, InstructionCode::FastSyncRead, params)?;

        let status = self.read_checked_status()?;
        let lengths = vec![length as usize; ids.len()];
        split_fast_records(&status.params, &lengths)
    }

    pub fn fast_bulk_read(
        &mut self,
        descriptors: &[BulkReadDescriptor],
    ) -> Result<Vec<Vec<u8>>, ProtocolError> {
        if descriptors.is_empty() {
            return Err(ProtocolError::MinOneIdRequired);
        }
        let mut params = Vec::with_capacity(descriptors.len() * 5);
        for desc in descriptors {
            params.push(desc.id);
            params.extend_from_slice(&desc.addr.to_le_bytes());
            params.extend_from_slice(&desc.length.to_le_bytes());
        }
        self.write_instruction(BROADCAST_ID, InstructionCode::FastBulkRead, params)?;

        let status = self.read_checked_status()?;
        let lengths: Vec<usize> = descriptors.iter().map(|d| d.length as usize).collect();
        split_fast_records(&status.params, &lengths)
    }
}

/// Splits the aggregated parameter blob of a fast sync/bulk read.
///
/// Layout: `id₁, data₁` for the first record, then for each further record a
/// two byte sub-CRC for the previous one, the `0x00` separator, the id, and
/// the data. The trailing aggregate CRC was already consumed as the status
/// packet CRC. Sub-CRCs are treated as opaque; devices answer in the order
/// they were addressed, so records are split positionally.
fn split_fast_records(params: &[u8], lengths: &[usize]) -> Result<Vec<Vec<u8>>, ProtocolError> {
    let expected = 1 + lengths.iter().sum::<usize>() + (lengths.len() - 1) * 4;
    if params.len() != expected {
        return Err(ProtocolError::UnexpectedParamCount);
    }

    let mut records = Vec::with_capacity(lengths.len());
    let mut pos = 1;
    for (i, &length) in lengths.iter().enumerate() {
        if i > 0 {
            pos += 4;
        }
        records.push(params[pos..pos + length].to_vec());
        pos += length;
    }
    Ok(records)
}
