//! A simulated device chain for driving the packet handler in tests.
//!
//! Devices hold a real control table and honour the response policy of the
//! protocol, so the handler sees byte streams indistinguishable from a live
//! bus: statuses padded with line noise, delayed mid-packet, or withheld
//! entirely for broadcast instructions.

use std::time::Duration;

use crate::protocol::codec::{crc16, stuff};
use crate::protocol::dxl_def::*;
use crate::protocol::instruction::{parse_instruction_packet, Instruction, InstructionCode};

/// Bytes a device puts on the line, released after `delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimedBytes {
    pub delay: Duration,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub id: u8,
    pub model_number: u16,
    pub firmware: u8,
    /// Initial control table contents; also the factory defaults.
    pub control_table: Vec<u8>,
    /// Forced error byte on every status this device sends.
    pub processing_error: u8,
    /// Pause before the first byte of any status.
    pub initial_silence: Duration,
    /// Extra pause inserted at `delay_position` within the status bytes.
    pub mid_packet_delay: Duration,
    pub delay_position: usize,
    /// Surround statuses with a little line noise, as a real half-duplex
    /// bus does with instruction echoes and leftovers.
    pub pad_with_garbage: bool,
    /// Drop or add one parameter byte to provoke count checks.
    pub wrong_param_count: bool,
}

impl Default for DeviceConfig {
    fn default() -> DeviceConfig {
        DeviceConfig {
            id: 1,
            model_number: 0x0424,
            firmware: 0x2F,
            control_table: vec![0; 64],
            processing_error: 0,
            initial_silence: Duration::ZERO,
            mid_packet_delay: Duration::ZERO,
            delay_position: 0,
            pad_with_garbage: true,
            wrong_param_count: false,
        }
    }
}

// A device's answer before framing: error byte plus parameters.
#[derive(Debug)]
struct Reply {
    error: u8,
    params: Vec<u8>,
}

impl Reply {
    fn ok(params: Vec<u8>) -> Reply {
        Reply { error: 0, params }
    }

    fn error(code: u8) -> Reply {
        Reply {
            error: code,
            params: Vec::new(),
        }
    }
}

const ERR_RESULT: u8 = 0x01;
const ERR_DATA_RANGE: u8 = 0x04;

#[derive(Debug)]
pub struct DxlDeviceSim {
    config: DeviceConfig,
    control_table: Vec<u8>,
    staged: Vec<(u16, Vec<u8>)>,
    backup: Option<Vec<u8>>,
    noise: u32,
}

impl DxlDeviceSim {
    fn new(config: DeviceConfig) -> DxlDeviceSim {
        let control_table = config.control_table.clone();
        let noise = 0x9E37_79B9 ^ (u32::from(config.id) << 8);
        DxlDeviceSim {
            config,
            control_table,
            staged: Vec::new(),
            backup: None,
            noise,
        }
    }

    pub fn id(&self) -> u8 {
        self.config.id
    }

    pub fn control_table(&self) -> &[u8] {
        &self.control_table
    }

    pub fn staged_writes(&self) -> &[(u16, Vec<u8>)] {
        &self.staged
    }

    fn read(&self, addr: u16, length: u16) -> Reply {
        let start = addr as usize;
        let end = start + length as usize;
        if end > self.control_table.len() {
            return Reply::error(ERR_DATA_RANGE);
        }
        Reply::ok(self.control_table[start..end].to_vec())
    }

    fn write(&mut self, addr: u16, data: &[u8]) -> Reply {
        let start = addr as usize;
        let end = start + data.len();
        if end > self.control_table.len() {
            return Reply::error(ERR_DATA_RANGE);
        }
        self.control_table[start..end].copy_from_slice(data);
        Reply::ok(Vec::new())
    }

    fn apply_staged(&mut self) {
        let staged = std::mem::take(&mut self.staged);
        for (addr, data) in staged {
            let _ = self.write(addr, &data);
        }
    }

    fn reset_table(&mut self) {
        self.control_table = self.config.control_table.clone();
        self.staged.clear();
    }

    // Multi-rotation position lives in the first four table bytes; clearing
    // snaps it back into a single revolution.
    fn clear_multi_rotation(&mut self) {
        if self.control_table.len() < 4 {
            return;
        }
        let mut pos = [0u8; 4];
        pos.copy_from_slice(&self.control_table[..4]);
        let wrapped = u32::from_le_bytes(pos) % 4096;
        self.control_table[..4].copy_from_slice(&wrapped.to_le_bytes());
    }

    fn apply(&mut self, instruction: &Instruction) -> Option<Reply> {
        let params = &instruction.params;
        let reply = match instruction.code {
            InstructionCode::Ping => {
                let mut out = Vec::with_capacity(3);
                out.extend_from_slice(&self.config.model_number.to_le_bytes());
                out.push(self.config.firmware);
                Reply::ok(out)
            }
            InstructionCode::Read => {
                if params.len() != 4 {
                    Reply::error(ERR_RESULT)
                } else {
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    let length = u16::from_le_bytes([params[2], params[3]]);
                    self.read(addr, length)
                }
            }
            InstructionCode::Write => {
                if params.len() < 2 {
                    Reply::error(ERR_RESULT)
                } else {
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    self.write(addr, &params[2..])
                }
            }
            InstructionCode::RegWrite => {
                if params.len() < 2 {
                    Reply::error(ERR_RESULT)
                } else {
                    let addr = u16::from_le_bytes([params[0], params[1]]);
                    self.staged.push((addr, params[2..].to_vec()));
                    Reply::ok(Vec::new())
                }
            }
            InstructionCode::Action => {
                self.apply_staged();
                Reply::ok(Vec::new())
            }
            InstructionCode::Reboot => {
                self.reset_table();
                Reply::ok(Vec::new())
            }
            InstructionCode::FactoryReset => {
                self.reset_table();
                Reply::ok(Vec::new())
            }
            InstructionCode::Clear => {
                if params.len() != 5 || params[0] != 0x01 || params[1..] != CLEAR_MAGIC {
                    Reply::error(ERR_RESULT)
                } else {
                    self.clear_multi_rotation();
                    Reply::ok(Vec::new())
                }
            }
            InstructionCode::ControlTableBackup => {
                if params.len() != 5 || params[0] > 0x02 || params[1..] != BACKUP_MAGIC {
                    Reply::error(ERR_RESULT)
                } else if params[0] == 0x01 {
                    self.backup = Some(self.control_table.clone());
                    Reply::ok(Vec::new())
                } else if let Some(backup) = self.backup.clone() {
                    self.control_table = backup;
                    Reply::ok(Vec::new())
                } else {
                    Reply::error(ERR_RESULT)
                }
            }
            // Group instructions are resolved at bus level.
            _ => return None,
        };
        Some(reply)
    }

    fn next_noise_byte(&mut self) -> u8 {
        // xorshift32; masked so noise can never contain 0xFF and fake a
        // header in front of a real packet.
        let mut x = self.noise;
        x ^= x << 13;
        x ^= x >> 17;
        x ^= x << 5;
        self.noise = x;
        (x as u8) & 0x7F
    }

    fn emit_reply(&mut self, mut reply: Reply, status_id: u8) -> Vec<TimedBytes> {
        if self.config.processing_error != 0 {
            reply = Reply::error(self.config.processing_error);
        }
        if self.config.wrong_param_count {
            if reply.params.len() > 1 {
                reply.params.pop();
            } else {
                reply.params.push(self.next_noise_byte());
            }
        }

        let stuffed = stuff(&reply.params);
        let length = (STATUS_BASE_LENGTH + stuffed.len()) as u16;
        let mut packet = Vec::with_capacity(MIN_STATUS_PACKET_LEN + stuffed.len());
        packet.extend_from_slice(&HEADER);
        packet.push(status_id);
        packet.extend_from_slice(&length.to_le_bytes());
        packet.push(InstructionCode::Status as u8);
        packet.push(reply.error);
        packet.extend_from_slice(&stuffed);
        let crc = crc16(&packet);
        packet.extend_from_slice(&crc.to_le_bytes());

        self.emit_wire(packet)
    }

    fn emit_wire(&mut self, packet: Vec<u8>) -> Vec<TimedBytes> {
        let mut wire = Vec::with_capacity(packet.len() + 10);
        if self.config.pad_with_garbage {
            let lead = (self.next_noise_byte() % 6) as usize;
            for _ in 0..lead {
                let byte = self.next_noise_byte();
                wire.push(byte);
            }
        }
        wire.extend_from_slice(&packet);
        if self.config.pad_with_garbage {
            let tail = (self.next_noise_byte() % 6) as usize;
            for _ in 0..tail {
                let byte = self.next_noise_byte();
                wire.push(byte);
            }
        }

        let silence = self.config.initial_silence;
        if self.config.mid_packet_delay > Duration::ZERO {
            let split = self.config.delay_position.min(wire.len());
            let tail = wire.split_off(split);
            return vec![
                TimedBytes {
                    delay: silence,
                    bytes: wire,
                },
                TimedBytes {
                    delay: silence + self.config.mid_packet_delay,
                    bytes: tail,
                },
            ];
        }
        vec![TimedBytes {
            delay: silence,
            bytes: wire,
        }]
    }
}

/// A daisy chain of simulated devices sharing one line.
#[derive(Debug, Default)]
pub struct DxlBusSim {
    devices: Vec<DxlDeviceSim>,
}

impl DxlBusSim {
    pub fn new() -> DxlBusSim {
        DxlBusSim::default()
    }

    pub fn add_device(&mut self, config: DeviceConfig) {
        if self.device(config.id).is_none() {
            self.devices.push(DxlDeviceSim::new(config));
        }
    }

    pub fn device(&self, id: u8) -> Option<&DxlDeviceSim> {
        self.devices.iter().find(|device| device.id() == id)
    }

    pub fn device_mut(&mut self, id: u8) -> Option<&mut DxlDeviceSim> {
        self.devices.iter_mut().find(|device| device.id() == id)
    }

    /// Feeds one instruction frame to the chain and collects whatever the
    /// devices put back on the line. Frames a conforming device would drop
    /// (bad CRC, unknown instruction, someone else's status) produce nothing.
    pub fn handle_frame(&mut self, frame: &[u8]) -> Vec<TimedBytes> {
        let Some(instruction) = parse_instruction_packet(frame) else {
            return Vec::new();
        };

        match instruction.code {
            InstructionCode::SyncRead => self.sync_read(&instruction),
            InstructionCode::SyncWrite => {
                self.sync_write(&instruction);
                Vec::new()
            }
            InstructionCode::BulkRead => self.bulk_read(&instruction),
            InstructionCode::BulkWrite => {
                self.bulk_write(&instruction);
                Vec::new()
            }
            InstructionCode::FastSyncRead => self.fast_sync_read(&instruction),
            InstructionCode::FastBulkRead => self.fast_bulk_read(&instruction),
            _ if instruction.id == BROADCAST_ID => {
                // Broadcast FactoryReset with the reset-all option is defined
                // to be ignored; everything else applies silently, except
                // Ping where every device answers in chain order.
                if instruction.code == InstructionCode::FactoryReset
                    && instruction.params.first() == Some(&0xFF)
                {
                    return Vec::new();
                }
                let mut out = Vec::new();
                for device in &mut self.devices {
                    let id = device.id();
                    let reply = device.apply(&instruction);
                    if instruction.code == InstructionCode::Ping {
                        if let Some(reply) = reply {
                            out.extend(device.emit_reply(reply, id));
                        }
                    }
                }
                out
            }
            _ => {
                let Some(device) = self.device_mut(instruction.id) else {
                    return Vec::new();
                };
                match device.apply(&instruction) {
                    Some(reply) => device.emit_reply(reply, instruction.id),
                    None => Vec::new(),
                }
            }
        }
    }

    // One status per listed id, in list order: the chain answers the way the
    // protocol sequences it, not in chain order.
    fn sync_read(&mut self, instruction: &Instruction) -> Vec<TimedBytes> {
        if instruction.id != BROADCAST_ID || instruction.params.len() < 4 {
            return Vec::new();
        }
        let addr = u16::from_le_bytes([instruction.params[0], instruction.params[1]]);
        let length = u16::from_le_bytes([instruction.params[2], instruction.params[3]]);
        let ids = &instruction.params[4..];

        let mut out = Vec::new();
        for &id in ids {
            if let Some(device) = self.device_mut(id) {
                let reply = device.read(addr, length);
                out.extend(device.emit_reply(reply, id));
            }
        }
        out
    }

    fn sync_write(&mut self, instruction: &Instruction) {
        if instruction.id != BROADCAST_ID || instruction.params.len() < 4 {
            return;
        }
        let addr = u16::from_le_bytes([instruction.params[0], instruction.params[1]]);
        let length = u16::from_le_bytes([instruction.params[2], instruction.params[3]]) as usize;
        let chunk_len = length + 1;
        if chunk_len == 1 {
            return;
        }
        let tail = &instruction.params[4..];
        if tail.len() % chunk_len != 0 {
            return;
        }
        for chunk in tail.chunks(chunk_len) {
            let data = chunk[1..].to_vec();
            if let Some(device) = self.device_mut(chunk[0]) {
                let _ = device.write(addr, &data);
            }
        }
    }

    fn bulk_read(&mut self, instruction: &Instruction) -> Vec<TimedBytes> {
        if instruction.id != BROADCAST_ID || instruction.params.len() % 5 != 0 {
            return Vec::new();
        }
        let mut out = Vec::new();
        for desc in instruction.params.chunks(5) {
            let id = desc[0];
            let addr = u16::from_le_bytes([desc[1], desc[2]]);
            let length = u16::from_le_bytes([desc[3], desc[4]]);
            if let Some(device) = self.device_mut(id) {
                let reply = device.read(addr, length);
                out.extend(device.emit_reply(reply, id));
            }
        }
        out
    }

    fn bulk_write(&mut self, instruction: &Instruction) {
        if instruction.id != BROADCAST_ID {
            return;
        }
        let mut rest = instruction.params.as_slice();
        while rest.len() >= 5 {
            let id = rest[0];
            let addr = u16::from_le_bytes([rest[1], rest[2]]);
            let length = u16::from_le_bytes([rest[3], rest[4]]) as usize;
            if rest.len() < 5 + length {
                return;
            }
            let data = rest[5..5 + length].to_vec();
            if let Some(device) = self.device_mut(id) {
                let _ = device.write(addr, &data);
            }
            rest = &rest[5 + length..];
        }
    }

    fn fast_sync_read(&mut self, instruction: &Instruction) -> Vec<TimedBytes> {
        if instruction.id != BROADCAST_ID || instruction.params.len() < 5 {
            return Vec::new();
        }
        let addr = u16::from_le_bytes([instruction.params[0], instruction.params[1]]);
        let length = u16::from_le_bytes([instruction.params[2], instruction.params[3]]);
        let ids = instruction.params[4..].to_vec();
        let windows: Vec<(u8, u16, u16)> = ids.iter().map(|&id| (id, addr, length)).collect();
        self.fast_aggregate(&windows)
    }

    fn fast_bulk_read(&mut self, instruction: &Instruction) -> Vec<TimedBytes> {
        if instruction.id != BROADCAST_ID
            || instruction.params.is_empty()
            || instruction.params.len() % 5 != 0
        {
            return Vec::new();
        }
        let windows: Vec<(u8, u16, u16)> = instruction
            .params
            .chunks(5)
            .map(|desc| {
                (
                    desc[0],
                    u16::from_le_bytes([desc[1], desc[2]]),
                    u16::from_le_bytes([desc[3], desc[4]]),
                )
            })
            .collect();
        self.fast_aggregate(&windows)
    }

    // The first addressed device leads the aggregate reply; sub-CRC slots
    // are opaque placeholders, only the trailing packet CRC is real.
    fn fast_aggregate(&mut self, windows: &[(u8, u16, u16)]) -> Vec<TimedBytes> {
        let mut params = Vec::new();
        let mut error = 0u8;
        for (i, &(id, addr, length)) in windows.iter().enumerate() {
            let Some(device) = self.device(id) else {
                return Vec::new();
            };
            let reply = device.read(addr, length);
            if i == 0 {
                error = reply.error;
                params.push(id);
            } else {
                params.extend_from_slice(&[0x00, 0x00]);
                params.push(0x00);
                params.push(id);
            }
            params.extend_from_slice(&reply.params);
        }

        let Some(leader) = self.device_mut(windows[0].0) else {
            return Vec::new();
        };
        let reply = if error != 0 {
            Reply::error(error)
        } else {
            Reply::ok(params)
        };
        leader.emit_reply(reply, BROADCAST_ID)
    }
}
