use std::time::Duration;

use crate::protocol::error::{DeviceError, ProtocolError};
use crate::protocol::handler::{
    BackupKind, BulkReadDescriptor, BulkWriteDescriptor, ClearKind, FactoryResetKind,
    PacketHandler,
};
use crate::protocol::port_handler::SimPort;
use crate::sim::{DeviceConfig, DxlBusSim};

fn device(id: u8, table: &[u8]) -> DeviceConfig {
    DeviceConfig {
        id,
        model_number: 0x0424,
        firmware: 0x2F,
        control_table: table.to_vec(),
        ..DeviceConfig::default()
    }
}

fn handler_for(configs: Vec<DeviceConfig>) -> PacketHandler<SimPort> {
    let mut bus = DxlBusSim::new();
    for config in configs {
        bus.add_device(config);
    }
    PacketHandler::new(SimPort::new(bus), Duration::ZERO)
}

const TABLE_1: [u8; 6] = [0x32, 0x14, 0xF0, 0xE9, 0xA9, 0x7C];
const TABLE_2: [u8; 6] = [0xA9, 0x56, 0xFF, 0x93, 0xBB, 0x7C];
const TABLE_3: [u8; 6] = [0x99, 0xAF, 0x12, 0x98, 0x7D, 0xE3];

#[test]
fn ping_returns_configured_identity() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    let response = handler.ping(0x99).unwrap();
    assert_eq!(response.id, 0x99);
    assert_eq!(response.model, 0x0424);
    assert_eq!(response.firmware, 0x2F);
}

#[test]
fn write_then_read_returns_same_data() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    let data = [0xF1, 0xF2];
    handler.write(0x99, 2, &data).unwrap();
    assert_eq!(handler.read(0x99, 2, 2).unwrap(), data);
}

#[test]
fn reg_write_then_action_equals_direct_write() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    let data = [0xF1, 0xF2];
    handler.reg_write(0x99, 3, &data).unwrap();
    // Nothing applied until Action.
    assert_eq!(handler.read(0x99, 3, 2).unwrap(), &TABLE_1[3..5]);

    handler.action(0x99).unwrap();
    assert_eq!(handler.read(0x99, 3, 2).unwrap(), data);
}

#[test]
fn factory_reset_restores_the_table() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    handler.write(0x99, 0, &[0xF1, 0xFA, 0x09, 0xA0]).unwrap();
    handler
        .factory_reset(0x99, FactoryResetKind::ExceptId)
        .unwrap();
    assert_eq!(handler.read(0x99, 0, 6).unwrap(), TABLE_1);
}

#[test]
fn clear_wraps_the_multi_rotation_position() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    handler.clear(0x99, ClearKind::MultiRotationPos).unwrap();
    // 0xE9F01432 % 4096 == 0x432
    assert_eq!(handler.read(0x99, 0, 4).unwrap(), [0x32, 0x04, 0x00, 0x00]);
}

#[test]
fn control_table_backup_roundtrips() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    handler
        .control_table_backup(0x99, BackupKind::Store)
        .unwrap();
    handler.write(0x99, 0, &[0xF1, 0xFA, 0x09, 0xA0]).unwrap();
    handler
        .control_table_backup(0x99, BackupKind::Restore)
        .unwrap();
    assert_eq!(handler.read(0x99, 0, 6).unwrap(), TABLE_1);
}

#[test]
fn sync_read_returns_each_devices_window() {
    let mut handler = handler_for(vec![
        device(0x99, &TABLE_1),
        device(0xF0, &TABLE_2),
        device(0x1B, &TABLE_3),
    ]);

    let data = handler.sync_read(&[0x99, 0xF0, 0x1B], 3, 2).unwrap();
    assert_eq!(data[0], &TABLE_1[3..5]);
    assert_eq!(data[1], &TABLE_2[3..5]);
    assert_eq!(data[2], &TABLE_3[3..5]);
}

#[test]
fn sync_write_updates_every_listed_device() {
    let mut handler = handler_for(vec![
        device(0x99, &TABLE_1),
        device(0xF0, &TABLE_2),
        device(0x1B, &TABLE_3),
    ]);

    let mut packed = Vec::new();
    packed.extend_from_slice(&[0x99, 0xF1, 0xF2]);
    packed.extend_from_slice(&[0xF0, 0xA7, 0xA8]);
    packed.extend_from_slice(&[0x1B, 0x21, 0x43]);
    handler.sync_write(4, 2, &packed).unwrap();

    assert_eq!(handler.read(0x99, 4, 2).unwrap(), [0xF1, 0xF2]);
    assert_eq!(handler.read(0xF0, 4, 2).unwrap(), [0xA7, 0xA8]);
    assert_eq!(handler.read(0x1B, 4, 2).unwrap(), [0x21, 0x43]);
}

#[test]
fn bulk_read_honours_descriptor_lengths() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1), device(0xF0, &TABLE_2)]);

    let data = handler
        .bulk_read(&[
            BulkReadDescriptor { id: 0x99, addr: 0, length: 4 },
            BulkReadDescriptor { id: 0xF0, addr: 2, length: 1 },
        ])
        .unwrap();
    assert_eq!(data[0], &TABLE_1[0..4]);
    assert_eq!(data[1], &TABLE_2[2..3]);
}

#[test]
fn bulk_write_targets_each_descriptor() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1), device(0xF0, &TABLE_2)]);

    handler
        .bulk_write(&[
            BulkWriteDescriptor { id: 0x99, addr: 0, data: vec![0x01, 0x02, 0x03] },
            BulkWriteDescriptor { id: 0xF0, addr: 5, data: vec![0x0F] },
        ])
        .unwrap();

    assert_eq!(handler.read(0x99, 0, 3).unwrap(), [0x01, 0x02, 0x03]);
    assert_eq!(handler.read(0xF0, 5, 1).unwrap(), [0x0F]);
}

#[test]
fn fast_sync_read_aggregates_all_devices() {
    let mut handler = handler_for(vec![
        device(0x99, &TABLE_1),
        device(0xF0, &TABLE_2),
        device(0x1B, &TABLE_3),
    ]);

    let data = handler.fast_sync_read(&[0x99, 0xF0, 0x1B], 1, 3).unwrap();
    assert_eq!(data[0], &TABLE_1[1..4]);
    assert_eq!(data[1], &TABLE_2[1..4]);
    assert_eq!(data[2], &TABLE_3[1..4]);
}

#[test]
fn fast_bulk_read_aggregates_mixed_lengths() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1), device(0xF0, &TABLE_2)]);

    let data = handler
        .fast_bulk_read(&[
            BulkReadDescriptor { id: 0x99, addr: 0, length: 2 },
            BulkReadDescriptor { id: 0xF0, addr: 1, length: 4 },
        ])
        .unwrap();
    assert_eq!(data[0], &TABLE_1[0..2]);
    assert_eq!(data[1], &TABLE_2[1..5]);
}

#[test]
fn broadcast_write_is_silent_but_applies_everywhere() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1), device(0xF0, &TABLE_2)]);

    handler
        .write(crate::protocol::dxl_def::BROADCAST_ID, 0, &[0x5A])
        .unwrap();
    assert_eq!(handler.read(0x99, 0, 1).unwrap(), [0x5A]);
    assert_eq!(handler.read(0xF0, 0, 1).unwrap(), [0x5A]);
}

#[test]
fn broadcast_ping_discovers_the_chain() {
    let mut handler = handler_for(vec![
        device(0x05, &TABLE_1),
        device(0x09, &TABLE_2),
        device(0x11, &TABLE_3),
    ]);

    let found = handler.broadcast_ping().unwrap();
    let ids: Vec<u8> = found.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![0x05, 0x09, 0x11]);
    assert!(found.iter().all(|r| r.model == 0x0424 && r.firmware == 0x2F));
}

#[test]
fn device_error_is_returned_as_the_call_error() {
    let mut handler = handler_for(vec![DeviceConfig {
        processing_error: 0x07,
        ..device(0x99, &TABLE_1)
    }]);

    assert!(matches!(
        handler.write(0x99, 0, &[0x00]),
        Err(ProtocolError::Device(DeviceError::Access))
    ));
}

#[test]
fn wrong_param_count_is_detected() {
    let mut handler = handler_for(vec![DeviceConfig {
        wrong_param_count: true,
        ..device(0x99, &TABLE_1)
    }]);

    assert!(matches!(
        handler.ping(0x99),
        Err(ProtocolError::UnexpectedParamCount)
    ));
    assert!(matches!(
        handler.read(0x99, 0, 4),
        Err(ProtocolError::UnexpectedParamCount)
    ));
}

#[test]
fn mid_packet_delay_beyond_deadline_times_out() {
    let config = DeviceConfig {
        mid_packet_delay: Duration::from_millis(15),
        delay_position: 6,
        ..device(0x99, &TABLE_1)
    };

    let mut bus = DxlBusSim::new();
    bus.add_device(config);
    let mut handler = PacketHandler::new(SimPort::new(bus), Duration::from_millis(10));
    assert!(matches!(
        handler.ping(0x99),
        Err(ProtocolError::ReadTimeout)
    ));
}

#[test]
fn initial_silence_is_a_race_against_the_deadline() {
    let silent = || DeviceConfig {
        initial_silence: Duration::from_millis(15),
        ..device(0x99, &TABLE_1)
    };

    let mut bus = DxlBusSim::new();
    bus.add_device(silent());
    let mut handler = PacketHandler::new(SimPort::new(bus), Duration::from_millis(10));
    assert!(matches!(
        handler.read(0x99, 0, 2),
        Err(ProtocolError::ReadTimeout)
    ));

    let mut bus = DxlBusSim::new();
    bus.add_device(silent());
    let mut handler = PacketHandler::new(SimPort::new(bus), Duration::from_millis(20));
    assert_eq!(handler.read(0x99, 0, 2).unwrap(), &TABLE_1[0..2]);
}

#[test]
fn flush_discards_a_stale_reply() {
    let mut handler = handler_for(vec![device(0x99, &TABLE_1)]);

    // Provoke a stale status by writing the instruction bytes directly,
    // then drop it before the next transaction.
    let ping = crate::protocol::instruction::Instruction::new(
        0x99,
        crate::protocol::instruction::InstructionCode::Ping,
        Vec::new(),
    )
    .packet_bytes()
    .unwrap();
    use crate::protocol::port_handler::PortHandler;
    handler.port_mut().write_port(&ping).unwrap();
    handler.flush().unwrap();

    // The bus is clean again: a fresh transaction sees only its own reply.
    let data = handler.read(0x99, 0, 6).unwrap();
    assert_eq!(data, TABLE_1);
}
