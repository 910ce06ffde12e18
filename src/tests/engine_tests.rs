// Copyright (c) 2025 Varshith Gudur. Licensed under AGPLv3.
use super::{request, sector_of, setup, test_config, warm};
use crate::checksum::{compute16, ChecksumValue};
use crate::config::{FaultPolicy, FilterConfig};
use crate::engine::SlotRead;
use crate::error::FilterError;
use crate::fault::FaultKind;
use crate::types::{IoDirection, IoRequest, RegionIndex, RequestId, SectorRange, VerificationOutcome};

#[test]
fn test_write_then_read_same_content_verifies() {
    let (engine, sched) = setup(test_config());
    warm(&engine, 100);

    let buf = sector_of(0xAA);
    let c1 = compute16(0, &buf);
    let out = engine.on_io_range_touched(&request(1, 100, IoDirection::Write, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::Verified);
    assert_eq!(engine.stored_checksum(100).unwrap(), SlotRead::Value(ChecksumValue(c1)));

    let c2 = compute16(0, &buf);
    assert_eq!(c1, c2);
    let out = engine.on_io_range_touched(&request(2, 100, IoDirection::Read, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::Verified);

    let stats = engine.stats();
    assert_eq!(stats.stored, 1);
    assert_eq!(stats.verified, 1);
    assert_eq!(sched.scheduled_count(), 0, "resident path never schedules");
}

#[test]
fn test_flipped_bit_raises_data_mismatch() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 100);

    let mut buf = sector_of(0xAA);
    engine.on_io_range_touched(&request(1, 100, IoDirection::Write, &buf)).unwrap();
    buf[17] ^= 0x04;
    let out = engine.on_io_range_touched(&request(2, 100, IoDirection::Read, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::FaultRaised(FaultKind::DataMismatch));

    let snap = engine.exception().expect("fault captured");
    assert_eq!(snap.sector, 100);
    assert_eq!(snap.kind, FaultKind::DataMismatch);
    assert_eq!(snap.request, Some(RequestId(2)));
    assert!(snap.synchronous);
    assert_eq!(snap.found, ChecksumValue::of(&buf));
    assert!(engine.is_raising_exception());
    assert_eq!(engine.stats().faults, 1);
}

#[test]
fn test_fault_latches_for_later_io() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 0);
    let good = sector_of(1);
    let bad = sector_of(2);
    engine.on_io_range_touched(&request(1, 0, IoDirection::Write, &good)).unwrap();
    engine.on_io_range_touched(&request(2, 0, IoDirection::Read, &bad)).unwrap();

    // Unrelated, well-formed I/O is refused too.
    let out = engine.on_io_range_touched(&request(3, 5, IoDirection::Write, &good)).unwrap();
    assert_eq!(out, VerificationOutcome::FaultRaised(FaultKind::DataMismatch));
    assert_eq!(engine.stored_checksum(5).unwrap(), SlotRead::Value(ChecksumValue::UNKNOWN));
    assert_eq!(engine.stats().faults, 1);
}

#[test]
fn test_shadow_tamper_raises_metadata_corruption() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 10);
    let buf = sector_of(0x3C);
    engine.on_io_range_touched(&request(1, 10, IoDirection::Write, &buf)).unwrap();

    let stored = ChecksumValue::of(&buf);
    engine.with_state(|st| {
        st.table
            .region_mut(RegionIndex(1))
            .unwrap()
            .tamper_shadow(2, ChecksumValue(stored.0.wrapping_add(1)));
    });

    assert_eq!(
        engine.stored_checksum(10).unwrap(),
        SlotRead::FaultRaised(FaultKind::MetadataCorruption)
    );
    let snap = engine.exception().unwrap();
    assert_eq!(snap.kind, FaultKind::MetadataCorruption);
    assert_eq!(snap.sector, 10);
    assert_eq!(snap.expected, stored);
}

#[test]
fn test_shadow_tamper_detected_on_read_io() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 3);
    let buf = sector_of(0x11);
    engine.on_io_range_touched(&request(1, 3, IoDirection::Write, &buf)).unwrap();
    engine.with_state(|st| {
        st.table
            .region_mut(RegionIndex(0))
            .unwrap()
            .tamper_shadow(3, ChecksumValue(ChecksumValue::of(&buf).0 ^ 0x8000));
    });
    let out = engine.on_io_range_touched(&request(2, 3, IoDirection::Read, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::FaultRaised(FaultKind::MetadataCorruption));
}

#[test]
fn test_invalidated_sector_never_mismatches() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 4);
    let old = sector_of(0x01);
    let new = sector_of(0x02);
    engine.on_io_range_touched(&request(1, 4, IoDirection::Write, &old)).unwrap();

    engine.invalidate_range(SectorRange::new(4, 1)).unwrap();
    assert_eq!(engine.stored_checksum(4).unwrap(), SlotRead::Value(ChecksumValue::UNKNOWN));

    let out = engine.on_io_range_touched(&request(2, 4, IoDirection::Read, &new)).unwrap();
    assert_eq!(out, VerificationOutcome::Verified);
    assert!(engine.exception().is_none());
    assert_eq!(engine.stats().invalidated, 1);
}

#[test]
fn test_first_read_learns_checksum() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 6);
    let buf = sector_of(0x42);
    let out = engine.on_io_range_touched(&request(1, 6, IoDirection::Read, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::Verified);
    assert_eq!(
        engine.stored_checksum(6).unwrap(),
        SlotRead::Value(ChecksumValue::of(&buf))
    );

    let other = sector_of(0x43);
    let out = engine.on_io_range_touched(&request(2, 6, IoDirection::Read, &other)).unwrap();
    assert_eq!(out, VerificationOutcome::FaultRaised(FaultKind::DataMismatch));
}

#[test]
fn test_first_read_learning_can_be_disabled() {
    let cfg = FilterConfig {
        learn_on_first_read: false,
        ..test_config()
    };
    let (engine, _sched) = setup(cfg);
    warm(&engine, 6);
    let buf = sector_of(0x42);
    engine.on_io_range_touched(&request(1, 6, IoDirection::Read, &buf)).unwrap();
    assert_eq!(engine.stored_checksum(6).unwrap(), SlotRead::Value(ChecksumValue::UNKNOWN));
}

#[test]
fn test_multi_sector_range() {
    let (engine, _sched) = setup(test_config());
    engine.make_resident(SectorRange::new(6, 4)).unwrap();
    assert!(engine.is_resident(RegionIndex(0)));
    assert!(engine.is_resident(RegionIndex(1)));

    let mut buf: Vec<u8> = Vec::new();
    for fill in 0..4u8 {
        buf.extend(sector_of(fill + 1));
    }
    let out = engine.on_io_range_touched(&request(1, 6, IoDirection::Write, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::Verified);
    for (i, sector) in (6..10u64).enumerate() {
        assert_eq!(
            engine.stored_checksum(sector).unwrap(),
            SlotRead::Value(ChecksumValue::of(&buf[i * 512..(i + 1) * 512]))
        );
    }

    // Corrupt the third sector only.
    buf[2 * 512] ^= 0xFF;
    let out = engine.on_io_range_touched(&request(2, 6, IoDirection::Read, &buf)).unwrap();
    assert_eq!(out, VerificationOutcome::FaultRaised(FaultKind::DataMismatch));
    assert_eq!(engine.exception().unwrap().sector, 8);
    assert_eq!(engine.stats().verified, 2, "checking stops at the fault");
}

#[test]
fn test_rejects_misaligned_buffer() {
    let (engine, _sched) = setup(test_config());
    let buf = vec![0u8; 700];
    let req = IoRequest {
        id: RequestId(1),
        range: SectorRange::new(0, 1),
        direction: IoDirection::Write,
        buffer: &buf,
    };
    assert!(matches!(
        engine.on_io_range_touched(&req),
        Err(FilterError::InvalidArgument(_))
    ));

    let empty = IoRequest {
        id: RequestId(2),
        range: SectorRange::new(0, 0),
        direction: IoDirection::Read,
        buffer: &[],
    };
    assert!(matches!(
        engine.on_io_range_touched(&empty),
        Err(FilterError::InvalidArgument(_))
    ));
}

#[test]
fn test_rejects_out_of_range_sector() {
    let (engine, _sched) = setup(test_config());
    let buf = sector_of(0);
    // 64 regions of 8 sectors.
    let err = engine
        .on_io_range_touched(&request(1, 512, IoDirection::Write, &buf))
        .unwrap_err();
    assert!(matches!(err, FilterError::OutOfRange { region: 64, .. }));
    assert!(matches!(
        engine.invalidate_range(SectorRange::new(510, 4)),
        Err(FilterError::OutOfRange { .. })
    ));
    assert_eq!(engine.pending_deferred(), 0);
}

#[test]
#[should_panic(expected = "DataMismatch")]
fn test_halt_policy_stops() {
    let cfg = FilterConfig {
        fault_policy: FaultPolicy::Halt,
        ..test_config()
    };
    let (engine, _sched) = setup(cfg);
    warm(&engine, 0);
    engine
        .on_io_range_touched(&request(1, 0, IoDirection::Write, &sector_of(1)))
        .unwrap();
    let _ = engine.on_io_range_touched(&request(2, 0, IoDirection::Read, &sector_of(2)));
}

#[test]
fn test_fault_report_includes_history() {
    let (engine, _sched) = setup(test_config());
    warm(&engine, 0);
    engine
        .on_io_range_touched(&request(1, 1, IoDirection::Write, &sector_of(9)))
        .unwrap();
    engine
        .on_io_range_touched(&request(2, 1, IoDirection::Read, &sector_of(8)))
        .unwrap();

    let report = engine.fault_report().unwrap();
    assert_eq!(report.code, FaultKind::DataMismatch.code());
    assert_eq!(report.recent.len(), 2);
    assert_eq!(report.recent[0].direction, IoDirection::Write);
    assert_eq!(report.recent[1].sector, 1);
    let json = report.to_json().unwrap();
    assert!(json.contains("DataMismatch"));
}

#[test]
fn test_external_fault_is_latched() {
    let (engine, _sched) = setup(test_config());
    let out = engine.raise_fault(FaultKind::MetadataCorruption, 77, Some(RequestId(5)), false);
    assert_eq!(out, VerificationOutcome::FaultRaised(FaultKind::MetadataCorruption));
    let snap = engine.exception().unwrap();
    assert_eq!((snap.sector, snap.synchronous), (77, false));

    // A second fault does not replace the first capture.
    engine.raise_fault(FaultKind::DataMismatch, 1, None, true);
    assert_eq!(engine.exception().unwrap().sector, 77);
    assert_eq!(engine.stats().faults, 1);
}
