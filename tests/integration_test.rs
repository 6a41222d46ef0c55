mod common;

use common::{content, damage_in_place, flip_bytes};
use savedinfo::protect::{ProtectError, ProtectOptions, Protector, RecordStatus};
use savedinfo::recovery::CollectingLog;
use savedinfo::{RestoreEvent, BLOCK_SIZE};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tempfile::tempdir;

/// 40 full blocks and a short tail: rows of 16 and 33 blocks.
const LEN: usize = 40 * BLOCK_SIZE + 123;

fn protected_file(dir: &Path, name: &str, seed: u32) -> (PathBuf, Vec<u8>) {
    let path = dir.join(name);
    let data = content(LEN, seed);
    fs::write(&path, &data).unwrap();
    (path, data)
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

#[test]
fn test_create_and_test_healthy_file() {
    let dir = tempdir().unwrap();
    let (path, _) = protected_file(dir.path(), "data.bin", 1);
    let p = Protector::new(ProtectOptions::default());

    let chk = p.create_saved_info(&path).unwrap();
    assert_eq!(chk, dir.path().join("RestoreInfo").join("data.bin.chk"));

    let rows = 2u64;
    let header = 60 + 8 * rows;
    let expected = header + (16 + 33) * BLOCK_SIZE as u64 + 8 + 41 * 3 + 31 + 84;
    assert_eq!(fs::metadata(&chk).unwrap().len(), expected);

    let check = p.test_file(&path).unwrap();
    assert!(check.report.is_healthy(), "{}", check.report.summary());
    assert!(check.report.record_consistent);
    assert!(check.plan.is_clean());
}

#[test]
fn test_silent_corruption_is_repaired_in_place() {
    let dir = tempdir().unwrap();
    let (path, data) = protected_file(dir.path(), "data.bin", 2);
    let p = Protector::new(ProtectOptions::default());
    p.create_saved_info(&path).unwrap();
    let before = mtime(&path);

    damage_in_place(&path, 5 * BLOCK_SIZE as u64 + 100, b"rot");
    let check = p.test_file(&path).unwrap();
    assert_eq!(check.report.status, RecordStatus::UpToDate);
    assert_eq!(check.report.blocks_mismatched, 1);
    assert_eq!(check.report.blocks_restorable, 1);

    let report = p.repair_file(&path).unwrap();
    assert!(report.repaired);
    assert!(!report.record_rewritten);
    assert_eq!(fs::read(&path).unwrap(), data);

    let drift = mtime(&path).duration_since(before).unwrap_or_else(|e| e.duration());
    assert!(drift.as_millis() < 1, "modification time moved by {drift:?}");
    assert!(p.test_file(&path).unwrap().report.is_healthy());
}

#[test]
fn test_secondary_row_rescues_primary_collision() {
    let dir = tempdir().unwrap();
    let (path, data) = protected_file(dir.path(), "data.bin", 3);
    let log = Arc::new(CollectingLog::new());
    let p = Protector::with_log(ProtectOptions::default(), Box::new(Arc::clone(&log)));
    p.create_saved_info(&path).unwrap();

    // Blocks 0 and 16 share slot 0 of the 16-block row.
    damage_in_place(&path, 10, &[0xEE; 8]);
    damage_in_place(&path, 16 * BLOCK_SIZE as u64 + 10, &[0xEE; 8]);

    let report = p.repair_file(&path).unwrap();
    assert_eq!(report.blocks_restorable, 2);
    assert_eq!(report.blocks_unrecoverable, 0);
    assert_eq!(fs::read(&path).unwrap(), data);

    let restored_rows: Vec<usize> = log
        .events()
        .into_iter()
        .filter_map(|e| match e {
            RestoreEvent::BlockRestored { row, .. } => Some(row),
            _ => None,
        })
        .collect();
    assert!(restored_rows.contains(&2));
}

#[test]
fn test_changed_file_makes_record_stale() {
    let dir = tempdir().unwrap();
    let (path, mut data) = protected_file(dir.path(), "data.bin", 4);
    let p = Protector::new(ProtectOptions::default());
    p.create_saved_info(&path).unwrap();

    data.extend_from_slice(b"appended");
    fs::write(&path, &data).unwrap();

    let check = p.test_file(&path).unwrap();
    assert_eq!(check.report.status, RecordStatus::StaleMustRebuild);
    assert!(!check.report.tested);

    let report = p.repair_file(&path).unwrap();
    assert!(report.record_rewritten);
    assert!(!report.repaired);
    assert!(p.test_file(&path).unwrap().report.is_healthy());
}

#[test]
fn test_damaged_record_header_still_repairs_data() {
    let dir = tempdir().unwrap();
    let (path, data) = protected_file(dir.path(), "data.bin", 5);
    let p = Protector::new(ProtectOptions::default());
    let chk = p.create_saved_info(&path).unwrap();

    flip_bytes(&chk, 0..100);
    damage_in_place(&path, 16 * BLOCK_SIZE as u64, b"xyz");

    let check = p.test_file(&path).unwrap();
    assert_eq!(check.report.status, RecordStatus::DamagedMustRebuild);
    assert!(check.report.tested);
    assert_eq!(check.report.blocks_restorable, 1);

    let report = p.repair_file(&path).unwrap();
    assert!(report.repaired);
    assert!(report.record_rewritten);
    assert_eq!(fs::read(&path).unwrap(), data);

    let after = p.test_file(&path).unwrap();
    assert_eq!(after.report.status, RecordStatus::UpToDate);
    assert!(after.report.is_healthy());
}

#[test]
fn test_damaged_record_scalars_do_not_look_stale() {
    // Timestamp, file length and checksum count of the leading header.
    for at in [30, 40, 47] {
        let dir = tempdir().unwrap();
        let (path, data) = protected_file(dir.path(), "data.bin", 30);
        let p = Protector::new(ProtectOptions::default());
        let chk = p.create_saved_info(&path).unwrap();

        flip_bytes(&chk, at..at + 1);
        damage_in_place(&path, 5 * BLOCK_SIZE as u64 + 7, b"rot");

        let check = p.test_file(&path).unwrap();
        assert_eq!(check.report.status, RecordStatus::DamagedMustRebuild, "byte {at}");
        assert!(check.report.tested, "byte {at}");
        assert_eq!(check.report.blocks_restorable, 1, "byte {at}");

        let report = p.repair_file(&path).unwrap();
        assert!(report.repaired, "byte {at}");
        assert!(report.record_rewritten, "byte {at}");
        assert_eq!(fs::read(&path).unwrap(), data, "byte {at}");
        assert!(p.test_file(&path).unwrap().report.is_healthy(), "byte {at}");
    }
}

#[test]
fn test_stale_record_returns_its_blocks_to_the_pool() {
    let dir = tempdir().unwrap();
    let (path, mut data) = protected_file(dir.path(), "data.bin", 31);
    let p = Protector::new(ProtectOptions::default());
    p.create_saved_info(&path).unwrap();
    data.push(0);
    fs::write(&path, &data).unwrap();

    let idle = p.pool().idle();
    let check = p.test_file(&path).unwrap();
    assert_eq!(check.report.status, RecordStatus::StaleMustRebuild);
    assert_eq!(p.pool().idle(), idle);
}

#[test]
fn test_unreadable_record_is_recreated() {
    let dir = tempdir().unwrap();
    let (path, _) = protected_file(dir.path(), "data.bin", 6);
    let p = Protector::new(ProtectOptions::default());
    let chk = p.create_saved_info(&path).unwrap();
    fs::write(&chk, b"definitely not saved info").unwrap();

    let report = p.repair_file(&path).unwrap();
    assert_eq!(report.status, RecordStatus::DamagedMustRebuild);
    assert!(report.record_rewritten);
    assert!(p.test_file(&path).unwrap().report.is_healthy());
}

#[test]
fn test_missing_record_is_an_error() {
    let dir = tempdir().unwrap();
    let (path, _) = protected_file(dir.path(), "data.bin", 7);
    let p = Protector::new(ProtectOptions::default());
    assert!(matches!(p.test_file(&path), Err(ProtectError::NoRecord(_))));
}

#[test]
fn test_empty_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty");
    fs::write(&path, b"").unwrap();
    let p = Protector::new(ProtectOptions::default());
    p.create_saved_info(&path).unwrap();

    let check = p.test_file(&path).unwrap();
    assert!(check.report.is_healthy(), "{}", check.report.summary());
    assert_eq!(check.report.blocks_total, 0);
}

#[test]
fn test_copies_reconcile_their_records() {
    let dir = tempdir().unwrap();
    let (a_dir, b_dir) = (dir.path().join("a"), dir.path().join("b"));
    fs::create_dir_all(&a_dir).unwrap();
    fs::create_dir_all(&b_dir).unwrap();
    let (a, _) = protected_file(&a_dir, "same.bin", 8);
    let (b, _) = protected_file(&b_dir, "same.bin", 8);

    let p = Protector::new(ProtectOptions::default());
    let chk_a = p.create_saved_info(&a).unwrap();
    let chk_b = p.create_saved_info(&b).unwrap();
    flip_bytes(&chk_a, 0..40);
    assert!(p.load_record(&chk_a).unwrap().needs_rebuild());

    assert!(p.reconcile_records(&chk_a, &chk_b).unwrap());
    let ra = p.load_record(&chk_a).unwrap();
    let rb = p.load_record(&chk_b).unwrap();
    assert!(!ra.needs_rebuild());
    assert_eq!(ra.rows(), rb.rows());
    assert_eq!(ra.checksums(), rb.checksums());

    assert!(!p.reconcile_records(&chk_a, &chk_b).unwrap());
}

#[test]
fn test_batch_over_several_files() {
    let dir = tempdir().unwrap();
    let files: Vec<PathBuf> = (0..4).map(|i| protected_file(dir.path(), &format!("f{i}"), 10 + i).0).collect();
    let p = Protector::new(ProtectOptions::default());

    let created = p.for_each_file(&files, |p, f| p.create_saved_info(f));
    assert!(created.iter().all(Result::is_ok));

    let reports = p.for_each_file(&files, |p, f| p.test_file(f).map(|c| c.report));
    for (file, report) in files.iter().zip(reports) {
        let report = report.unwrap();
        assert_eq!(&report.path, file);
        assert!(report.is_healthy());
    }
}

#[test]
fn test_report_serializes_to_json() {
    let dir = tempdir().unwrap();
    let (path, _) = protected_file(dir.path(), "data.bin", 20);
    let p = Protector::new(ProtectOptions::default());
    p.create_saved_info(&path).unwrap();

    let report = p.test_file(&path).unwrap().report;
    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["status"], "UpToDate");
    assert_eq!(json["strategy"], "Buffered");
    assert_eq!(json["blocks_total"], 41);
}
