//! File-level operations around the redundancy core: creating `.chk`
//! records next to files, testing files against them and repairing them.
//!
//! ```no_run
//! use savedinfo::protect::{Protector, ProtectOptions};
//! use std::path::Path;
//!
//! let p = Protector::new(ProtectOptions::default());
//! p.create_saved_info(Path::new("movie.mkv"))?;
//! // ... later
//! let report = p.repair_file(Path::new("movie.mkv"))?;
//! println!("{}", report.summary());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! # Read strategy
//! A test pass first reads the file through a large `BufReader`.  A device
//! error in that mode loses track of which block failed, so the pass is
//! abandoned and redone once with one positioned read per block, where an
//! error costs exactly one block.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::block::{BlockPool, SharedBlockPool, BLOCK_SIZE};
use crate::format::{decode_or_empty, encode, FormatError};
use crate::model::RedundancyModel;
use crate::recovery::{RestoreInfo, RestoreLog, RestorePlan, TracingLog};
use crate::sizing::{blocks_for_length, valid_len, SizingPolicy};
use crate::stream::{read_full, read_full_at, ReadOutcome};

pub const SIDECAR_EXTENSION: &str = "chk";
pub const DEFAULT_SIDECAR_DIR: &str = "RestoreInfo";
const BUFFERED_CAPACITY: usize = 64 * BLOCK_SIZE;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ProtectOptions {
    pub sizing:              SizingPolicy,
    /// Largest modification-time difference still treated as "same file".
    pub timestamp_tolerance: Duration,
    /// Rereads of a block whose checksum did not match.
    pub reread_attempts:     u32,
    /// Directory, next to each file, that holds its `.chk` record.
    pub sidecar_dir:         String,
    pub pool_capacity:       usize,
}

impl Default for ProtectOptions {
    fn default() -> Self {
        Self {
            sizing:              SizingPolicy::default(),
            timestamp_tolerance: Duration::seconds(2),
            reread_attempts:     1,
            sidecar_dir:         DEFAULT_SIDECAR_DIR.to_owned(),
            pool_capacity:       256,
        }
    }
}

// ── Errors and results ────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ProtectError {
    #[error("No saved info at {0}")]
    NoRecord(PathBuf),
    #[error("File changed while reading: {0}")]
    FileChanged(PathBuf),
    #[error("Format error: {0}")]
    Format(#[from] FormatError),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Verdict on a record relative to the file it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecordStatus {
    UpToDate,
    /// The record describes another version of the file.
    StaleMustRebuild,
    /// The record is unreadable in parts or does not match the file.
    DamagedMustRebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ReadStrategy {
    Buffered,
    Unbuffered,
}

/// Block indices that did not make it into a pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PassStats {
    pub unreadable: Vec<u64>,
    pub mismatched: Vec<u64>,
}

/// Result of [`run_verify`].
#[derive(Debug)]
pub struct VerifyRun {
    pub model:    RedundancyModel,
    pub stats:    PassStats,
    pub strategy: ReadStrategy,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub path:                 PathBuf,
    pub status:               RecordStatus,
    pub tested:               bool,
    pub strategy:             Option<ReadStrategy>,
    pub blocks_total:         u64,
    pub blocks_unreadable:    usize,
    pub blocks_mismatched:    usize,
    pub blocks_restorable:    usize,
    pub blocks_unrecoverable: usize,
    pub not_restored_bytes:   u64,
    pub record_consistent:    bool,
    pub repaired:             bool,
    pub record_rewritten:     bool,
}

impl FileReport {
    fn new(path: &Path, status: RecordStatus, blocks_total: u64) -> Self {
        Self {
            path: path.to_owned(),
            status,
            tested: false,
            strategy: None,
            blocks_total,
            blocks_unreadable: 0,
            blocks_mismatched: 0,
            blocks_restorable: 0,
            blocks_unrecoverable: 0,
            not_restored_bytes: 0,
            record_consistent: false,
            repaired: false,
            record_rewritten: false,
        }
    }

    pub fn failed_blocks(&self) -> usize {
        self.blocks_unreadable + self.blocks_mismatched
    }

    pub fn is_healthy(&self) -> bool {
        self.tested && self.status == RecordStatus::UpToDate && self.failed_blocks() == 0
    }

    pub fn summary(&self) -> String {
        if !self.tested {
            return format!("{}: {:?}, not tested", self.path.display(), self.status);
        }
        format!(
            "{}: {:?}, {}/{} blocks failed, {} restorable, {} lost ({} bytes){}",
            self.path.display(),
            self.status,
            self.failed_blocks(),
            self.blocks_total,
            self.blocks_restorable,
            self.blocks_unrecoverable,
            self.not_restored_bytes,
            if self.repaired { ", repaired" } else { "" },
        )
    }
}

/// Everything `repair_file` needs from a test pass.
#[derive(Debug)]
pub struct FileCheck {
    pub report:   FileReport,
    pub plan:     RestorePlan,
    pub stats:    PassStats,
    pub modified: DateTime<Utc>,
}

// ── Verify pass ───────────────────────────────────────────────────────────────

enum Source<'a, R: Read + Seek> {
    Buffered(BufReader<&'a mut R>),
    Direct(&'a mut R),
}

impl<R: Read + Seek> Source<'_, R> {
    fn read_block(&mut self, index: u64, buf: &mut [u8]) -> ReadOutcome {
        match self {
            Source::Buffered(r) => read_full(r, buf),
            Source::Direct(r) => read_full_at(&mut **r, index * BLOCK_SIZE as u64, buf),
        }
    }

    fn reread(&mut self, index: u64, buf: &mut [u8]) -> ReadOutcome {
        let offset = index * BLOCK_SIZE as u64;
        match self {
            Source::Buffered(r) => read_full_at(r, offset, buf),
            Source::Direct(r) => read_full_at(&mut **r, offset, buf),
        }
    }
}

/// One pass over `reader` with the given strategy.
///
/// In buffered mode the first device error aborts the pass with `Err`; in
/// unbuffered mode it only marks that block unreadable.
pub fn verify_pass<R: Read + Seek>(
    model:    &mut RedundancyModel,
    reader:   &mut R,
    strategy: ReadStrategy,
    rereads:  u32,
    pool:     &dyn BlockPool,
) -> io::Result<PassStats> {
    reader.seek(SeekFrom::Start(0))?;
    let mut source = match strategy {
        ReadStrategy::Buffered => Source::Buffered(BufReader::with_capacity(BUFFERED_CAPACITY, reader)),
        ReadStrategy::Unbuffered => Source::Direct(reader),
    };

    model.start_restore();
    let file_length = model.file_length();
    let mut stats = PassStats::default();
    let mut block = pool.acquire();

    for index in 0..model.block_count() {
        let want = valid_len(file_length, index);
        block.clear();
        match source.read_block(index, &mut block[..want]) {
            ReadOutcome::Data(n) if n == want => {
                let mut accepted = model.observe_for_test_or_restore(&block, index);
                let mut attempt = 0;
                while !accepted && attempt < rereads {
                    attempt += 1;
                    block.clear();
                    if !source.reread(index, &mut block[..want]).is_complete(want) {
                        break;
                    }
                    accepted = model.observe_for_test_or_restore(&block, index);
                }
                if !accepted {
                    debug!(index, "block fails its checksum");
                    stats.mismatched.push(index);
                }
            }
            ReadOutcome::Failed(e) if strategy == ReadStrategy::Buffered => {
                pool.release(block);
                return Err(e);
            }
            ReadOutcome::Failed(e) => {
                debug!(index, error = %e, "block unreadable");
                stats.unreadable.push(index);
            }
            ReadOutcome::Data(_) | ReadOutcome::Eof => {
                stats.unreadable.push(index);
            }
        }
    }
    pool.release(block);
    Ok(stats)
}

/// Verify `reader` against a copy of `record`, downgrading from buffered to
/// per-block reads once if the device reports an error.
pub fn run_verify<R: Read + Seek>(
    record:  &RedundancyModel,
    reader:  &mut R,
    rereads: u32,
    pool:    &dyn BlockPool,
) -> io::Result<VerifyRun> {
    let mut strategy = ReadStrategy::Buffered;
    loop {
        let mut model = record.clone();
        match verify_pass(&mut model, reader, strategy, rereads, pool) {
            Ok(stats) => return Ok(VerifyRun { model, stats, strategy }),
            Err(e) if strategy == ReadStrategy::Buffered => {
                warn!(error = %e, "buffered read failed, redoing pass block by block");
                model.release(pool);
                strategy = ReadStrategy::Unbuffered;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Write the data of `infos` into `writer`, clipped to `file_length`.
/// Returns the number of bytes written.
pub fn write_restore_infos<'a, W, I>(writer: &mut W, infos: I, file_length: u64) -> io::Result<u64>
where
    W: Write + Seek,
    I: IntoIterator<Item = &'a RestoreInfo>,
{
    let mut written = 0u64;
    for info in infos {
        let len = valid_len(file_length, info.block_index());
        if len == 0 {
            continue;
        }
        writer.seek(SeekFrom::Start(info.position))?;
        info.data.write_first(&mut *writer, len)?;
        written += len as u64;
    }
    writer.flush()?;
    Ok(written)
}

// ── Protector ─────────────────────────────────────────────────────────────────

/// File operations sharing one options set, block pool and event sink.
/// `Sync`: independent files may be processed from several threads.
pub struct Protector {
    options: ProtectOptions,
    pool:    SharedBlockPool,
    log:     Box<dyn RestoreLog>,
}

impl Protector {
    pub fn new(options: ProtectOptions) -> Self {
        Self::with_log(options, Box::new(TracingLog))
    }

    pub fn with_log(options: ProtectOptions, log: Box<dyn RestoreLog>) -> Self {
        let pool = SharedBlockPool::new(options.pool_capacity);
        Self { options, pool, log }
    }

    pub fn options(&self) -> &ProtectOptions {
        &self.options
    }

    pub fn pool(&self) -> &SharedBlockPool {
        &self.pool
    }

    /// `<dir>/<sidecar_dir>/<name>.chk`
    pub fn sidecar_path(&self, file: &Path) -> PathBuf {
        let dir = file.parent().unwrap_or_else(|| Path::new("")).join(&self.options.sidecar_dir);
        let mut name: OsString = file.file_name().map(OsString::from).unwrap_or_default();
        name.push(".");
        name.push(SIDECAR_EXTENSION);
        dir.join(name)
    }

    // ── Create ────────────────────────────────────────────────────────────────

    /// Stream `file` once and build its record.
    pub fn encode_file(&self, file: &Path) -> Result<RedundancyModel, ProtectError> {
        let f = File::open(file)?;
        let meta = f.metadata()?;
        let modified = modified_utc(meta.modified()?);
        let mut model = RedundancyModel::new(meta.len(), modified, &self.options.sizing, &self.pool);

        let mut reader = BufReader::with_capacity(BUFFERED_CAPACITY, f);
        let mut block = self.pool.acquire();
        for index in 0..model.block_count() {
            let want = valid_len(meta.len(), index);
            block.clear();
            match read_full(&mut reader, &mut block[..want]) {
                ReadOutcome::Data(n) if n == want => model.observe_for_encoding(&block, index),
                ReadOutcome::Failed(e) => return Err(e.into()),
                ReadOutcome::Data(_) | ReadOutcome::Eof => {
                    return Err(ProtectError::FileChanged(file.to_owned()));
                }
            }
        }
        self.pool.release(block);
        Ok(model)
    }

    /// Build and store the record for `file`; returns the record's path.
    pub fn create_saved_info(&self, file: &Path) -> Result<PathBuf, ProtectError> {
        let model = self.encode_file(file)?;
        let chk = self.sidecar_path(file);
        self.write_record(&model, &chk)?;
        info!(file = %file.display(), record = %chk.display(), rows = ?model.summary().row_lengths, "saved info created");
        model.release(&self.pool);
        Ok(chk)
    }

    pub fn write_record(&self, model: &RedundancyModel, chk: &Path) -> Result<(), ProtectError> {
        if let Some(dir) = chk.parent() {
            fs::create_dir_all(dir)?;
        }
        let tmp = chk.with_extension(format!("{SIDECAR_EXTENSION}.tmp"));
        {
            let mut w = BufWriter::new(File::create(&tmp)?);
            encode(model, &mut w)?;
            w.get_ref().sync_all()?;
        }
        fs::rename(&tmp, chk)?;
        Ok(())
    }

    /// Load a record; an unparseable one comes back empty.
    pub fn load_record(&self, chk: &Path) -> Result<RedundancyModel, ProtectError> {
        let mut f = File::open(chk).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ProtectError::NoRecord(chk.to_owned()),
            _ => ProtectError::Io(e),
        })?;
        Ok(decode_or_empty(&mut f, &self.pool))
    }

    pub fn check_record(
        &self,
        record:      &RedundancyModel,
        file_length: u64,
        modified:    DateTime<Utc>,
    ) -> RecordStatus {
        if record.is_empty() && file_length > 0 {
            RecordStatus::DamagedMustRebuild
        } else if !record.describes(file_length, modified, self.options.timestamp_tolerance) {
            RecordStatus::StaleMustRebuild
        } else if record.needs_rebuild() {
            RecordStatus::DamagedMustRebuild
        } else {
            RecordStatus::UpToDate
        }
    }

    // ── Test ──────────────────────────────────────────────────────────────────

    pub fn test_file(&self, file: &Path) -> Result<FileCheck, ProtectError> {
        let record = self.load_record(&self.sidecar_path(file))?;
        let mut f = File::open(file)?;
        let meta = f.metadata()?;
        let modified = modified_utc(meta.modified()?);
        let status = self.check_record(&record, meta.len(), modified);
        let mut report = FileReport::new(file, status, blocks_for_length(meta.len()));

        if status == RecordStatus::StaleMustRebuild || (record.is_empty() && meta.len() > 0) {
            debug!(file = %file.display(), ?status, "record not usable for testing");
            record.release(&self.pool);
            return Ok(FileCheck { report, plan: RestorePlan::default(), stats: PassStats::default(), modified });
        }

        let run = run_verify(&record, &mut f, self.options.reread_attempts, &self.pool)?;
        record.release(&self.pool);
        let mut model = run.model;
        let label = file.display().to_string();
        let plan = model.end_restore(&label, self.log.as_ref(), &self.pool);

        report.tested = true;
        report.strategy = Some(run.strategy);
        report.blocks_unreadable = run.stats.unreadable.len();
        report.blocks_mismatched = run.stats.mismatched.len();
        report.blocks_restorable = plan.restored().count();
        report.blocks_unrecoverable = plan.unrecoverable().count();
        report.not_restored_bytes = plan.not_restored_size;
        report.record_consistent = model.verify_integrity_after_restore_test();
        if !plan.reliable || (plan.infos.is_empty() && !report.record_consistent) {
            report.status = RecordStatus::DamagedMustRebuild;
        }
        model.release(&self.pool);

        Ok(FileCheck { report, plan, stats: run.stats, modified })
    }

    // ── Repair ────────────────────────────────────────────────────────────────

    /// Test `file`, write back whatever could be restored, and bring its
    /// record up to date.
    ///
    /// Filler is written only over blocks that could not be read at all;
    /// readable blocks with a wrong checksum are left alone unless they were
    /// restored.
    pub fn repair_file(&self, file: &Path) -> Result<FileReport, ProtectError> {
        let check = self.test_file(file)?;
        let mut report = check.report;

        if !report.tested {
            self.create_saved_info(file)?;
            report.record_rewritten = true;
            return Ok(report);
        }

        let to_write: Vec<&RestoreInfo> = check
            .plan
            .infos
            .iter()
            .filter(|i| !i.not_recoverable || check.stats.unreadable.contains(&i.block_index()))
            .collect();
        if !to_write.is_empty() {
            let mut f = OpenOptions::new().write(true).open(file)?;
            let file_length = f.metadata()?.len();
            let written = write_restore_infos(&mut f, to_write, file_length)?;
            f.sync_all()?;
            f.set_modified(SystemTime::from(check.modified))?;
            info!(file = %file.display(), written, "restored data written");
            report.repaired = true;
        }

        let damaged = report.status == RecordStatus::DamagedMustRebuild;
        if damaged && (report.blocks_unrecoverable == 0 || !check.plan.reliable) {
            self.create_saved_info(file)?;
            report.record_rewritten = true;
        }
        for info in check.plan.infos {
            self.pool.release(info.data);
        }
        Ok(report)
    }

    // ── Reconcile ─────────────────────────────────────────────────────────────

    /// Patch two records of equivalent content from each other and write
    /// back each side that is complete afterwards.  Returns true if anything
    /// changed.
    pub fn reconcile_records(&self, a: &Path, b: &Path) -> Result<bool, ProtectError> {
        let mut ra = self.load_record(a)?;
        let mut rb = self.load_record(b)?;
        if !ra.improve_this_and_other(&mut rb) {
            return Ok(false);
        }
        for (model, path) in [(&ra, a), (&rb, b)] {
            if model.has_unreadable_slots() || model.is_empty() {
                warn!(record = %path.display(), "record still incomplete after reconciling");
            } else {
                self.write_record(model, path)?;
            }
        }
        Ok(true)
    }

    // ── Batches ───────────────────────────────────────────────────────────────

    /// Apply `op` to every file, in input order.
    ///
    /// With the `parallel` feature the files are spread over the rayon pool;
    /// records of different files share nothing but the block pool.
    pub fn for_each_file<T, F>(&self, files: &[PathBuf], op: F) -> Vec<T>
    where
        T: Send,
        F: Fn(&Self, &Path) -> T + Sync,
    {
        #[cfg(feature = "parallel")]
        {
            use rayon::prelude::*;
            files.par_iter().map(|f| op(self, f)).collect()
        }

        #[cfg(not(feature = "parallel"))]
        {
            files.iter().map(|f| op(self, f)).collect()
        }
    }
}

fn modified_utc(t: SystemTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(t)
}
