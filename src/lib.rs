pub mod block;
pub mod checksum;
pub mod stream;
pub mod sizing;
pub mod model;
pub mod recovery;
pub mod format;
pub mod protect;

pub use block::{Block, BlockPool, HeapPool, SharedBlockPool, BLOCK_SIZE};
pub use model::{Checksum, RecordSummary, RedundancyModel, Row};
pub use recovery::{RestoreEvent, RestoreInfo, RestoreLog, RestorePlan};
pub use format::{decode, encode, FormatError};
pub use sizing::{RowSizing, SizingPolicy};
pub use protect::{FileReport, ProtectError, ProtectOptions, Protector, RecordStatus};
