//! blkindex-core: blk-file parser and chain bookkeeping engine.
//!
//! # Architecture
//!
//! ```text
//! BlockIndexer (update / run_until)
//!     ├── BlkReader        (blk-file records → RawBlock)
//!     ├── BlockPersister   (rows, input resolution, optional worker fan-out)
//!     ├── OrphanTracker    (parent-less blocks, deferred inputs)
//!     ├── ChainResolver    (in_longest promotion / demotion)
//!     └── ChainStore       (memory here, SQLite in blkindex-storage)
//! ```

pub mod address;
pub mod codec;
pub mod cursor;
pub mod error;
pub mod indexer;
pub mod memory;
pub mod orphan;
pub mod parser;
pub mod persist;
pub mod pow;
pub mod reorg;
pub mod store;
pub mod types;

#[cfg(any(test, feature = "fixtures"))]
pub mod fixtures;

pub use cursor::BlkCursor;
pub use error::{DecodeError, IndexerError};
pub use indexer::{BlockIndexer, IndexerConfig, Network, UpdateReport};
pub use memory::MemoryChainStore;
pub use orphan::OrphanTracker;
pub use parser::BlkReader;
pub use persist::BlockPersister;
pub use reorg::{ChainResolver, ReorgOutcome};
pub use store::{Branch, ChainStore, ChainTxn, StoredBlock};
pub use types::{BlockHeader, Hash256, RawBlock, RawTx, TxType};
