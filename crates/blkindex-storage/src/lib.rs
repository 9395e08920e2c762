//! blkindex-storage: SQLite chain store for blkindex.
//!
//! - [`sqlite`]: [`ChainStore`](blkindex_core::store::ChainStore) backed by
//!   SQLite via `sqlx` (single-file persistence)
//! - [`query`]: read-side lookups (blocks, transactions, UTXOs, balances)
//!
//! The in-memory backend lives in `blkindex_core::memory`.

#[cfg(feature = "sqlite")]
pub mod query;
#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "sqlite")]
pub use query::{BlockView, ChainTip, ColorBalance, StoreStatus, TxView, Utxo};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteChainStore;
