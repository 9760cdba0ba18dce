// # Per-shard cache structures
//
// The record store of one shard: the KV record itself with its three
// layouts, the intrusive lists that thread records into the LRU / borrower /
// wait structures, and the incrementally-rehashed hash index that resolves a
// key to either a record or the connection currently filling it.

pub mod index;
pub mod list;
pub mod record;

pub use index::{EntryKind, HashIndex, HashNode, IndexEntry};
pub use record::{Borrower, Record, RecordLayout, RecordMigrate};
