//! Finder (C5): key→position index maintained incrementally while
//! tailing the file. Three variants — [`simple::SimpleFinder`],
//! [`binary_search::BinarySearchFinder`], [`in_memory::InMemoryFinder`] —
//! share this interface and a conformance suite (see `conformance`,
//! test-only).

pub mod binary_search;
pub mod in_memory;
pub mod simple;

#[cfg(test)]
mod conformance;

use crate::codec::RowUnion;
use crate::error::Result;

/// Shared contract for all three finder variants.
pub trait Finder: Send + Sync {
    /// Physical row index of `key`, or `KeyNotFound`.
    fn get_index(&self, key: &[u8; 16]) -> Result<u64>;

    /// Physical index of the first row (`start_control == T`) of the
    /// transaction containing physical index `i`.
    fn get_transaction_start(&self, index: u64) -> Result<u64>;

    /// Physical index of the terminal row of the transaction containing
    /// physical index `i`, or `TransactionActive` if still open.
    fn get_transaction_end(&self, index: u64) -> Result<u64>;

    /// Maximum UUIDv7 timestamp among completed DataRow/NullRow entries.
    /// Remains readable even after tombstoning.
    fn max_timestamp(&self) -> u64;

    /// Subscriber hook fed by the row emitter in strictly increasing
    /// logical order.
    fn on_row_added(&self, logical_index: u64, row: &RowUnion) -> Result<()>;

    /// True once this finder has entered its permanent tombstoned state.
    fn is_tombstoned(&self) -> bool;
}
