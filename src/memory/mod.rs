//! Memory table

mod journaled_mem_table;
mod skip_map_mem_table;

pub use journaled_mem_table::JournaledMemTable;
pub use skip_map_mem_table::{MemTable, MemTableIter};
