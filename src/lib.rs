#[macro_use]
extern crate log;

pub use db::KeyValueStore;

mod cache;
mod compact;
pub mod db;
pub mod error;
mod hash;
mod ioutils;
pub mod manifest;
pub mod memory;
pub mod sstable;
mod wal;

pub type Result<T> = std::result::Result<T, error::StrataError>;
