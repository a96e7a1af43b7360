//! Change-stream readers for the supported source engines

pub mod binlog;
pub mod slot;

pub use binlog::BinlogReader;
pub use slot::SlotReader;
