//! A concurrent B+Tree index with latch-crabbing.
pub mod core;
pub mod cursor;

pub use core::BTree;
pub use cursor::Cursor;
