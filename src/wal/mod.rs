//! The write-ahead log — durable, checksummed, type-tagged records.
pub mod reader;
pub mod record;
pub mod writer;

pub use reader::WalReader;
pub use record::{EntryType, WalEntry, WalHeader, WalPayload, PAYLOAD_LEN_LIMIT};
pub use writer::{SyncPolicy, WalWriter};
