pub mod error;
pub mod journal;
pub mod memory;
pub mod sqlite;

pub use error::StoreError;
pub use journal::{read_journal, FeedJournal};
pub use memory::MemoryBackend;
pub use sqlite::{SqliteStore, FLEET_SCHEMA_VERSION};
