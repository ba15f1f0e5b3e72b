pub mod client;
pub mod engine;
pub mod kvfile;
pub mod protocol;
pub mod server;

pub use engine::memtable::MemTableSize;
pub use engine::{Engine, Stats};

pub type Error = Box<dyn std::error::Error + Send + Sync>;

pub type Result<T, E = Error> = std::result::Result<T, E>;
