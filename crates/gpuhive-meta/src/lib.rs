pub mod file;
pub mod memory;
pub mod types;

pub use file::FileMetaStore;
pub use memory::MemoryMetaStore;
pub use types::MetaStore;
