pub mod memory;
pub mod repository;
pub mod store;

pub use memory::MemoryStore;
pub use repository::PgStore;
pub use store::{DenylistStore, StoreError};
