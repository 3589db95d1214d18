mod items;
pub(crate) mod persist;
mod registry;
mod types;

pub use items::{ItemStore, JsonItemStore, MemoryItemStore};
pub use registry::FeedRegistry;
pub use types::{Feed, FeedItem, RegistryError, StoreError};
