pub mod handlers;
pub mod ingest;
pub mod store;

pub use store::{format_created_at, CatalogStore, FeedCursor, FeedPage, StoreError};
