pub mod api;
pub mod handlers;
pub mod models;
pub mod service;
pub mod store;

pub use service::{InventoryConfig, InventoryService};
pub use store::InventoryStore;
