pub mod api;
pub mod handlers;
pub mod models;
pub mod outbox;
pub mod service;
pub mod store;

pub use service::{OrderConfig, OrderError, OrderService};
pub use store::OrderStore;
