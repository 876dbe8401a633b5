pub mod system;

pub use system::{StorefrontSystem, SystemConfig};
