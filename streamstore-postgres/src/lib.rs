//! # PostgreSQL Streamstore Backend Library
mod error;
mod gap;
mod latch;
mod notifier;
pub mod schema;
mod store;
mod subscription;

pub use crate::gap::GapPolicy;
pub use crate::notifier::NotifierConfig;
pub use crate::store::{PgStreamStore, PgStreamStoreSettings};
pub use crate::subscription::{SubscribeToAllOptions, SubscribeToStreamOptions, Subscription};
pub use error::Error;
