pub mod config;
pub mod errors;
pub mod publisher;

pub use config::PublisherConfig;
pub use errors::PublishError;
pub use publisher::{CycleReport, Delivery, OutboxPublisher};
