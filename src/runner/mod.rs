//! Long running entry points wiring the publisher and the consumer to their
//! collaborators.

pub mod consumer;
pub mod errors;
pub mod publisher;

pub use consumer::{ConsumerRunner, ConsumerRunnerBuilder};
pub use errors::RunnerError;
pub use publisher::{PublisherRunner, PublisherRunnerBuilder};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Runs until `cancel` fires or an unrecoverable error occurs.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), RunnerError>;
}
