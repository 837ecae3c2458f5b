use super::{Runner, RunnerError};
use crate::{
    bus::MessagePublisher,
    publisher::{OutboxPublisher, PublisherConfig},
    store::{OutboxStore, PgOutboxStore},
};
use async_trait::async_trait;
use sqlx::PgPool;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Drives an [`OutboxPublisher`] on its tick until cancelled.
#[derive(Debug, Clone)]
pub struct PublisherRunner {
    publisher: OutboxPublisher,
}

impl PublisherRunner {
    pub fn builder() -> PublisherRunnerBuilder {
        PublisherRunnerBuilder::default()
    }

    pub fn publisher(&self) -> &OutboxPublisher {
        &self.publisher
    }
}

#[async_trait]
impl Runner for PublisherRunner {
    async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), RunnerError> {
        self.publisher.run(cancel).await;
        Ok(())
    }
}

#[derive(Default)]
pub struct PublisherRunnerBuilder {
    store: Option<Arc<dyn OutboxStore>>,
    bus: Option<Arc<dyn MessagePublisher>>,
    config: PublisherConfig,
}

impl fmt::Debug for PublisherRunnerBuilder {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("PublisherRunnerBuilder")
            .field("store", &self.store.is_some())
            .field("bus", &self.bus.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl PublisherRunnerBuilder {
    /// Uses a [`PgOutboxStore`] over `pool`.
    pub fn with_postgres(
        self,
        pool: PgPool,
    ) -> Self {
        self.with_store(Arc::new(PgOutboxStore::new(pool)))
    }

    pub fn with_store(
        mut self,
        store: Arc<dyn OutboxStore>,
    ) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_bus(
        mut self,
        bus: Arc<dyn MessagePublisher>,
    ) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn with_config(
        mut self,
        config: PublisherConfig,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<PublisherRunner, RunnerError> {
        let store = self
            .store
            .ok_or(RunnerError::MissingDependency("outbox store"))?;
        let bus = self
            .bus
            .ok_or(RunnerError::MissingDependency("bus publisher"))?;
        Ok(PublisherRunner {
            publisher: OutboxPublisher::new(store, bus, self.config),
        })
    }
}
