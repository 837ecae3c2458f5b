use super::{Runner, RunnerError};
use crate::{
    bus::MessageReceiver,
    consumer::{ConsumerConfig, InboxConsumer, InboxHandler, PayloadDecoder},
    store::{InboxStore, PgOutboxStore},
    transaction::{TransactionManager, TxConfig},
};
use async_trait::async_trait;
use sqlx::PgPool;
use std::{fmt, sync::Arc};
use tokio_util::sync::CancellationToken;

/// Feeds deliveries from a [`MessageReceiver`] into an [`InboxConsumer`].
pub struct ConsumerRunner<D, H> {
    consumer: InboxConsumer<D, H>,
    receiver: Arc<dyn MessageReceiver>,
}

impl<D, H> fmt::Debug for ConsumerRunner<D, H> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ConsumerRunner")
            .field("consumer", &self.consumer)
            .finish_non_exhaustive()
    }
}

impl<D, H> ConsumerRunner<D, H>
where
    D: PayloadDecoder + 'static,
    H: InboxHandler<D::Output> + 'static,
{
    pub fn builder() -> ConsumerRunnerBuilder<D, H> {
        ConsumerRunnerBuilder::new()
    }

    pub fn consumer(&self) -> &InboxConsumer<D, H> {
        &self.consumer
    }
}

#[async_trait]
impl<D, H> Runner for ConsumerRunner<D, H>
where
    D: PayloadDecoder + 'static,
    H: InboxHandler<D::Output> + 'static,
{
    async fn run(
        &self,
        cancel: CancellationToken,
    ) -> Result<(), RunnerError> {
        Ok(self.consumer.run(&*self.receiver, cancel).await?)
    }
}

pub struct ConsumerRunnerBuilder<D, H> {
    postgres: Option<(PgPool, TxConfig)>,
    transactions: Option<TransactionManager>,
    store: Option<Arc<dyn InboxStore>>,
    decoder: Option<D>,
    handler: Option<H>,
    receiver: Option<Arc<dyn MessageReceiver>>,
    config: ConsumerConfig,
}

impl<D, H> fmt::Debug for ConsumerRunnerBuilder<D, H> {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        f.debug_struct("ConsumerRunnerBuilder")
            .field("postgres", &self.postgres.as_ref().map(|(_, config)| config))
            .field("transactions", &self.transactions.is_some())
            .field("store", &self.store.is_some())
            .field("decoder", &self.decoder.is_some())
            .field("handler", &self.handler.is_some())
            .field("receiver", &self.receiver.is_some())
            .field("config", &self.config)
            .finish()
    }
}

impl<D, H> ConsumerRunnerBuilder<D, H>
where
    D: PayloadDecoder + 'static,
    H: InboxHandler<D::Output> + 'static,
{
    pub fn new() -> Self {
        Self {
            postgres: None,
            transactions: None,
            store: None,
            decoder: None,
            handler: None,
            receiver: None,
            config: ConsumerConfig::default(),
        }
    }

    /// Builds the transaction manager and the inbox store from a pool,
    /// unless they are given explicitly.
    pub fn with_postgres(
        mut self,
        pool: PgPool,
        tx_config: TxConfig,
    ) -> Self {
        self.postgres = Some((pool, tx_config));
        self
    }

    pub fn with_transactions(
        mut self,
        transactions: TransactionManager,
    ) -> Self {
        self.transactions = Some(transactions);
        self
    }

    pub fn with_store(
        mut self,
        store: Arc<dyn InboxStore>,
    ) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_decoder(
        mut self,
        decoder: D,
    ) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn with_handler(
        mut self,
        handler: H,
    ) -> Self {
        self.handler = Some(handler);
        self
    }

    pub fn with_receiver(
        mut self,
        receiver: Arc<dyn MessageReceiver>,
    ) -> Self {
        self.receiver = Some(receiver);
        self
    }

    pub fn with_config(
        mut self,
        config: ConsumerConfig,
    ) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<ConsumerRunner<D, H>, RunnerError> {
        let (transactions, store) = match (self.postgres, self.transactions) {
            (_, Some(transactions)) => (transactions, self.store),
            (Some((pool, tx_config)), None) => {
                let store = self.store.unwrap_or_else(|| {
                    Arc::new(PgOutboxStore::new(pool.clone()))
                });
                (TransactionManager::new(pool, tx_config)?, Some(store))
            }
            (None, None) => {
                return Err(RunnerError::MissingDependency(
                    "transaction manager",
                ))
            }
        };
        let store =
            store.ok_or(RunnerError::MissingDependency("inbox store"))?;
        let decoder = self
            .decoder
            .ok_or(RunnerError::MissingDependency("payload decoder"))?;
        let handler = self
            .handler
            .ok_or(RunnerError::MissingDependency("handler"))?;
        let receiver = self
            .receiver
            .ok_or(RunnerError::MissingDependency("bus receiver"))?;
        Ok(ConsumerRunner {
            consumer: InboxConsumer::new(
                transactions,
                store,
                decoder,
                handler,
                self.config,
            ),
            receiver,
        })
    }
}

impl<D, H> Default for ConsumerRunnerBuilder<D, H>
where
    D: PayloadDecoder + 'static,
    H: InboxHandler<D::Output> + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}
