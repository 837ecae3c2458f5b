use opentelemetry::{
    global,
    metrics::{Counter, Histogram, Meter, ObservableGauge},
    KeyValue,
};
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};

const METER_NAME: &str = "fx_outbox";

fn meter() -> Meter {
    global::meter(METER_NAME)
}

/// Instruments recorded by the transaction manager.
#[derive(Clone)]
pub(crate) struct TxMetrics {
    duration: Histogram<f64>,
    outcomes: Counter<u64>,
}

impl TxMetrics {
    pub fn new() -> Self {
        let meter = meter();
        Self {
            duration: meter
                .f64_histogram("fx_outbox.tx.duration")
                .with_unit("s")
                .with_description("Wall time of a transaction, begin to end")
                .build(),
            outcomes: meter
                .u64_counter("fx_outbox.tx.outcomes")
                .with_description("Transactions by outcome")
                .build(),
        }
    }

    pub fn record(
        &self,
        name: &str,
        outcome: &'static str,
        seconds: f64,
    ) {
        let attributes = [
            KeyValue::new("tx.name", name.to_owned()),
            KeyValue::new("outcome", outcome),
        ];
        self.duration.record(seconds, &attributes);
        self.outcomes.add(1, &attributes);
    }
}

/// Instruments recorded by the outbox publisher.
///
/// The backlog gauge reads the shared atomic on every collection.
pub(crate) struct PublisherMetrics {
    published: Counter<u64>,
    failed: Counter<u64>,
    publish_latency: Histogram<f64>,
    lag: Histogram<f64>,
    _backlog: ObservableGauge<i64>,
}

impl PublisherMetrics {
    pub fn new(backlog: Arc<AtomicI64>) -> Self {
        let meter = meter();
        Self {
            published: meter
                .u64_counter("fx_outbox.publisher.published")
                .with_description("Outbox events published to the bus")
                .build(),
            failed: meter
                .u64_counter("fx_outbox.publisher.failed")
                .with_description("Outbox publish attempts that failed")
                .build(),
            publish_latency: meter
                .f64_histogram("fx_outbox.publisher.publish_latency")
                .with_unit("s")
                .with_description("Duration of a single bus publish call")
                .build(),
            lag: meter
                .f64_histogram("fx_outbox.publisher.lag")
                .with_unit("s")
                .with_description("Time from occurrence to publication")
                .build(),
            _backlog: meter
                .i64_observable_gauge("fx_outbox.publisher.backlog")
                .with_description("Unpublished outbox events")
                .with_callback(move |observer| {
                    observer.observe(backlog.load(Ordering::Relaxed), &[])
                })
                .build(),
        }
    }

    pub fn published(
        &self,
        event_type: &str,
        latency: f64,
        lag: f64,
    ) {
        let attributes = [KeyValue::new("event_type", event_type.to_owned())];
        self.published.add(1, &attributes);
        self.publish_latency.record(latency, &attributes);
        self.lag.record(lag, &attributes);
    }

    pub fn failed(
        &self,
        event_type: &str,
        latency: f64,
    ) {
        let attributes = [KeyValue::new("event_type", event_type.to_owned())];
        self.failed.add(1, &attributes);
        self.publish_latency.record(latency, &attributes);
    }
}

/// Instruments recorded by the inbox consumer.
#[derive(Clone)]
pub(crate) struct ConsumerMetrics {
    deliveries: Counter<u64>,
    duration: Histogram<f64>,
}

impl ConsumerMetrics {
    pub fn new() -> Self {
        let meter = meter();
        Self {
            deliveries: meter
                .u64_counter("fx_outbox.consumer.deliveries")
                .with_description("Inbox deliveries by outcome")
                .build(),
            duration: meter
                .f64_histogram("fx_outbox.consumer.duration")
                .with_unit("s")
                .with_description("Time spent handling one delivery")
                .build(),
        }
    }

    pub fn record(
        &self,
        source_service: &str,
        outcome: &'static str,
        seconds: f64,
    ) {
        let attributes = [
            KeyValue::new("source_service", source_service.to_owned()),
            KeyValue::new("outcome", outcome),
        ];
        self.deliveries.add(1, &attributes);
        self.duration.record(seconds, &attributes);
    }
}
