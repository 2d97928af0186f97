use prometheus_client::{
    encoding::EncodeLabelSet,
    metrics::{counter::Counter, family::Family},
    registry::Registry,
};

#[derive(Clone, Debug, Default)]
pub struct Metrics {
    reconciles: Family<ResultLabels, Counter>,
    rule_writes: Family<WriteLabels, Counter>,
    nic_events: Family<SourceLabels, Counter>,
    queue_retries: Counter,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum ReconcileResult {
    Ok,
    Error,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

#[derive(Copy, Clone, Debug, Hash, PartialEq, Eq)]
pub enum EventSource {
    Resync,
    Feed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ResultLabels {
    result: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct WriteLabels {
    op: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct SourceLabels {
    source: &'static str,
}

// === impl Metrics ===

impl Metrics {
    pub fn register(prom: &mut Registry) -> Self {
        let reconciles = Family::default();
        prom.register(
            "reconciles",
            "Count of NIC reconciliations by result",
            reconciles.clone(),
        );

        let rule_writes = Family::default();
        prom.register(
            "rule_writes",
            "Count of rule writes by operation",
            rule_writes.clone(),
        );

        let nic_events = Family::default();
        prom.register(
            "nic_events",
            "Count of NIC cache updates by source",
            nic_events.clone(),
        );

        let queue_retries = Counter::default();
        prom.register(
            "queue_retries",
            "Count of NIC reconciliations requeued after a failure",
            queue_retries.clone(),
        );

        Self {
            reconciles,
            rule_writes,
            nic_events,
            queue_retries,
        }
    }

    pub(crate) fn reconciled(&self, result: ReconcileResult) {
        self.reconciles
            .get_or_create(&ResultLabels {
                result: result.as_str(),
            })
            .inc();
    }

    pub(crate) fn rule_written(&self, op: WriteOp) {
        self.rule_writes
            .get_or_create(&WriteLabels { op: op.as_str() })
            .inc();
    }

    pub(crate) fn nic_event(&self, source: EventSource) {
        self.nic_events
            .get_or_create(&SourceLabels {
                source: source.as_str(),
            })
            .inc();
    }

    pub(crate) fn retried(&self) {
        self.queue_retries.inc();
    }

    pub fn reconciles(&self, result: ReconcileResult) -> u64 {
        self.reconciles
            .get_or_create(&ResultLabels {
                result: result.as_str(),
            })
            .get()
    }

    pub fn rule_writes(&self, op: WriteOp) -> u64 {
        self.rule_writes
            .get_or_create(&WriteLabels { op: op.as_str() })
            .get()
    }
}

impl ReconcileResult {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

impl WriteOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }
}

impl std::fmt::Display for WriteOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl EventSource {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Resync => "resync",
            Self::Feed => "feed",
        }
    }
}
