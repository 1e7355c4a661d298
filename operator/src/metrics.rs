use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};

/// Operator metrics, registered on a registry owned by this struct rather than
/// the process-global default one.
pub struct Metrics {
    registry: Registry,
    pub queue_depth: IntGauge,
    pub enqueued: IntCounterVec,
    pub ignored_objects: IntCounterVec,
    pub retries: IntCounter,
    pub reconciliations: IntCounterVec,
    pub reconcile_duration: Histogram,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("environment_operator".into()), None)?;

        let queue_depth = IntGauge::new("workqueue_depth", "Keys waiting in the work queue")?;
        let enqueued = IntCounterVec::new(
            Opts::new("workqueue_adds_total", "Enqueue requests by source kind"),
            &["kind"],
        )?;
        let ignored_objects = IntCounterVec::new(
            Opts::new(
                "ignored_objects_total",
                "Watch events dropped because no Environment key could be extracted",
            ),
            &["kind", "reason"],
        )?;
        let retries = IntCounter::new("workqueue_retries_total", "Rate limited re-adds")?;
        let reconciliations = IntCounterVec::new(
            Opts::new("reconciliations_total", "Reconciliation passes by result"),
            &["result"],
        )?;
        let reconcile_duration = Histogram::with_opts(HistogramOpts::new(
            "reconcile_duration_seconds",
            "Wall time of one reconciliation pass",
        ))?;

        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(enqueued.clone()))?;
        registry.register(Box::new(ignored_objects.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Self {
            registry,
            queue_depth,
            enqueued,
            ignored_objects,
            retries,
            reconciliations,
            reconcile_duration,
        })
    }

    /// Text exposition of everything registered here.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let mut buf = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }
}
