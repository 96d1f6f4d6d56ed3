use anyhow::{Context, Result};
use prometheus::{IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

#[derive(Clone)]
pub struct MetricsRegistry {
    registry: Registry,
    http_requests_total: IntCounter,
    generations_total: IntCounterVec,
    quota_rejections_total: IntCounter,
}

impl MetricsRegistry {
    pub fn new(prefix: &str) -> Result<Self> {
        let registry = Registry::new();
        let http_requests_total = IntCounter::with_opts(Opts::new(
            format!("{prefix}_http_requests_total"),
            "Total HTTP requests handled by text-assistant",
        ))
        .context("failed to create http_requests_total metric")?;

        let generations_total = IntCounterVec::new(
            Opts::new(
                format!("{prefix}_generations_total"),
                "Total generation calls partitioned by outcome",
            ),
            &["outcome"],
        )
        .context("failed to create generations_total metric")?;

        let quota_rejections_total = IntCounter::with_opts(Opts::new(
            format!("{prefix}_quota_rejections_total"),
            "Total requests rejected because the daily quota was used up",
        ))
        .context("failed to create quota_rejections_total metric")?;

        registry
            .register(Box::new(http_requests_total.clone()))
            .context("failed to register http_requests_total metric")?;
        registry
            .register(Box::new(generations_total.clone()))
            .context("failed to register generations_total metric")?;
        registry
            .register(Box::new(quota_rejections_total.clone()))
            .context("failed to register quota_rejections_total metric")?;

        Ok(Self {
            registry,
            http_requests_total,
            generations_total,
            quota_rejections_total,
        })
    }

    pub fn inc_http_requests(&self) {
        self.http_requests_total.inc();
    }

    pub fn inc_generation(&self, outcome: &str) {
        self.generations_total.with_label_values(&[outcome]).inc();
    }

    pub fn inc_quota_rejection(&self) {
        self.quota_rejections_total.inc();
    }

    pub fn render(&self) -> Result<String> {
        let metric_families = self.registry.gather();
        let mut body = String::new();
        let encoder = TextEncoder::new();
        encoder
            .encode_utf8(&metric_families, &mut body)
            .context("failed encoding prometheus metrics")?;

        Ok(body)
    }
}
