// Copyright (C) 2025 Bilinear Labs - All Rights Reserved

//! Prometheus metrics exporter.

use crate::model::ActivityType;
use anyhow::Result;
use axum::{
    Router,
    body::Body,
    extract::State,
    http::{
        HeaderValue, StatusCode,
        header::{ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_TYPE},
    },
    response::Response,
    routing::get,
};
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};
use std::{net::SocketAddr, sync::Arc};
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Configuration for the Prometheus metrics server.
#[derive(Clone, Debug)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub address: String,
    pub port: u16,
    pub allow_origin: Option<String>,
}

/// Handle to the metrics of the indexer. Recording is a no-op when the metrics are disabled.
#[derive(Clone, Default)]
pub struct MetricsHandle {
    inner: Option<Arc<MetricsInner>>,
}

#[derive(Clone)]
struct MetricsInner {
    registry: Registry,
    indexed_block: IntGaugeVec,
    chain_head_block: IntGaugeVec,
    events_processed: IntCounterVec,
    events_duplicated: IntCounter,
    degraded_events: IntCounterVec,
    allow_origin: Option<String>,
}

impl MetricsHandle {
    pub fn new(config: &MetricsConfig) -> Result<Self> {
        if !config.enabled {
            return Ok(Self { inner: None });
        }

        let registry = Registry::new_custom(Some("vouchie".to_string()), None)?;

        let indexed_block = IntGaugeVec::new(
            Opts::new(
                "indexed_block",
                "Latest block whose events have been committed for a contract.",
            ),
            &["contract_address"],
        )?;
        registry.register(Box::new(indexed_block.clone()))?;

        let chain_head_block = IntGaugeVec::new(
            Opts::new(
                "chain_head_block",
                "Latest block reported by the RPC node at the configured block tag.",
            ),
            &["contract_address"],
        )?;
        registry.register(Box::new(chain_head_block.clone()))?;

        let events_processed = IntCounterVec::new(
            Opts::new(
                "events_processed_total",
                "Events committed to the views, by event type.",
            ),
            &["event_type"],
        )?;
        registry.register(Box::new(events_processed.clone()))?;

        let events_duplicated = IntCounter::new(
            "events_duplicated_total",
            "Logs skipped because they were already indexed.",
        )?;
        registry.register(Box::new(events_duplicated.clone()))?;

        let degraded_events = IntCounterVec::new(
            Opts::new(
                "degraded_events_total",
                "Events applied with default values, by reason.",
            ),
            &["reason"],
        )?;
        registry.register(Box::new(degraded_events.clone()))?;

        // Standard build info style metric: value is always 1.
        let build_info = IntGaugeVec::new(
            Opts::new("build_info", "Build information about the running binary."),
            &["version"],
        )?;
        build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1);
        registry.register(Box::new(build_info.clone()))?;

        Ok(Self {
            inner: Some(Arc::new(MetricsInner {
                registry,
                indexed_block,
                chain_head_block,
                events_processed,
                events_duplicated,
                degraded_events,
                allow_origin: config.allow_origin.clone(),
            })),
        })
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    #[inline]
    pub fn record_indexed_block(&self, contract: &str, block: u64) {
        if let Some(inner) = &self.inner {
            inner
                .indexed_block
                .with_label_values(&[contract])
                .set(block as i64);
        }
    }

    #[inline]
    pub fn record_chain_head_block(&self, contract: &str, block: u64) {
        if let Some(inner) = &self.inner {
            inner
                .chain_head_block
                .with_label_values(&[contract])
                .set(block as i64);
        }
    }

    #[inline]
    pub fn record_event_processed(&self, event_type: ActivityType) {
        if let Some(inner) = &self.inner {
            inner
                .events_processed
                .with_label_values(&[event_type.to_string().as_str()])
                .inc();
        }
    }

    #[inline]
    pub fn record_duplicate_event(&self) {
        if let Some(inner) = &self.inner {
            inner.events_duplicated.inc();
        }
    }

    #[inline]
    pub fn record_degraded_event(&self, reason: &str) {
        if let Some(inner) = &self.inner {
            inner.degraded_events.with_label_values(&[reason]).inc();
        }
    }

    #[cfg(test)]
    pub(crate) fn degraded_events(&self, reason: &str) -> u64 {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.degraded_events.with_label_values(&[reason]).get())
    }

    /// Renders the registry in the Prometheus text format.
    fn render(registry: &Registry) -> Result<(String, Vec<u8>)> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&registry.gather(), &mut buffer)?;
        Ok((encoder.format_type().to_string(), buffer))
    }

    pub async fn serve(&self, config: MetricsConfig) -> Result<Option<JoinHandle<()>>> {
        let Some(inner) = self.inner.clone() else {
            return Ok(None);
        };

        let addr: SocketAddr = format!("{}:{}", config.address, config.port).parse()?;
        let state = MetricsState {
            registry: inner.registry.clone(),
            allow_origin: inner.allow_origin.clone(),
        };

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .with_state(state);

        // Bind before spawning, so a busy port is reported to the caller.
        let listener = tokio::net::TcpListener::bind(addr).await?;
        info!("Metrics server listening on {}", listener.local_addr()?);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                error!("Metrics server error: {e}");
            }
        });

        Ok(Some(handle))
    }
}

#[derive(Clone)]
struct MetricsState {
    registry: Registry,
    allow_origin: Option<String>,
}

async fn metrics_handler(State(state): State<MetricsState>) -> Response {
    let (content_type, buffer) = match MetricsHandle::render(&state.registry) {
        Ok(rendered) => rendered,
        Err(e) => {
            error!("Failed to encode metrics: {e}");
            let mut response = Response::new(Body::from("failed to encode metrics"));
            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            return response;
        }
    };

    let mut response = Response::new(Body::from(buffer));
    if let Ok(value) = HeaderValue::from_str(&content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }

    if let Some(origin) = state.allow_origin.as_ref() {
        let header_value =
            HeaderValue::from_str(origin).unwrap_or_else(|_| HeaderValue::from_static("*"));
        response
            .headers_mut()
            .insert(ACCESS_CONTROL_ALLOW_ORIGIN, header_value);
    }

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::*;

    fn enabled() -> MetricsConfig {
        MetricsConfig {
            enabled: true,
            address: "127.0.0.1".to_string(),
            port: 0,
            allow_origin: None,
        }
    }

    #[rstest]
    fn disabled_metrics_record_nothing() {
        let metrics = MetricsHandle::new(&MetricsConfig {
            enabled: false,
            ..enabled()
        })
        .unwrap();

        assert!(!metrics.is_enabled());
        // Recording on a disabled handle is a no-op.
        metrics.record_event_processed(ActivityType::GoalCreated);
        metrics.record_duplicate_event();
    }

    #[rstest]
    fn counters_show_up_in_the_exposition() {
        let metrics = MetricsHandle::new(&enabled()).unwrap();
        metrics.record_event_processed(ActivityType::GoalCreated);
        metrics.record_event_processed(ActivityType::GoalCreated);
        metrics.record_duplicate_event();
        metrics.record_degraded_event("missing_goal");
        metrics.record_indexed_block("0xabc", 42);

        let inner = metrics.inner.as_ref().unwrap();
        let (_, buffer) = MetricsHandle::render(&inner.registry).unwrap();
        let text = String::from_utf8(buffer).unwrap();

        assert!(text.contains("vouchie_events_processed_total{event_type=\"goal_created\"} 2"));
        assert!(text.contains("vouchie_events_duplicated_total 1"));
        assert!(text.contains("vouchie_degraded_events_total{reason=\"missing_goal\"} 1"));
        assert!(text.contains("vouchie_indexed_block{contract_address=\"0xabc\"} 42"));
        assert!(text.contains("vouchie_build_info"));
    }
}
