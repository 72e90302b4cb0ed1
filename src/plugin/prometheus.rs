use crate::message::{Request, Response};
use crate::plugin::cache::{Cache, CacheEvent};
use crate::plugin::{Handler, Next};
use crate::types::rcode_to_str;
use anyhow::{Context, Result};
use axum::http::header;
use axum::routing::get;
use lazy_static::lazy_static;
use prometheus::{
    register_gauge_vec, register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, GaugeVec, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const DURATION_BUCKETS: &[f64] = &[
    0.00025, 0.0005, 0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096, 8.192,
];

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "zonedns_dns_requests_total",
        "Counter of DNS requests per protocol, address family and query type.",
        &["proto", "family", "type"]
    ).unwrap();

    pub static ref DNS_RESPONSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "zonedns_dns_responses_total",
        "Counter of response status codes.",
        &["proto", "rcode"]
    ).unwrap();

    pub static ref DNS_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "zonedns_dns_request_duration_seconds",
        "Histogram of the time (in seconds) each request took.",
        &["proto"],
        DURATION_BUCKETS.to_vec()
    ).unwrap();

    pub static ref DNS_HANDLER_ERRORS_TOTAL: IntCounter = register_int_counter!(
        "zonedns_dns_handler_errors_total",
        "Counter of handler chains that ended with an error."
    ).unwrap();

    pub static ref CACHE_ENTRIES: IntGauge = register_int_gauge!(
        "zonedns_cache_entries",
        "The number of keys in the cache."
    ).unwrap();

    pub static ref CACHE_HITS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "zonedns_cache_hits_total",
        "The count of cache hits.",
        &["type"]
    ).unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "zonedns_cache_misses_total",
        "The count of cache misses.",
        &["type"]
    ).unwrap();

    pub static ref PROXY_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "zonedns_proxy_request_duration_seconds",
        "Histogram of the time each upstream request took.",
        &["proxy_name", "rcode", "to"],
        DURATION_BUCKETS.to_vec()
    ).unwrap();

    pub static ref PROXY_CONN_CACHE_HITS: IntCounterVec = register_int_counter_vec!(
        "zonedns_proxy_conn_cache_hits_total",
        "Counter of connection cache hits per upstream and protocol.",
        &["proto", "proxy_name", "to"]
    ).unwrap();

    pub static ref PROXY_CONN_CACHE_MISSES: IntCounterVec = register_int_counter_vec!(
        "zonedns_proxy_conn_cache_misses_total",
        "Counter of connection cache misses per upstream and protocol.",
        &["proto", "proxy_name", "to"]
    ).unwrap();

    pub static ref FORWARD_MAX_CONCURRENT_REJECTS: IntCounter = register_int_counter!(
        "zonedns_forward_max_concurrent_rejects_total",
        "Counter of the number of queries rejected because the concurrent queries were at maximum."
    ).unwrap();

    pub static ref BUILD_INFO: GaugeVec = register_gauge_vec!(
        "zonedns_build_info",
        "A metric with a constant '1' value labeled by version.",
        &["version"]
    ).unwrap();
}

/// Renders every registered metric in the text exposition format.
pub fn render() -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&prometheus::gather(), &mut buffer)?;
    Ok(String::from_utf8(buffer)?)
}

async fn metrics_endpoint() -> impl axum::response::IntoResponse {
    match render() {
        Ok(body) => (axum::http::StatusCode::OK, [(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body),
        Err(e) => {
            tracing::error!("[prometheus] failed to encode metrics: {:#}", e);
            (axum::http::StatusCode::INTERNAL_SERVER_ERROR, [(header::CONTENT_TYPE, "text/plain")], String::new())
        }
    }
}

/// Request/response counters as middleware, plus the `/metrics` listener.
pub struct PrometheusPlugin {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PrometheusPlugin {
    pub fn new() -> Self {
        BUILD_INFO.with_label_values(&[env!("CARGO_PKG_VERSION")]).set(1.0);
        Self { tasks: Mutex::new(Vec::new()) }
    }

    /// Binds the exposition listener and returns the bound address.
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let listener = tokio::net::TcpListener::bind(addr).await
            .with_context(|| format!("binding metrics listener on {}", addr))?;
        let local = listener.local_addr()?;
        let app = axum::Router::new().route("/metrics", get(metrics_endpoint));
        tracing::info!("[prometheus] Successfully bound metrics listener on {}", local);

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("[prometheus] metrics listener stopped: {}", e);
            }
        });
        self.track(handle);
        Ok(local)
    }

    /// Feeds cache hit/miss notifications into the cache counters.
    pub fn observe_cache(&self, cache: Arc<Cache>) {
        let mut events = cache.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CacheEvent::Hit { rtype, .. }) => CACHE_HITS_TOTAL.with_label_values(&[&rtype.to_string()]).inc(),
                    Ok(CacheEvent::Miss { rtype, .. }) => CACHE_MISSES_TOTAL.with_label_values(&[&rtype.to_string()]).inc(),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::debug!("[prometheus] cache observer lagged, {} events skipped", skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
                CACHE_ENTRIES.set(cache.len() as i64);
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push(handle);
    }
}

impl Default for PrometheusPlugin {
    fn default() -> Self { Self::new() }
}

impl Drop for PrometheusPlugin {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().unwrap_or_else(PoisonError::into_inner).drain(..) {
            task.abort();
        }
    }
}

#[async_trait::async_trait]
impl Handler for PrometheusPlugin {
    fn name(&self) -> &str { "prometheus" }

    async fn handle(&self, req: &Request, res: &mut Response, next: Next<'_>) -> Result<()> {
        let conn = req.connection();
        let proto = conn.kind.as_str();
        let family = if conn.remote_address.is_ipv6() { "2" } else { "1" };
        let qtype = req.question().map(|q| q.qtype.to_string()).unwrap_or_else(|| "-".to_string());
        DNS_REQUESTS_TOTAL.with_label_values(&[proto, family, &qtype]).inc();

        let outcome = next.run(req, res).await;

        DNS_REQUEST_DURATION.with_label_values(&[proto]).observe(conn.elapsed().as_secs_f64());
        if res.is_finished() {
            DNS_RESPONSES_TOTAL.with_label_values(&[proto, rcode_to_str(res.message().rcode())]).inc();
        }
        if outcome.is_err() {
            DNS_HANDLER_ERRORS_TOTAL.inc();
        }
        outcome
    }
}
