//! Prometheus registry and the text exposition listener.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter_vec, Gauge, HistogramVec, IntCounter,
    IntCounterVec,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

lazy_static! {
    pub static ref DNS_REQUESTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsagent_dns_requests_total",
        "Counter of accepted DNS requests per query type.",
        &["qtype"]
    )
    .unwrap();

    pub static ref DNS_REFUSED_TOTAL: IntCounter = prometheus::register_int_counter!(
        "dnsagent_dns_refused_total",
        "Counter of queries refused by the network whitelist."
    )
    .unwrap();

    pub static ref CACHE_HITS_TOTAL: IntCounter = prometheus::register_int_counter!(
        "dnsagent_cache_hits_total",
        "The count of cache hits."
    )
    .unwrap();

    pub static ref CACHE_MISSES_TOTAL: IntCounter = prometheus::register_int_counter!(
        "dnsagent_cache_misses_total",
        "The count of cache misses."
    )
    .unwrap();

    pub static ref CACHE_ENTRIES: Gauge = prometheus::register_gauge!(
        "dnsagent_cache_entries",
        "The number of elements in the response cache."
    )
    .unwrap();

    pub static ref RULE_MATCHES_TOTAL: IntCounter = prometheus::register_int_counter!(
        "dnsagent_rule_matches_total",
        "Counter of queries that matched a rule."
    )
    .unwrap();

    pub static ref EXCHANGE_DURATION: HistogramVec = register_histogram_vec!(
        "dnsagent_exchange_duration_seconds",
        "Histogram of the time one upstream round-trip took.",
        &["to"],
        vec![0.001, 0.002, 0.004, 0.008, 0.016, 0.032, 0.064, 0.128, 0.256, 0.512, 1.024, 2.048, 4.096]
    )
    .unwrap();

    pub static ref EXCHANGE_TIMEOUTS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "dnsagent_exchange_timeouts_total",
        "Counter of upstream exchanges that hit their deadline.",
        &["to"]
    )
    .unwrap();

    pub static ref RELOAD_TOTAL: IntCounter = prometheus::register_int_counter!(
        "dnsagent_rules_reload_total",
        "Counter of applied rule reloads."
    )
    .unwrap();

    pub static ref RELOAD_FAILED_TOTAL: IntCounter = prometheus::register_int_counter!(
        "dnsagent_rules_reload_failed_total",
        "Counter of rejected or failed rule reloads."
    )
    .unwrap();
}

/// Serve the registry as prometheus text format over raw HTTP.
pub fn spawn_exposition(addr: String) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&addr).await {
            Ok(listener) => {
                tracing::info!("[metrics] Successfully bound metrics listener on {}", addr);
                while let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let mut buf = [0u8; 8192];
                        if let Ok(Ok(n)) = tokio::time::timeout(
                            std::time::Duration::from_secs(2),
                            stream.read(&mut buf),
                        )
                        .await
                        {
                            if n > 0 && buf.starts_with(b"GET ") {
                                use prometheus::Encoder;
                                let encoder = prometheus::TextEncoder::new();
                                let mut body = Vec::new();
                                if encoder.encode(&prometheus::gather(), &mut body).is_ok() {
                                    let header = format!(
                                        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                                        body.len()
                                    );
                                    let mut response = header.into_bytes();
                                    response.extend_from_slice(&body);
                                    let _ = tokio::time::timeout(
                                        std::time::Duration::from_secs(2),
                                        stream.write_all(&response),
                                    )
                                    .await;
                                    let _ = stream.flush().await;
                                    // 发送 FIN，避免客户端读到一半收 RST
                                    let _ = stream.shutdown().await;
                                }
                            }
                        }
                    });
                }
            }
            Err(e) => {
                tracing::error!("[metrics] Failed to bind {}: {}", addr, e);
            }
        }
    })
}
