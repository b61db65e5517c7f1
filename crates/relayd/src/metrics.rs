use anyhow::Context;
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    register_histogram, register_histogram_vec, register_int_counter, register_int_counter_vec,
    Histogram, HistogramVec, IntCounter, IntCounterVec, TextEncoder,
};
use std::sync::LazyLock;
use tokio::net::TcpListener;
use tokio::sync::watch;

const MB: f64 = 1024.0 * 1024.0;

pub static REQUESTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| {
    register_int_counter!("relayd_requests_total", "count of message relay requests").unwrap()
});

pub static ERRORS_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "relayd_errors_total",
        "count of unsuccessfully relayed messages",
        &["error_code"]
    )
    .unwrap()
});

pub static DURATION_SECONDS: LazyLock<HistogramVec> = LazyLock::new(|| {
    register_histogram_vec!(
        "relayd_relay_duration_seconds",
        "duration of message relay requests",
        &["status_code"]
    )
    .unwrap()
});

pub static MESSAGE_BYTES: LazyLock<Histogram> = LazyLock::new(|| {
    register_histogram!(
        "relayd_message_bytes",
        "size of messages",
        vec![
            0.05 * MB,
            0.1 * MB,
            0.25 * MB,
            0.5 * MB,
            1.0 * MB,
            2.0 * MB,
            5.0 * MB,
            10.0 * MB,
            20.0 * MB
        ]
    )
    .unwrap()
});

pub static RATE_LIMITED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| {
    register_int_counter_vec!(
        "relayd_rate_limited_total",
        "count of rate limited messages by sender",
        &["sender"]
    )
    .unwrap()
});

/// Count a rejection under its SMTP code and hand the error back.
pub fn observe_err(err: smtpd::Error) -> smtpd::Error {
    ERRORS_TOTAL
        .with_label_values(&[&err.code.to_string()])
        .inc();
    err
}

pub struct MetricsServer {
    shutdown: watch::Sender<bool>,
    pub local_addr: std::net::SocketAddr,
}

impl MetricsServer {
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Bind the instrumentation listener (failing startup early if the
/// address is taken) and serve `GET /metrics` until stopped.
pub async fn serve(addr: &str) -> anyhow::Result<MetricsServer> {
    // A bare ":8080" means all interfaces
    let addr = if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{port}")
    } else {
        addr.to_string()
    };

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen at {addr}"))?;
    let local_addr = listener.local_addr()?;

    let router = Router::new().route("/metrics", get(metrics_handler));
    let (shutdown, mut shutdown_rx) = watch::channel(false);

    tokio::spawn(async move {
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            let _ = shutdown_rx.changed().await;
        });
        if let Err(err) = serve.await {
            tracing::error!("instrumentation server terminated with error: {err:#}");
        }
    });

    tracing::info!(%local_addr, "instrumentation server listening");

    Ok(MetricsServer {
        shutdown,
        local_addr,
    })
}

async fn metrics_handler() -> impl IntoResponse {
    match TextEncoder::new().encode_to_string(&prometheus::gather()) {
        Ok(body) => ([(CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("encoding metrics: {err}"),
        )
            .into_response(),
    }
}
