use anyhow::Context;
use clap::Parser;
use relayd::config::{self, Config};
use relayd::relay::Relay;
use relayd::{logging, metrics};
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;

/// Listener drain budget during shutdown, after which the process
/// gives up on stragglers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn main() -> anyhow::Result<()> {
    let opt = config::Opt::parse();
    let cfg = config::load(opt).context("error loading config")?;

    logging::init(&cfg.log_format, &cfg.log_level).context("setting up logging")?;
    tracing::debug!(version = env!("CARGO_PKG_VERSION"), "config loaded");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("building the tokio runtime")
        .block_on(run(Arc::new(cfg)))
}

async fn run(cfg: Arc<Config>) -> anyhow::Result<()> {
    let metrics_server = metrics::serve(&cfg.metrics_listen)
        .await
        .context("could not start metrics server")?;

    let relay = Arc::new(Relay::new(Arc::clone(&cfg)).context("setting up relay")?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Some(limiter) = relay.rate_limiter() {
        Arc::clone(limiter).start(shutdown_rx);
    }

    let mut servers: Vec<(Arc<smtpd::Server>, JoinHandle<Result<(), smtpd::ServerError>>)> =
        vec![];

    for address in cfg.listen.split_ascii_whitespace() {
        let (server, handle) = match address.split_once("://") {
            None => {
                tracing::info!(address, "listening on address");
                listen(&cfg, &relay, address, None, false, false).await?
            }
            Some(("starttls", address)) => {
                let tls = server_tls_config(&cfg)?;
                tracing::info!(address, "listening on STARTTLS address");
                listen(&cfg, &relay, address, Some(tls), cfg.local_forcetls, false).await?
            }
            Some(("tls", address)) => {
                let tls = server_tls_config(&cfg)?;
                tracing::info!(address, "listening on TLS address");
                listen(&cfg, &relay, address, Some(tls), false, true).await?
            }
            Some((scheme, _)) => {
                anyhow::bail!("unknown protocol {scheme:?} in address {address:?}")
            }
        };
        servers.push((server, handle));
    }

    wait_for_signal().await;

    // Stop accepting, let in-flight sessions drain, then leave
    let _ = shutdown_tx.send(true);
    for (server, _) in &servers {
        server.shutdown();
    }
    for (server, handle) in servers {
        let _ = handle.await;
        if tokio::time::timeout(SHUTDOWN_GRACE, server.wait())
            .await
            .is_err()
        {
            tracing::warn!("timed out waiting for sessions to finish");
        }
    }

    metrics_server.stop();
    Ok(())
}

async fn listen(
    cfg: &Arc<Config>,
    relay: &Arc<Relay>,
    address: &str,
    tls: Option<Arc<rustls::ServerConfig>>,
    force_tls: bool,
    implicit_tls: bool,
) -> anyhow::Result<(Arc<smtpd::Server>, JoinHandle<Result<(), smtpd::ServerError>>)> {
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("could not listen on address {address:?}"))?;

    let engine_config = smtpd::ServerConfig {
        hostname: cfg.hostname.clone(),
        welcome_message: cfg.welcome_msg.clone(),
        read_timeout: cfg.read_timeout,
        write_timeout: cfg.write_timeout,
        data_timeout: cfg.data_timeout,
        max_connections: cfg.max_connections,
        max_message_size: cfg.max_message_size,
        max_recipients: cfg.max_recipients,
        tls,
        force_tls,
        enable_xclient: false,
        enable_proxy: false,
    };

    let mut server = smtpd::Server::new(engine_config, Arc::clone(relay) as _);
    if cfg.allowed_users.is_some() {
        server = server.with_authenticator(Arc::clone(relay) as _);
    }
    let server = Arc::new(server);

    let serving = Arc::clone(&server);
    let handle = tokio::spawn(async move {
        if implicit_tls {
            serving.serve_tls(listener).await
        } else {
            serving.serve(listener).await
        }
    });

    Ok((server, handle))
}

fn server_tls_config(cfg: &Config) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let cert_path = cfg
        .local_cert
        .as_deref()
        .context("empty local_cert")?;
    let key_path = cfg.local_key.as_deref().context("empty local_key")?;

    load_tls_config(cert_path, key_path)
        .with_context(|| format!("cannot load X509 keypair from {}", cert_path.display()))
}

fn load_tls_config(cert_path: &Path, key_path: &Path) -> anyhow::Result<Arc<rustls::ServerConfig>> {
    let mut cert_reader = BufReader::new(std::fs::File::open(cert_path)?);
    let certs = rustls_pemfile::certs(&mut cert_reader).collect::<Result<Vec<_>, _>>()?;
    anyhow::ensure!(!certs.is_empty(), "no certificates found");

    let mut key_reader = BufReader::new(std::fs::File::open(key_path)?);
    let key = rustls_pemfile::private_key(&mut key_reader)?.context("no private key found")?;

    Ok(Arc::new(
        rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)?,
    ))
}

async fn wait_for_signal() {
    let mut sigint = signal(SignalKind::interrupt()).expect("listen for SIGINT");
    let mut sigterm = signal(SignalKind::terminate()).expect("listen for SIGTERM");

    tokio::select! {
        _ = sigint.recv() => tracing::warn!("received SIGINT, shutting down"),
        _ = sigterm.recv() => tracing::warn!("received SIGTERM, shutting down"),
    }
}
