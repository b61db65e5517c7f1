use anyhow::Context;
use cidr_map::CidrSet;
use clap::Parser;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Command line surface. Every option can equally be set in the TOML
/// file given via `--config`, under the same name; flags win over the
/// file, the file wins over the built-in defaults.
#[derive(Debug, Default, Parser)]
#[command(name = "relayd", about = "An authenticating SMTP smarthost relay", version)]
pub struct Opt {
    /// Configuration file (TOML, same keys as the flags)
    #[arg(long = "config")]
    pub config: Option<PathBuf>,

    /// Log format - json or logfmt
    #[arg(long = "log_format")]
    pub log_format: Option<String>,

    /// Minimum log level to output
    #[arg(long = "log_level")]
    pub log_level: Option<String>,

    /// Server hostname
    #[arg(long = "hostname")]
    pub hostname: Option<String>,

    /// Welcome message for SMTP session
    #[arg(long = "welcome_msg")]
    pub welcome_msg: Option<String>,

    /// Address and port to listen for incoming SMTP
    #[arg(long = "listen")]
    pub listen: Option<String>,

    /// Address and port to listen for metrics exposition
    #[arg(long = "metrics_listen")]
    pub metrics_listen: Option<String>,

    /// SSL certificate for STARTTLS/TLS
    #[arg(long = "local_cert")]
    pub local_cert: Option<PathBuf>,

    /// SSL private key for STARTTLS/TLS
    #[arg(long = "local_key")]
    pub local_key: Option<PathBuf>,

    /// Force STARTTLS (needs local_cert and local_key)
    #[arg(long = "local_forcetls", num_args = 0..=1, default_missing_value = "true")]
    pub local_forcetls: Option<bool>,

    /// Networks allowed to send mails (set to "" to disable)
    #[arg(long = "allowed_nets")]
    pub allowed_nets: Option<String>,

    /// Regular expression for valid FROM email addresses
    #[arg(long = "allowed_sender")]
    pub allowed_sender: Option<String>,

    /// Regular expression for valid 'to' email addresses
    #[arg(long = "allowed_recipients")]
    pub allowed_recipients: Option<String>,

    /// Regular expression for email addresses that are never delivered to
    #[arg(long = "denied_recipients")]
    pub denied_recipients: Option<String>,

    /// Path to file with valid users/passwords
    #[arg(long = "allowed_users")]
    pub allowed_users: Option<PathBuf>,

    /// Outgoing SMTP server
    #[arg(long = "remote_host")]
    pub remote_host: Option<String>,

    /// Username for authentication on outgoing SMTP server
    #[arg(long = "remote_user")]
    pub remote_user: Option<String>,

    /// Password for authentication on outgoing SMTP server
    /// (set $REMOTE_PASS to use an env var instead)
    #[arg(long = "remote_pass")]
    pub remote_pass: Option<String>,

    /// Auth method on outgoing SMTP server (plain, login, xoauth2)
    #[arg(long = "remote_auth")]
    pub remote_auth: Option<String>,

    /// Sender email address on outgoing SMTP server
    #[arg(long = "remote_sender")]
    pub remote_sender: Option<String>,

    /// Max message size allowed in bytes
    #[arg(long = "max_message_size")]
    pub max_message_size: Option<usize>,

    /// Max number of concurrent connections, use -1 to disable
    #[arg(long = "max_connections")]
    pub max_connections: Option<i64>,

    /// Max number of recipients on an email
    #[arg(long = "max_recipients")]
    pub max_recipients: Option<usize>,

    /// Socket timeout for read operations
    #[arg(long = "read_timeout")]
    pub read_timeout: Option<String>,

    /// Socket timeout for write operations
    #[arg(long = "write_timeout")]
    pub write_timeout: Option<String>,

    /// Socket timeout for DATA command
    #[arg(long = "data_timeout")]
    pub data_timeout: Option<String>,

    /// Enable per-sender rate limiting
    #[arg(long = "rate_limit_enabled", num_args = 0..=1, default_missing_value = "true")]
    pub rate_limit_enabled: Option<bool>,

    /// Maximum messages per second per sender
    #[arg(long = "rate_limit_messages_per_second")]
    pub rate_limit_messages_per_second: Option<f64>,

    /// Burst capacity for the rate limiter
    #[arg(long = "rate_limit_burst")]
    pub rate_limit_burst: Option<u32>,

    /// Email header to extract the sender identity for rate limiting
    /// (by default, the sender address is used)
    #[arg(long = "rate_limit_header")]
    pub rate_limit_header: Option<String>,

    /// Client ID for OAuth2 authentication
    #[arg(long = "xoauth2_client_id")]
    pub xoauth2_client_id: Option<String>,

    /// Client secret for OAuth2 authentication
    #[arg(long = "xoauth2_client_secret")]
    pub xoauth2_client_secret: Option<String>,

    /// OAuth2 token endpoint URL
    #[arg(long = "xoauth2_token_url")]
    pub xoauth2_token_url: Option<String>,

    /// Refresh token for OAuth2 authentication
    #[arg(long = "xoauth2_refresh_token")]
    pub xoauth2_refresh_token: Option<String>,

    /// Log this mail header's value (log_field=Header-Name),
    /// set multiples with spaces
    #[arg(long = "log_header")]
    pub log_header: Option<String>,
}

/// The same knobs, as they appear in the TOML file.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    log_format: Option<String>,
    log_level: Option<String>,
    hostname: Option<String>,
    welcome_msg: Option<String>,
    listen: Option<String>,
    metrics_listen: Option<String>,
    local_cert: Option<PathBuf>,
    local_key: Option<PathBuf>,
    local_forcetls: Option<bool>,
    allowed_nets: Option<String>,
    allowed_sender: Option<String>,
    allowed_recipients: Option<String>,
    denied_recipients: Option<String>,
    allowed_users: Option<PathBuf>,
    remote_host: Option<String>,
    remote_user: Option<String>,
    remote_pass: Option<String>,
    remote_auth: Option<String>,
    remote_sender: Option<String>,
    max_message_size: Option<usize>,
    max_connections: Option<i64>,
    max_recipients: Option<usize>,
    read_timeout: Option<String>,
    write_timeout: Option<String>,
    data_timeout: Option<String>,
    rate_limit_enabled: Option<bool>,
    rate_limit_messages_per_second: Option<f64>,
    rate_limit_burst: Option<u32>,
    rate_limit_header: Option<String>,
    xoauth2_client_id: Option<String>,
    xoauth2_client_secret: Option<String>,
    xoauth2_token_url: Option<String>,
    xoauth2_refresh_token: Option<String>,
    log_header: Option<String>,
}

/// Validated process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub log_format: String,
    pub log_level: String,
    pub hostname: String,
    pub welcome_msg: String,
    pub listen: String,
    pub metrics_listen: String,
    pub local_cert: Option<PathBuf>,
    pub local_key: Option<PathBuf>,
    pub local_forcetls: bool,
    pub allowed_nets: CidrSet,
    pub allowed_sender: String,
    pub allowed_recipients: String,
    pub denied_recipients: String,
    pub allowed_users: Option<PathBuf>,
    pub remote_host: String,
    pub remote_user: String,
    pub remote_pass: String,
    pub remote_auth: String,
    pub remote_sender: String,
    pub max_message_size: usize,
    /// None disables the connection cap (`max_connections = -1`).
    pub max_connections: Option<usize>,
    pub max_recipients: usize,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
    pub data_timeout: Duration,
    pub rate_limit_enabled: bool,
    pub rate_limit_messages_per_second: f64,
    pub rate_limit_burst: u32,
    pub rate_limit_header: String,
    pub xoauth2_client_id: String,
    pub xoauth2_client_secret: String,
    pub xoauth2_token_url: String,
    pub xoauth2_refresh_token: String,
    pub log_headers: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_format: "json".to_string(),
            log_level: "debug".to_string(),
            hostname: "localhost.localdomain".to_string(),
            welcome_msg: String::new(),
            listen: "127.0.0.1:25 [::1]:25".to_string(),
            metrics_listen: ":8080".to_string(),
            local_cert: None,
            local_key: None,
            local_forcetls: false,
            allowed_nets: CidrSet::parse_list("127.0.0.0/8 ::/128").expect("default nets parse"),
            allowed_sender: String::new(),
            allowed_recipients: String::new(),
            denied_recipients: String::new(),
            allowed_users: None,
            remote_host: "smtp.gmail.com:587".to_string(),
            remote_user: String::new(),
            remote_pass: String::new(),
            remote_auth: "plain".to_string(),
            remote_sender: String::new(),
            max_message_size: 51_200_000,
            max_connections: Some(100),
            max_recipients: 100,
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(5 * 60),
            rate_limit_enabled: false,
            rate_limit_messages_per_second: 10.0,
            rate_limit_burst: 5,
            rate_limit_header: String::new(),
            xoauth2_client_id: String::new(),
            xoauth2_client_secret: String::new(),
            xoauth2_token_url: String::new(),
            xoauth2_refresh_token: String::new(),
            log_headers: HashMap::new(),
        }
    }
}

fn pick<T>(cli: Option<T>, file: Option<T>, default: T) -> T {
    cli.or(file).unwrap_or(default)
}

fn pick_duration(
    cli: Option<String>,
    file: Option<String>,
    default: Duration,
    name: &str,
) -> anyhow::Result<Duration> {
    match cli.or(file) {
        Some(text) => humantime::parse_duration(&text)
            .map_err(|err| anyhow::anyhow!("invalid {name} {text:?}: {err}")),
        None => Ok(default),
    }
}

pub fn load(opt: Opt) -> anyhow::Result<Config> {
    let file: FileConfig = match &opt.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        }
        None => FileConfig::default(),
    };

    let defaults = Config::default();

    // remote_pass may come from the environment so that it stays out
    // of the process arguments
    let remote_pass = pick(
        opt.remote_pass,
        file.remote_pass,
        std::env::var("REMOTE_PASS").unwrap_or_default(),
    );

    let allowed_nets_str = opt.allowed_nets.or(file.allowed_nets);
    let allowed_nets = match allowed_nets_str {
        Some(list) => CidrSet::parse_list(&list).context("allowed_nets")?,
        None => defaults.allowed_nets,
    };

    let max_connections = match pick(opt.max_connections, file.max_connections, 100) {
        n if n < 0 => None,
        n => Some(n as usize),
    };

    let cfg = Config {
        log_format: pick(opt.log_format, file.log_format, defaults.log_format),
        log_level: pick(opt.log_level, file.log_level, defaults.log_level),
        hostname: pick(opt.hostname, file.hostname, defaults.hostname),
        welcome_msg: pick(opt.welcome_msg, file.welcome_msg, defaults.welcome_msg),
        listen: pick(opt.listen, file.listen, defaults.listen),
        metrics_listen: pick(opt.metrics_listen, file.metrics_listen, defaults.metrics_listen),
        local_cert: opt.local_cert.or(file.local_cert),
        local_key: opt.local_key.or(file.local_key),
        local_forcetls: pick(opt.local_forcetls, file.local_forcetls, false),
        allowed_nets,
        allowed_sender: pick(opt.allowed_sender, file.allowed_sender, String::new()),
        allowed_recipients: pick(opt.allowed_recipients, file.allowed_recipients, String::new()),
        denied_recipients: pick(opt.denied_recipients, file.denied_recipients, String::new()),
        allowed_users: opt.allowed_users.or(file.allowed_users),
        remote_host: pick(opt.remote_host, file.remote_host, defaults.remote_host),
        remote_user: pick(opt.remote_user, file.remote_user, String::new()),
        remote_pass,
        remote_auth: pick(opt.remote_auth, file.remote_auth, defaults.remote_auth),
        remote_sender: pick(opt.remote_sender, file.remote_sender, String::new()),
        max_message_size: pick(
            opt.max_message_size,
            file.max_message_size,
            defaults.max_message_size,
        ),
        max_connections,
        max_recipients: pick(opt.max_recipients, file.max_recipients, defaults.max_recipients),
        read_timeout: pick_duration(
            opt.read_timeout,
            file.read_timeout,
            defaults.read_timeout,
            "read_timeout",
        )?,
        write_timeout: pick_duration(
            opt.write_timeout,
            file.write_timeout,
            defaults.write_timeout,
            "write_timeout",
        )?,
        data_timeout: pick_duration(
            opt.data_timeout,
            file.data_timeout,
            defaults.data_timeout,
            "data_timeout",
        )?,
        rate_limit_enabled: pick(opt.rate_limit_enabled, file.rate_limit_enabled, false),
        rate_limit_messages_per_second: pick(
            opt.rate_limit_messages_per_second,
            file.rate_limit_messages_per_second,
            defaults.rate_limit_messages_per_second,
        ),
        rate_limit_burst: pick(
            opt.rate_limit_burst,
            file.rate_limit_burst,
            defaults.rate_limit_burst,
        ),
        rate_limit_header: pick(opt.rate_limit_header, file.rate_limit_header, String::new()),
        xoauth2_client_id: pick(opt.xoauth2_client_id, file.xoauth2_client_id, String::new()),
        xoauth2_client_secret: pick(
            opt.xoauth2_client_secret,
            file.xoauth2_client_secret,
            String::new(),
        ),
        xoauth2_token_url: pick(opt.xoauth2_token_url, file.xoauth2_token_url, String::new()),
        xoauth2_refresh_token: pick(
            opt.xoauth2_refresh_token,
            file.xoauth2_refresh_token,
            String::new(),
        ),
        log_headers: parse_log_headers(&pick(opt.log_header, file.log_header, String::new())),
    };

    if cfg.remote_auth == "xoauth2" {
        anyhow::ensure!(
            !cfg.remote_user.is_empty(),
            "remote_user is required for xoauth2 authentication"
        );
        anyhow::ensure!(
            !cfg.xoauth2_client_id.is_empty(),
            "xoauth2_client_id is required for xoauth2 authentication"
        );
        anyhow::ensure!(
            !cfg.xoauth2_client_secret.is_empty(),
            "xoauth2_client_secret is required for xoauth2 authentication"
        );
        anyhow::ensure!(
            !cfg.xoauth2_refresh_token.is_empty(),
            "xoauth2_refresh_token is required for xoauth2 authentication"
        );
        anyhow::ensure!(
            !cfg.xoauth2_token_url.is_empty(),
            "xoauth2_token_url is required for xoauth2 authentication"
        );
    }

    Ok(cfg)
}

/// Parse `field1=Header-Name1 field2=Header-Name2` pairs; entries
/// without a `=` are skipped.
fn parse_log_headers(pairs: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for entry in pairs.split(' ') {
        if let Some((field, header)) = entry.split_once('=') {
            headers.insert(field.to_string(), header.to_string());
        }
    }
    headers
}
