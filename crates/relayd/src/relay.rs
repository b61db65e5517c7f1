use crate::authfile::AuthFile;
use crate::config::Config;
use crate::metrics::{
    observe_err, DURATION_SECONDS, MESSAGE_BYTES, RATE_LIMITED_TOTAL, REQUESTS_TOTAL,
};
use crate::trace;
use crate::xoauth2::TokenSource;
use async_trait::async_trait;
use regex::Regex;
use rfc5321::{Auth, ClientError, SmtpClientTimeouts};
use smtpd::{Authenticator, Envelope, Error, Peer};
use std::sync::Arc;
use std::time::Instant;
use throttle::RateLimiter;
use tracing::Instrument;
use uuid::Uuid;

/// The admission policy and delivery handler wired onto every
/// listener: CIDR admission, sender/recipient policy, per-sender rate
/// limiting, and synchronous forwarding to the smarthost.
pub struct Relay {
    cfg: Arc<Config>,
    auth_file: Option<AuthFile>,
    limiter: Option<Arc<RateLimiter>>,
    token_source: Option<TokenSource>,
    timeouts: SmtpClientTimeouts,
}

impl Relay {
    pub fn new(cfg: Arc<Config>) -> anyhow::Result<Self> {
        let auth_file = match &cfg.allowed_users {
            Some(path) => Some(AuthFile::open(path)?),
            None => None,
        };

        let limiter = if cfg.rate_limit_enabled {
            Some(Arc::new(RateLimiter::new(
                cfg.rate_limit_messages_per_second,
                cfg.rate_limit_burst,
            )))
        } else {
            None
        };

        let token_source = if cfg.remote_auth == "xoauth2" {
            Some(TokenSource::new(
                cfg.xoauth2_token_url.clone(),
                cfg.xoauth2_client_id.clone(),
                cfg.xoauth2_client_secret.clone(),
                cfg.xoauth2_refresh_token.clone(),
            ))
        } else {
            None
        };

        Ok(Self {
            cfg,
            auth_file,
            limiter,
            token_source,
            timeouts: SmtpClientTimeouts::default(),
        })
    }

    pub fn auth_file(&self) -> Option<&AuthFile> {
        self.auth_file.as_ref()
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.limiter.as_ref()
    }

    /// Pick the upstream credentials per `remote_auth`. `Ok(None)`
    /// means the smarthost is used unauthenticated.
    async fn upstream_auth(&self, unique_id: &str) -> Result<Option<Auth>, Error> {
        let cfg = &self.cfg;

        match cfg.remote_auth.as_str() {
            "xoauth2" => {
                let source = self
                    .token_source
                    .as_ref()
                    .expect("token source exists when remote_auth is xoauth2");
                match source.token().await {
                    Ok(token) => Ok(Some(Auth::XOauth2 {
                        username: cfg.remote_user.clone(),
                        token,
                    })),
                    Err(err) => {
                        tracing::error!("could not obtain access token: {err:#}");
                        Err(observe_err(Error::forwarding_failed(unique_id)))
                    }
                }
            }
            _ if cfg.remote_user.is_empty() || cfg.remote_pass.is_empty() => Ok(None),
            "plain" => Ok(Some(Auth::Plain {
                username: cfg.remote_user.clone(),
                password: cfg.remote_pass.clone(),
            })),
            "login" => Ok(Some(Auth::Login {
                username: cfg.remote_user.clone(),
                password: cfg.remote_pass.clone(),
            })),
            _ => Err(observe_err(Error::auth_method_not_supported())),
        }
    }

    /// Resolve the configured `log_field=Header-Name` pairs against
    /// the message header. Only the first value of a repeated header
    /// is reported.
    fn log_header_fields(&self, envelope: &Envelope) -> Vec<(String, String)> {
        self.cfg
            .log_headers
            .iter()
            .filter_map(|(field, header)| {
                envelope
                    .header
                    .get(header)
                    .map(|value| (field.clone(), value.to_string()))
            })
            .collect()
    }

    fn rate_limit_key(&self, envelope: &Envelope) -> String {
        if self.cfg.rate_limit_header.is_empty() {
            envelope.sender.clone()
        } else {
            envelope
                .header
                .get(&self.cfg.rate_limit_header)
                .unwrap_or_default()
                .to_string()
        }
    }

    async fn handle_message(&self, peer: &Peer, mut envelope: Envelope) -> Result<(), Error> {
        let cfg = &self.cfg;

        // Sessions whose key is empty (null sender and no configured
        // header value) are not throttled
        if let Some(limiter) = &self.limiter {
            let key = self.rate_limit_key(&envelope);
            if !key.is_empty() && !limiter.allow(&key) {
                RATE_LIMITED_TOTAL.with_label_values(&[&key]).inc();
                tracing::warn!(key, "rate limit exceeded");
                return Err(observe_err(Error::rate_limit_exceeded()));
            }
        }

        let unique_id = Uuid::new_v4().to_string();

        let extra = self.log_header_fields(&envelope);
        tracing::info!(
            uuid = %unique_id,
            from = %envelope.sender,
            to = ?envelope.recipients,
            peer = %peer.addr.ip(),
            host = %cfg.remote_host,
            headers = ?extra,
            "delivering mail from peer using smarthost"
        );

        let auth = self.upstream_auth(&unique_id).await?;

        envelope.add_received_line(peer, &cfg.hostname);

        let sender = if cfg.remote_sender.is_empty() {
            envelope.sender.clone()
        } else {
            cfg.remote_sender.clone()
        };

        MESSAGE_BYTES.observe(envelope.data.len() as f64);

        let start = Instant::now();
        let result = rfc5321::send_mail(
            &cfg.remote_host,
            auth.as_ref(),
            &cfg.hostname,
            &sender,
            &envelope.recipients,
            &envelope.data,
            self.timeouts,
        )
        .await;

        match result {
            Ok(_) => {
                DURATION_SECONDS
                    .with_label_values(&["none"])
                    .observe(start.elapsed().as_secs_f64());
                tracing::debug!(host = %cfg.remote_host, "delivery successful");
                Ok(())
            }
            Err(ClientError::Rejected(response)) => {
                // The upstream spoke SMTP; relay its verdict verbatim
                tracing::error!(
                    err_code = response.code,
                    err_msg = %response.summary(),
                    "delivery failed"
                );
                let err = Error::new(response.code, response.summary());
                DURATION_SECONDS
                    .with_label_values(&[&err.code.to_string()])
                    .observe(start.elapsed().as_secs_f64());
                Err(observe_err(err))
            }
            Err(err) => {
                tracing::error!("delivery failed: {err:#}");
                let err = Error::forwarding_failed(&unique_id);
                DURATION_SECONDS
                    .with_label_values(&[&err.code.to_string()])
                    .observe(start.elapsed().as_secs_f64());
                Err(observe_err(err))
            }
        }
    }
}

#[async_trait]
impl smtpd::Policy for Relay {
    async fn check_connection(&self, peer: &Peer) -> Result<(), Error> {
        // An empty list means allow everything
        if self.cfg.allowed_nets.is_empty() {
            return Ok(());
        }

        let ip = peer.addr.ip();
        if self.cfg.allowed_nets.contains(ip) {
            return Ok(());
        }

        tracing::warn!(%ip, "IP out of allowed network range");
        Err(observe_err(Error::ip_denied()))
    }

    async fn check_helo(&self, _peer: &Peer, _name: &str) -> Result<(), Error> {
        // Every SMTP request starts with a HELO
        REQUESTS_TOTAL.inc();
        Ok(())
    }

    async fn check_sender(&self, peer: &Peer, addr: &str) -> Result<(), Error> {
        let cfg = &self.cfg;

        if cfg.allowed_sender.is_empty() {
            // Sender checking disabled, anyone may send
            return Ok(());
        }

        // Authenticated users may carry their own address allow-list
        if let (Some(auth_file), false) = (&self.auth_file, peer.username.is_empty()) {
            let user = match auth_file.fetch(&peer.username).await {
                Ok(user) => user,
                Err(err) => {
                    tracing::warn!(sender_address = addr, "sender address not allowed: {err:#}");
                    return Err(observe_err(Error::sender_denied()));
                }
            };

            if !addr_allowed(addr, user.allowed_addresses.as_deref()) {
                tracing::warn!(sender_address = addr, username = %peer.username, "sender address not allowed");
                return Err(observe_err(Error::sender_denied()));
            }
        }

        let re = match Regex::new(&cfg.allowed_sender) {
            Ok(re) => re,
            Err(err) => {
                tracing::warn!(allowed_sender = %cfg.allowed_sender, "allowed_sender invalid: {err}");
                return Err(observe_err(Error::sender_denied()));
            }
        };

        if re.is_match(addr) {
            return Ok(());
        }

        tracing::warn!(sender_address = addr, "sender address not allowed");
        Err(observe_err(Error::sender_denied()))
    }

    async fn check_recipient(&self, _peer: &Peer, addr: &str) -> Result<(), Error> {
        let cfg = &self.cfg;

        // The deny list takes precedence
        if !cfg.denied_recipients.is_empty() {
            let re = match Regex::new(&cfg.denied_recipients) {
                Ok(re) => re,
                Err(err) => {
                    tracing::warn!(denied_recipients = %cfg.denied_recipients, "denied_recipients invalid: {err}");
                    return Err(observe_err(Error::recipient_invalid()));
                }
            };

            if re.is_match(addr) {
                tracing::warn!(address = addr, "recipient address is part of the deny list");
                return Err(observe_err(Error::recipient_denied()));
            }
        }

        if !cfg.allowed_recipients.is_empty() {
            let re = match Regex::new(&cfg.allowed_recipients) {
                Ok(re) => re,
                Err(err) => {
                    tracing::warn!(allowed_recipients = %cfg.allowed_recipients, "allowed_recipients invalid: {err}");
                    return Err(observe_err(Error::recipient_invalid()));
                }
            };

            if re.is_match(addr) {
                return Ok(());
            }

            tracing::warn!(address = addr, "invalid recipient address");
            return Err(observe_err(Error::recipient_invalid()));
        }

        // Neither a deny nor an allow list: recipient check disabled
        Ok(())
    }

    async fn deliver(&self, peer: &Peer, envelope: Envelope) -> Result<(), Error> {
        let span = tracing::info_span!(
            "deliver",
            trace_id = tracing::field::Empty,
            sampled = tracing::field::Empty
        );
        if let Some(ctx) = trace::extract(&envelope.header) {
            span.record("trace_id", ctx.trace_id.as_str());
            span.record("sampled", ctx.sampled);
        }

        self.handle_message(peer, envelope).instrument(span).await
    }
}

#[async_trait]
impl Authenticator for Relay {
    async fn authenticate(
        &self,
        _peer: &Peer,
        username: &str,
        password: &str,
    ) -> Result<(), Error> {
        let auth_file = self
            .auth_file
            .as_ref()
            .expect("authenticator is only wired up when allowed_users is set");

        if let Err(err) = auth_file.check_password(username, password).await {
            tracing::warn!(username, "auth error: {err:#}");
            return Err(observe_err(Error::auth_invalid()));
        }
        Ok(())
    }
}

/// Does `addr` match one of the patterns from the credentials file?
/// `None` (no list configured for the user) allows everything.
fn addr_allowed(addr: &str, allowed_addrs: Option<&[String]>) -> bool {
    let allowed_addrs = match allowed_addrs {
        Some(allowed_addrs) => allowed_addrs,
        None => return true,
    };

    let addr = addr.to_lowercase();
    let domain = addr
        .rsplit_once('@')
        .map(|(_, domain)| domain)
        .unwrap_or("");

    allowed_addrs
        .iter()
        .any(|allowed| match_addr(allowed, &addr, domain))
}

fn match_addr(allowed_addr: &str, addr: &str, domain: &str) -> bool {
    let allowed_addr = allowed_addr.to_lowercase();

    match allowed_addr.find('@') {
        // Bare local part or full mailbox: exact match
        None => allowed_addr == addr,
        Some(idx) if idx != 0 => allowed_addr == addr,
        // `@domain.com`: match the address's domain
        Some(_) => &allowed_addr[1..] == domain,
    }
}
