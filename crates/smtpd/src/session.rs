use crate::conn::SessionStream;
use crate::envelope::{Envelope, Peer, Protocol};
use crate::errors::Error;
use crate::line_io::{DotData, Line, LineIo};
use crate::parser::{parse_address, parse_command, Command};
use crate::Server;
use data_encoding::BASE64;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Where the session stands in the command sequence. The fine-grained
/// distinctions of the protocol (authenticated or not, recipients
/// gathered or not) live on `peer` and `envelope`; transitions are
/// confined to the handful of methods that mutate `state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Banner sent, no HELO/EHLO yet.
    Greeted,
    /// The peer has introduced itself.
    Heloed,
    /// MAIL FROM accepted; an envelope is open.
    Transaction,
    /// QUIT received or the connection is being torn down.
    Closed,
}

pub(crate) struct Session {
    server: Arc<Server>,
    io: LineIo,
    peer: Peer,
    state: State,
    envelope: Option<Envelope>,
}

impl Session {
    pub fn new(server: Arc<Server>, stream: SessionStream, addr: SocketAddr) -> Self {
        let mut peer = Peer::new(addr);
        peer.tls = stream.tls_info();

        Self {
            server,
            io: LineIo::new(stream),
            peer,
            state: State::Greeted,
            envelope: None,
        }
    }

    /// Run the session to completion. I/O failures (including timeouts)
    /// tear the connection down without a reply.
    pub async fn run(mut self) {
        let addr = self.peer.addr;
        let result = match self.server.policy().connection_deadline(&self.peer) {
            Some(deadline) => match tokio::time::timeout(deadline, self.serve()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::debug!(%addr, "connection deadline elapsed");
                    return;
                }
            },
            None => self.serve().await,
        };

        if let Err(err) = result {
            tracing::debug!(%addr, "session ended: {err:#}");
        }
    }

    async fn serve(&mut self) -> io::Result<()> {
        self.welcome().await?;

        while self.state != State::Closed {
            match self.io.read_line(self.server.config().read_timeout).await? {
                Line::Text(line) => self.handle(&line).await?,
                Line::TooLong => self.reply(&Error::line_too_long()).await?,
            }
        }
        Ok(())
    }

    /// Run the connection check and emit the banner. Also re-invoked by
    /// XCLIENT/PROXY after the peer identity has been rewritten.
    async fn welcome(&mut self) -> io::Result<()> {
        if let Err(err) = self.server.policy().check_connection(&self.peer).await {
            self.reply(&err).await?;
            self.state = State::Closed;
            return Ok(());
        }

        let config = self.server.config();
        let welcome = if config.welcome_message.is_empty() {
            format!("{} ESMTP ready.", config.hostname)
        } else {
            config.welcome_message.clone()
        };
        self.write_reply(220, &welcome).await
    }

    async fn handle(&mut self, line: &str) -> io::Result<()> {
        let cmd = parse_command(line);

        match cmd.verb.as_str() {
            "PROXY" => self.handle_proxy(&cmd).await,
            "HELO" => self.handle_helo(&cmd, Protocol::Smtp).await,
            "EHLO" => self.handle_helo(&cmd, Protocol::Esmtp).await,
            "MAIL" => self.handle_mail(&cmd).await,
            "RCPT" => self.handle_rcpt(&cmd).await,
            "STARTTLS" => self.handle_starttls(&cmd).await,
            "DATA" => self.handle_data(&cmd).await,
            "RSET" => self.handle_rset(&cmd).await,
            "NOOP" => self.write_reply(250, "Go ahead").await,
            "QUIT" => self.handle_quit(&cmd).await,
            "AUTH" => self.handle_auth(&cmd).await,
            "XCLIENT" => self.handle_xclient(&cmd).await,
            _ => self.reply(&Error::unsupported_command()).await,
        }
    }

    /// Abort the current transaction. An authenticated username
    /// survives; only STARTTLS clears it.
    fn reset(&mut self) {
        self.envelope = None;
        if self.state == State::Transaction {
            self.state = State::Heloed;
        }
    }

    async fn handle_helo(&mut self, cmd: &Command, protocol: Protocol) -> io::Result<()> {
        if cmd.fields.len() < 2 {
            return self.reply(&Error::missing_param()).await;
        }

        if !self.peer.helo_name.is_empty() {
            // Duplicate HELO resets the envelope
            self.reset();
        }

        let name = &cmd.fields[1];
        if let Err(err) = self.server.policy().check_helo(&self.peer, name).await {
            return self.reply(&err).await;
        }

        self.peer.helo_name = name.clone();
        self.peer.protocol = protocol;
        self.state = State::Heloed;

        match protocol {
            Protocol::Smtp => self.write_reply(250, "Go ahead").await,
            Protocol::Esmtp => {
                let message = self.ehlo_response();
                self.write_reply(250, &message).await
            }
        }
    }

    fn ehlo_response(&self) -> String {
        let config = self.server.config();
        let mut lines = vec![
            config.hostname.clone(),
            "PIPELINING".to_string(),
            "8BITMIME".to_string(),
        ];
        if config.tls.is_some() && !self.io.is_tls() {
            lines.push("STARTTLS".to_string());
        }
        if self.server.authenticator().is_some() && self.io.is_tls() {
            lines.push("AUTH PLAIN LOGIN".to_string());
        }
        if config.enable_xclient {
            lines.push("XCLIENT".to_string());
        }
        if config.enable_proxy {
            lines.push("PROXY".to_string());
        }
        lines.push(format!("SIZE {}", config.max_message_size));
        lines.join("\n")
    }

    async fn handle_mail(&mut self, cmd: &Command) -> io::Result<()> {
        if cmd.params.len() != 2 || !cmd.params[0].eq_ignore_ascii_case("FROM") {
            return self.reply(&Error::invalid_syntax()).await;
        }
        if self.peer.helo_name.is_empty() {
            return self.reply(&Error::no_helo()).await;
        }
        if self.server.authenticator().is_some() && self.peer.username.is_empty() {
            return self.reply(&Error::auth_required()).await;
        }
        if self.server.config().force_tls && !self.io.is_tls() {
            return self.reply(&Error::starttls_required()).await;
        }
        if self.envelope.is_some() {
            return self.reply(&Error::duplicate_mail()).await;
        }

        // The null sender is legal per RFC 5321 §6.1
        let addr = if cmd.params[1] == "<>" {
            String::new()
        } else {
            match parse_address(&cmd.params[1]) {
                Ok(addr) => addr,
                Err(err) => return self.reply(&err).await,
            }
        };

        if let Err(err) = self.server.policy().check_sender(&self.peer, &addr).await {
            return self.reply(&err).await;
        }

        self.envelope = Some(Envelope::new(addr));
        self.state = State::Transaction;
        self.write_reply(250, "Go ahead").await
    }

    async fn handle_rcpt(&mut self, cmd: &Command) -> io::Result<()> {
        if cmd.params.len() != 2 || !cmd.params[0].eq_ignore_ascii_case("TO") {
            return self.reply(&Error::invalid_syntax()).await;
        }

        let max_recipients = self.server.config().max_recipients;
        let envelope = match &self.envelope {
            Some(envelope) => envelope,
            None => return self.reply(&Error::no_mail()).await,
        };
        if envelope.recipients.len() >= max_recipients {
            return self.reply(&Error::too_many_recipients()).await;
        }

        let addr = match parse_address(&cmd.params[1]) {
            Ok(addr) => addr,
            Err(err) => return self.reply(&err).await,
        };

        if let Err(err) = self
            .server
            .policy()
            .check_recipient(&self.peer, &addr)
            .await
        {
            return self.reply(&err).await;
        }

        self.envelope
            .as_mut()
            .expect("checked above")
            .recipients
            .push(addr);
        self.write_reply(250, "Go ahead").await
    }

    async fn handle_starttls(&mut self, _cmd: &Command) -> io::Result<()> {
        if self.io.is_tls() {
            return self.reply(&Error::duplicate_starttls()).await;
        }

        let acceptor = match &self.server.config().tls {
            Some(tls) => TlsAcceptor::from(tls.clone()),
            None => return self.reply(&Error::tls_not_supported()).await,
        };

        self.write_reply(220, "Go ahead").await?;

        let timeout = self.server.config().read_timeout;
        if let Err(err) = self.io.upgrade_tls(acceptor, timeout).await {
            // The stream is consumed mid-handshake; nothing sensible
            // can be written back.
            tracing::debug!(addr = %self.peer.addr, "TLS handshake failed: {err:#}");
            self.state = State::Closed;
            return Ok(());
        }

        // A new EHLO is required, and whatever identity was established
        // in plaintext no longer counts.
        self.reset();
        self.peer.helo_name.clear();
        self.peer.username.clear();
        self.peer.tls = self.io.tls_info();
        self.state = State::Greeted;

        Ok(())
    }

    async fn handle_data(&mut self, _cmd: &Command) -> io::Result<()> {
        let ready = self
            .envelope
            .as_ref()
            .map(|envelope| !envelope.recipients.is_empty())
            .unwrap_or(false);
        if !ready {
            return self.reply(&Error::no_rcpt()).await;
        }

        self.write_reply(354, "Go ahead. End your data with <CR><LF>.<CR><LF>")
            .await?;

        let config = self.server.config();
        let max_message_size = config.max_message_size;
        match self
            .io
            .read_data(max_message_size, config.data_timeout)
            .await?
        {
            DotData::Complete(data) => {
                let mut envelope = self.envelope.take().expect("checked above");
                envelope.data = data;
                envelope.parse_header();
                self.reset();

                match self.server.policy().deliver(&self.peer, envelope).await {
                    Ok(()) => self.write_reply(250, "Thank you.").await,
                    Err(err) => self.reply(&err).await,
                }
            }
            DotData::TooBig => {
                self.reset();
                self.reply(&Error::too_big(max_message_size)).await
            }
        }
    }

    async fn handle_rset(&mut self, _cmd: &Command) -> io::Result<()> {
        self.reset();
        self.write_reply(250, "Go ahead").await
    }

    async fn handle_quit(&mut self, _cmd: &Command) -> io::Result<()> {
        self.write_reply(221, "OK, bye").await?;
        self.state = State::Closed;
        Ok(())
    }

    async fn handle_auth(&mut self, cmd: &Command) -> io::Result<()> {
        if cmd.fields.len() < 2 {
            return self.reply(&Error::invalid_syntax()).await;
        }
        let authenticator = match self.server.authenticator() {
            Some(authenticator) => authenticator.clone(),
            None => return self.reply(&Error::unsupported_command()).await,
        };
        if self.peer.helo_name.is_empty() {
            return self.reply(&Error::no_helo()).await;
        }
        if !self.io.is_tls() {
            return self.reply(&Error::starttls_required()).await;
        }

        let mechanism = cmd.fields[1].to_ascii_uppercase();

        let (username, password) = match mechanism.as_str() {
            "PLAIN" => {
                let payload = match cmd.fields.get(2) {
                    Some(inline) => inline.clone(),
                    None => match self.challenge("Give me your credentials").await? {
                        Some(response) => response,
                        None => return Ok(()),
                    },
                };

                let decoded = match BASE64.decode(payload.as_bytes()) {
                    Ok(decoded) => decoded,
                    Err(_) => return self.reply(&Error::malformed_auth()).await,
                };

                // [authzid] NUL authcid NUL password
                let parts: Vec<&[u8]> = decoded.split(|&b| b == 0).collect();
                if parts.len() != 3 {
                    return self.reply(&Error::malformed_auth()).await;
                }
                (
                    String::from_utf8_lossy(parts[1]).into_owned(),
                    String::from_utf8_lossy(parts[2]).into_owned(),
                )
            }
            "LOGIN" => {
                let encoded_username = match cmd.fields.get(2) {
                    Some(inline) => inline.clone(),
                    None => match self.challenge("VXNlcm5hbWU6").await? {
                        Some(response) => response,
                        None => return Ok(()),
                    },
                };
                let username = match BASE64.decode(encoded_username.as_bytes()) {
                    Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                    Err(_) => return self.reply(&Error::malformed_auth()).await,
                };

                let encoded_password = match self.challenge("UGFzc3dvcmQ6").await? {
                    Some(response) => response,
                    None => return Ok(()),
                };
                let password = match BASE64.decode(encoded_password.as_bytes()) {
                    Ok(decoded) => String::from_utf8_lossy(&decoded).into_owned(),
                    Err(_) => return self.reply(&Error::malformed_auth()).await,
                };

                (username, password)
            }
            _ => {
                tracing::debug!(mechanism, "unknown authentication mechanism");
                return self.reply(&Error::unknown_auth_mechanism()).await;
            }
        };

        if let Err(err) = authenticator
            .authenticate(&self.peer, &username, &password)
            .await
        {
            return self.reply(&err).await;
        }

        self.peer.username = username;
        self.write_reply(235, "OK, you are now authenticated").await
    }

    /// Emit a 334 continuation and read the response line.
    /// Returns None when the peer sent something unreadable (the error
    /// reply has already been written).
    async fn challenge(&mut self, prompt: &str) -> io::Result<Option<String>> {
        self.write_reply(334, prompt).await?;
        match self.io.read_line(self.server.config().read_timeout).await? {
            Line::Text(line) => Ok(Some(line)),
            Line::TooLong => {
                self.reply(&Error::line_too_long()).await?;
                Ok(None)
            }
        }
    }

    async fn handle_xclient(&mut self, cmd: &Command) -> io::Result<()> {
        if !self.server.config().enable_xclient {
            return self.reply(&Error::unsupported_command()).await;
        }
        if cmd.fields.len() < 2 {
            return self.reply(&Error::invalid_syntax()).await;
        }

        let mut new_helo_name = None;
        let mut new_username = None;
        let mut new_protocol = None;
        let mut new_addr = None;
        let mut new_port = None;

        for item in &cmd.fields[1..] {
            let (name, value) = match item.split_once('=') {
                Some(pair) => pair,
                None => return self.reply(&Error::malformed_command()).await,
            };

            match name {
                // The proxy's own name is of no interest here
                "NAME" => continue,
                "HELO" => new_helo_name = Some(value.to_string()),
                "ADDR" => new_addr = value.parse::<std::net::IpAddr>().ok(),
                "PORT" => match value.parse::<u16>() {
                    Ok(port) => new_port = Some(port),
                    Err(_) => return self.reply(&Error::malformed_command()).await,
                },
                "LOGIN" => new_username = Some(value.to_string()),
                "PROTO" => {
                    new_protocol = match value {
                        "SMTP" => Some(Protocol::Smtp),
                        "ESMTP" => Some(Protocol::Esmtp),
                        _ => None,
                    }
                }
                _ => return self.reply(&Error::malformed_command()).await,
            }
        }

        self.rewrite_peer(new_helo_name, new_username, new_protocol, new_addr, new_port);
        self.welcome().await
    }

    async fn handle_proxy(&mut self, cmd: &Command) -> io::Result<()> {
        if !self.server.config().enable_proxy {
            return self.reply(&Error::unsupported_command()).await;
        }

        // PROXY TCP4 <src-ip> <dst-ip> <src-port> <dst-port>
        if cmd.fields.len() < 6 {
            return self.reply(&Error::malformed_command()).await;
        }

        let new_addr = cmd.fields[2].parse::<std::net::IpAddr>().ok();
        let new_port = match cmd.fields[4].parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => return self.reply(&Error::malformed_command()).await,
        };

        self.rewrite_peer(None, None, None, new_addr, new_port);
        self.welcome().await
    }

    fn rewrite_peer(
        &mut self,
        helo_name: Option<String>,
        username: Option<String>,
        protocol: Option<Protocol>,
        addr: Option<std::net::IpAddr>,
        port: Option<u16>,
    ) {
        if let Some(helo_name) = helo_name {
            self.peer.helo_name = helo_name;
        }
        if let Some(username) = username {
            self.peer.username = username;
        }
        if let Some(protocol) = protocol {
            self.peer.protocol = protocol;
        }
        if let Some(ip) = addr {
            self.peer.addr = SocketAddr::new(ip, self.peer.addr.port());
        }
        if let Some(port) = port {
            self.peer.addr = SocketAddr::new(self.peer.addr.ip(), port);
        }
    }

    async fn reply(&mut self, err: &Error) -> io::Result<()> {
        self.write_reply(err.code, &err.message).await
    }

    async fn write_reply(&mut self, code: u16, message: &str) -> io::Result<()> {
        self.io
            .write_reply(code, message, self.server.config().write_timeout)
            .await
    }
}
