use crate::{
    parse_response_line, Auth, ClientError, Response, SmtpClientTimeouts, MAX_LINE_LEN,
};
use data_encoding::BASE64;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;

pub trait AsyncReadAndWrite: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncReadAndWrite for T {}

type BoxedAsyncReadAndWrite = Box<dyn AsyncReadAndWrite>;

/// Client side of one SMTP connection.
pub struct SmtpClient {
    socket: Option<BoxedAsyncReadAndWrite>,
    hostname: String,
    capabilities: HashMap<String, Option<String>>,
    read_buffer: Vec<u8>,
    timeouts: SmtpClientTimeouts,
}

fn extract_hostname(hostname: &str) -> &str {
    // Just the hostname, without any :port
    let fields: Vec<&str> = hostname.rsplitn(2, ':').collect();
    let hostname = if fields.len() == 2 {
        fields[1]
    } else {
        hostname
    };

    let hostname = if hostname.starts_with('[') && hostname.ends_with(']') {
        &hostname[1..hostname.len() - 1]
    } else {
        hostname
    };

    hostname.strip_suffix('.').unwrap_or(hostname)
}

impl SmtpClient {
    /// Connect and consume the 220 greeting.
    pub async fn connect(addr: &str, timeouts: SmtpClientTimeouts) -> Result<Self, ClientError> {
        let stream = timeout(timeouts.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| ClientError::TimedOut("connect"))??;
        // No need for Nagle with SMTP request/response
        stream.set_nodelay(true)?;

        let mut client = Self {
            socket: Some(Box::new(stream)),
            hostname: extract_hostname(addr).to_string(),
            capabilities: HashMap::new(),
            read_buffer: Vec::with_capacity(1024),
            timeouts,
        };

        let greeting = client.read_response(client.timeouts.command_timeout).await?;
        if greeting.code != 220 {
            return Err(ClientError::Rejected(greeting));
        }
        Ok(client)
    }

    pub fn has_capability(&self, name: &str) -> bool {
        self.capabilities.contains_key(&name.to_ascii_uppercase())
    }

    pub async fn ehlo(&mut self, ehlo_name: &str) -> Result<(), ClientError> {
        let response = self.command(&format!("EHLO {ehlo_name}")).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        let mut capabilities = HashMap::new();
        for line in response.content.lines().skip(1) {
            let mut fields = line.splitn(2, ' ');
            if let Some(name) = fields.next() {
                capabilities.insert(
                    name.to_ascii_uppercase(),
                    fields.next().map(|s| s.to_string()),
                );
            }
        }
        self.capabilities = capabilities;
        Ok(())
    }

    /// Upgrade to TLS. The certificate is verified against the webpki
    /// roots for the smarthost's name.
    pub async fn starttls(&mut self) -> Result<(), ClientError> {
        let response = self.command("STARTTLS").await?;
        if response.code != 220 {
            return Err(ClientError::Rejected(response));
        }

        let connector = build_tls_connector();
        let server_name = ServerName::try_from(self.hostname.clone())
            .map_err(|_| ClientError::InvalidDnsName(self.hostname.clone()))?;

        let socket = self.socket.take().ok_or(ClientError::NotConnected)?;
        let stream = timeout(
            self.timeouts.starttls_timeout,
            connector.connect(server_name, socket),
        )
        .await
        .map_err(|_| ClientError::TimedOut("TLS handshake"))??;

        self.socket = Some(Box::new(stream));
        // Pre-TLS capabilities no longer apply
        self.capabilities.clear();
        Ok(())
    }

    /// Drive the SASL exchange for the selected mechanism.
    pub async fn auth(&mut self, auth: &Auth) -> Result<(), ClientError> {
        let mut line = format!("AUTH {}", auth.mechanism());
        if let Some(initial) = auth.initial_response() {
            line.push(' ');
            line.push_str(&BASE64.encode(&initial));
        }

        let mut response = self.command(&line).await?;
        let mut step = 0;
        while response.code == 334 {
            step += 1;
            let reply = auth.respond(step)?;
            response = self.command(&BASE64.encode(&reply)).await?;
        }

        if response.code != 235 {
            return Err(ClientError::Rejected(response));
        }
        Ok(())
    }

    /// Run one MAIL/RCPT/DATA transaction.
    pub async fn send_message(
        &mut self,
        sender: &str,
        recipients: &[String],
        data: &[u8],
    ) -> Result<Response, ClientError> {
        let data_is_8bit = data.iter().any(|&b| b >= 0x80);
        let mail_from = if data_is_8bit && self.has_capability("8BITMIME") {
            format!("MAIL FROM:<{sender}> BODY=8BITMIME")
        } else {
            format!("MAIL FROM:<{sender}>")
        };

        let response = self.command(&mail_from).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }

        for recipient in recipients {
            let response = self.command(&format!("RCPT TO:<{recipient}>")).await?;
            if response.code != 250 && response.code != 251 {
                return Err(ClientError::Rejected(response));
            }
        }

        let response = self.command("DATA").await?;
        if response.code != 354 {
            return Err(ClientError::Rejected(response));
        }

        let stuffed;
        let data = match apply_dot_stuffing(data) {
            Some(d) => {
                stuffed = d;
                &stuffed
            }
            None => data,
        };
        let marker: &[u8] = if data.ends_with(b"\n") {
            b".\r\n"
        } else {
            b"\r\n.\r\n"
        };

        self.write_all(data, self.timeouts.data_timeout).await?;
        self.write_all(marker, self.timeouts.data_timeout).await?;

        let response = self.read_response(self.timeouts.data_timeout).await?;
        if response.code != 250 {
            return Err(ClientError::Rejected(response));
        }
        Ok(response)
    }

    pub async fn quit(&mut self) -> Result<(), ClientError> {
        let _ = self.command("QUIT").await?;
        if let Some(mut socket) = self.socket.take() {
            let _ = socket.shutdown().await;
        }
        Ok(())
    }

    pub async fn command(&mut self, line: &str) -> Result<Response, ClientError> {
        tracing::trace!("send->{}: {line}", self.hostname);
        self.write_all(
            format!("{line}\r\n").as_bytes(),
            self.timeouts.command_timeout,
        )
        .await?;
        self.read_response(self.timeouts.command_timeout).await
    }

    async fn write_all(&mut self, bytes: &[u8], duration: Duration) -> Result<(), ClientError> {
        let socket = self.socket.as_mut().ok_or(ClientError::NotConnected)?;
        match timeout(duration, socket.write_all(bytes)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => {
                self.socket.take();
                Err(err.into())
            }
            Err(_) => {
                self.socket.take();
                Err(ClientError::TimedOut("write"))
            }
        }
    }

    async fn read_response(&mut self, duration: Duration) -> Result<Response, ClientError> {
        if let Some(socket) = self.socket.as_mut() {
            socket.flush().await?;
        }

        let mut line = self.read_line(duration).await?;
        tracing::trace!("recv<-{}: {line}", self.hostname);
        let mut parsed = parse_response_line(&line)?;
        let code = parsed.code;
        let mut content = parsed.content.to_string();

        while !parsed.is_final {
            line = self.read_line(duration).await?;
            parsed = parse_response_line(&line)?;
            if parsed.code != code {
                return Err(ClientError::MalformedResponseLine(line.to_string()));
            }
            content.push('\n');
            content.push_str(parsed.content);
        }

        Ok(Response { code, content })
    }

    async fn read_line(&mut self, duration: Duration) -> Result<String, ClientError> {
        let mut too_long = false;
        loop {
            if let Some(pos) = self.read_buffer.iter().position(|&b| b == b'\n') {
                if too_long {
                    self.read_buffer.drain(0..=pos);
                    return Err(ClientError::ResponseTooLong);
                }

                let mut line: Vec<u8> = self.read_buffer.drain(0..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(String::from_utf8_lossy(&line).into_owned());
            }

            if self.read_buffer.len() > MAX_LINE_LEN {
                self.read_buffer.clear();
                too_long = true;
            }

            let mut data = [0u8; MAX_LINE_LEN];
            let size = match self.socket.as_mut() {
                Some(socket) => match timeout(duration, socket.read(&mut data)).await {
                    Ok(Ok(size)) => size,
                    Ok(Err(err)) => {
                        self.socket.take();
                        return Err(err.into());
                    }
                    Err(_) => {
                        self.socket.take();
                        return Err(ClientError::TimedOut("response"));
                    }
                },
                None => return Err(ClientError::NotConnected),
            };
            if size == 0 {
                self.socket.take();
                return Err(ClientError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "connection closed by server",
                )));
            }
            self.read_buffer.extend_from_slice(&data[0..size]);
        }
    }
}

/// Deliver one message to the smarthost: connect, EHLO, opportunistic
/// STARTTLS (with a fresh EHLO), AUTH when credentials are given and
/// the server offers AUTH, then the transaction, then QUIT.
pub async fn send_mail(
    remote_host: &str,
    auth: Option<&Auth>,
    helo_name: &str,
    sender: &str,
    recipients: &[String],
    data: &[u8],
    timeouts: SmtpClientTimeouts,
) -> Result<Response, ClientError> {
    let mut client = SmtpClient::connect(remote_host, timeouts).await?;
    client.ehlo(helo_name).await?;

    if client.has_capability("STARTTLS") {
        client.starttls().await?;
        client.ehlo(helo_name).await?;
    }

    if let Some(auth) = auth {
        if client.has_capability("AUTH") {
            client.auth(auth).await?;
        }
    }

    let response = client.send_message(sender, recipients, data).await?;
    let _ = client.quit().await;
    Ok(response)
}

fn build_tls_connector() -> TlsConnector {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

/// Double any `.` that opens a line so the payload cannot contain the
/// end-of-data marker. Returns None when the message needs no escaping
/// and can be written out as-is.
fn apply_dot_stuffing(data: &[u8]) -> Option<Vec<u8>> {
    let needs_stuffing = data.starts_with(b".") || data.windows(2).any(|pair| pair == b"\n.");
    if !needs_stuffing {
        return None;
    }

    let mut escaped = Vec::with_capacity(data.len() + 16);
    let mut line_start = true;
    for &byte in data {
        if line_start && byte == b'.' {
            escaped.push(b'.');
        }
        escaped.push(byte);
        line_start = byte == b'\n';
    }
    Some(escaped)
}
