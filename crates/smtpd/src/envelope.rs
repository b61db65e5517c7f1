use chrono::Utc;
use std::fmt;
use std::net::SocketAddr;

/// Protocol negotiated by the greeting command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Smtp,
    Esmtp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Smtp => write!(fmt, "SMTP"),
            Self::Esmtp => write!(fmt, "ESMTP"),
        }
    }
}

/// Negotiated TLS parameters, recorded on the peer once a handshake
/// has completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsInfo {
    pub version: String,
    pub cipher: String,
}

/// A snapshot of who is connected. Handed to every policy check.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Remote TCP endpoint. XCLIENT/PROXY may rewrite this.
    pub addr: SocketAddr,
    /// Name from HELO/EHLO; empty until the peer introduces itself.
    pub helo_name: String,
    pub protocol: Protocol,
    /// Authenticated username; empty while unauthenticated.
    pub username: String,
    /// None on a plaintext connection.
    pub tls: Option<TlsInfo>,
}

impl Peer {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            helo_name: String::new(),
            protocol: Protocol::Smtp,
            username: String::new(),
            tls: None,
        }
    }
}

/// Case-insensitive, multi-valued view of the top-level message header.
/// Values keep their order of appearance.
#[derive(Debug, Clone, Default)]
pub struct HeaderMap {
    entries: Vec<(String, String)>,
}

impl HeaderMap {
    /// Best-effort parse of the header block of an RFC 5322 message.
    /// Returns None when the data doesn't start with anything
    /// header-shaped; the message itself is still deliverable.
    pub fn parse(data: &[u8]) -> Option<Self> {
        let mut entries: Vec<(String, String)> = vec![];

        for raw_line in data.split(|&b| b == b'\n') {
            let line = match raw_line.strip_suffix(b"\r") {
                Some(stripped) => stripped,
                None => raw_line,
            };
            if line.is_empty() {
                break;
            }

            if line[0] == b' ' || line[0] == b'\t' {
                // Continuation of the previous field
                let (_, value) = entries.last_mut()?;
                value.push(' ');
                value.push_str(String::from_utf8_lossy(line).trim());
                continue;
            }

            let text = String::from_utf8_lossy(line);
            let (name, value) = text.split_once(':')?;
            if name.is_empty() || name.contains(' ') {
                return None;
            }
            entries.push((name.to_string(), value.trim().to_string()));
        }

        Some(Self { entries })
    }

    /// First value of the named field, if any.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> {
        self.entries
            .iter()
            .filter(move |(field, _)| field.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The message being assembled during one SMTP transaction.
#[derive(Debug, Clone, Default)]
pub struct Envelope {
    /// Empty string represents the null sender `<>`.
    pub sender: String,
    pub recipients: Vec<String>,
    /// Raw message bytes, dot-unstuffed, CRLF endings preserved.
    pub data: Vec<u8>,
    /// Parsed after DATA completes; empty when parsing failed.
    pub header: HeaderMap,
}

impl Envelope {
    pub(crate) fn new(sender: String) -> Self {
        Self {
            sender,
            ..Default::default()
        }
    }

    pub(crate) fn parse_header(&mut self) {
        if let Some(header) = HeaderMap::parse(&self.data) {
            self.header = header;
        }
    }

    /// Prepend a `Received:` trace line recording how the message
    /// arrived here.
    pub fn add_received_line(&mut self, peer: &Peer, hostname: &str) {
        let line = format!(
            "Received: from {} ([{}]) by {} with {}; {}\r\n",
            peer.helo_name,
            peer.addr.ip(),
            hostname,
            peer.protocol,
            Utc::now().to_rfc2822(),
        );

        let mut data = line.into_bytes();
        data.extend_from_slice(&self.data);
        self.data = data;
    }
}
