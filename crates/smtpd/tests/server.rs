//! Protocol-level tests that drive a listening server over real
//! sockets, covering the command sequencing, policy hooks, STARTTLS,
//! AUTH and shutdown behavior.
use async_trait::async_trait;
use smtpd::{Authenticator, Envelope, Error, Peer, Protocol, Server, ServerConfig, ServerError};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufStream};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_rustls::rustls;

struct Client<S> {
    stream: BufStream<S>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Client<S> {
    fn new(stream: S) -> Self {
        Self {
            stream: BufStream::new(stream),
        }
    }

    async fn send(&mut self, line: &str) {
        self.stream
            .write_all(format!("{line}\r\n").as_bytes())
            .await
            .unwrap();
        self.stream.flush().await.unwrap();
    }

    /// Read one (possibly multi-line) reply; returns code and lines.
    async fn read_reply(&mut self) -> (u16, Vec<String>) {
        let mut lines = vec![];
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.unwrap();
            assert!(n > 0, "connection closed while awaiting a reply");
            let line = line.trim_end().to_string();
            assert!(line.len() >= 4, "short reply line: {line:?}");
            let code: u16 = line[..3].parse().expect("numeric reply code");
            let last = line.as_bytes()[3] == b' ';
            lines.push(line[4..].to_string());
            if last {
                return (code, lines);
            }
        }
    }

    async fn expect(&mut self, code: u16) -> Vec<String> {
        let (got, lines) = self.read_reply().await;
        assert_eq!(got, code, "unexpected reply: {got} {lines:?}");
        lines
    }

    async fn cmd(&mut self, line: &str, code: u16) -> Vec<String> {
        self.send(line).await;
        self.expect(code).await
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }
}

async fn connect(addr: SocketAddr) -> Client<TcpStream> {
    let mut client = Client::new(TcpStream::connect(addr).await.unwrap());
    client.expect(220).await;
    client
}

type Sink = mpsc::UnboundedReceiver<(Peer, Envelope)>;

struct SinkPolicy {
    tx: mpsc::UnboundedSender<(Peer, Envelope)>,
    deliver_result: Result<(), Error>,
}

#[async_trait]
impl smtpd::Policy for SinkPolicy {
    async fn deliver(&self, peer: &Peer, envelope: Envelope) -> Result<(), Error> {
        let _ = self.tx.send((peer.clone(), envelope));
        self.deliver_result.clone()
    }
}

fn sink_policy() -> (Arc<SinkPolicy>, Sink) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Arc::new(SinkPolicy {
            tx,
            deliver_result: Ok(()),
        }),
        rx,
    )
}

async fn spawn_server(
    server: Server,
) -> (
    SocketAddr,
    Arc<Server>,
    JoinHandle<Result<(), ServerError>>,
) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = Arc::new(server);
    let serving = Arc::clone(&server);
    let handle = tokio::spawn(async move { serving.serve(listener).await });
    (addr, server, handle)
}

fn test_config() -> ServerConfig {
    ServerConfig {
        hostname: "relay.test".to_string(),
        ..Default::default()
    }
}

mod tls_support {
    use super::*;
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::pki_types::{
        CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime,
    };
    use tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
    use tokio_rustls::TlsConnector;

    pub fn server_tls_config() -> Arc<rustls::ServerConfig> {
        let key = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert = key.cert.der().clone();
        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.key_pair.serialize_der()));
        Arc::new(
            rustls::ServerConfig::builder()
                .with_no_client_auth()
                .with_single_cert(vec![cert], private_key)
                .unwrap(),
        )
    }

    #[derive(Debug)]
    struct NoVerify;

    impl ServerCertVerifier for NoVerify {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn verify_tls13_signature(
            &self,
            _message: &[u8],
            _cert: &CertificateDer<'_>,
            _dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            Ok(HandshakeSignatureValid::assertion())
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            vec![
                SignatureScheme::ECDSA_NISTP256_SHA256,
                SignatureScheme::ED25519,
                SignatureScheme::RSA_PKCS1_SHA256,
                SignatureScheme::RSA_PSS_SHA256,
            ]
        }
    }

    pub async fn client_handshake(
        stream: TcpStream,
    ) -> tokio_rustls::client::TlsStream<TcpStream> {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(config));
        connector
            .connect(ServerName::try_from("localhost").unwrap(), stream)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn smtp_walkthrough() {
    let (policy, mut sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    let ehlo = c.cmd("EHLO localhost", 250).await;
    assert!(ehlo.iter().any(|l| l == "8BITMIME"));
    assert!(ehlo.iter().any(|l| l == "PIPELINING"));
    assert!(ehlo.iter().any(|l| l.starts_with("SIZE ")));
    assert!(!ehlo.iter().any(|l| l == "STARTTLS"));
    assert!(!ehlo.iter().any(|l| l.starts_with("AUTH")));

    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("RCPT TO:<recipient2@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("This is the email body").await;
    c.cmd(".", 250).await;

    let (peer, envelope) = sink.recv().await.unwrap();
    assert_eq!(peer.helo_name, "localhost");
    assert_eq!(peer.protocol, Protocol::Esmtp);
    assert_eq!(envelope.sender, "sender@example.org");
    assert_eq!(
        envelope.recipients,
        vec!["recipient@example.net", "recipient2@example.net"]
    );
    assert_eq!(envelope.data, b"This is the email body\r\n");

    c.cmd("RSET", 250).await;
    c.cmd("VRFY foobar@example.net", 502).await;
    c.cmd("NOOP", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn pipelined_commands_are_answered_in_order() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.send("NOOP\r\nNOOP").await;
    c.expect(250).await;
    c.expect(250).await;
}

#[tokio::test]
async fn dot_stuffing_is_undone() {
    let (policy, mut sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<rcpt@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("..leading dot").await;
    c.send("normal line").await;
    c.cmd(".", 250).await;

    let (_, envelope) = sink.recv().await.unwrap();
    assert_eq!(envelope.data, b".leading dot\r\nnormal line\r\n");
}

#[tokio::test]
async fn null_sender_and_bare_addresses_are_accepted() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<>", 250).await;
    c.cmd("RSET", 250).await;
    c.cmd("MAIL FROM:test@example.org", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn stray_space_in_mail_from_is_tolerated() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM: <test@example.org>", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn sequencing_violations() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    // MAIL before HELO
    c.cmd("MAIL FROM:<test@example.org>", 502).await;
    // RCPT before MAIL
    c.cmd("RCPT TO:<recipient@example.net>", 502).await;

    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    // DATA before RCPT
    c.cmd("DATA", 502).await;
    // duplicate MAIL
    c.cmd("MAIL FROM:<sender@example.org>", 502).await;

    // duplicate HELO is legal and resets the transaction
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn malformed_addresses_are_rejected() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<invalid@@example.org>", 502).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<invalid@@example.org>", 502).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn helo_requires_a_name() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO", 502).await;
    c.cmd("EHLO", 502).await;
}

#[tokio::test]
async fn connection_checker_denies_before_banner() {
    struct DenyAll;
    #[async_trait]
    impl smtpd::Policy for DenyAll {
        async fn check_connection(&self, _peer: &Peer) -> Result<(), Error> {
            Err(Error::ip_denied())
        }
        async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), Error> {
            unreachable!("no connection should get this far")
        }
    }

    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), Arc::new(DenyAll))).await;

    let mut c = Client::new(TcpStream::connect(addr).await.unwrap());
    c.expect(421).await;
    // ... and the server hangs up
    let mut rest = vec![];
    c.into_inner().read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn policy_rejections_surface_verbatim() {
    struct Picky;
    #[async_trait]
    impl smtpd::Policy for Picky {
        async fn check_helo(&self, _peer: &Peer, name: &str) -> Result<(), Error> {
            if name == "denied.host" {
                return Err(Error::new(421, "Denied"));
            }
            Ok(())
        }
        async fn check_sender(&self, _peer: &Peer, addr: &str) -> Result<(), Error> {
            if addr == "denied@example.com" {
                return Err(Error::sender_denied());
            }
            Ok(())
        }
        async fn check_recipient(&self, _peer: &Peer, addr: &str) -> Result<(), Error> {
            if addr == "denied@example.com" {
                return Err(Error::recipient_denied());
            }
            Ok(())
        }
        async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), Error> {
            Err(Error::new(554, "Rejected by handler"))
        }
    }

    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), Arc::new(Picky))).await;

    let mut c = connect(addr).await;
    c.cmd("HELO denied.host", 421).await;
    c.cmd("HELO localhost", 250).await;

    c.cmd("MAIL FROM:<denied@example.com>", 451).await;
    c.cmd("MAIL FROM:<ok@example.com>", 250).await;
    c.cmd("RCPT TO:<denied@example.com>", 451).await;
    c.cmd("RCPT TO:<ok@example.com>", 250).await;

    c.cmd("DATA", 354).await;
    c.send("body").await;
    let (code, lines) = {
        c.send(".").await;
        c.read_reply().await
    };
    assert_eq!(code, 554);
    assert_eq!(lines[0], "Rejected by handler");

    // The rejection doesn't poison the session
    c.cmd("MAIL FROM:<ok@example.com>", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn max_message_size_yields_552_and_session_survives() {
    let (policy, mut sink) = sink_policy();
    let config = ServerConfig {
        max_message_size: 5,
        ..test_config()
    };
    let (addr, _server, _handle) = spawn_server(Server::new(config, policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("This is the email body").await;
    c.send(".").await;
    let (code, lines) = c.read_reply().await;
    assert_eq!(code, 552);
    assert!(lines[0].contains("maximum size"));

    assert!(sink.try_recv().is_err(), "oversize message was delivered");

    c.cmd("NOOP", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn message_at_exactly_the_limit_is_accepted() {
    let (policy, mut sink) = sink_policy();
    let config = ServerConfig {
        // "12345" + CRLF
        max_message_size: 7,
        ..test_config()
    };
    let (addr, _server, _handle) = spawn_server(Server::new(config, policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("12345").await;
    c.cmd(".", 250).await;

    let (_, envelope) = sink.recv().await.unwrap();
    assert_eq!(envelope.data, b"12345\r\n");
}

#[tokio::test]
async fn interrupted_data_is_not_delivered() {
    let (policy, mut sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("This is the email body").await;
    drop(c);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(sink.try_recv().is_err(), "truncated message was delivered");
}

#[tokio::test]
async fn over_long_line_gets_500_and_session_survives() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    let long = format!("MAIL FROM:<{}@example.org>", "x".repeat(65 * 1024));
    c.cmd(&long, 500).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn max_connections_cap() {
    let (policy, _sink) = sink_policy();
    let config = ServerConfig {
        max_connections: Some(1),
        ..test_config()
    };
    let (addr, _server, _handle) = spawn_server(Server::new(config, policy)).await;

    let _c1 = connect(addr).await;
    let mut c2 = Client::new(TcpStream::connect(addr).await.unwrap());
    c2.expect(421).await;
}

#[tokio::test]
async fn unlimited_connections() {
    let (policy, _sink) = sink_policy();
    let config = ServerConfig {
        max_connections: None,
        ..test_config()
    };
    let (addr, _server, _handle) = spawn_server(Server::new(config, policy)).await;

    let _c1 = connect(addr).await;
    let _c2 = connect(addr).await;
}

#[tokio::test]
async fn max_recipients() {
    let (policy, _sink) = sink_policy();
    let config = ServerConfig {
        max_recipients: 1,
        ..test_config()
    };
    let (addr, _server, _handle) = spawn_server(Server::new(config, policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("RCPT TO:<recipient2@example.net>", 452).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn xclient_rewrites_the_peer() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    struct XclientPolicy {
        tx: mpsc::UnboundedSender<Peer>,
    }
    #[async_trait]
    impl smtpd::Policy for XclientPolicy {
        async fn check_sender(&self, peer: &Peer, _addr: &str) -> Result<(), Error> {
            self.tx.send(peer.clone()).unwrap();
            Ok(())
        }
        async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
    }

    let config = ServerConfig {
        enable_xclient: true,
        ..test_config()
    };
    let (addr, _server, _handle) =
        spawn_server(Server::new(config, Arc::new(XclientPolicy { tx }))).await;

    let mut c = connect(addr).await;
    let ehlo = c.cmd("EHLO localhost", 250).await;
    assert!(ehlo.iter().any(|l| l == "XCLIENT"));

    // The rewrite re-issues the banner
    c.cmd(
        "XCLIENT NAME=ignored ADDR=42.42.42.42 PORT=4242 PROTO=SMTP HELO=new.example.net LOGIN=newusername",
        220,
    )
    .await;

    c.cmd("MAIL FROM:<sender@example.org>", 250).await;

    let peer = rx.recv().await.unwrap();
    assert_eq!(peer.helo_name, "new.example.net");
    assert_eq!(peer.addr.to_string(), "42.42.42.42:4242");
    assert_eq!(peer.username, "newusername");
    assert_eq!(peer.protocol, Protocol::Smtp);
}

#[tokio::test]
async fn xclient_requires_the_flag() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("XCLIENT ADDR=42.42.42.42", 502).await;
}

#[tokio::test]
async fn proxy_rewrites_the_source_address() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    struct ProxyPolicy {
        tx: mpsc::UnboundedSender<Peer>,
    }
    #[async_trait]
    impl smtpd::Policy for ProxyPolicy {
        async fn check_helo(&self, peer: &Peer, _name: &str) -> Result<(), Error> {
            self.tx.send(peer.clone()).unwrap();
            Ok(())
        }
        async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
    }

    let config = ServerConfig {
        enable_proxy: true,
        ..test_config()
    };
    let (addr, _server, _handle) =
        spawn_server(Server::new(config, Arc::new(ProxyPolicy { tx }))).await;

    let mut c = connect(addr).await;
    c.cmd("PROXY TCP4 198.51.100.22 203.0.113.7 35646 25", 220)
        .await;
    c.cmd("HELO localhost", 250).await;

    let peer = rx.recv().await.unwrap();
    assert_eq!(peer.addr.to_string(), "198.51.100.22:35646");
}

#[tokio::test]
async fn received_line_records_the_peer() {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

    struct ReceivedPolicy {
        tx: mpsc::UnboundedSender<Vec<u8>>,
    }
    #[async_trait]
    impl smtpd::Policy for ReceivedPolicy {
        async fn deliver(&self, peer: &Peer, mut envelope: Envelope) -> Result<(), Error> {
            envelope.add_received_line(peer, "foobar.example.net");
            self.tx.send(envelope.data).unwrap();
            Ok(())
        }
    }

    let (addr, _server, _handle) =
        spawn_server(Server::new(test_config(), Arc::new(ReceivedPolicy { tx }))).await;

    let mut c = connect(addr).await;
    c.cmd("EHLO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("This is the email body").await;
    c.cmd(".", 250).await;

    let data = rx.recv().await.unwrap();
    let text = String::from_utf8(data).unwrap();
    assert!(
        text.starts_with("Received: from localhost ([127.0.0.1]) by foobar.example.net with ESMTP;"),
        "wrong received line: {text}"
    );
}

struct AcceptAuth;
#[async_trait]
impl Authenticator for AcceptAuth {
    async fn authenticate(
        &self,
        _peer: &Peer,
        _username: &str,
        _password: &str,
    ) -> Result<(), Error> {
        Ok(())
    }
}

struct RejectAuth;
#[async_trait]
impl Authenticator for RejectAuth {
    async fn authenticate(
        &self,
        _peer: &Peer,
        _username: &str,
        _password: &str,
    ) -> Result<(), Error> {
        Err(Error::auth_invalid())
    }
}

fn tls_server(authenticator: Option<Arc<dyn Authenticator>>, force_tls: bool) -> Server {
    let (policy, _sink) = sink_policy();
    let config = ServerConfig {
        tls: Some(tls_support::server_tls_config()),
        force_tls,
        ..test_config()
    };
    let server = Server::new(config, policy);
    match authenticator {
        Some(authenticator) => server.with_authenticator(authenticator),
        None => server,
    }
}

#[tokio::test]
async fn starttls_and_auth_flow() {
    let (addr, _server, _handle) =
        spawn_server(tls_server(Some(Arc::new(AcceptAuth)), true)).await;

    let mut c = connect(addr).await;
    let ehlo = c.cmd("EHLO localhost", 250).await;
    assert!(ehlo.iter().any(|l| l == "STARTTLS"));
    assert!(
        !ehlo.iter().any(|l| l.starts_with("AUTH")),
        "AUTH advertised before TLS"
    );

    // Pre-TLS constraints
    c.cmd("AUTH PLAIN Zm9vAGZvbwBmb28=", 530).await;
    c.cmd("MAIL FROM:<sender@example.org>", 530).await;

    c.cmd("STARTTLS", 220).await;
    let tls = tls_support::client_handshake(c.into_inner()).await;
    let mut c = Client::new(tls);

    // Post-upgrade the session restarts at EHLO
    c.cmd("MAIL FROM:<sender@example.org>", 502).await;
    let ehlo = c.cmd("EHLO localhost", 250).await;
    assert!(ehlo.iter().any(|l| l == "AUTH PLAIN LOGIN"));
    assert!(
        !ehlo.iter().any(|l| l == "STARTTLS"),
        "STARTTLS advertised twice"
    );

    c.cmd("STARTTLS", 502).await;

    // AUTH is still required for MAIL
    c.cmd("MAIL FROM:<sender@example.org>", 530).await;

    // foo\0foo\0foo
    c.cmd("AUTH PLAIN Zm9vAGZvbwBmb28=", 235).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    c.cmd("RCPT TO:<recipient@example.net>", 250).await;
    c.cmd("DATA", 354).await;
    c.send("This is the email body").await;
    c.cmd(".", 250).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn auth_login_challenge_flow() {
    let (addr, _server, _handle) =
        spawn_server(tls_server(Some(Arc::new(AcceptAuth)), false)).await;

    let mut c = connect(addr).await;
    c.cmd("EHLO localhost", 250).await;
    c.cmd("STARTTLS", 220).await;
    let tls = tls_support::client_handshake(c.into_inner()).await;
    let mut c = Client::new(tls);
    c.cmd("EHLO localhost", 250).await;

    // A bogus base64 username aborts the exchange
    let prompt = c.cmd("AUTH LOGIN", 334).await;
    assert_eq!(prompt[0], "VXNlcm5hbWU6");
    c.cmd("not base64!", 502).await;

    // Password prompt follows a valid username
    c.cmd("AUTH LOGIN", 334).await;
    let prompt = c.cmd("Zm9v", 334).await;
    assert_eq!(prompt[0], "UGFzc3dvcmQ6");
    c.cmd("not base64!", 502).await;

    // And the full exchange succeeds
    c.cmd("AUTH LOGIN", 334).await;
    c.cmd("Zm9v", 334).await;
    c.cmd("Zm9v", 235).await;

    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn auth_plain_variants_and_rejection() {
    let (addr, _server, _handle) =
        spawn_server(tls_server(Some(Arc::new(RejectAuth)), false)).await;

    let mut c = connect(addr).await;
    // AUTH before HELO
    c.cmd("AUTH PLAIN Zm9vAGJhcgBxdXV4", 502).await;
    c.cmd("EHLO localhost", 250).await;
    c.cmd("STARTTLS", 220).await;
    let tls = tls_support::client_handshake(c.into_inner()).await;
    let mut c = Client::new(tls);
    c.cmd("EHLO localhost", 250).await;

    c.cmd("AUTH UNKNOWN", 502).await;
    // Undecodable payload
    c.cmd("AUTH PLAIN foobar", 502).await;
    // Wrong number of NUL-separated parts (foo\0bar)
    c.cmd("AUTH PLAIN Zm9vAGJhcg==", 502).await;
    // Well-formed credentials, rejected by the authenticator
    c.cmd("AUTH PLAIN Zm9vAGJhcgBxdXV4", 535).await;
    // Continuation form
    c.cmd("AUTH PLAIN", 334).await;
    c.cmd("Zm9vAGJhcgBxdXV4", 535).await;
}

#[tokio::test]
async fn auth_without_authenticator_is_unsupported() {
    let (addr, _server, _handle) = spawn_server(tls_server(None, false)).await;

    let mut c = connect(addr).await;
    c.cmd("EHLO localhost", 250).await;
    c.cmd("STARTTLS", 220).await;
    let tls = tls_support::client_handshake(c.into_inner()).await;
    let mut c = Client::new(tls);
    c.cmd("EHLO localhost", 250).await;
    c.cmd("AUTH PLAIN Zm9vAGJhcgBxdXV4", 502).await;
}

#[tokio::test]
async fn starttls_without_tls_config_is_rejected() {
    let (policy, _sink) = sink_policy();
    let (addr, _server, _handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("EHLO localhost", 250).await;
    c.cmd("STARTTLS", 502).await;
}

#[tokio::test]
async fn username_survives_rset_but_not_starttls() {
    let (tx, mut rx) = mpsc::unbounded_channel();

    struct UserPolicy {
        tx: mpsc::UnboundedSender<String>,
    }
    #[async_trait]
    impl smtpd::Policy for UserPolicy {
        async fn check_sender(&self, peer: &Peer, _addr: &str) -> Result<(), Error> {
            self.tx.send(peer.username.clone()).unwrap();
            Ok(())
        }
        async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
    }

    let config = ServerConfig {
        tls: Some(tls_support::server_tls_config()),
        ..test_config()
    };
    let server =
        Server::new(config, Arc::new(UserPolicy { tx })).with_authenticator(Arc::new(AcceptAuth));
    let (addr, _server, _handle) = spawn_server(server).await;

    let mut c = connect(addr).await;
    c.cmd("EHLO localhost", 250).await;
    c.cmd("STARTTLS", 220).await;
    let tls = tls_support::client_handshake(c.into_inner()).await;
    let mut c = Client::new(tls);
    c.cmd("EHLO localhost", 250).await;
    c.cmd("AUTH PLAIN Zm9vAGZvbwBmb28=", 235).await;

    c.cmd("RSET", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    assert_eq!(rx.recv().await.unwrap(), "foo");

    // A duplicate EHLO also preserves the username
    c.cmd("EHLO localhost", 250).await;
    c.cmd("MAIL FROM:<sender@example.org>", 250).await;
    assert_eq!(rx.recv().await.unwrap(), "foo");
}

#[tokio::test]
async fn tls_listener_speaks_tls_from_the_first_byte() {
    let (policy, _sink) = sink_policy();
    let config = ServerConfig {
        tls: Some(tls_support::server_tls_config()),
        ..test_config()
    };
    let server = Arc::new(Server::new(config, policy).with_authenticator(Arc::new(AcceptAuth)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = Arc::clone(&server);
    tokio::spawn(async move { serving.serve_tls(listener).await });

    let socket = TcpStream::connect(addr).await.unwrap();
    let tls = tls_support::client_handshake(socket).await;
    let mut c = Client::new(tls);
    c.expect(220).await;
    c.cmd("EHLO localhost", 250).await;
    // Already TLS: AUTH available, STARTTLS not
    c.cmd("STARTTLS", 502).await;
    c.cmd("AUTH PLAIN Zm9vAGZvbwBmb28=", 235).await;
    c.cmd("QUIT", 221).await;
}

#[tokio::test]
async fn shutdown_drains_sessions() {
    let (policy, _sink) = sink_policy();
    let (addr, server, handle) = spawn_server(Server::new(test_config(), policy)).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;

    server.shutdown();

    // Serve returns the sentinel and the listener is gone
    let served = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(served, Err(ServerError::Closed)));
    assert!(TcpStream::connect(addr).await.is_err(), "listener still accepting");

    // wait() blocks while the session is open
    let waiting = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!waiting.is_finished(), "wait() returned with a live session");

    // The in-flight session still works, then closes
    c.cmd("NOOP", 250).await;
    c.cmd("QUIT", 221).await;
    drop(c);

    tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn serve_fails_after_shutdown() {
    let (policy, _sink) = sink_policy();
    let server = Arc::new(Server::new(test_config(), policy));
    server.shutdown();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    assert!(matches!(
        server.serve(listener).await,
        Err(ServerError::Closed)
    ));
}

#[tokio::test]
async fn wait_fails_if_not_shut_down() {
    let (policy, _sink) = sink_policy();
    let server = Arc::new(Server::new(test_config(), policy));
    assert!(matches!(server.wait().await, Err(ServerError::NotShutdown)));
}

#[tokio::test]
async fn connection_deadline_tears_down_without_a_reply() {
    struct Bounded;
    #[async_trait]
    impl smtpd::Policy for Bounded {
        fn connection_deadline(&self, _peer: &Peer) -> Option<Duration> {
            Some(Duration::from_millis(200))
        }
        async fn deliver(&self, _peer: &Peer, _envelope: Envelope) -> Result<(), Error> {
            Ok(())
        }
    }

    let (addr, server, _handle) = spawn_server(Server::new(test_config(), Arc::new(Bounded))).await;

    let mut c = connect(addr).await;
    c.cmd("HELO localhost", 250).await;

    // The connection dies, the server does not
    let mut rest = vec![];
    c.into_inner().read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
    assert!(!server.is_shutting_down());
    let mut again = connect(addr).await;
    again.cmd("QUIT", 221).await;
}
