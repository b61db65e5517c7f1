/// An SMTP-shaped error: a reply code plus a single line of text.
/// Policy implementations return these to reject a peer, a sender, a
/// recipient or a message; the session writes them to the client verbatim.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code} {message}")]
pub struct Error {
    pub code: u16,
    pub message: String,
}

impl Error {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn busy() -> Self {
        Self::new(421, "Too busy. Try again later.")
    }

    pub fn ip_denied() -> Self {
        Self::new(421, "Denied - IP out of allowed network range")
    }

    pub fn rate_limit_exceeded() -> Self {
        Self::new(421, "Rate limit exceeded. Try again later.")
    }

    pub fn recipient_denied() -> Self {
        Self::new(451, "Denied recipient address")
    }

    pub fn recipient_invalid() -> Self {
        Self::new(451, "Invalid recipient address")
    }

    pub fn sender_denied() -> Self {
        Self::new(451, "sender address not allowed")
    }

    pub fn too_many_recipients() -> Self {
        Self::new(452, "Too many recipients")
    }

    pub fn line_too_long() -> Self {
        Self::new(500, "Line too long")
    }

    pub fn duplicate_mail() -> Self {
        Self::new(502, "Duplicate MAIL")
    }

    pub fn duplicate_starttls() -> Self {
        Self::new(502, "Already running in TLS")
    }

    pub fn invalid_syntax() -> Self {
        Self::new(502, "Invalid syntax.")
    }

    pub fn malformed_auth() -> Self {
        Self::new(502, "Couldn't decode your credentials")
    }

    pub fn malformed_command() -> Self {
        Self::new(502, "Couldn't decode the command")
    }

    pub fn malformed_email() -> Self {
        Self::new(502, "Malformed email address")
    }

    pub fn missing_param() -> Self {
        Self::new(502, "Missing parameter")
    }

    pub fn no_helo() -> Self {
        Self::new(502, "Please introduce yourself first.")
    }

    pub fn no_mail() -> Self {
        Self::new(502, "Missing MAIL FROM command.")
    }

    pub fn no_rcpt() -> Self {
        Self::new(502, "Missing RCPT TO command.")
    }

    pub fn tls_not_supported() -> Self {
        Self::new(502, "TLS not supported")
    }

    pub fn unknown_auth_mechanism() -> Self {
        Self::new(502, "Unknown authentication mechanism")
    }

    pub fn unsupported_command() -> Self {
        Self::new(502, "Unsupported command")
    }

    pub fn starttls_required() -> Self {
        Self::new(530, "Please turn on TLS by issuing a STARTTLS command.")
    }

    pub fn auth_required() -> Self {
        Self::new(530, "Authentication required.")
    }

    pub fn auth_method_not_supported() -> Self {
        Self::new(530, "Authentication method not supported")
    }

    pub fn auth_invalid() -> Self {
        Self::new(535, "Authentication credentials invalid")
    }

    pub fn handshake_failed() -> Self {
        Self::new(550, "Handshake error")
    }

    pub fn too_big(max_message_size: usize) -> Self {
        Self::new(
            552,
            format!("Message exceeded maximum size (max {max_message_size} bytes)"),
        )
    }

    pub fn forwarding_failed(message_id: &str) -> Self {
        Self::new(554, format!("Forwarding failed for message ID {message_id}"))
    }
}
