//! A deliberately small ESMTP client: enough to hand a message to a
//! fixed smarthost. Speaks EHLO, STARTTLS, AUTH (PLAIN, LOGIN,
//! XOAUTH2) and the MAIL/RCPT/DATA transaction.
use std::time::Duration;
use thiserror::Error;

mod auth;
mod client;

pub use auth::Auth;
pub use client::{send_mail, SmtpClient};

pub const MAX_LINE_LEN: usize = 4096;

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Malformed Response: {0}")]
    MalformedResponseLine(String),
    #[error("Response line is too long")]
    ResponseTooLong,
    #[error("Not connected")]
    NotConnected,
    #[error("Command rejected {0:?}")]
    Rejected(Response),
    #[error("STARTTLS: {0} is not a valid DNS name")]
    InvalidDnsName(String),
    #[error("Timed out waiting for {0}")]
    TimedOut(&'static str),
    #[error("unexpected challenge from server")]
    UnexpectedChallenge,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A complete (possibly multi-line) server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: u16,
    /// Reply text; lines of a multi-line reply are joined with `\n`.
    pub content: String,
}

impl Response {
    /// The first line of the reply text, which is what belongs in a
    /// one-line reply relayed to someone else.
    pub fn summary(&self) -> &str {
        self.content.lines().next().unwrap_or("")
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SmtpClientTimeouts {
    pub connect_timeout: Duration,
    /// Applies to each command/response exchange.
    pub command_timeout: Duration,
    /// Applies to streaming the message payload.
    pub data_timeout: Duration,
    pub starttls_timeout: Duration,
}

impl Default for SmtpClientTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            command_timeout: Duration::from_secs(60),
            data_timeout: Duration::from_secs(5 * 60),
            starttls_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponseLine<'a> {
    pub code: u16,
    pub is_final: bool,
    pub content: &'a str,
}

pub(crate) fn parse_response_line(line: &str) -> Result<ResponseLine, ClientError> {
    if line.len() < 4 {
        return Err(ClientError::MalformedResponseLine(line.to_string()));
    }

    match line.as_bytes()[3] {
        b' ' | b'-' => match line[0..3].parse::<u16>() {
            Ok(code) => Ok(ResponseLine {
                code,
                is_final: line.as_bytes()[3] == b' ',
                content: &line[4..],
            }),
            Err(_) => Err(ClientError::MalformedResponseLine(line.to_string())),
        },
        _ => Err(ClientError::MalformedResponseLine(line.to_string())),
    }
}
