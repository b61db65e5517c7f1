use crate::ClientError;

/// SASL credentials for the smarthost.
#[derive(Debug, Clone)]
pub enum Auth {
    /// RFC 4616 single-shot mechanism.
    Plain { username: String, password: String },
    /// Two-step username/password exchange.
    Login { username: String, password: String },
    /// OAuth2 bearer token, as implemented by gmail and outlook.
    XOauth2 { username: String, token: String },
}

impl Auth {
    pub(crate) fn mechanism(&self) -> &'static str {
        match self {
            Self::Plain { .. } => "PLAIN",
            Self::Login { .. } => "LOGIN",
            Self::XOauth2 { .. } => "XOAUTH2",
        }
    }

    /// The SASL initial response, sent base64-encoded on the AUTH line
    /// itself. LOGIN has none; the server drives it with challenges.
    pub(crate) fn initial_response(&self) -> Option<Vec<u8>> {
        match self {
            Self::Plain { username, password } => {
                // [authzid] NUL authcid NUL passwd
                Some(format!("\x00{username}\x00{password}").into_bytes())
            }
            Self::Login { .. } => None,
            Self::XOauth2 { username, token } => {
                Some(format!("user={username}\x01auth=Bearer {token}\x01\x01").into_bytes())
            }
        }
    }

    /// Answer the server's nth 334 continuation (1-based).
    pub(crate) fn respond(&self, step: usize) -> Result<Vec<u8>, ClientError> {
        match self {
            Self::Login { username, password } => match step {
                1 => Ok(username.clone().into_bytes()),
                2 => Ok(password.clone().into_bytes()),
                _ => Err(ClientError::UnexpectedChallenge),
            },
            // PLAIN and XOAUTH2 are complete after the initial
            // response; any continuation means something is wrong.
            Self::Plain { .. } | Self::XOauth2 { .. } => Err(ClientError::UnexpectedChallenge),
        }
    }
}
