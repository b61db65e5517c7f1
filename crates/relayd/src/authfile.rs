use anyhow::Context;
use std::path::{Path, PathBuf};

/// One record from the credentials file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthUser {
    pub username: String,
    pub password_hash: String,
    /// When present, restricts which MAIL FROM addresses this user may
    /// claim. Absent means any address is fine.
    pub allowed_addresses: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("user not found")]
    NotFound,
    #[error("password invalid")]
    InvalidPassword,
    #[error("reading credentials file: {0}")]
    Io(#[from] std::io::Error),
}

/// Credentials file access. The file is re-read on every lookup so
/// that edits take effect without a restart; records are
/// `username bcrypt_hash [addr1,addr2,...]`, whitespace separated.
#[derive(Debug, Clone)]
pub struct AuthFile {
    path: PathBuf,
}

impl AuthFile {
    /// Verify the file is readable now so that a bad path fails
    /// startup rather than the first AUTH.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        std::fs::File::open(path)
            .with_context(|| format!("cannot open credentials file {}", path.display()))?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub async fn fetch(&self, username: &str) -> Result<AuthUser, AuthError> {
        let contents = tokio::fs::read_to_string(&self.path).await?;

        for line in contents.lines() {
            let user = match parse_line(line) {
                Some(user) => user,
                None => continue,
            };
            if user.username.eq_ignore_ascii_case(username) {
                return Ok(user);
            }
        }

        Err(AuthError::NotFound)
    }

    pub async fn check_password(&self, username: &str, secret: &str) -> Result<(), AuthError> {
        let user = self.fetch(username).await?;
        let secret = secret.to_string();

        // bcrypt is intentionally slow; keep it off the async workers
        let verified = tokio::task::spawn_blocking(move || {
            bcrypt::verify(secret.as_bytes(), &user.password_hash)
        })
        .await
        .map_err(|err| std::io::Error::other(err))?;

        match verified {
            Ok(true) => Ok(()),
            _ => Err(AuthError::InvalidPassword),
        }
    }
}

fn parse_line(line: &str) -> Option<AuthUser> {
    let parts: Vec<&str> = line.split_whitespace().collect();

    if parts.len() < 2 || parts.len() > 3 {
        return None;
    }

    let allowed_addresses = parts.get(2).map(|addrs| {
        addrs
            .split(',')
            .filter(|addr| !addr.is_empty())
            .map(str::to_string)
            .collect()
    });

    Some(AuthUser {
        username: parts[0].to_string(),
        password_hash: parts[1].to_string(),
        allowed_addresses,
    })
}
