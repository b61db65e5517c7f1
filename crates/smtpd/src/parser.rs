use crate::errors::Error;

/// A tokenized command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Command {
    /// Upper-cased first token; empty for a blank line.
    pub verb: String,
    pub fields: Vec<String>,
    /// When the second field carries a `KEYWORD:value` argument, the
    /// keyword and value split on the first `:`.
    pub params: Vec<String>,
}

pub(crate) fn parse_command(line: &str) -> Command {
    let mut fields: Vec<String> = line.split_whitespace().map(str::to_string).collect();

    let verb = fields
        .first()
        .map(|f| f.to_ascii_uppercase())
        .unwrap_or_default();

    // Account for clients that break the standard with an extra
    // whitespace after the ':', eg:
    //
    //   MAIL FROM: <test@example.org>
    //
    // instead of:
    //
    //   MAIL FROM:<test@example.org>
    //
    // When the second field ends with ':' the third is folded into it.
    if fields.len() > 2 && fields[1].ends_with(':') {
        let tail = fields.remove(2);
        fields[1].push_str(&tail);
    }

    let params = match fields.get(1) {
        Some(arg) if arg.contains(':') => {
            let (keyword, value) = arg.split_once(':').expect("checked contains above");
            vec![keyword.to_string(), value.to_string()]
        }
        _ => vec![],
    };

    Command {
        verb,
        fields,
        params,
    }
}

/// Extract the mailbox from an (optionally angle-bracketed) path.
pub(crate) fn parse_address(src: &str) -> Result<String, Error> {
    let addr = if src.starts_with('<') && src.ends_with('>') {
        &src[1..src.len() - 1]
    } else {
        src
    };

    if src.is_empty() || addr.matches('@').count() > 1 {
        return Err(Error::malformed_email());
    }

    Ok(addr.to_string())
}
