use smtpd::HeaderMap;

/// W3C trace context carried in a message's `Traceparent` header:
/// `00-<trace-id>-<parent-id>-<flags>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: String,
    pub parent_id: String,
    pub sampled: bool,
}

/// Pull the propagated trace context out of the message header, if the
/// submitter included a valid one.
pub fn extract(header: &HeaderMap) -> Option<TraceContext> {
    parse_traceparent(header.get("Traceparent")?)
}

fn parse_traceparent(value: &str) -> Option<TraceContext> {
    let mut fields = value.trim().split('-');

    let version = fields.next()?;
    if version.len() != 2 || !is_lower_hex(version) || version == "ff" {
        return None;
    }

    let trace_id = fields.next()?;
    if trace_id.len() != 32 || !is_lower_hex(trace_id) || trace_id.bytes().all(|b| b == b'0') {
        return None;
    }

    let parent_id = fields.next()?;
    if parent_id.len() != 16 || !is_lower_hex(parent_id) || parent_id.bytes().all(|b| b == b'0') {
        return None;
    }

    let flags = fields.next()?;
    if flags.len() != 2 || !is_lower_hex(flags) {
        return None;
    }

    let sampled = u8::from_str_radix(flags, 16).ok()? & 0x01 == 0x01;

    Some(TraceContext {
        trace_id: trace_id.to_string(),
        parent_id: parent_id.to_string(),
        sampled,
    })
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}
