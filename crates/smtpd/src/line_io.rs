use crate::conn::SessionStream;
use crate::envelope::TlsInfo;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;

/// Hard limit for a single command line, per RFC 5321 §4.5.3.1.6 with
/// slack for AUTH payloads.
pub(crate) const MAX_LINE_LENGTH: usize = 4096;

const READ_CHUNK: usize = 4096;

/// One command line from the peer.
pub(crate) enum Line {
    Text(String),
    /// The line exceeded [`MAX_LINE_LENGTH`]. Its bytes have been
    /// drained through the terminating newline, so the session can
    /// reply with a 500 and keep going.
    TooLong,
}

/// Outcome of the DATA phase dot-reader.
pub(crate) enum DotData {
    /// Decoded message, dot-unstuffed, CRLF line endings, terminator
    /// consumed but not included.
    Complete(Vec<u8>),
    /// The decoded message would exceed the size cap. The rest of the
    /// dot-encoded stream has been drained and discarded.
    TooBig,
}

/// Buffered line-oriented reader/writer over the session stream.
/// Every read and write is bounded by the deadline its caller supplies.
pub(crate) struct LineIo {
    stream: SessionStream,
    buffer: Vec<u8>,
}

impl LineIo {
    pub fn new(stream: SessionStream) -> Self {
        Self {
            stream,
            buffer: Vec::with_capacity(READ_CHUNK),
        }
    }

    pub fn is_tls(&self) -> bool {
        self.stream.is_tls()
    }

    pub fn tls_info(&self) -> Option<TlsInfo> {
        self.stream.tls_info()
    }

    /// Hand the stream to the TLS acceptor and rebind. Any plaintext
    /// bytes the client pipelined ahead of the handshake are discarded.
    pub async fn upgrade_tls(
        &mut self,
        acceptor: TlsAcceptor,
        timeout: Duration,
    ) -> io::Result<()> {
        self.buffer.clear();
        tokio::time::timeout(timeout, self.stream.upgrade(acceptor))
            .await
            .map_err(|_| timed_out("TLS handshake"))?
    }

    pub async fn read_line(&mut self, timeout: Duration) -> io::Result<Line> {
        let deadline = Instant::now() + timeout;
        let mut too_long = false;

        loop {
            if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
                if too_long {
                    self.buffer.drain(..=pos);
                    return Ok(Line::TooLong);
                }

                let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Line::Text(String::from_utf8_lossy(&line).into_owned()));
            }

            if self.buffer.len() > MAX_LINE_LENGTH {
                self.buffer.clear();
                too_long = true;
            }

            self.fill(deadline).await?;
        }
    }

    /// Read the DATA payload: strip dot-stuffing, stop at
    /// `<CRLF>.<CRLF>`, and give up once the decoded size passes
    /// `max_size` (while still draining the stream to the terminator).
    pub async fn read_data(&mut self, max_size: usize, timeout: Duration) -> io::Result<DotData> {
        let deadline = Instant::now() + timeout;
        let mut data: Vec<u8> = Vec::new();
        let mut line: Vec<u8> = Vec::new();
        let mut line_overflowed = false;
        let mut too_big = false;

        loop {
            if self.buffer.is_empty() {
                self.fill(deadline).await?;
            }

            let pending = std::mem::take(&mut self.buffer);

            for (i, &b) in pending.iter().enumerate() {
                if b != b'\n' {
                    // Bound the line accumulator: a single line past the
                    // cap can never be part of an acceptable message,
                    // nor can it be the terminator.
                    if line.len() > max_size + 2 {
                        line_overflowed = true;
                        too_big = true;
                        data.clear();
                        line.clear();
                    }
                    line.push(b);
                    continue;
                }

                if line.last() == Some(&b'\r') {
                    line.pop();
                }

                if !line_overflowed && line == b"." {
                    self.buffer = pending[i + 1..].to_vec();
                    return Ok(if too_big {
                        DotData::TooBig
                    } else {
                        DotData::Complete(data)
                    });
                }
                line_overflowed = false;

                if !too_big {
                    let unstuffed: &[u8] = if line.first() == Some(&b'.') {
                        &line[1..]
                    } else {
                        &line
                    };
                    if data.len() + unstuffed.len() + 2 > max_size {
                        too_big = true;
                        data.clear();
                    } else {
                        data.extend_from_slice(unstuffed);
                        data.extend_from_slice(b"\r\n");
                    }
                }
                line.clear();
            }
        }
    }

    /// Write one reply, using `code-` continuation framing for every
    /// line of a multi-line message except the last.
    pub async fn write_reply(
        &mut self,
        code: u16,
        message: &str,
        timeout: Duration,
    ) -> io::Result<()> {
        let mut text = String::new();
        let mut lines = message.lines().peekable();
        while let Some(line) = lines.next() {
            let sep = if lines.peek().is_none() { ' ' } else { '-' };
            text.push_str(&format!("{code}{sep}{line}\r\n"));
        }

        let deadline = Instant::now() + timeout;
        tokio::time::timeout_at(deadline, self.stream.write_all(text.as_bytes()))
            .await
            .map_err(|_| timed_out("write"))??;
        tokio::time::timeout_at(deadline, self.stream.flush())
            .await
            .map_err(|_| timed_out("flush"))?
    }

    async fn fill(&mut self, deadline: Instant) -> io::Result<()> {
        let mut chunk = [0u8; READ_CHUNK];
        let size = tokio::time::timeout_at(deadline, self.stream.read(&mut chunk))
            .await
            .map_err(|_| timed_out("read"))??;
        if size == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed by peer",
            ));
        }
        self.buffer.extend_from_slice(&chunk[..size]);
        Ok(())
    }
}

fn timed_out(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out"))
}
