//! Telnet IAC stripping for QEMU serial chardevs.
//!
//! QEMU serial sockets opened in telnet mode interleave IAC command
//! sequences with the guest byte stream. `TelnetFilter` wraps a reader
//! and yields only data bytes: negotiation triples, subnegotiations,
//! and bare commands are dropped; an escaped `IAC IAC` yields one
//! literal 0xFF.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

const IAC: u8 = 255;
const SB: u8 = 250;
const SE: u8 = 240;
const WILL: u8 = 251;
const DONT: u8 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterState {
    Data,
    Iac,
    Option,
    Sub,
    SubIac,
}

impl FilterState {
    /// Feeds one raw byte; returns the data byte to emit, if any.
    fn feed(&mut self, byte: u8) -> Option<u8> {
        match *self {
            FilterState::Data => {
                if byte == IAC {
                    *self = FilterState::Iac;
                    None
                } else {
                    Some(byte)
                }
            }
            FilterState::Iac => match byte {
                IAC => {
                    *self = FilterState::Data;
                    Some(IAC)
                }
                SB => {
                    *self = FilterState::Sub;
                    None
                }
                b if (WILL..=DONT).contains(&b) => {
                    *self = FilterState::Option;
                    None
                }
                _ => {
                    *self = FilterState::Data;
                    None
                }
            },
            FilterState::Option => {
                *self = FilterState::Data;
                None
            }
            FilterState::Sub => {
                if byte == IAC {
                    *self = FilterState::SubIac;
                }
                None
            }
            FilterState::SubIac => {
                *self = if byte == SE {
                    FilterState::Data
                } else {
                    FilterState::Sub
                };
                None
            }
        }
    }
}

/// Reader adapter stripping telnet IAC sequences from a byte stream.
pub struct TelnetFilter<R> {
    inner: R,
    state: FilterState,
}

impl<R> TelnetFilter<R> {
    /// Wraps a raw reader.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: FilterState::Data,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TelnetFilter<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            let mut raw = [0u8; 256];
            let want = raw.len().min(buf.remaining());
            let mut inner_buf = ReadBuf::new(&mut raw[..want]);
            match Pin::new(&mut me.inner).poll_read(cx, &mut inner_buf) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Err(e)) => return Poll::Ready(Err(e)),
                Poll::Ready(Ok(())) => {
                    let filled = inner_buf.filled();
                    if filled.is_empty() {
                        return Poll::Ready(Ok(()));
                    }
                    let mut emitted = false;
                    for &byte in filled {
                        if let Some(data) = me.state.feed(byte) {
                            buf.put_slice(&[data]);
                            emitted = true;
                        }
                    }
                    if emitted {
                        return Poll::Ready(Ok(()));
                    }
                    // Whole chunk was negotiation; read more.
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn filter_all(input: &[u8]) -> Vec<u8> {
        let mut filter = TelnetFilter::new(input);
        let mut out = Vec::new();
        filter.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn identity_without_iac() {
        let input: Vec<u8> = (0u8..=254).collect();
        assert_eq!(filter_all(&input).await, input);
    }

    #[tokio::test]
    async fn strips_negotiation_triples() {
        // IAC WILL ECHO, then data.
        let input = [IAC, WILL, 1, b'h', b'i'];
        assert_eq!(filter_all(&input).await, b"hi");
    }

    #[tokio::test]
    async fn unescapes_doubled_iac() {
        let input = [b'a', IAC, IAC, b'b'];
        assert_eq!(filter_all(&input).await, [b'a', IAC, b'b']);
    }

    #[tokio::test]
    async fn strips_subnegotiation() {
        let input = [IAC, SB, 31, 0, 80, 0, 24, IAC, SE, b'x'];
        assert_eq!(filter_all(&input).await, b"x");
    }
}
