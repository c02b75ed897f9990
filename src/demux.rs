//! Stripping of the container runtime's stdout/stderr framing.
//!
//! A non-TTY container's combined output arrives as frames, each led by an
//! 8-byte header: byte 0 names the channel, bytes 4..8 hold the big-endian
//! payload length. [`Demuxer`] wraps such a stream and yields only the payload
//! bytes, both channels merged in arrival order. Frames do not line up with
//! lines; whoever reads from the demuxer has to scan for line breaks itself.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use tokio::io::{AsyncRead, ReadBuf};
use tracing::debug;

pub const HEADER_LEN: usize = 8;

/// Whether the attached output carries frame headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFraming {
    /// Header-prefixed frames, as served by the runtime's raw logs endpoint.
    Multiplexed,
    /// Already-clean bytes (TTY attach, or a client that decodes frames itself).
    Raw,
}

enum State {
    PassThrough,
    Header { bytes: [u8; HEADER_LEN], filled: usize },
    Payload { remaining: usize },
    Closed,
}

impl State {
    fn header() -> Self {
        State::Header {
            bytes: [0; HEADER_LEN],
            filled: 0,
        }
    }
}

/// An [`AsyncRead`] adapter that removes frame headers.
///
/// End of input inside a header, including a partial one, ends the output
/// cleanly. End of input inside a payload is reported as
/// [`io::ErrorKind::UnexpectedEof`].
pub struct Demuxer<R> {
    inner: R,
    state: State,
}

impl<R> Demuxer<R> {
    pub fn new(inner: R, framing: LogFraming) -> Self {
        let state = match framing {
            LogFraming::Multiplexed => State::header(),
            LogFraming::Raw => State::PassThrough,
        };
        Self { inner, state }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for Demuxer<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                State::PassThrough => return Pin::new(&mut this.inner).poll_read(cx, buf),
                State::Closed => return Poll::Ready(Ok(())),
                State::Header { bytes, filled } => {
                    let mut header = ReadBuf::new(&mut bytes[*filled..]);
                    if let Err(e) = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut header)) {
                        this.state = State::Closed;
                        return Poll::Ready(Err(e));
                    }
                    let n = header.filled().len();
                    if n == 0 {
                        if *filled > 0 {
                            debug!(partial = *filled, "output ended inside a frame header");
                        }
                        this.state = State::Closed;
                        return Poll::Ready(Ok(()));
                    }
                    *filled += n;
                    if *filled == HEADER_LEN {
                        let len = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
                        this.state = State::Payload {
                            remaining: len as usize,
                        };
                    }
                }
                State::Payload { remaining } => {
                    if *remaining == 0 {
                        this.state = State::header();
                        continue;
                    }
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }

                    let want = (*remaining).min(buf.remaining());
                    let mut chunk = ReadBuf::new(buf.initialize_unfilled_to(want));
                    if let Err(e) = ready!(Pin::new(&mut this.inner).poll_read(cx, &mut chunk)) {
                        this.state = State::Closed;
                        return Poll::Ready(Err(e));
                    }
                    let n = chunk.filled().len();
                    if n == 0 {
                        let missing = *remaining;
                        this.state = State::Closed;
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::UnexpectedEof,
                            format!("output ended with {missing} payload bytes outstanding"),
                        )));
                    }
                    *remaining -= n;
                    buf.advance(n);
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}
