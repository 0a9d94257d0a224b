use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use log::warn;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

/// Reader adapter that copies everything read through it into an
/// in-memory buffer, so one pass over the input can feed both a file
/// write and a later network send.
pub struct TeeReader<'a, R: ?Sized> {
    inner: &'a mut R,
    copied: Vec<u8>,
}

impl<'a, R: AsyncRead + Unpin + ?Sized> TeeReader<'a, R> {
    pub fn new(inner: &'a mut R) -> Self {
        Self {
            inner,
            copied: Vec::new(),
        }
    }

    /// Consumes the tee and yields the bytes observed so far.
    pub fn into_copied(self) -> Vec<u8> {
        self.copied
    }
}

impl<'a, R: AsyncRead + Unpin + ?Sized> AsyncRead for TeeReader<'a, R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut *this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                this.copied.extend_from_slice(&buf.filled()[before..]);
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

struct Sink<W> {
    inner: W,
    dead: bool,
}

/// Writer that duplicates one input across several sinks.
///
/// A sink that fails is logged and skipped for the rest of the copy
/// instead of aborting the others; the write as a whole only errors once
/// every sink has failed. Each call writes the full buffer to each live
/// sink in order, so all sinks observe an identical byte sequence.
pub struct FanoutWriter<W> {
    sinks: Vec<Sink<W>>,
    // resume position for a write interrupted by back-pressure
    idx: usize,
    offset: usize,
}

impl<W: AsyncWrite + Unpin> FanoutWriter<W> {
    pub fn new(sinks: Vec<W>) -> Self {
        Self {
            sinks: sinks
                .into_iter()
                .map(|inner| Sink { inner, dead: false })
                .collect(),
            idx: 0,
            offset: 0,
        }
    }

    /// Sinks that have not failed so far.
    pub fn live_count(&self) -> usize {
        self.sinks.iter().filter(|s| !s.dead).count()
    }

    fn all_dead(&self) -> bool {
        !self.sinks.is_empty() && self.sinks.iter().all(|s| s.dead)
    }
}

impl<W: AsyncWrite + Unpin> AsyncWrite for FanoutWriter<W> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();

        while this.idx < this.sinks.len() {
            let sink = &mut this.sinks[this.idx];
            if sink.dead {
                this.idx += 1;
                this.offset = 0;
                continue;
            }
            while this.offset < buf.len() {
                match Pin::new(&mut sink.inner).poll_write(cx, &buf[this.offset..]) {
                    Poll::Pending => return Poll::Pending,
                    Poll::Ready(Ok(0)) => {
                        warn!("fan-out sink closed mid-write, skipping it");
                        sink.dead = true;
                        break;
                    }
                    Poll::Ready(Ok(n)) => this.offset += n,
                    Poll::Ready(Err(e)) => {
                        warn!("fan-out sink failed: {}, skipping it", e);
                        sink.dead = true;
                        break;
                    }
                }
            }
            this.idx += 1;
            this.offset = 0;
        }

        this.idx = 0;
        this.offset = 0;
        if this.all_dead() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "every fan-out sink has failed",
            )));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        // flushing is idempotent, so restart from the front on re-poll
        for sink in this.sinks.iter_mut().filter(|s| !s.dead) {
            match Pin::new(&mut sink.inner).poll_flush(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(Ok(())) => {}
                Poll::Ready(Err(e)) => {
                    warn!("fan-out sink failed on flush: {}, skipping it", e);
                    sink.dead = true;
                }
            }
        }
        if this.all_dead() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "every fan-out sink has failed",
            )));
        }
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // the sinks are borrowed peer connections; flushing is as far as
        // shutdown may go
        self.poll_flush(cx)
    }
}
