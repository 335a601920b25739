//! A bounded in-memory byte pipe between a listener's receive loop (the only writer) and the
//!  session reading from it.
//!
//! Its salient points are:
//!
//! * fixed capacity: writers wait for the reader when it is full (or use the non-blocking
//!   [StreamBuffer::try_write] and give up)
//! * each write appends one datagram's payload; arrival order is preserved, datagram boundaries
//!   are not
//! * after [StreamBuffer::close], writes fail while reads drain the remaining data and then
//!   report EOF
//!
//! There is a single waker slot per side, i.e. the buffer supports one concurrent reader and one
//!  concurrent writer.

use std::cmp::min;
use std::future::poll_fn;
use std::io;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};

use bytes::{Buf, BytesMut};
use tokio::io::ReadBuf;

use crate::config::OverflowPolicy;

pub struct StreamBuffer {
    capacity: usize,
    inner: Mutex<Inner>,
}

struct Inner {
    data: BytesMut,
    closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl StreamBuffer {
    pub fn new(capacity: usize) -> StreamBuffer {
        StreamBuffer {
            capacity,
            inner: Mutex::new(Inner {
                data: BytesMut::new(),
                closed: false,
                read_waker: None,
                write_waker: None,
            }),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// number of buffered bytes not yet read
    pub fn len(&self) -> usize {
        self.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // the lock is never held across code that can panic halfway through an update
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends as much of `data` as fits, waiting for free space if the buffer is full.
    pub fn poll_write(&self, cx: &mut Context<'_>, data: &[u8]) -> Poll<io::Result<usize>> {
        let mut inner = self.lock();
        if inner.closed {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)));
        }
        if data.is_empty() {
            return Poll::Ready(Ok(0));
        }

        let available = self.capacity - inner.data.len();
        if available == 0 {
            inner.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }

        let n = min(available, data.len());
        inner.data.extend_from_slice(&data[..n]);
        let read_waker = inner.read_waker.take();
        drop(inner);

        if let Some(waker) = read_waker {
            waker.wake();
        }
        Poll::Ready(Ok(n))
    }

    pub async fn write_all(&self, mut data: &[u8]) -> io::Result<()> {
        while !data.is_empty() {
            let n = poll_fn(|cx| self.poll_write(cx, data)).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// Appends `data` if it fits completely, returning `false` without changing the buffer
    ///  otherwise.
    pub fn try_write(&self, data: &[u8]) -> io::Result<bool> {
        let mut inner = self.lock();
        if inner.closed {
            return Err(io::Error::from(io::ErrorKind::BrokenPipe));
        }
        if data.len() > self.capacity - inner.data.len() {
            return Ok(false);
        }
        if data.is_empty() {
            return Ok(true);
        }

        inner.data.extend_from_slice(data);
        let read_waker = inner.read_waker.take();
        drop(inner);

        if let Some(waker) = read_waker {
            waker.wake();
        }
        Ok(true)
    }

    /// Appends a datagram's payload according to the overflow policy, returning `false` if it was
    ///  dropped for lack of space.
    pub async fn deliver(&self, payload: &[u8], overflow: OverflowPolicy) -> io::Result<bool> {
        match overflow {
            OverflowPolicy::Block => {
                self.write_all(payload).await?;
                Ok(true)
            }
            OverflowPolicy::DropNewest => self.try_write(payload),
        }
    }

    /// Moves buffered bytes into `buf`, waiting until data is available. Completing without
    ///  filling any bytes signals EOF, i.e. the buffer was closed and fully drained.
    pub fn poll_read(&self, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let mut inner = self.lock();
        if inner.data.is_empty() {
            if !inner.closed {
                inner.read_waker = Some(cx.waker().clone());
                return Poll::Pending;
            }
            return Poll::Ready(Ok(()));
        }

        let n = min(buf.remaining(), inner.data.len());
        buf.put_slice(&inner.data[..n]);
        inner.data.advance(n);
        let write_waker = inner.write_waker.take();
        drop(inner);

        if let Some(waker) = write_waker {
            waker.wake();
        }
        Poll::Ready(Ok(()))
    }

    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut read_buf = ReadBuf::new(buf);
        poll_fn(|cx| self.poll_read(cx, &mut read_buf)).await?;
        Ok(read_buf.filled().len())
    }

    /// Idempotent. Wakes up both a waiting reader and a waiting writer.
    pub fn close(&self) {
        let mut inner = self.lock();
        inner.closed = true;
        let read_waker = inner.read_waker.take();
        let write_waker = inner.write_waker.take();
        drop(inner);

        if let Some(waker) = read_waker {
            waker.wake();
        }
        if let Some(waker) = write_waker {
            waker.wake();
        }
    }
}
