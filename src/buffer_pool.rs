//! Reusable fixed-size byte buffers for stream copying.
//!
//! Every relay direction and every forwarded response body borrows one buffer
//! for the duration of a single copy. The borrow is a guard: the buffer goes
//! back to the idle set when the guard drops, on every exit path.

use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const DEFAULT_BUFFER_SIZE: usize = 1024;

/// Shared pool of idle buffers. Cloning is cheap and shares the idle set.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

struct PoolInner {
    idle: Mutex<Vec<Box<[u8]>>>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                idle: Mutex::new(Vec::new()),
                buffer_size: buffer_size.max(1),
            }),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Number of buffers currently sitting idle in the pool.
    pub fn idle(&self) -> usize {
        self.inner.idle.lock().len()
    }

    /// Takes an idle buffer, or allocates a fresh one when none is idle.
    pub fn acquire(&self) -> PooledBuffer {
        let buf = self
            .inner
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.inner.buffer_size].into_boxed_slice());
        PooledBuffer {
            buf: Some(buf),
            pool: self.clone(),
        }
    }

    /// Returns a buffer to the idle set. Dropping the guard does the same.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    fn put_back(&self, buf: Box<[u8]>) {
        self.inner.idle.lock().push(buf);
    }

    /// Copies `reader` into `writer` until EOF through one pooled buffer.
    ///
    /// Returns the number of bytes written. The buffer is released whether
    /// the copy finishes or fails partway.
    pub async fn copy<R, W>(&self, reader: &mut R, writer: &mut W) -> io::Result<u64>
    where
        R: AsyncRead + Unpin + ?Sized,
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut buf = self.acquire();
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        writer.flush().await?;
        Ok(total)
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// Exclusive borrow of one pooled buffer.
pub struct PooledBuffer {
    buf: Option<Box<[u8]>>,
    pool: BufferPool,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put_back(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::ReadBuf;

    struct FailAfter {
        data: &'static [u8],
        sent: bool,
    }

    impl AsyncRead for FailAfter {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            out: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.sent {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "reset",
                )));
            }
            self.sent = true;
            out.put_slice(self.data);
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_acquire_allocates_fixed_size() {
        let pool = BufferPool::new(1024);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 1024);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_release_makes_buffer_reusable() {
        let pool = BufferPool::new(64);
        let mut buf = pool.acquire();
        buf[0] = 7;
        pool.release(buf);
        assert_eq!(pool.idle(), 1);

        let again = pool.acquire();
        assert_eq!(again[0], 7);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_concurrent_borrows_are_distinct() {
        let pool = BufferPool::new(16);
        let a = pool.acquire();
        let b = pool.acquire();
        assert_ne!(a.as_ptr(), b.as_ptr());
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_zero_size_is_clamped() {
        let pool = BufferPool::new(0);
        assert_eq!(pool.buffer_size(), 1);
    }

    #[tokio::test]
    async fn test_copy_is_byte_exact() {
        let pool = BufferPool::new(7);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let mut reader = &data[..];
        let mut out = Vec::new();

        let n = pool.copy(&mut reader, &mut out).await.unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(pool.idle(), 1);
    }

    #[tokio::test]
    async fn test_copy_releases_buffer_on_error() {
        let pool = BufferPool::new(32);
        let mut reader = FailAfter {
            data: b"partial",
            sent: false,
        };
        let mut out = Vec::new();

        let err = pool.copy(&mut reader, &mut out).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
        assert_eq!(out, b"partial");
        assert_eq!(pool.idle(), 1);
    }
}
