//! Byte plumbing between the data-plane loop and overlay connections.
//!
//! The data-plane task speaks lock-free [`ByteQueue`]s (so it never awaits
//! per-connection I/O); each dialed connection gets a pump task bridging
//! its queue pair to a duplex pipe, and callers see a plain
//! `AsyncRead + AsyncWrite` stream.

use bytes::{Bytes, BytesMut};
use crossbeam_queue::ArrayQueue;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};
use tokio::sync::Notify;

pub(crate) const STREAM_BUF: usize = 16 * 1024;

pub(crate) enum PushError {
    Full(Bytes),
    Closed,
}

/// Bounded SPSC byte-chunk queue with close semantics.
///
/// Pushes from the pump side wake the data-plane loop through the shared
/// `loop_notify`; the loop only ever uses the `try_` variants.
pub(crate) struct ByteQueue {
    queue: ArrayQueue<Bytes>,
    data: Notify,
    space: Notify,
    loop_notify: Arc<Notify>,
    closed: AtomicBool,
}

impl ByteQueue {
    pub(crate) fn new(capacity: usize, loop_notify: Arc<Notify>) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            data: Notify::new(),
            space: Notify::new(),
            loop_notify,
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.data.notify_waiters();
        self.space.notify_waiters();
        self.loop_notify.notify_waiters();
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub(crate) fn try_push(&self, chunk: Bytes) -> Result<(), PushError> {
        if self.is_closed() {
            return Err(PushError::Closed);
        }
        match self.queue.push(chunk) {
            Ok(()) => {
                self.data.notify_one();
                self.loop_notify.notify_one();
                Ok(())
            }
            Err(chunk) => Err(PushError::Full(chunk)),
        }
    }

    pub(crate) async fn push(&self, mut chunk: Bytes) -> Result<(), ()> {
        loop {
            match self.try_push(chunk) {
                Ok(()) => return Ok(()),
                Err(PushError::Closed) => return Err(()),
                Err(PushError::Full(returned)) => {
                    chunk = returned;
                    if self.is_closed() {
                        return Err(());
                    }
                    self.space.notified().await;
                }
            }
        }
    }

    pub(crate) fn try_pop(&self) -> Option<Bytes> {
        let out = self.queue.pop();
        if out.is_some() {
            self.space.notify_one();
        }
        out
    }

    pub(crate) async fn pop(&self) -> Option<Bytes> {
        loop {
            if let Some(out) = self.try_pop() {
                return Some(out);
            }
            if self.is_closed() {
                return None;
            }
            self.data.notified().await;
        }
    }
}

/// The queue pair backing one virtual connection.
///
/// `to_remote` flows caller → overlay peer (the loop pops it),
/// `from_remote` flows overlay peer → caller (the loop pushes it).
pub(crate) struct VirtualConnQueues {
    pub(crate) to_remote: Arc<ByteQueue>,
    pub(crate) from_remote: Arc<ByteQueue>,
}

/// A TCP connection dialed over the overlay.
///
/// Dropping the stream closes the virtual socket: the pump observes the
/// pipe shutting down, closes both queues, and the data-plane loop tears
/// the smoltcp socket down on its next pass.
pub struct OverlayStream {
    inner: DuplexStream,
}

impl OverlayStream {
    pub(crate) fn new(inner: DuplexStream) -> Self {
        Self { inner }
    }
}

impl AsyncRead for OverlayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for OverlayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bridge one side of a duplex pipe to a connection's queue pair.
///
/// `to_remote` carries bytes toward the overlay peer, `from_remote` back
/// toward the caller. Exits when either direction ends, closing both
/// queues so the loop can reclaim the socket.
pub(crate) async fn pump(
    mut pipe: DuplexStream,
    to_remote: Arc<ByteQueue>,
    from_remote: Arc<ByteQueue>,
) {
    let mut read_buf = BytesMut::with_capacity(STREAM_BUF);
    loop {
        tokio::select! {
            result = pipe.read_buf(&mut read_buf) => {
                match result {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        let chunk = read_buf.split().freeze();
                        if to_remote.push(chunk).await.is_err() {
                            break;
                        }
                    }
                }
            }
            data = from_remote.pop() => {
                match data {
                    None => break,
                    Some(chunk) => {
                        if pipe.write_all(&chunk).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    to_remote.close();
    from_remote.close();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn queue_roundtrip() {
        let notify = Arc::new(Notify::new());
        let q = ByteQueue::new(4, notify);
        q.try_push(Bytes::from_static(b"hello")).ok().unwrap();
        assert_eq!(q.try_pop().unwrap(), Bytes::from_static(b"hello"));
        assert!(q.try_pop().is_none());
    }

    #[tokio::test]
    async fn closed_queue_rejects_push_and_drains_pop() {
        let notify = Arc::new(Notify::new());
        let q = ByteQueue::new(4, notify);
        q.try_push(Bytes::from_static(b"x")).ok().unwrap();
        q.close();
        assert!(matches!(
            q.try_push(Bytes::from_static(b"y")),
            Err(PushError::Closed)
        ));
        // already-queued data still drains
        assert_eq!(q.pop().await.unwrap(), Bytes::from_static(b"x"));
        assert!(q.pop().await.is_none());
    }

    #[tokio::test]
    async fn pump_forwards_both_directions() {
        let notify = Arc::new(Notify::new());
        let to_remote = Arc::new(ByteQueue::new(16, notify.clone()));
        let from_remote = Arc::new(ByteQueue::new(16, notify));

        let (mut user, pipe) = tokio::io::duplex(4096);
        let handle = tokio::spawn(pump(pipe, to_remote.clone(), from_remote.clone()));

        user.write_all(b"request").await.unwrap();
        let got = to_remote.pop().await.unwrap();
        assert_eq!(&got[..], b"request");

        from_remote.push(Bytes::from_static(b"response")).await.unwrap();
        let mut buf = [0u8; 8];
        user.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response");

        drop(user);
        handle.await.unwrap();
        assert!(to_remote.is_closed());
        assert!(from_remote.is_closed());
    }
}
