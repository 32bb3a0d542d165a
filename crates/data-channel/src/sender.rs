//! Transfer sender (board side).
//!
//! Listens for the Controller's transfer connection and streams queued
//! captures over it, oldest first. Each file is deleted once its bytes are
//! flushed. An item that cannot be delivered goes back to the head of the
//! queue and the sender waits for the next connection.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::queue::{TransferItem, TransferQueue};
use crate::wire::write_frame_header;
use crate::{SEND_STALL_TIMEOUT, TCP_BUFFER_SIZE};

/// Streams items from a [`TransferQueue`] to the connected Controller.
#[derive(Clone)]
pub struct TransferSender {
    queue: TransferQueue,
    stall_timeout: Duration,
    current: Arc<Mutex<Option<CancellationToken>>>,
}

impl TransferSender {
    pub fn new(queue: TransferQueue) -> Self {
        Self {
            queue,
            stall_timeout: SEND_STALL_TIMEOUT,
            current: Arc::new(Mutex::new(None)),
        }
    }

    /// Overrides how long a single write may block.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn queue(&self) -> &TransferQueue {
        &self.queue
    }

    /// Returns `true` while a Controller is attached.
    pub fn is_connected(&self) -> bool {
        self.current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Closes the active transfer connection, if any. Queued items are kept.
    pub fn drop_connection(&self) {
        if let Some(token) = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            token.cancel();
        }
    }

    /// Accepts connections until `cancel` fires. A new connection replaces
    /// the current one.
    pub async fn run(
        &self,
        listener: TcpListener,
        cancel: CancellationToken,
    ) -> Result<(), DataChannelError> {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "transfer channel listening");
        }

        loop {
            let (mut stream, mut addr) = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                result = listener.accept() => result?,
            };

            loop {
                info!(%addr, "transfer channel connection accepted");
                let conn = cancel.child_token();
                *self.current.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn.clone());

                let serve = self.serve(stream, conn.clone());
                tokio::pin!(serve);

                let replacement = tokio::select! {
                    result = &mut serve => {
                        log_closed(&addr, result);
                        None
                    }
                    result = listener.accept() => {
                        conn.cancel();
                        log_closed(&addr, serve.await);
                        Some(result?)
                    }
                };

                *self.current.lock().unwrap_or_else(PoisonError::into_inner) = None;
                match replacement {
                    Some((next, next_addr)) => {
                        info!(old = %addr, new = %next_addr, "transfer connection replaced");
                        stream = next;
                        addr = next_addr;
                    }
                    None => break,
                }
            }
        }
    }

    /// Sends items over one connection until it fails, closes or is
    /// cancelled.
    async fn serve(
        &self,
        stream: TcpStream,
        conn: CancellationToken,
    ) -> Result<(), DataChannelError> {
        stream.set_nodelay(true)?;
        let (mut reader, writer) = stream.into_split();
        let mut writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);
        let mut buf = vec![0u8; TCP_BUFFER_SIZE];

        loop {
            let item = tokio::select! {
                biased;
                _ = conn.cancelled() => return Err(DataChannelError::Cancelled),
                _ = peer_closed(&mut reader) => return Ok(()),
                item = self.queue.next() => item,
            };

            let result = tokio::select! {
                biased;
                _ = conn.cancelled() => Err(DataChannelError::Cancelled),
                result = self.send_item(&mut writer, &item, &mut buf) => result,
            };

            match result {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(&item.path).await {
                        warn!(path = %item.path.display(), error = %e, "failed to delete sent capture");
                    }
                    self.queue.complete(&item);
                }
                Err(DataChannelError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(seq = item.seq, path = %item.path.display(), "capture vanished before transfer; skipping");
                    self.queue.complete(&item);
                }
                Err(e) => {
                    warn!(seq = item.seq, error = %e, "transfer failed; item kept for retry");
                    self.queue.fail(item);
                    return Err(e);
                }
            }
        }
    }

    async fn send_item(
        &self,
        writer: &mut BufWriter<OwnedWriteHalf>,
        item: &TransferItem,
        buf: &mut [u8],
    ) -> Result<(), DataChannelError> {
        let mut file = tokio::fs::File::open(&item.path).await?;
        let len = file.metadata().await?.len();
        if len != item.len {
            debug!(seq = item.seq, queued = item.len, actual = len, "capture size changed since enqueue");
        }

        self.stall_guard(write_frame_header(writer, len)).await?;

        let mut remaining = len;
        while remaining > 0 {
            let to_read = (remaining as usize).min(buf.len());
            let n = file.read(&mut buf[..to_read]).await?;
            if n == 0 {
                return Err(DataChannelError::Protocol(
                    "unexpected EOF reading local file".into(),
                ));
            }
            let chunk = &buf[..n];
            self.stall_guard(async { writer.write_all(chunk).await.map_err(DataChannelError::from) })
                .await?;
            remaining -= n as u64;
        }
        self.stall_guard(async { writer.flush().await.map_err(DataChannelError::from) })
            .await?;

        debug!(seq = item.seq, len, "transfer channel: file sent");
        Ok(())
    }

    async fn stall_guard<F>(&self, fut: F) -> Result<(), DataChannelError>
    where
        F: std::future::Future<Output = Result<(), DataChannelError>>,
    {
        tokio::time::timeout(self.stall_timeout, fut)
            .await
            .map_err(|_| DataChannelError::Stalled(self.stall_timeout))?
    }
}

/// Resolves when the Controller closes its end. The Controller never sends
/// on this channel, so any bytes are discarded.
async fn peer_closed(reader: &mut OwnedReadHalf) {
    let mut scratch = [0u8; 64];
    loop {
        match reader.read(&mut scratch).await {
            Ok(0) | Err(_) => return,
            Ok(_) => continue,
        }
    }
}

fn log_closed(addr: &std::net::SocketAddr, result: Result<(), DataChannelError>) {
    match result {
        Ok(()) => info!(%addr, "transfer connection closed by peer"),
        Err(DataChannelError::Cancelled) => info!(%addr, "transfer connection dropped"),
        Err(e) => warn!(%addr, error = %e, "transfer connection ended with error"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{copy_exact, read_frame_header};

    async fn start(queue: TransferQueue) -> (TransferSender, std::net::SocketAddr, CancellationToken) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = TransferSender::new(queue);
        let cancel = CancellationToken::new();
        let task_sender = sender.clone();
        let task_cancel = cancel.clone();
        tokio::spawn(async move { task_sender.run(listener, task_cancel).await });
        (sender, addr, cancel)
    }

    async fn read_one(stream: &mut TcpStream) -> Vec<u8> {
        let len = read_frame_header(stream).await.unwrap().unwrap();
        let mut out = Vec::new();
        let mut buf = [0u8; 1024];
        copy_exact(stream, &mut out, len, &mut buf).await.unwrap();
        out
    }

    #[tokio::test]
    async fn sends_in_order_and_deletes() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TransferQueue::new(8);
        let mut paths = Vec::new();
        for i in 0..3u8 {
            let path = dir.path().join(format!("capture_{i}.bin"));
            std::fs::write(&path, vec![i; 100 + i as usize]).unwrap();
            queue.enqueue(path.clone(), 100 + i as u64).await.unwrap();
            paths.push(path);
        }

        let (_sender, addr, cancel) = start(queue.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for i in 0..3u8 {
            let data = read_one(&mut stream).await;
            assert_eq!(data, vec![i; 100 + i as usize]);
        }

        queue.wait_drained().await;
        for path in &paths {
            assert!(!path.exists());
        }
        cancel.cancel();
    }

    #[tokio::test]
    async fn dropped_connection_keeps_items() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TransferQueue::new(8);
        let (sender, addr, cancel) = start(queue.clone()).await;

        let stream = TcpStream::connect(addr).await.unwrap();
        while !sender.is_connected() {
            tokio::task::yield_now().await;
        }
        sender.drop_connection();
        drop(stream);

        let path = dir.path().join("late.bin");
        std::fs::write(&path, b"late").unwrap();
        queue.enqueue(path.clone(), 4).await.unwrap();

        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_one(&mut stream).await, b"late");
        queue.wait_drained().await;
        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let queue = TransferQueue::new(8);
        queue
            .enqueue(dir.path().join("gone.bin"), 10)
            .await
            .unwrap();
        let present = dir.path().join("present.bin");
        std::fs::write(&present, b"ok").unwrap();
        queue.enqueue(present, 2).await.unwrap();

        let (_sender, addr, cancel) = start(queue.clone()).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_one(&mut stream).await, b"ok");
        queue.wait_drained().await;
        cancel.cancel();
    }
}
