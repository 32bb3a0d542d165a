//! Transfer receiver (controller side).
//!
//! Connects to the board's transfer port and writes each received frame to
//! the capture directory as `capture_{index:05}.{ext}`. The extension is
//! sniffed from the file's leading bytes. Numbering continues after the
//! highest capture already in the directory, so earlier files are never
//! replaced.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use tokio::io::{AsyncRead, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::wire::{copy_exact, read_frame_header};
use crate::{TCP_BUFFER_SIZE, TCP_CONNECT_TIMEOUT};

/// A file written to the capture directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    /// Position in the receive order, starting at the receiver's first index.
    pub index: u64,
    pub path: PathBuf,
    pub bytes: u64,
}

/// Receives captures from the board.
pub struct TransferReceiver {
    dest: PathBuf,
    next_index: u64,
}

impl TransferReceiver {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self {
            dest: dest.into(),
            next_index: 0,
        }
    }

    /// Continues numbering from `index`, e.g. after a reconnect.
    pub fn with_start_index(mut self, index: u64) -> Self {
        self.next_index = index;
        self
    }

    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Connects to the board's transfer port.
    pub async fn connect(addr: SocketAddr) -> Result<TcpStream, DataChannelError> {
        match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => {
                info!(%addr, "transfer channel connected");
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(DataChannelError::Timeout),
        }
    }

    /// Receives frames until the board closes the stream at a frame boundary.
    ///
    /// Each completed file is reported on `files_tx`. Returns the number of
    /// files received. A framing error, EOF inside a frame or cancellation
    /// removes the partial file and ends the transfer with an error.
    pub async fn receive<R: AsyncRead + Unpin>(
        &mut self,
        reader: R,
        cancel: CancellationToken,
        files_tx: mpsc::Sender<ReceivedFile>,
    ) -> Result<u64, DataChannelError> {
        tokio::fs::create_dir_all(&self.dest).await?;
        let free = next_free_index(&self.dest, self.next_index).await?;
        if free != self.next_index {
            info!(
                from = self.next_index,
                to = free,
                "captures already present; continuing numbering"
            );
            self.next_index = free;
        }
        let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
        let mut buf = vec![0u8; TCP_BUFFER_SIZE];
        let mut count = 0u64;

        loop {
            let len = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DataChannelError::Cancelled),
                result = read_frame_header(&mut reader) => match result? {
                    Some(len) => len,
                    None => {
                        info!(count, "transfer channel closed");
                        return Ok(count);
                    }
                },
            };

            let part = self.part_path();
            let received = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.receive_one(&mut reader, len, &mut buf) => Some(result),
            };
            let Some(file) = received else {
                debug!(path = %part.display(), "receive cancelled; removing partial capture");
                let _ = tokio::fs::remove_file(&part).await;
                return Err(DataChannelError::Cancelled);
            };
            let file = file?;
            count += 1;

            if files_tx.send(file).await.is_err() {
                debug!("file receiver dropped; continuing without notifications");
            }
        }
    }

    fn part_path(&self) -> PathBuf {
        self.dest.join(format!("capture_{:05}.part", self.next_index))
    }

    async fn receive_one<R: AsyncRead + Unpin>(
        &mut self,
        reader: &mut R,
        len: u64,
        buf: &mut [u8],
    ) -> Result<ReceivedFile, DataChannelError> {
        let index = self.next_index;
        let part = self.part_path();

        let result = write_part(reader, &part, len, buf).await;
        let head = match result {
            Ok(head) => head,
            Err(e) => {
                warn!(index, error = %e, "incomplete capture discarded");
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };

        let path = self
            .dest
            .join(format!("capture_{index:05}.{}", sniff_extension(&head)));
        tokio::fs::rename(&part, &path).await?;
        self.next_index += 1;

        debug!(index, len, path = %path.display(), "transfer channel: file received");
        Ok(ReceivedFile {
            index,
            path,
            bytes: len,
        })
    }
}

/// Writes `len` bytes into `part` and returns up to the first 8 bytes.
async fn write_part<R: AsyncRead + Unpin>(
    reader: &mut R,
    part: &Path,
    len: u64,
    buf: &mut [u8],
) -> Result<Vec<u8>, DataChannelError> {
    let file = tokio::fs::File::create(part).await?;
    let mut writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, file);

    let head_len = len.min(8);
    let mut head = Vec::with_capacity(head_len as usize);
    copy_exact(reader, &mut head, head_len, buf).await?;
    writer.write_all(&head).await?;
    copy_exact(reader, &mut writer, len - head_len, buf).await?;

    writer.flush().await?;
    writer.into_inner().sync_all().await?;
    Ok(head)
}

/// Lowest index at or above `from` that no finished capture in `dir` uses.
async fn next_free_index(dir: &Path, from: u64) -> Result<u64, DataChannelError> {
    let mut next = from;
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if let Some(index) = entry.file_name().to_str().and_then(capture_index) {
            next = next.max(index.saturating_add(1));
        }
    }
    Ok(next)
}

/// Index of a finished `capture_NNNNN.ext` file name.
fn capture_index(name: &str) -> Option<u64> {
    let (digits, ext) = name.strip_prefix("capture_")?.split_once('.')?;
    if ext == "part" {
        return None;
    }
    digits.parse().ok()
}

/// Picks a file extension from the leading bytes of a capture.
pub fn sniff_extension(head: &[u8]) -> &'static str {
    if head.starts_with(b"II*\0") || head.starts_with(b"MM\0*") {
        "dng"
    } else if head.starts_with(&[0xFF, 0xD8, 0xFF]) {
        "jpg"
    } else if head.starts_with(&[0x89, b'P', b'N', b'G']) {
        "png"
    } else {
        "bin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::TransferQueue;
    use crate::sender::TransferSender;
    use crate::wire::write_frame_header;
    use tokio::net::TcpListener;

    #[test]
    fn sniffs_known_formats() {
        assert_eq!(sniff_extension(b"II*\0rest"), "dng");
        assert_eq!(sniff_extension(b"MM\0*rest"), "dng");
        assert_eq!(sniff_extension(&[0xFF, 0xD8, 0xFF, 0xE0]), "jpg");
        assert_eq!(sniff_extension(b"\x89PNG\r\n\x1a\n"), "png");
        assert_eq!(sniff_extension(b"RAW"), "bin");
        assert_eq!(sniff_extension(b""), "bin");
    }

    #[tokio::test]
    async fn receives_frames_with_any_chunking() {
        let dir = tempfile::tempdir().unwrap();
        let files: Vec<Vec<u8>> = vec![
            b"\x89PNG\r\n\x1a\nimage-body".to_vec(),
            Vec::new(),
            (0..5000u32).map(|i| (i % 251) as u8).collect(),
        ];
        let mut wire = Vec::new();
        for f in &files {
            write_frame_header(&mut wire, f.len() as u64).await.unwrap();
            wire.extend_from_slice(f);
        }

        for chunk in [1usize, 7, 4096] {
            let out = dir.path().join(format!("chunk_{chunk}"));
            let (mut tx, rx) = tokio::io::duplex(64);
            let data = wire.clone();
            tokio::spawn(async move {
                for piece in data.chunks(chunk) {
                    tx.write_all(piece).await.unwrap();
                }
            });

            let (files_tx, mut files_rx) = mpsc::channel(8);
            let mut receiver = TransferReceiver::new(&out);
            let count = receiver
                .receive(rx, CancellationToken::new(), files_tx)
                .await
                .unwrap();
            assert_eq!(count, 3);

            for (i, expected) in files.iter().enumerate() {
                let got = files_rx.recv().await.unwrap();
                assert_eq!(got.index, i as u64);
                assert_eq!(std::fs::read(&got.path).unwrap(), *expected);
            }
            assert!(out.join("capture_00000.png").exists());
            assert!(out.join("capture_00002.bin").exists());
        }
    }

    #[test]
    fn parses_capture_names() {
        assert_eq!(capture_index("capture_00042.dng"), Some(42));
        assert_eq!(capture_index("capture_123456.bin"), Some(123456));
        assert_eq!(capture_index("capture_00003.part"), None);
        assert_eq!(capture_index("notes.txt"), None);
        assert_eq!(capture_index("capture_abc.png"), None);
    }

    #[tokio::test]
    async fn second_receiver_keeps_earlier_captures() {
        let dir = tempfile::tempdir().unwrap();
        let mut received = Vec::new();
        for body in [&b"II*\0first-run"[..], &b"II*\0second-run"[..]] {
            let mut wire = Vec::new();
            write_frame_header(&mut wire, body.len() as u64).await.unwrap();
            wire.extend_from_slice(body);

            let (files_tx, mut files_rx) = mpsc::channel(8);
            let mut receiver = TransferReceiver::new(dir.path());
            receiver
                .receive(&wire[..], CancellationToken::new(), files_tx)
                .await
                .unwrap();
            received.push(files_rx.recv().await.unwrap());
        }

        assert_eq!(received[0].path, dir.path().join("capture_00000.dng"));
        assert_eq!(received[1].path, dir.path().join("capture_00001.dng"));
        assert_eq!(received[1].index, 1);
        assert_eq!(std::fs::read(&received[0].path).unwrap(), b"II*\0first-run");
        assert_eq!(std::fs::read(&received[1].path).unwrap(), b"II*\0second-run");
    }

    #[tokio::test]
    async fn cancel_mid_frame_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut tx, rx) = tokio::io::duplex(4096);
        let mut head = Vec::new();
        write_frame_header(&mut head, 1000).await.unwrap();
        tx.write_all(&head).await.unwrap();
        tx.write_all(&[7u8; 100]).await.unwrap();

        let cancel = CancellationToken::new();
        let (files_tx, _files_rx) = mpsc::channel(8);
        let dest = dir.path().to_path_buf();
        let recv_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            TransferReceiver::new(dest)
                .receive(rx, recv_cancel, files_tx)
                .await
        });

        let part = dir.path().join("capture_00000.part");
        while !part.exists() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(DataChannelError::Cancelled)));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
        drop(tx);
    }

    #[tokio::test]
    async fn truncated_frame_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut wire = Vec::new();
        write_frame_header(&mut wire, 100).await.unwrap();
        wire.extend_from_slice(&[1u8; 40]);

        let (files_tx, _files_rx) = mpsc::channel(8);
        let mut receiver = TransferReceiver::new(dir.path());
        let err = receiver
            .receive(&wire[..], CancellationToken::new(), files_tx)
            .await
            .unwrap_err();
        assert!(matches!(err, DataChannelError::Truncated { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn corrupt_length_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let mut wire = Vec::new();
        write_frame_header(&mut wire, 3).await.unwrap();
        wire.extend_from_slice(b"abc");
        wire.extend_from_slice(&u64::MAX.to_be_bytes());
        wire.extend_from_slice(b"trailing garbage");

        let (files_tx, mut files_rx) = mpsc::channel(8);
        let mut receiver = TransferReceiver::new(dir.path());
        let err = receiver
            .receive(&wire[..], CancellationToken::new(), files_tx)
            .await
            .unwrap_err();
        assert!(err.is_framing());
        assert_eq!(files_rx.recv().await.unwrap().bytes, 3);
        assert_eq!(receiver.next_index(), 1);
    }

    #[tokio::test]
    async fn sender_to_receiver_over_tcp() {
        let board_dir = tempfile::tempdir().unwrap();
        let ctrl_dir = tempfile::tempdir().unwrap();

        let queue = TransferQueue::new(8);
        let payloads: Vec<Vec<u8>> = (0..4u8)
            .map(|i| vec![i; crate::TCP_BUFFER_SIZE / 2 + i as usize])
            .collect();
        for (i, data) in payloads.iter().enumerate() {
            let path = board_dir.path().join(format!("frame{i}.raw"));
            std::fs::write(&path, data).unwrap();
            queue.enqueue(path, data.len() as u64).await.unwrap();
        }

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let sender = TransferSender::new(queue.clone());
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move { sender.run(listener, run_cancel).await });

        let stream = TransferReceiver::connect(addr).await.unwrap();
        let (files_tx, mut files_rx) = mpsc::channel(8);
        let recv_cancel = cancel.clone();
        let recv = tokio::spawn(async move {
            let mut receiver = TransferReceiver::new(ctrl_dir.path());
            let result = receiver.receive(stream, recv_cancel, files_tx).await;
            (result, ctrl_dir)
        });

        for (i, data) in payloads.iter().enumerate() {
            let file = files_rx.recv().await.unwrap();
            assert_eq!(file.index, i as u64);
            assert_eq!(&std::fs::read(&file.path).unwrap(), data);
        }
        queue.wait_drained().await;
        cancel.cancel();
        let (result, _dir) = recv.await.unwrap();
        assert!(matches!(result, Err(DataChannelError::Cancelled) | Ok(4)));
    }
}
