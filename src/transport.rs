//! The raw socket transport (C2): owns the TCP halves, serializes writes,
//! and lazily starts the single reader task that turns the socket into a
//! stream of CRLF-normalized byte chunks.
//!
//! Grounded on `rust-billing-engine::esl::connection`'s split read/write
//! usage, generalized from its inline byte-by-byte loop into a standalone
//! reader task so [`crate::stream::MessageStream`] can fan the bytes out to
//! a [`tokio::sync::broadcast`] channel instead of blocking a single
//! consumer on the socket.

use crate::error::{EslError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex, Notify};

const READ_BUF_SIZE: usize = 8192;

/// Owns one TCP connection's read and write halves.
pub struct Transport {
    write_half: Mutex<OwnedWriteHalf>,
    read_half: StdMutex<Option<OwnedReadHalf>>,
    reader_started: AtomicBool,
    disposed: AtomicBool,
    dispose_notify: Arc<Notify>,
}

impl Transport {
    pub fn new(stream: TcpStream) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            write_half: Mutex::new(write_half),
            read_half: StdMutex::new(Some(read_half)),
            reader_started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            dispose_notify: Arc::new(Notify::new()),
        }
    }

    /// Write `data` in full. Fails immediately if the transport has already
    /// been disposed rather than attempting a write on a dead socket.
    pub async fn send(&self, data: &[u8]) -> Result<()> {
        if self.is_disposed() {
            return Err(EslError::Disposed);
        }
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(data).await?;
        Ok(())
    }

    /// Starts the reader task on the first call and returns the receiving
    /// end of its byte-chunk channel. Only one caller may ever drive the
    /// socket's read side, so later calls return `None` — this crate's own
    /// use is [`crate::stream::MessageStream`] taking it exactly once at
    /// connection setup.
    pub fn take_reader(&self) -> Option<mpsc::Receiver<Result<Vec<u8>>>> {
        if self.reader_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let read_half = self.read_half.lock().expect("read_half mutex poisoned").take()?;
        let (tx, rx) = mpsc::channel(32);
        tokio::spawn(read_loop(read_half, tx));
        Some(rx)
    }

    /// Mark the transport disposed and wake anyone awaiting
    /// [`Transport::disposed`]. Idempotent: only the first call has any
    /// effect.
    pub fn dispose(&self) {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            self.dispose_notify.notify_waiters();
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Resolves once the transport has been disposed, immediately if it
    /// already has been.
    pub async fn disposed(&self) {
        if self.is_disposed() {
            return;
        }
        self.dispose_notify.notified().await;
    }
}

async fn read_loop(mut read_half: OwnedReadHalf, tx: mpsc::Sender<Result<Vec<u8>>>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut pending_cr = false;
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) => break, // EOF: drop `tx`, the receiver sees the channel close.
            Ok(n) => {
                let chunk = normalize_crlf(&buf[..n], &mut pending_cr);
                if tx.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                let _ = tx.send(Err(EslError::Io(e))).await;
                break;
            }
        }
    }
}

/// FreeSWITCH's wire format is line-oriented with `\n` terminators but
/// tolerates `\r\n`; strip any `\r` that precedes a `\n` so the framer
/// only ever has to deal with bare `\n`. `pending_cr` carries state across
/// chunk boundaries so a `\r` landing at the very end of a `read()` still
/// gets normalized against a `\n` that arrives in the next chunk.
fn normalize_crlf(input: &[u8], pending_cr: &mut bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(input.len());
    for &byte in input {
        if *pending_cr {
            *pending_cr = false;
            if byte == b'\n' {
                out.push(b'\n');
                continue;
            }
            out.push(b'\r');
        }
        if byte == b'\r' {
            *pending_cr = true;
        } else {
            out.push(byte);
        }
    }
    out
}
