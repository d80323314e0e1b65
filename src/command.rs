//! The command pipeline (C4): serializes outbound commands one at a time
//! and correlates each with the reply FreeSWITCH sends back.
//!
//! ESL carries no explicit correlation id on `command/reply` or
//! `api/response` messages — the only guarantee is that FreeSWITCH answers
//! commands in the order it received them on one connection. This module
//! generalizes `rust-billing-engine::esl::connection::send_command`'s
//! single `Mutex`-guarded stream (which enforced the same ordering by
//! holding the lock across both the write and the matching read) into a
//! split design: a [`tokio::sync::Mutex`] gate still allows only one
//! command in flight, but the reply is delivered through a
//! [`tokio::sync::oneshot`] channel so a slow reply can't also block
//! [`crate::stream::MessageStream`]'s other subscribers (events,
//! `channel_events`) from making progress — an approach adapted from the
//! oneshot-per-transaction correlation table in `semi-hsms-rs`.

use crate::config::ConnectionConfig;
use crate::error::{EslError, Result};
use crate::message::{ApiResponse, CommandReply, Message};
use crate::stream::{MessageStream, StreamEvent};
use crate::transport::Transport;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{oneshot, Mutex};
use tokio::time::timeout;

/// What a single command's correlated reply turned out to be.
enum PipelineReply {
    Command(CommandReply),
    Api(ApiResponse),
}

pub struct CommandPipeline {
    transport: Arc<Transport>,
    stream: Arc<MessageStream>,
    /// Holding this across a whole send/await cycle is what makes the
    /// pipeline FIFO: the next caller can't register its own pending slot
    /// until the previous command's reply has arrived or timed out.
    gate: Mutex<()>,
    pending: Arc<StdMutex<Option<oneshot::Sender<PipelineReply>>>>,
    disposed: Arc<AtomicBool>,
    config: ConnectionConfig,
}

impl CommandPipeline {
    pub fn new(transport: Arc<Transport>, stream: Arc<MessageStream>, config: ConnectionConfig) -> Self {
        let pending: Arc<StdMutex<Option<oneshot::Sender<PipelineReply>>>> = Arc::new(StdMutex::new(None));
        let disposed = Arc::new(AtomicBool::new(false));

        let pending_task = pending.clone();
        let disposed_task = disposed.clone();
        let mut watch = stream.subscribe();
        tokio::spawn(async move {
            loop {
                match watch.next().await {
                    Some(StreamEvent::Message(msg)) => {
                        let reply = match msg.as_ref() {
                            Message::CommandReply(r) => Some(PipelineReply::Command(r.clone())),
                            Message::ApiResponse(r) => Some(PipelineReply::Api(r.clone())),
                            _ => None,
                        };
                        if let Some(reply) = reply {
                            if let Some(tx) = pending_task.lock().expect("pending mutex poisoned").take() {
                                let _ = tx.send(reply);
                            }
                        }
                    }
                    Some(StreamEvent::Error(_)) | None => {
                        disposed_task.store(true, Ordering::SeqCst);
                        // Drop without sending: the waiter's oneshot::Receiver
                        // observes a RecvError, which send_raw maps to Cancelled.
                        pending_task.lock().expect("pending mutex poisoned").take();
                        break;
                    }
                }
            }
        });

        Self { transport, stream, gate: Mutex::new(()), pending, disposed, config }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst) || self.transport.is_disposed()
    }

    async fn send_raw(&self, command: &str) -> Result<PipelineReply> {
        if self.is_disposed() {
            return Err(EslError::Disposed);
        }
        let _permit = self.gate.lock().await;
        // Re-check after acquiring the gate: the connection may have died
        // while we were waiting for our turn.
        if self.is_disposed() {
            return Err(EslError::Disposed);
        }

        let (tx, rx) = oneshot::channel();
        *self.pending.lock().expect("pending mutex poisoned") = Some(tx);

        if let Err(err) = self.transport.send(format!("{command}\n\n").as_bytes()).await {
            self.pending.lock().expect("pending mutex poisoned").take();
            return Err(err);
        }

        match timeout(self.config.response_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_recv_error)) => Err(EslError::Cancelled),
            Err(_elapsed) => {
                self.pending.lock().expect("pending mutex poisoned").take();
                Err(EslError::Timeout)
            }
        }
    }

    /// Send `api <command>` and await the correlated `api/response`.
    pub async fn send_api(&self, command: &str) -> Result<ApiResponse> {
        match self.send_raw(&format!("api {command}")).await? {
            PipelineReply::Api(reply) => Ok(reply),
            PipelineReply::Command(_) => {
                Err(EslError::ProtocolViolation("expected api/response, got command/reply".into()))
            }
        }
    }

    /// Send a raw command line (e.g. `auth secret`, `myevents`,
    /// `sendmsg <uuid>\n...`) and await the correlated `command/reply`.
    pub async fn send_command(&self, command: &str) -> Result<CommandReply> {
        match self.send_raw(command).await? {
            PipelineReply::Command(reply) => Ok(reply),
            PipelineReply::Api(_) => {
                Err(EslError::ProtocolViolation("expected command/reply, got api/response".into()))
            }
        }
    }

    /// `exit`: FreeSWITCH answers with a `command/reply` immediately, then
    /// (usually) follows up with a `text/disconnect-notice` before closing
    /// the socket. The notice is best-effort — a missing one within
    /// `disconnect_notice_timeout` still counts as a successful exit, and
    /// this wait deliberately ignores cancellation so a caller that is
    /// already tearing down the connection doesn't race itself.
    pub async fn exit(&self) -> Result<()> {
        let mut watch = self.stream.subscribe();
        let reply = self.send_command("exit").await?;
        if !reply.success() {
            return Err(EslError::ProtocolViolation(format!(
                "exit rejected: {}",
                reply.error_message().unwrap_or_default()
            )));
        }

        let wait_for_notice = async {
            loop {
                match watch.next().await {
                    Some(StreamEvent::Message(msg)) if matches!(msg.as_ref(), Message::DisconnectNotice(_)) => {
                        return;
                    }
                    Some(_) => continue,
                    None => return,
                }
            }
        };
        let _ = timeout(self.config.disconnect_notice_timeout, wait_for_notice).await;
        Ok(())
    }
}
