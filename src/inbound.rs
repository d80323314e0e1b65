//! Inbound client (C7): dial FreeSWITCH and authenticate.
//!
//! Generalizes `rust-billing-engine::esl::connection::EslConnection::connect`'s
//! connect-then-auth sequence onto the split transport/stream/command
//! pipeline, replacing its ad hoc `contains("Content-Type: auth/request")`
//! string checks with typed [`Message`] matching.

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{EslError, InboundFailureReason, Result};
use crate::message::Message;
use crate::stream::{MessageStream, StreamEvent};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout as tokio_timeout;

/// Entry point for inbound-mode connections: the library dials
/// FreeSWITCH and authenticates with a shared password.
pub struct InboundSocket;

impl InboundSocket {
    /// Connect to `host:port`, authenticate with `password`, and return a
    /// live [`Connection`]. `connect_timeout` bounds only the wait for the
    /// initial `auth/request` greeting (spec.md §4.7 step 2); the
    /// authentication round trip itself is governed by
    /// `config.response_timeout`.
    pub async fn connect(
        host: &str,
        port: u16,
        password: &str,
        connect_timeout: Duration,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let endpoint = format!("{host}:{port}");
        let connection = Self::try_connect(host, port, password, connect_timeout, config).await;
        connection.map_err(|err| wrap_transport_failure(err, &endpoint))
    }

    async fn try_connect(
        host: &str,
        port: u16,
        password: &str,
        connect_timeout: Duration,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let endpoint = format!("{host}:{port}");
        let tcp = TcpStream::connect((host, port)).await?;
        let connection = Connection::from_tcp_stream(tcp, config);

        let mut greeting_watch = connection.stream().subscribe();
        let greeting = tokio_timeout(connect_timeout, async {
            loop {
                match greeting_watch.next().await {
                    Some(StreamEvent::Message(msg)) => {
                        if matches!(msg.as_ref(), Message::AuthRequest(_)) {
                            return Ok(());
                        }
                    }
                    Some(StreamEvent::Error(err)) => return Err((*err).clone_display()),
                    None => return Err(EslError::Cancelled),
                }
            }
        })
        .await;

        match greeting {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                return Err(EslError::InboundConnectionFailed {
                    reason: InboundFailureReason::TransportError,
                    message: err.to_string(),
                    endpoint,
                })
            }
            Err(_elapsed) => {
                return Err(EslError::InboundConnectionFailed {
                    reason: InboundFailureReason::Timeout,
                    message: "no auth/request greeting within the connect timeout".to_string(),
                    endpoint,
                })
            }
        }

        let reply = connection.pipeline().send_command(&format!("auth {password}")).await.map_err(|err| {
            EslError::InboundConnectionFailed {
                reason: InboundFailureReason::TransportError,
                message: err.to_string(),
                endpoint: endpoint.clone(),
            }
        })?;

        if !reply.success() {
            return Err(EslError::InboundConnectionFailed {
                reason: InboundFailureReason::InvalidPassword,
                message: reply.error_message().unwrap_or_else(|| "authentication rejected".to_string()),
                endpoint,
            });
        }

        Ok(connection)
    }
}

fn wrap_transport_failure(err: EslError, endpoint: &str) -> EslError {
    match err {
        already @ EslError::InboundConnectionFailed { .. } => already,
        other => EslError::InboundConnectionFailed {
            reason: InboundFailureReason::TransportError,
            message: other.to_string(),
            endpoint: endpoint.to_string(),
        },
    }
}

/// [`EslError`] doesn't implement `Clone` (it wraps `std::io::Error`,
/// which doesn't either) but the greeting wait needs to move an owned
/// error out of an `Arc<EslError>` borrow; render it to a string instead
/// of attempting a real clone.
trait ClonableDisplay {
    fn clone_display(&self) -> EslError;
}

impl ClonableDisplay for EslError {
    fn clone_display(&self) -> EslError {
        EslError::MessageReceiverFatal(self.to_string())
    }
}
