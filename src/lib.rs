//! A FreeSWITCH Event Socket Layer (ESL) client.
//!
//! Supports both of ESL's connection modes:
//! - **Inbound**: dial FreeSWITCH and authenticate ([`InboundSocket`]).
//! - **Outbound**: let FreeSWITCH dial in, one connection per call leg
//!   ([`OutboundListener`]).
//!
//! Both modes converge on the same [`Connection`] handle once
//! established, built from a frame parser, a command pipeline that
//! serializes and correlates replies, an event router with monotonic
//! subscriptions, and an application executor for dialplan app execution.

mod application;
mod command;
mod config;
mod connection;
mod error;
mod events;
mod frame;
mod inbound;
mod message;
mod outbound;
mod stream;
mod transport;

pub use application::ExecuteOptions;
pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{EslError, InboundFailureReason, Result};
pub use events::EventStream;
pub use frame::{Frame, Framer};
pub use inbound::InboundSocket;
pub use message::{ApiResponse, BackgroundJobResult, CommandReply, EventMessage, EventName, Message};
pub use outbound::{OutboundListener, OutboundSession, SessionStream};
pub use stream::{StreamEvent, Subscription};
