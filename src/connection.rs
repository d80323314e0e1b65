//! The connection facade: wires the transport, message stream, command
//! pipeline, event router, and application executor (C2–C6) into the
//! single handle both inbound and outbound modes hand to callers.

use crate::application::{ApplicationExecutor, ExecuteOptions};
use crate::command::CommandPipeline;
use crate::config::ConnectionConfig;
use crate::error::Result;
use crate::events::{EventRouter, EventStream};
use crate::message::{ApiResponse, CommandReply, EventMessage};
use crate::stream::{MessageStream, Subscription};
use crate::transport::Transport;
use std::sync::Arc;
use tokio::net::TcpStream;

/// A live ESL connection, in either inbound or outbound mode.
pub struct Connection {
    transport: Arc<Transport>,
    stream: Arc<MessageStream>,
    pipeline: Arc<CommandPipeline>,
    events: Arc<EventRouter>,
    executor: ApplicationExecutor,
}

impl Connection {
    /// Builds the full C2–C6 stack over an already-established TCP
    /// socket. Used by both [`crate::inbound::InboundSocket`] (after
    /// dialing out) and [`crate::outbound::OutboundListener`] (after
    /// accepting).
    pub(crate) fn from_tcp_stream(tcp: TcpStream, config: ConnectionConfig) -> Self {
        let transport = Arc::new(Transport::new(tcp));
        let reader = transport.take_reader().expect("reader taken exactly once at construction");
        let stream = Arc::new(MessageStream::spawn(reader, transport.clone()));
        let pipeline = Arc::new(CommandPipeline::new(transport.clone(), stream.clone(), config));
        let events = Arc::new(EventRouter::new(pipeline.clone(), stream.clone()));
        let executor = ApplicationExecutor::new(pipeline.clone(), events.clone());
        Self { transport, stream, pipeline, events, executor }
    }

    pub(crate) fn stream(&self) -> &MessageStream {
        &self.stream
    }

    pub(crate) fn pipeline(&self) -> &Arc<CommandPipeline> {
        &self.pipeline
    }

    /// `false` once the transport has been disposed, whether by an
    /// explicit [`Connection::dispose`] or by the peer disconnecting.
    pub fn is_connected(&self) -> bool {
        !self.transport.is_disposed()
    }

    /// Tears the connection down: the transport is marked disposed, the
    /// reader task stops forwarding, and every pending transaction fails
    /// with `Cancelled`.
    pub fn dispose(&self) {
        self.transport.dispose();
    }

    pub async fn send_api(&self, command: &str) -> Result<ApiResponse> {
        self.pipeline.send_api(command).await
    }

    pub async fn send_command(&self, command: &str) -> Result<CommandReply> {
        self.pipeline.send_command(command).await
    }

    pub async fn execute_application(
        &self,
        uuid: &str,
        application: &str,
        options: ExecuteOptions,
    ) -> Result<Option<EventMessage>> {
        self.executor.execute(uuid, application, options).await
    }

    pub async fn bridge(&self, uuid: &str, destination: &str) -> Result<Option<EventMessage>> {
        self.executor.bridge(uuid, destination).await
    }

    pub async fn background_job(&self, command: &str, arg: Option<&str>) -> Result<String> {
        self.executor.background_job(command, arg).await
    }

    pub async fn exit(&self) -> Result<()> {
        self.pipeline.exit().await
    }

    pub async fn subscribe_events(&self, names: &[&str]) -> Result<()> {
        self.events.subscribe_events(names).await
    }

    pub async fn subscribe_custom_events(&self, subclasses: &[&str]) -> Result<()> {
        self.events.subscribe_custom_events(subclasses).await
    }

    pub async fn on_hangup(&self, unique_id: &str) -> Option<EventMessage> {
        self.events.on_hangup(unique_id).await
    }

    /// Every framed message, unfiltered.
    pub fn messages(&self) -> Subscription {
        self.stream.subscribe()
    }

    /// Every event message.
    pub fn events(&self) -> EventStream {
        self.events.events()
    }

    /// Event messages scoped to a specific channel (carrying `Unique-ID`).
    pub fn channel_events(&self) -> EventStream {
        self.events.channel_events()
    }
}
