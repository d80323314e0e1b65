//! Runs a dialplan application on a channel and resolves when FreeSWITCH
//! reports it finished.

use crate::command::CommandPipeline;
use crate::error::Result;
use crate::events::{wait_for, EventRouter};
use crate::message::{EventMessage, EventName};
use std::sync::Arc;
use uuid::Uuid;

/// Optional knobs for [`ApplicationExecutor::execute`].
#[derive(Debug, Clone, Default)]
pub struct ExecuteOptions {
    pub args: Option<String>,
    pub event_lock: bool,
    pub is_async: bool,
    pub loops: Option<u32>,
}

impl ExecuteOptions {
    pub fn with_args(mut self, args: impl Into<String>) -> Self {
        self.args = Some(args.into());
        self
    }

    pub fn with_event_lock(mut self) -> Self {
        self.event_lock = true;
        self
    }

    pub fn with_async(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn with_loops(mut self, loops: u32) -> Self {
        self.loops = Some(loops);
        self
    }
}

pub struct ApplicationExecutor {
    pipeline: Arc<CommandPipeline>,
    events: Arc<EventRouter>,
}

impl ApplicationExecutor {
    pub fn new(pipeline: Arc<CommandPipeline>, events: Arc<EventRouter>) -> Self {
        Self { pipeline, events }
    }

    /// Run `application` on `uuid`. Resolves to `None` (not an error) if
    /// the `sendmsg` itself is rejected or the connection dies before the
    /// completion event arrives.
    pub async fn execute(
        &self,
        uuid: &str,
        application: &str,
        options: ExecuteOptions,
    ) -> Result<Option<EventMessage>> {
        self.events.subscribe_events(&["CHANNEL_EXECUTE_COMPLETE"]).await?;

        let application_uuid = Uuid::new_v4().to_string();
        // Arm the observer (synchronously subscribes) before writing the
        // command, so the completion event can't race ahead of us.
        let watch = self.events.watch();
        let expected = application_uuid.clone();
        let wait = wait_for(watch, move |event| {
            event.event_name() == EventName::ChannelExecuteComplete
                && event.application_uuid() == Some(expected.as_str())
        });

        let command = build_sendmsg(uuid, &application_uuid, application, &options);
        let reply = self.pipeline.send_command(&command).await?;
        if !reply.success() {
            tracing::debug!(application, reply = reply.reply_text(), "sendmsg execute rejected");
            return Ok(None);
        }

        Ok(wait.await)
    }

    /// `bridge` is `execute("bridge", destination, ...)` with the
    /// execute-complete observer raced against the first of
    /// `CHANNEL_BRIDGE`/`CHANNEL_HANGUP` on the A-leg, since a successful
    /// bridge withholds `CHANNEL_EXECUTE_COMPLETE` until the far end hangs
    /// up. Both observers are armed before the `sendmsg` is written.
    pub async fn bridge(&self, uuid: &str, destination: &str) -> Result<Option<EventMessage>> {
        self.events
            .subscribe_events(&["CHANNEL_EXECUTE_COMPLETE", "CHANNEL_BRIDGE", "CHANNEL_HANGUP"])
            .await?;

        let application_uuid = Uuid::new_v4().to_string();
        let expected = application_uuid.clone();
        let execute_complete_watch = self.events.watch();
        let execute_complete = wait_for(execute_complete_watch, move |event| {
            event.event_name() == EventName::ChannelExecuteComplete
                && event.application_uuid() == Some(expected.as_str())
        });

        let a_leg = uuid.to_string();
        let terminal_watch = self.events.watch();
        let bridge_or_hangup = wait_for(terminal_watch, move |event| {
            matches!(event.event_name(), EventName::ChannelBridge | EventName::ChannelHangup)
                && event.unique_id() == Some(a_leg.as_str())
        });

        let options = ExecuteOptions::default().with_args(destination);
        let command = build_sendmsg(uuid, &application_uuid, "bridge", &options);
        let reply = self.pipeline.send_command(&command).await?;
        if !reply.success() {
            tracing::debug!(reply = reply.reply_text(), "sendmsg bridge rejected");
            return Ok(None);
        }

        tokio::select! {
            event = execute_complete => Ok(event),
            event = bridge_or_hangup => Ok(event),
        }
    }

    /// `bgapi <command> [<arg>]`: fires and forgets, correlating the
    /// eventual result through the `BACKGROUND_JOB` event carrying the
    /// generated `Job-UUID`. Returns the job id immediately; the caller
    /// reads `events()`/`channel_events()` (or uses
    /// [`crate::message::BackgroundJobResult::from_event`]) to pick the
    /// result up later.
    pub async fn background_job(&self, command: &str, arg: Option<&str>) -> Result<String> {
        let job_uuid = Uuid::new_v4().to_string();
        let line = match arg {
            Some(arg) => format!("bgapi {command} {arg}\nJob-UUID: {job_uuid}"),
            None => format!("bgapi {command}\nJob-UUID: {job_uuid}"),
        };
        let reply = self.pipeline.send_command(&line).await?;
        if !reply.success() {
            return Err(crate::error::EslError::ProtocolViolation(format!(
                "bgapi rejected: {}",
                reply.error_message().unwrap_or_default()
            )));
        }
        Ok(job_uuid)
    }
}

/// Builds the `sendmsg` command line, WITHOUT the trailing blank-line
/// terminator — [`CommandPipeline::send_command`] appends that uniformly
/// for every command. A command carrying a body must end exactly at the
/// body's last byte so the terminator it adds becomes the single blank
/// line FreeSWITCH expects, not an extra one.
fn build_sendmsg(uuid: &str, application_uuid: &str, application: &str, options: &ExecuteOptions) -> String {
    let mut lines = vec![
        format!("sendmsg {uuid}"),
        format!("Event-UUID: {application_uuid}"),
        "call-command: execute".to_string(),
        format!("execute-app-name: {application}"),
    ];
    if options.event_lock {
        lines.push("event-lock: true".to_string());
    }
    if let Some(loops) = options.loops {
        lines.push(format!("loops: {loops}"));
    }
    if options.is_async {
        // Spelled exactly as the reference implementation emits it, not
        // FreeSWITCH's documented `async: true` — kept for wire
        // compatibility with deployments already depending on this form.
        lines.push("isAsync: true".to_string());
    }
    let headers = lines.join("\n");
    match &options.args {
        Some(args) => format!("{headers}\ncontent-type: text/plain\ncontent-length: {}\n\n{args}", args.len()),
        None => headers,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::stream::MessageStream;
    use crate::transport::Transport;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = tokio::spawn(async move { TcpStream::connect(addr).await.unwrap() });
        let (server, _) = listener.accept().await.unwrap();
        (server, client.await.unwrap())
    }

    fn executor(server: TcpStream) -> (ApplicationExecutor, Arc<CommandPipeline>) {
        let transport = Arc::new(Transport::new(server));
        let reader = transport.take_reader().unwrap();
        let stream = Arc::new(MessageStream::spawn(reader, transport.clone()));
        let pipeline = Arc::new(CommandPipeline::new(transport.clone(), stream.clone(), ConnectionConfig::default()));
        let router = Arc::new(EventRouter::new(pipeline.clone(), stream));
        (ApplicationExecutor::new(pipeline.clone(), router), pipeline)
    }

    #[tokio::test]
    async fn execute_resolves_with_completion_event() {
        let (server, mut peer) = connected_pair().await;
        let (exec, _pipeline) = executor(server);

        let peer_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            // event plain CHANNEL_EXECUTE_COMPLETE
            let n = peer.read(&mut buf).await.unwrap();
            assert_eq!(&buf[..n], b"event plain CHANNEL_EXECUTE_COMPLETE\n\n");
            peer.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();

            let n = peer.read(&mut buf).await.unwrap();
            let sent = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(sent.starts_with("sendmsg UUID\n"));
            assert!(sent.contains("execute-app-name: playback\n"));
            assert!(sent.contains("content-length: 8\n\nfile.wav\n"));

            let app_uuid = sent
                .lines()
                .find(|l| l.starts_with("Event-UUID: "))
                .unwrap()
                .trim_start_matches("Event-UUID: ")
                .to_string();

            peer.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();

            // Event fields live in the Content-Length-framed body, not the
            // wrapping frame's own headers — this is the real FreeSWITCH
            // wire shape for `text/event-plain`.
            let body = format!(
                "Event-Name: CHANNEL_EXECUTE_COMPLETE\nApplication-UUID: {app_uuid}\nUnique-ID: UUID\nApplication-Response: FILE PLAYED\n"
            );
            let event = format!("Content-Type: text/event-plain\nContent-Length: {}\n\n{}", body.len(), body);
            peer.write_all(event.as_bytes()).await.unwrap();
        });

        let result = exec
            .execute("UUID", "playback", ExecuteOptions::default().with_args("file.wav"))
            .await
            .unwrap();
        let event = result.expect("execute-complete should resolve");
        assert_eq!(event.header("Application-Response"), Some("FILE PLAYED"));
        peer_task.await.unwrap();
    }

    #[tokio::test]
    async fn execute_returns_none_when_sendmsg_rejected() {
        let (server, mut peer) = connected_pair().await;
        let (exec, _pipeline) = executor(server);

        let peer_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(b"Content-Type: command/reply\nReply-Text: +OK\n\n").await.unwrap();
            let _ = peer.read(&mut buf).await.unwrap();
            peer.write_all(b"Content-Type: command/reply\nReply-Text: -ERR NO_CHANNEL\n\n").await.unwrap();
        });

        let result = exec.execute("UUID", "playback", ExecuteOptions::default()).await.unwrap();
        assert!(result.is_none());
        peer_task.await.unwrap();
    }
}
