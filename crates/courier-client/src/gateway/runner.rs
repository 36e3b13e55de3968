//! Drives [`GatewayMachine`] over a real WebSocket.
//!
//! One task owns the machine, the socket, and every timer (retry, ping, pong
//! deadline). Callers talk to it through [`ConnectionGateway`]; cancelling the
//! gateway stops the task and with it every pending reconnect.

use std::future::pending;
use std::time::Duration;

use courier_core::events::{ClientEvent, ServerEvent};
use courier_core::{ContactId, CourierError, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::machine::{Action, BackoffPolicy, Enqueued, GatewayMachine, GatewayState, Input, Notice};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const EVENT_CHANNEL_CAPACITY: usize = 256;
const NOTICE_CHANNEL_CAPACITY: usize = 16;

/// Transport and timer settings for a gateway.
#[derive(Clone, Debug)]
pub struct GatewayOptions {
    /// `ws://` or `wss://` endpoint.
    pub url: String,
    /// Reconnect schedule.
    pub backoff: BackoffPolicy,
    /// Outbound events held while not `Active` (`0` = unbounded).
    pub queue_limit: usize,
    /// Ping cadence while `Active`.
    pub ping_interval: Duration,
    /// How long a ping may go unanswered.
    pub pong_timeout: Duration,
    /// Time allowed to open the socket.
    pub connect_timeout: Duration,
}

/// What `authenticate` carries.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    /// Session bearer token.
    pub token: String,
    /// Contact the socket speaks for.
    pub contact_id: ContactId,
}

#[derive(Debug)]
enum Command {
    Connect(Credentials),
    Send(ClientEvent),
    Disconnect,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handle
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running gateway task.
pub struct ConnectionGateway {
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<GatewayState>,
    events: broadcast::Sender<ServerEvent>,
    notices: broadcast::Sender<Notice>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ConnectionGateway {
    /// Spawn the driver task in `Idle`.
    pub fn spawn(options: GatewayOptions) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let (state_tx, state) = watch::channel(GatewayState::Idle);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();

        let driver = Driver {
            machine: GatewayMachine::new(options.backoff, options.queue_limit),
            options,
            credentials: None,
            socket: None,
            retry_at: None,
            next_ping: None,
            pong_deadline: None,
            commands: rx,
            state: state_tx,
            events: events.clone(),
            notices: notices.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(driver.run());

        Self {
            commands,
            state,
            events,
            notices,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Start connecting with `credentials`.
    pub fn connect(&self, credentials: Credentials) -> Result<()> {
        self.command(Command::Connect(credentials))
    }

    /// Send an event now if `Active`, otherwise queue it.
    pub fn send(&self, event: ClientEvent) -> Result<()> {
        self.command(Command::Send(event))
    }

    /// Close the socket and cancel reconnects. The task keeps running.
    pub fn disconnect(&self) -> Result<()> {
        self.command(Command::Disconnect)
    }

    /// Current state.
    pub fn state(&self) -> GatewayState {
        self.state.borrow().clone()
    }

    /// Wait until the state satisfies `predicate`.
    pub async fn wait_for(
        &self,
        predicate: impl FnMut(&GatewayState) -> bool,
    ) -> Result<GatewayState> {
        let mut rx = self.state.clone();
        rx.wait_for(predicate)
            .await
            .map(|state| state.clone())
            .map_err(|_| CourierError::internal("gateway task stopped"))
    }

    /// Server events, including terminal ones.
    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    /// Owner-facing notices.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    /// Stop the task and wait for it.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    fn command(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| CourierError::internal("gateway task stopped"))
    }
}

impl Drop for ConnectionGateway {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Driver
// ─────────────────────────────────────────────────────────────────────────────

struct Driver {
    machine: GatewayMachine,
    options: GatewayOptions,
    credentials: Option<Credentials>,
    socket: Option<Socket>,
    retry_at: Option<Instant>,
    next_ping: Option<Instant>,
    pong_deadline: Option<Instant>,
    commands: mpsc::UnboundedReceiver<Command>,
    state: watch::Sender<GatewayState>,
    events: broadcast::Sender<ServerEvent>,
    notices: broadcast::Sender<Notice>,
    cancel: CancellationToken,
}

async fn at(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn next_frame(
    socket: &mut Option<Socket>,
) -> Option<std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>> {
    match socket {
        Some(socket) => socket.next().await,
        None => pending().await,
    }
}

impl Driver {
    async fn run(mut self) {
        loop {
            tokio::select! {
                biased;
                () = self.cancel.cancelled() => break,
                command = self.commands.recv() => match command {
                    Some(Command::Connect(credentials)) => {
                        self.credentials = Some(credentials);
                        self.apply(Input::Connect).await;
                    }
                    Some(Command::Send(event)) => self.outbound(event).await,
                    Some(Command::Disconnect) => self.apply(Input::Disconnect).await,
                    None => break,
                },
                () = at(self.retry_at) => {
                    self.retry_at = None;
                    self.apply(Input::RetryDue).await;
                }
                () = at(self.pong_deadline) => {
                    warn!("pong not received in time, dropping connection");
                    self.pong_deadline = None;
                    self.apply(Input::TransportLost).await;
                }
                () = at(self.next_ping) => self.ping().await,
                frame = next_frame(&mut self.socket) => self.on_frame(frame).await,
            }
        }

        if let Some(mut socket) = self.socket.take() {
            let _ = socket.close(None).await;
        }
        debug!("gateway task stopped");
    }

    /// Feed `input` and run the resulting actions, including any inputs
    /// they produce.
    async fn apply(&mut self, input: Input) {
        let mut inputs = vec![input];
        while let Some(input) = inputs.pop() {
            for action in self.machine.handle(input) {
                if let Some(next) = self.execute(action).await {
                    inputs.push(next);
                }
            }
            self.publish();
        }
    }

    async fn execute(&mut self, action: Action) -> Option<Input> {
        match action {
            Action::OpenTransport => Some(self.open().await),
            Action::SendAuthenticate => {
                let Some(credentials) = self.credentials.clone() else {
                    return Some(Input::AuthRejected("no credentials".into()));
                };
                let event = ClientEvent::Authenticate {
                    token: credentials.token,
                    contact_id: credentials.contact_id,
                };
                match self.write(&event).await {
                    Ok(()) => None,
                    Err(()) => Some(Input::TransportLost),
                }
            }
            Action::Flush(events) => {
                let mut events = events.into_iter();
                while let Some(event) = events.next() {
                    if self.write(&event).await.is_err() {
                        let mut unsent = vec![event];
                        unsent.extend(events);
                        self.machine.requeue(unsent);
                        return Some(Input::TransportLost);
                    }
                }
                Some(Input::Flushed)
            }
            Action::ScheduleRetry(delay) => {
                info!(
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    attempt = self.machine.attempt(),
                    "reconnect scheduled"
                );
                self.retry_at = Some(Instant::now() + delay);
                None
            }
            Action::CloseTransport => {
                self.retry_at = None;
                if let Some(mut socket) = self.socket.take() {
                    let _ = socket.close(None).await;
                }
                None
            }
            Action::Notify(notice) => {
                info!(?notice, "gateway notice");
                let _ = self.notices.send(notice);
                None
            }
        }
    }

    async fn open(&mut self) -> Input {
        let url = self.options.url.clone();
        let connect = tokio::time::timeout(
            self.options.connect_timeout,
            tokio_tungstenite::connect_async(url.as_str()),
        );
        let outcome = tokio::select! {
            outcome = connect => outcome,
            () = self.cancel.cancelled() => return Input::Disconnect,
        };
        match outcome {
            Ok(Ok((socket, _))) => {
                debug!(url = %url, "socket opened");
                self.socket = Some(socket);
                Input::TransportOpened
            }
            Ok(Err(err)) => {
                debug!(url = %url, error = %err, "connect failed");
                Input::TransportLost
            }
            Err(_) => {
                debug!(url = %url, "connect timed out");
                Input::TransportLost
            }
        }
    }

    /// Mirror the machine state into the watch channel and the ping timers.
    fn publish(&mut self) {
        let state = self.machine.state().clone();
        if state == GatewayState::Active {
            if self.next_ping.is_none() {
                self.next_ping = Some(Instant::now() + self.options.ping_interval);
            }
        } else {
            self.next_ping = None;
            self.pong_deadline = None;
        }
        let _ = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                debug!(from = ?current, to = ?state, "gateway state");
                *current = state;
                true
            }
        });
    }

    async fn outbound(&mut self, event: ClientEvent) {
        match self.machine.enqueue(event) {
            Enqueued::SendNow(event) => {
                if self.write(&event).await.is_err() {
                    self.machine.requeue(vec![event]);
                    self.apply(Input::TransportLost).await;
                }
            }
            Enqueued::Queued => debug!(queued = self.machine.queued(), "event queued"),
            Enqueued::DroppedOldest(dropped) => {
                warn!(dropped = dropped.event_type(), "outbound queue full, dropped oldest");
            }
            Enqueued::Rejected => debug!("gateway closed, event discarded"),
        }
    }

    async fn ping(&mut self) {
        self.next_ping = Some(Instant::now() + self.options.ping_interval);
        if self.write(&ClientEvent::Ping).await.is_err() {
            self.apply(Input::TransportLost).await;
            return;
        }
        if self.pong_deadline.is_none() {
            self.pong_deadline = Some(Instant::now() + self.options.pong_timeout);
        }
    }

    async fn on_frame(
        &mut self,
        frame: Option<std::result::Result<WsMessage, tokio_tungstenite::tungstenite::Error>>,
    ) {
        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => {
                self.socket = None;
                self.apply(Input::TransportLost).await;
                return;
            }
            Some(Ok(_)) => return,
            Some(Err(err)) => {
                debug!(error = %err, "socket read failed");
                self.socket = None;
                self.apply(Input::TransportLost).await;
                return;
            }
        };

        let event = match serde_json::from_str::<ServerEvent>(text.as_str()) {
            Ok(event) => event,
            Err(err) => {
                warn!(error = %err, "ignoring unparseable server frame");
                return;
            }
        };
        let _ = self.events.send(event.clone());

        match event {
            ServerEvent::Authenticated { .. } => self.apply(Input::Authenticated).await,
            ServerEvent::AuthenticationFailed { error } => {
                self.apply(Input::AuthRejected(error)).await;
            }
            ServerEvent::SessionInvalidated { reason } => {
                self.apply(Input::Invalidated(reason)).await;
            }
            ServerEvent::ConnectionReplaced { .. } => self.apply(Input::Replaced).await,
            ServerEvent::Pong => self.pong_deadline = None,
            _ => {}
        }
    }

    async fn write(&mut self, event: &ClientEvent) -> std::result::Result<(), ()> {
        let Some(socket) = self.socket.as_mut() else {
            return Err(());
        };
        let text = match serde_json::to_string(event) {
            Ok(text) => text,
            Err(err) => {
                warn!(error = %err, "failed to encode client event");
                return Ok(());
            }
        };
        socket.send(WsMessage::Text(text.into())).await.map_err(|err| {
            debug!(error = %err, event = event.event_type(), "socket write failed");
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::events::reasons;
    use tokio::net::TcpListener;

    use crate::gateway::machine::CloseReason;

    type ServerSocket = WebSocketStream<TcpStream>;

    async fn listener() -> (TcpListener, String) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        (listener, url)
    }

    fn options(url: String) -> GatewayOptions {
        GatewayOptions {
            url,
            backoff: BackoffPolicy {
                base: Duration::from_millis(20),
                max_attempts: 5,
            },
            queue_limit: 0,
            ping_interval: Duration::from_secs(60),
            pong_timeout: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(2),
        }
    }

    fn creds() -> Credentials {
        Credentials {
            token: "tok".into(),
            contact_id: "alice".into(),
        }
    }

    async fn accept(listener: &TcpListener) -> ServerSocket {
        let (stream, _) = listener.accept().await.unwrap();
        tokio_tungstenite::accept_async(stream).await.unwrap()
    }

    async fn read_event(ws: &mut ServerSocket) -> ClientEvent {
        loop {
            match ws.next().await.unwrap().unwrap() {
                WsMessage::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn push(ws: &mut ServerSocket, event: &ServerEvent) {
        let text = serde_json::to_string(event).unwrap();
        ws.send(WsMessage::Text(text.into())).await.unwrap();
    }

    /// Accept, expect `authenticate`, and confirm it.
    async fn handshake(listener: &TcpListener) -> ServerSocket {
        let mut ws = accept(listener).await;
        assert_eq!(
            read_event(&mut ws).await,
            ClientEvent::Authenticate {
                token: "tok".into(),
                contact_id: "alice".into()
            }
        );
        push(&mut ws, &ServerEvent::Authenticated { contact_id: "alice".into() }).await;
        ws
    }

    fn typing(contact: &str) -> ClientEvent {
        ClientEvent::TypingStart {
            contact_id: contact.into(),
        }
    }

    #[tokio::test]
    async fn queued_events_flush_after_authentication() {
        let (listener, url) = listener().await;
        let gateway = ConnectionGateway::spawn(options(url));
        gateway.send(typing("bob")).unwrap();
        gateway.send(typing("carol")).unwrap();
        gateway.connect(creds()).unwrap();

        let mut ws = handshake(&listener).await;
        assert_eq!(read_event(&mut ws).await, typing("bob"));
        assert_eq!(read_event(&mut ws).await, typing("carol"));

        gateway.wait_for(|s| *s == GatewayState::Active).await.unwrap();
        gateway.send(typing("dave")).unwrap();
        assert_eq!(read_event(&mut ws).await, typing("dave"));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn reconnects_after_transport_loss() {
        let (listener, url) = listener().await;
        let gateway = ConnectionGateway::spawn(options(url));
        gateway.connect(creds()).unwrap();

        let ws = handshake(&listener).await;
        gateway.wait_for(|s| *s == GatewayState::Active).await.unwrap();
        drop(ws);

        gateway
            .wait_for(|s| *s != GatewayState::Active)
            .await
            .unwrap();
        gateway.send(typing("bob")).unwrap();
        let mut ws = handshake(&listener).await;
        assert_eq!(read_event(&mut ws).await, typing("bob"));
        gateway.wait_for(|s| *s == GatewayState::Active).await.unwrap();
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn missing_pong_forces_reconnect() {
        let (listener, url) = listener().await;
        let mut opts = options(url);
        opts.ping_interval = Duration::from_millis(30);
        opts.pong_timeout = Duration::from_millis(30);
        let gateway = ConnectionGateway::spawn(opts);
        gateway.connect(creds()).unwrap();

        let mut silent = handshake(&listener).await;
        assert_eq!(read_event(&mut silent).await, ClientEvent::Ping);

        // The client gives up on the silent socket and dials again.
        let _second = tokio::time::timeout(Duration::from_secs(5), handshake(&listener))
            .await
            .unwrap();
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn pong_keeps_the_connection() {
        let (listener, url) = listener().await;
        let mut opts = options(url);
        opts.ping_interval = Duration::from_millis(20);
        opts.pong_timeout = Duration::from_millis(200);
        let gateway = ConnectionGateway::spawn(opts);
        gateway.connect(creds()).unwrap();

        let mut ws = handshake(&listener).await;
        for _ in 0..5 {
            assert_eq!(read_event(&mut ws).await, ClientEvent::Ping);
            push(&mut ws, &ServerEvent::Pong).await;
        }
        assert_eq!(gateway.state(), GatewayState::Active);
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn superseded_session_stops_with_notice() {
        let (listener, url) = listener().await;
        let gateway = ConnectionGateway::spawn(options(url));
        let mut notices = gateway.notices();
        gateway.connect(creds()).unwrap();

        let mut ws = handshake(&listener).await;
        gateway.wait_for(|s| *s == GatewayState::Active).await.unwrap();
        push(
            &mut ws,
            &ServerEvent::SessionInvalidated {
                reason: reasons::SUPERSEDED.into(),
            },
        )
        .await;

        assert_eq!(notices.recv().await.unwrap(), Notice::SessionSuperseded);
        let state = gateway.wait_for(GatewayState::is_closed).await.unwrap();
        assert_eq!(state, GatewayState::Closed(CloseReason::Superseded));
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let (listener, url) = listener().await;
        let gateway = ConnectionGateway::spawn(options(url));
        let mut notices = gateway.notices();
        gateway.connect(creds()).unwrap();

        let mut ws = accept(&listener).await;
        let _ = read_event(&mut ws).await;
        push(&mut ws, &ServerEvent::AuthenticationFailed { error: "bad token".into() }).await;

        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::AuthInvalid("bad token".into())
        );
        let again = tokio::time::timeout(Duration::from_millis(200), listener.accept()).await;
        assert!(again.is_err(), "client must not redial after auth failure");
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn unreachable_server_gives_up() {
        let (listener, url) = listener().await;
        drop(listener);
        let mut opts = options(url);
        opts.backoff = BackoffPolicy {
            base: Duration::from_millis(5),
            max_attempts: 3,
        };
        let gateway = ConnectionGateway::spawn(opts);
        let mut notices = gateway.notices();
        gateway.connect(creds()).unwrap();

        assert_eq!(
            notices.recv().await.unwrap(),
            Notice::GaveUp { attempts: 3 }
        );
        gateway.shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_cancels_pending_reconnect() {
        let (listener, url) = listener().await;
        let mut opts = options(url);
        opts.backoff.base = Duration::from_millis(100);
        let gateway = ConnectionGateway::spawn(opts);
        gateway.connect(creds()).unwrap();

        let ws = handshake(&listener).await;
        gateway.wait_for(|s| *s == GatewayState::Active).await.unwrap();
        drop(ws);
        gateway
            .wait_for(|s| matches!(s, GatewayState::Reconnecting { .. }))
            .await
            .unwrap();
        gateway.disconnect().unwrap();
        gateway.wait_for(GatewayState::is_closed).await.unwrap();

        let again = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
        assert!(again.is_err(), "no redial after disconnect");
        gateway.shutdown().await;
    }
}
