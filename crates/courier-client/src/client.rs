//! The client façade.
//!
//! [`ChatClient`] owns one logged-in session at a time: the local cache, the
//! delivery pipeline, the gateway, and the background tasks that feed pushes
//! and polls into the cache. Logging out or shutting down cancels all of them.

use std::sync::Arc;

use courier_core::crypto::EncryptionLayer;
use courier_core::events::{ClientEvent, ServerEvent};
use courier_core::summary::ChatSummary;
use courier_core::wire::{LoginRequest, LoginResponse};
use courier_core::{
    ClientMessageId, ContactId, CourierError, DeviceId, Message, MessageId, MessageStatus, Result,
    SharedClock, SystemClock,
};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::{ChatApi, HttpChatApi};
use crate::config::ClientConfig;
use crate::delivery::{DeliveryOptions, DeliveryPipeline, PollReport};
use crate::gateway::{ConnectionGateway, Credentials, GatewayOptions, GatewayState, Notice};
use crate::store::{Profile, ReconciliationStore, StoreOptions};
use crate::typing::TypingTracker;

const NOTICE_CAPACITY: usize = 32;

/// Cache path that keeps everything in memory.
pub const IN_MEMORY_CACHE: &str = ":memory:";

struct Session {
    profile: Profile,
    store: Arc<ReconciliationStore>,
    pipeline: Arc<DeliveryPipeline>,
    gateway: Arc<ConnectionGateway>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// One user's messaging client.
pub struct ChatClient {
    config: ClientConfig,
    api: Arc<dyn ChatApi>,
    clock: SharedClock,
    encryption: Option<EncryptionLayer>,
    typing: Arc<TypingTracker>,
    notices: broadcast::Sender<Notice>,
    session: Mutex<Option<Session>>,
}

impl ChatClient {
    /// Client talking HTTP to `config.server_url`.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let api = HttpChatApi::new(config.server_url.clone(), config.request_timeout)?;
        Ok(Self::with_api(config, Arc::new(api)))
    }

    /// Client over any [`ChatApi`].
    pub fn with_api(config: ClientConfig, api: Arc<dyn ChatApi>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            typing: Arc::new(TypingTracker::new(config.typing_timeout)),
            config,
            api,
            clock: Arc::new(SystemClock),
            encryption: None,
            notices,
            session: Mutex::new(None),
        }
    }

    /// Replace the clock used for timestamps and cache TTLs.
    #[must_use]
    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    /// Encryptor for message bodies. Used only while
    /// `encryption_enabled` is set in the config.
    #[must_use]
    pub fn with_encryption(mut self, layer: EncryptionLayer) -> Self {
        self.encryption = Some(layer);
        self
    }

    /// Owner-facing notices: superseded, credential rejected, gave up.
    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Session lifecycle
    // ─────────────────────────────────────────────────────────────────────

    /// Log in, open the local cache, and start the gateway and poller.
    /// Any previous session on this client is shut down first.
    #[instrument(skip_all, fields(contact_id = %contact_id))]
    pub async fn login(
        &self,
        id_token: &str,
        contact_id: ContactId,
        device_id: DeviceId,
    ) -> Result<LoginResponse> {
        self.shutdown().await;
        let encryption = match (self.config.encryption_enabled, &self.encryption) {
            (true, None) => {
                return Err(CourierError::validation(
                    "encryption is enabled but no encryptor is configured",
                ));
            }
            (true, Some(layer)) => Some(layer.clone()),
            (false, _) => None,
        };

        let response = self
            .api
            .login(LoginRequest {
                id_token: id_token.to_owned(),
                contact_id: contact_id.clone(),
                device_id: device_id.clone(),
            })
            .await?;
        let profile = Profile {
            account_id: response.account_id.clone(),
            contact_id: response.contact_id.clone(),
            device_id,
        };

        let store = Arc::new(self.open_store(&profile.contact_id)?);
        store.put_profile(&profile)?;

        let mut pipeline = DeliveryPipeline::new(
            Arc::clone(&self.api),
            Arc::clone(&store),
            Arc::clone(&self.clock),
            DeliveryOptions::from_config(&self.config),
        );
        if let Some(layer) = encryption {
            pipeline = pipeline.with_encryption(layer);
        }
        let pipeline = Arc::new(pipeline);

        let gateway = Arc::new(ConnectionGateway::spawn(GatewayOptions {
            url: self.config.ws_url(),
            backoff: self.config.backoff,
            queue_limit: self.config.outbound_queue_limit,
            ping_interval: self.config.ping_interval,
            pong_timeout: self.config.pong_timeout,
            connect_timeout: self.config.connect_timeout,
        }));

        let cancel = CancellationToken::new();
        let tasks = vec![
            spawn_event_pump(
                gateway.subscribe(),
                Arc::clone(&pipeline),
                Arc::clone(&self.typing),
                cancel.clone(),
            ),
            spawn_notice_forwarder(gateway.notices(), self.notices.clone(), cancel.clone()),
            Arc::clone(&pipeline).spawn_poller(
                self.config.poll_interval,
                cancel.clone(),
                Some(self.notices.clone()),
            ),
        ];

        gateway.connect(Credentials {
            token: id_token.to_owned(),
            contact_id: profile.contact_id.clone(),
        })?;

        info!(account_id = %profile.account_id, "logged in");
        *self.session.lock() = Some(Session {
            profile,
            store,
            pipeline,
            gateway,
            cancel,
            tasks,
        });
        Ok(response)
    }

    fn open_store(&self, owner: &ContactId) -> Result<ReconciliationStore> {
        let options = StoreOptions::from_config(&self.config);
        let clock = Arc::clone(&self.clock);
        let store = if self.config.cache_path == IN_MEMORY_CACHE {
            ReconciliationStore::in_memory(owner.clone(), options, clock)?
        } else {
            ReconciliationStore::open(&self.config.cache_path, owner.clone(), options, clock)?
        };
        if store.profile().is_some_and(|p| &p.contact_id != owner) {
            info!("cache belongs to another contact, clearing");
            store.clear()?;
        }
        Ok(store)
    }

    /// End the session on the server, stop every background task, and wipe
    /// the local cache.
    #[instrument(skip_all)]
    pub async fn logout(&self) -> Result<()> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };
        if let Err(err) = self.api.logout().await {
            warn!(error = %err, "server logout failed, clearing locally anyway");
        }
        let store = Arc::clone(&session.store);
        stop(session).await;
        self.typing.clear();
        store.clear()?;
        info!("logged out");
        Ok(())
    }

    /// Stop every background task, keeping the cache for the next login.
    pub async fn shutdown(&self) {
        let session = self.session.lock().take();
        if let Some(session) = session {
            stop(session).await;
            self.typing.clear();
            debug!("session stopped");
        }
    }

    fn with_session<T>(&self, f: impl FnOnce(&Session) -> T) -> Result<T> {
        self.session
            .lock()
            .as_ref()
            .map(f)
            .ok_or_else(|| CourierError::auth_invalid("not logged in"))
    }

    fn pipeline(&self) -> Result<Arc<DeliveryPipeline>> {
        self.with_session(|s| Arc::clone(&s.pipeline))
    }

    fn gateway(&self) -> Result<Arc<ConnectionGateway>> {
        self.with_session(|s| Arc::clone(&s.gateway))
    }

    fn store(&self) -> Result<Arc<ReconciliationStore>> {
        self.with_session(|s| Arc::clone(&s.store))
    }

    /// Profile of the logged-in user.
    pub fn profile(&self) -> Option<Profile> {
        self.with_session(|s| s.profile.clone()).ok()
    }

    /// Gateway state, `Idle` when logged out.
    pub fn gateway_state(&self) -> GatewayState {
        self.gateway().map_or(GatewayState::Idle, |g| g.state())
    }

    /// Wait until the gateway state satisfies `predicate`.
    pub async fn wait_for_gateway(
        &self,
        predicate: impl FnMut(&GatewayState) -> bool,
    ) -> Result<GatewayState> {
        self.gateway()?.wait_for(predicate).await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Messaging
    // ─────────────────────────────────────────────────────────────────────

    /// Send and wait for the server's answer.
    pub async fn send(&self, recipient: &ContactId, content: &str) -> Result<Message> {
        self.pipeline()?.send(recipient, content).await
    }

    /// Send without waiting; returns the optimistic copy.
    pub fn send_detached(&self, recipient: &ContactId, content: &str) -> Result<Message> {
        let (message, _) = self.pipeline()?.send_detached(recipient, content)?;
        Ok(message)
    }

    /// Resubmit a failed message.
    pub async fn resubmit(
        &self,
        counterpart: &ContactId,
        client_id: &ClientMessageId,
    ) -> Result<Message> {
        self.pipeline()?.resubmit(counterpart, client_id).await
    }

    /// Acknowledge receipt.
    pub async fn mark_delivered(&self, id: &MessageId) -> Result<MessageStatus> {
        self.pipeline()?.mark_delivered(id).await
    }

    /// Acknowledge reading.
    pub async fn mark_read(&self, id: &MessageId) -> Result<MessageStatus> {
        self.pipeline()?.mark_read(id).await
    }

    /// Poll now instead of waiting for the next tick.
    pub async fn refresh(&self) -> Result<PollReport> {
        self.pipeline()?.poll_once().await
    }

    /// Cached messages of one chat, oldest first.
    pub fn messages(&self, counterpart: &ContactId) -> Result<Vec<Message>> {
        Ok(self.store()?.messages(counterpart))
    }

    /// Chat list, most recent first.
    pub fn chat_summaries(&self) -> Result<Vec<ChatSummary>> {
        Ok(self.store()?.chat_summaries())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Presence and typing
    // ─────────────────────────────────────────────────────────────────────

    /// Ask the server whether `contact` is online, and remember the answer.
    pub async fn presence(&self, contact: &ContactId) -> Result<bool> {
        let online = self.api.presence(contact).await?;
        self.store()?.set_presence(contact, online);
        Ok(online)
    }

    /// Last known presence of `contact`.
    pub fn is_online(&self, contact: &ContactId) -> bool {
        self.store().is_ok_and(|s| s.is_online(contact))
    }

    /// Tell `target` we started typing. Queued while reconnecting.
    pub fn start_typing(&self, target: &ContactId) -> Result<()> {
        self.gateway()?.send(ClientEvent::TypingStart {
            contact_id: target.clone(),
        })
    }

    /// Tell `target` we stopped typing.
    pub fn stop_typing(&self, target: &ContactId) -> Result<()> {
        self.gateway()?.send(ClientEvent::TypingStop {
            contact_id: target.clone(),
        })
    }

    /// Whether `contact` is typing to us.
    pub fn is_typing(&self, contact: &ContactId) -> bool {
        self.typing.is_typing(contact)
    }

    /// Everyone typing to us.
    pub fn typing(&self) -> Vec<ContactId> {
        self.typing.typing()
    }
}

async fn stop(session: Session) {
    session.cancel.cancel();
    let _ = session.gateway.disconnect();
    session.gateway.shutdown().await;
    for task in session.tasks {
        let _ = task.await;
    }
}

/// Route pushed events into the cache and typing tracker. A fresh
/// `authenticated` (first connect or reconnect) triggers a catch-up poll.
fn spawn_event_pump(
    mut events: broadcast::Receiver<ServerEvent>,
    pipeline: Arc<DeliveryPipeline>,
    typing: Arc<TypingTracker>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                () = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(ServerEvent::Authenticated { .. }) => {
                    if let Err(err) = pipeline.poll_once().await {
                        debug!(error = %err, "catch-up poll failed");
                    }
                }
                Ok(event) => {
                    let _ = typing.apply(&event);
                    if let Err(err) = pipeline.apply_event(&event).await {
                        warn!(event = event.event_type(), error = %err, "failed to apply pushed event");
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "event pump lagged, polling to catch up");
                    let _ = pipeline.poll_once().await;
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

/// Re-publish gateway notices; a terminal authorization notice also stops
/// the session's background work.
fn spawn_notice_forwarder(
    mut notices: broadcast::Receiver<Notice>,
    out: broadcast::Sender<Notice>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let notice = tokio::select! {
                () = cancel.cancelled() => break,
                notice = notices.recv() => notice,
            };
            match notice {
                Ok(notice) => {
                    let terminal =
                        matches!(notice, Notice::SessionSuperseded | Notice::AuthInvalid(_));
                    let _ = out.send(notice);
                    if terminal {
                        cancel.cancel();
                        break;
                    }
                }
                Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
