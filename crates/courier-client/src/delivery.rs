//! Client delivery pipeline.
//!
//! Outgoing messages are written to the local cache in `sending` before the
//! network call starts, then rewritten to `sent` (with the server id) or
//! `failed`. Incoming data arrives on two independent paths (socket pushes
//! through [`DeliveryPipeline::apply_event`] and the poller through
//! [`DeliveryPipeline::poll_once`]) and both go through the same merge, so
//! whichever lands first wins and the other is absorbed as a duplicate.

use std::sync::Arc;
use std::time::Duration;

use courier_core::crypto::EncryptionLayer;
use courier_core::events::ServerEvent;
use courier_core::validation::{validate_content, validate_identifier};
use courier_core::wire::{SendRequest, SendResponse};
use courier_core::{
    ClientMessageId, ContactId, CourierError, Message, MessageId, MessageStatus, Result,
    SharedClock,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::ChatApi;
use crate::config::ClientConfig;
use crate::gateway::{BackoffPolicy, Notice};
use crate::store::ReconciliationStore;

/// Pipeline policy.
#[derive(Clone, Copy, Debug)]
pub struct DeliveryOptions {
    /// Upper bound on message length, in characters.
    pub max_content_chars: usize,
    /// Acknowledge incoming messages as delivered when they arrive.
    pub auto_ack_delivered: bool,
    /// Automatic retries of a send that failed in transport.
    pub retry: BackoffPolicy,
    /// Page size used by the poller; `None` takes the server default.
    pub page_limit: Option<usize>,
}

impl Default for DeliveryOptions {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl DeliveryOptions {
    /// Take delivery policy from client config.
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            max_content_chars: config.max_content_chars,
            auto_ack_delivered: config.auto_ack_delivered,
            retry: BackoffPolicy {
                base: Duration::from_millis(500),
                max_attempts: 2,
            },
            page_limit: None,
        }
    }
}

/// What one poll cycle did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PollReport {
    /// Conversations listed by the server.
    pub conversations: usize,
    /// Messages new to the local cache.
    pub inserted: usize,
    /// Local messages advanced.
    pub updated: usize,
    /// Delivery receipts sent.
    pub acknowledged: usize,
    /// Message pages fetched across all conversations.
    pub pages: usize,
}

/// Moves messages between the UI, the server, and the local cache.
pub struct DeliveryPipeline {
    api: Arc<dyn ChatApi>,
    store: Arc<ReconciliationStore>,
    clock: SharedClock,
    encryption: Option<EncryptionLayer>,
    options: DeliveryOptions,
}

impl DeliveryPipeline {
    /// Assemble a pipeline.
    pub fn new(
        api: Arc<dyn ChatApi>,
        store: Arc<ReconciliationStore>,
        clock: SharedClock,
        options: DeliveryOptions,
    ) -> Self {
        Self {
            api,
            store,
            clock,
            encryption: None,
            options,
        }
    }

    /// Seal outgoing and open incoming bodies with `layer`.
    #[must_use]
    pub fn with_encryption(mut self, layer: EncryptionLayer) -> Self {
        self.encryption = Some(layer);
        self
    }

    /// The cache this pipeline writes to.
    pub fn store(&self) -> &Arc<ReconciliationStore> {
        &self.store
    }

    fn owner(&self) -> &ContactId {
        self.store.owner()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Outgoing
    // ─────────────────────────────────────────────────────────────────────

    /// Validate, write optimistically, and send. Resolves once the server
    /// answered (or retries ran out); the local copy is `sent` or `failed`.
    #[instrument(skip_all, fields(recipient = %recipient))]
    pub async fn send(&self, recipient: &ContactId, content: &str) -> Result<Message> {
        let message = self.prepare(recipient, content)?;
        self.submit(message).await
    }

    /// Like [`send`](Self::send), but returns the optimistic copy as soon as
    /// it is written and finishes the network part in the background.
    pub fn send_detached(
        self: &Arc<Self>,
        recipient: &ContactId,
        content: &str,
    ) -> Result<(Message, JoinHandle<Result<Message>>)> {
        let message = self.prepare(recipient, content)?;
        let pipeline = Arc::clone(self);
        let pending = message.clone();
        let handle = tokio::spawn(async move { pipeline.submit(pending).await });
        Ok((message, handle))
    }

    /// Send a `failed` message again under its original client id.
    #[instrument(skip_all, fields(counterpart = %counterpart, client_id = %client_id))]
    pub async fn resubmit(
        &self,
        counterpart: &ContactId,
        client_id: &ClientMessageId,
    ) -> Result<Message> {
        let existing = self
            .store
            .find_by_client_id(counterpart, client_id)
            .ok_or_else(|| CourierError::NotFound(format!("message {client_id}")))?;
        if existing.status != MessageStatus::Failed {
            return Err(CourierError::validation(format!(
                "message {client_id} is {}, only failed messages can be resubmitted",
                existing.status
            )));
        }
        let message = self.store.mark_resending(counterpart, client_id)?;
        self.submit(message).await
    }

    /// Synchronous half of a send: checks and the optimistic write.
    fn prepare(&self, recipient: &ContactId, content: &str) -> Result<Message> {
        validate_identifier("recipientContactId", recipient)?;
        let body = validate_content(content, self.options.max_content_chars)?;
        let message = Message::outgoing(
            self.owner().clone(),
            recipient.clone(),
            body,
            ClientMessageId::new(),
            self.clock.now(),
        );
        self.store.record_local(&message)?;
        Ok(message)
    }

    /// Network half of a send. `message` is already in the cache as `sending`.
    async fn submit(&self, message: Message) -> Result<Message> {
        let recipient = message.recipient_contact_id.clone();
        let Some(client_id) = message.client_id.clone() else {
            return Err(CourierError::internal("outgoing message without client id"));
        };

        let result = self.send_with_retry(&message).await;
        match result {
            Ok(response) => {
                self.store.set_presence(&recipient, response.recipient_online);
                let stored = self.store.confirm_sent(
                    &recipient,
                    &client_id,
                    response.message_id,
                    response.created_at,
                )?;
                info!(
                    client_id = %client_id,
                    message_id = ?stored.id,
                    recipient_online = response.recipient_online,
                    "message sent"
                );
                Ok(stored)
            }
            Err(err) => {
                warn!(client_id = %client_id, error = %err, "send failed");
                let _ = self.store.mark_failed(&recipient, &client_id)?;
                Err(err)
            }
        }
    }

    async fn send_with_retry(
        &self,
        message: &Message,
    ) -> Result<SendResponse> {
        let content = match &self.encryption {
            Some(layer) => layer.seal(&message.recipient_contact_id, &message.content)?,
            None => message.content.clone(),
        };
        let request = SendRequest {
            recipient_contact_id: message.recipient_contact_id.clone(),
            content,
            client_id: message.client_id.clone(),
        };

        let mut attempt = 0;
        loop {
            match self.api.send(request.clone()).await {
                Ok(response) => return Ok(response),
                Err(err) if err.is_retryable() => {
                    attempt += 1;
                    let Some(mut delay) = self.options.retry.delay(attempt) else {
                        return Err(err);
                    };
                    if let CourierError::RateLimited { retry_after_ms } = err {
                        delay = delay.max(Duration::from_millis(retry_after_ms));
                    }
                    debug!(
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %err,
                        "retrying send"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Receipts
    // ─────────────────────────────────────────────────────────────────────

    /// Acknowledge receipt of an incoming message.
    pub async fn mark_delivered(&self, id: &MessageId) -> Result<MessageStatus> {
        let receipt = self.api.mark_delivered(id).await?;
        let _ = self.store.set_status(&receipt.message_id, receipt.status)?;
        Ok(receipt.status)
    }

    /// Acknowledge reading an incoming message.
    pub async fn mark_read(&self, id: &MessageId) -> Result<MessageStatus> {
        let receipt = self.api.mark_read(id).await?;
        let _ = self.store.set_status(&receipt.message_id, receipt.status)?;
        Ok(receipt.status)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Incoming
    // ─────────────────────────────────────────────────────────────────────

    /// Fold one pushed event into the cache.
    pub async fn apply_event(&self, event: &ServerEvent) -> Result<()> {
        match event {
            ServerEvent::NewMessage(message) => {
                let message = self.prepare_remote(message.clone());
                let counterpart = message.counterpart(self.owner()).clone();
                let outcome = self.store.merge_remote(&counterpart, std::slice::from_ref(&message))?;
                debug!(counterpart = %counterpart, inserted = outcome.inserted, "pushed message merged");
                let _ = self.acknowledge(&message).await;
            }
            ServerEvent::StatusChanged {
                message_id, status, ..
            } => {
                let _ = self.store.set_status(message_id, *status)?;
            }
            ServerEvent::UserOnline { contact_id } => self.store.set_presence(contact_id, true),
            ServerEvent::UserOffline { contact_id } => self.store.set_presence(contact_id, false),
            _ => {}
        }
        Ok(())
    }

    /// One pass of the polling path: list conversations, fetch each, merge.
    #[instrument(skip_all)]
    pub async fn poll_once(&self) -> Result<PollReport> {
        let conversations = self.api.list_conversations().await?;
        let mut report = PollReport {
            conversations: conversations.len(),
            ..PollReport::default()
        };

        for entry in conversations {
            self.sync_conversation(&entry.counterpart_id, &mut report).await?;
        }

        debug!(
            conversations = report.conversations,
            inserted = report.inserted,
            updated = report.updated,
            pages = report.pages,
            "poll complete"
        );
        Ok(report)
    }

    /// Fetch pages of one conversation, newest first, merging each.
    ///
    /// Walks backwards while the server reports older messages and the last
    /// page still brought something new. Stops once the cache starts
    /// evicting, since older pages would not be kept.
    async fn sync_conversation(
        &self,
        counterpart: &ContactId,
        report: &mut PollReport,
    ) -> Result<()> {
        let mut before: Option<MessageId> = None;
        loop {
            let page = self
                .api
                .fetch_messages(counterpart, self.options.page_limit, before.take())
                .await?;
            let messages: Vec<Message> = page
                .messages
                .into_iter()
                .map(|m| self.prepare_remote(m))
                .collect();
            let outcome = self.store.merge_remote(counterpart, &messages)?;
            report.inserted += outcome.inserted;
            report.updated += outcome.updated;
            report.pages += 1;

            for message in &messages {
                if self.acknowledge(message).await {
                    report.acknowledged += 1;
                }
            }

            before = messages.first().and_then(|m| m.id.clone());
            if !page.has_more || outcome.inserted == 0 || outcome.evicted > 0 || before.is_none() {
                return Ok(());
            }
            debug!(counterpart = %counterpart, inserted = outcome.inserted, "fetching older page");
        }
    }

    /// Run [`poll_once`](Self::poll_once) every `interval` until cancelled.
    /// An authorization failure stops the poller and is reported on `notices`.
    pub fn spawn_poller(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
        notices: Option<broadcast::Sender<Notice>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match self.poll_once().await {
                    Ok(_) => {}
                    Err(err) if err.is_auth() => {
                        warn!(error = %err, "poller stopped on authorization failure");
                        if let Some(notices) = &notices {
                            let notice = match err {
                                CourierError::SessionSuperseded => Notice::SessionSuperseded,
                                other => Notice::AuthInvalid(other.to_string()),
                            };
                            let _ = notices.send(notice);
                        }
                        break;
                    }
                    Err(err) => debug!(error = %err, "poll failed, will retry"),
                }
            }
            debug!("poller stopped");
        })
    }

    /// Decrypt incoming bodies, and give our own messages their local
    /// plaintext back so the client-id dedup sees equal content.
    fn prepare_remote(&self, mut message: Message) -> Message {
        let Some(layer) = &self.encryption else {
            return message;
        };
        if message.is_incoming_for(self.owner()) {
            match layer.open(&message.content) {
                Ok(plain) => message.content = plain,
                Err(err) => warn!(message_id = ?message.id, error = %err, "could not decrypt message"),
            }
        } else if let Some(client_id) = &message.client_id {
            let counterpart = message.counterpart(self.owner()).clone();
            if let Some(local) = self.store.find_by_client_id(&counterpart, client_id) {
                message.content = local.content;
            }
        }
        message
    }

    /// Send a delivery receipt for an unacknowledged incoming message.
    /// Best effort; returns whether a receipt went out.
    async fn acknowledge(&self, message: &Message) -> bool {
        if !self.options.auto_ack_delivered
            || !message.is_incoming_for(self.owner())
            || message.status != MessageStatus::Sent
        {
            return false;
        }
        let Some(id) = &message.id else {
            return false;
        };
        match self.mark_delivered(id).await {
            Ok(_) => true,
            Err(err) => {
                debug!(message_id = %id, error = %err, "delivery receipt failed");
                false
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
