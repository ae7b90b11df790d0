//! Ingest and fan-out of chat messages.
//!
//! A submission is validated, resolved to its chat, persisted, and only then
//! pushed to the recipient's live connections (and the sender's other
//! devices). Fan-out is best effort per connection: a failed delivery tears
//! down that one connection and never fails the send.

use crate::{
    config::Config,
    entity::{User, UserId, UserInfo},
    error::{ChatError, Result},
    protocol::{OutboundMessage, Recipient, SendMessage, ServerEvent},
    registry::{ConnectionHandle, ConnectionId, ConnectionRegistry, Frame},
    resolver::ChatResolver,
    store::Store,
};
use futures::future::join_all;
use std::{sync::Arc, time::Duration};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub send_timeout: Duration,
    pub max_message_len: usize,
    pub echo_to_sender: bool,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            send_timeout: config.send_timeout,
            max_message_len: config.max_message_len,
            echo_to_sender: config.echo_to_sender,
        }
    }
}

/// Outcome of fanning one message out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FanoutReport {
    pub delivered: usize,
    pub failed: Vec<ConnectionId>,
}

/// A successfully persisted message and what happened to its live deliveries.
#[derive(Debug, Clone)]
pub struct Delivered {
    pub message: OutboundMessage,
    pub frame: Frame,
    pub report: FanoutReport,
}

pub struct Pipeline {
    store: Store,
    resolver: ChatResolver,
    registry: Arc<ConnectionRegistry>,
    settings: PipelineSettings,
}

impl Pipeline {
    pub fn new(
        store: Store,
        registry: Arc<ConnectionRegistry>,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            resolver: ChatResolver::new(store.clone()),
            store,
            registry,
            settings,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Process one inbound text frame from `origin`.
    ///
    /// The originating connection receives either the persisted message as
    /// confirmation or an error frame; errors never close it.
    pub async fn handle_frame(
        &self,
        sender: &UserInfo,
        origin: &ConnectionHandle,
        text: &str,
    ) -> Result<FanoutReport> {
        let outcome = match SendMessage::decode(text) {
            Ok(request) => self.submit(sender, request, Some(origin.id())).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(delivered) => {
                debug!(message_id = %delivered.message.id, conn = %origin.id(), "confirming to origin");
                self.push(origin, delivered.frame.clone()).await;
                Ok(delivered.report)
            }
            Err(err) => {
                self.report_error(origin, &err).await;
                Err(err)
            }
        }
    }

    /// Send an error frame to `origin`.
    pub async fn report_error(&self, origin: &ConnectionHandle, err: &ChatError) {
        warn!(conn = %origin.id(), kind = err.kind(), error = %err, "rejected frame");
        match ServerEvent::error(err).to_frame() {
            Ok(frame) => self.push(origin, frame).await,
            Err(e) => warn!(error = %e, "failed to encode error frame"),
        }
    }

    /// Validate, resolve, persist, fan out.
    ///
    /// `origin` is excluded from the sender echo; it is confirmed separately.
    pub async fn submit(
        &self,
        sender: &UserInfo,
        request: SendMessage,
        origin: Option<ConnectionId>,
    ) -> Result<Delivered> {
        let content = self.validate_content(&request.content)?;
        let recipient = self.find_recipient(request.recipient()?).await?;
        if recipient.id == sender.id {
            return Err(ChatError::validation("cannot send a message to yourself"));
        }

        let chat = self.resolver.get_or_create(sender.id, recipient.id).await?;
        let message = self.store.create_message(chat.id, sender.id, content).await?;
        debug!(message_id = %message.id, chat_id = %chat.id, "message persisted");

        let outbound = OutboundMessage::new(&message, sender.clone(), recipient.id);
        let frame = ServerEvent::Message(outbound.clone()).to_frame()?;
        let report = self
            .fan_out(frame.clone(), recipient.id, sender.id, origin)
            .await;

        if !self.registry.contains(recipient.id) {
            debug!(to = %recipient.id, "recipient offline, message kept for history");
        }
        info!(
            message_id = %message.id,
            from = %sender.id,
            to = %recipient.id,
            delivered = report.delivered,
            failed = report.failed.len(),
            "message sent"
        );

        Ok(Delivered {
            message: outbound,
            frame,
            report,
        })
    }

    /// Push `frame` to every live connection of `recipient` and, when echo is
    /// enabled, to the sender's connections other than `origin`.
    pub async fn fan_out(
        &self,
        frame: Frame,
        recipient: UserId,
        sender: UserId,
        origin: Option<ConnectionId>,
    ) -> FanoutReport {
        let mut targets: Vec<(UserId, ConnectionHandle)> = self
            .registry
            .lookup(recipient)
            .into_iter()
            .map(|conn| (recipient, conn))
            .collect();

        if self.settings.echo_to_sender {
            targets.extend(
                self.registry
                    .lookup(sender)
                    .into_iter()
                    .filter(|conn| Some(conn.id()) != origin)
                    .map(|conn| (sender, conn)),
            );
        }

        let timeout = self.settings.send_timeout;
        let results = join_all(targets.iter().map(|(_, conn)| {
            let frame = frame.clone();
            async move { conn.deliver(frame, timeout).await }
        }))
        .await;

        let mut report = FanoutReport::default();
        for ((user, conn), result) in targets.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(%user, conn = %conn.id(), error = %e, "delivery failed, closing connection");
                    conn.close();
                    self.registry.remove(*user, conn.id());
                    report.failed.push(conn.id());
                }
            }
        }
        report
    }

    async fn push(&self, conn: &ConnectionHandle, frame: Frame) {
        if let Err(e) = conn.deliver(frame, self.settings.send_timeout).await {
            warn!(conn = %conn.id(), error = %e, "reply failed, closing connection");
            conn.close();
        }
    }

    fn validate_content<'a>(&self, content: &'a str) -> Result<&'a str> {
        if content.trim().is_empty() {
            return Err(ChatError::validation("message content is empty"));
        }
        let len = content.chars().count();
        if len > self.settings.max_message_len {
            return Err(ChatError::validation(format!(
                "message is {} characters long, the limit is {}",
                len, self.settings.max_message_len
            )));
        }
        Ok(content)
    }

    async fn find_recipient(&self, recipient: Recipient) -> Result<User> {
        match recipient {
            Recipient::Id(id) => self.store.get_user_by_id(id).await,
            Recipient::Username(name) => self.store.get_user_by_username(&name).await,
        }
    }
}
