//! The conversation message channel signaling rides on.
//!
//! The channel is an external publish/subscribe service shared with ordinary
//! chat. Delivery is at-least-once and ordered per sender; a sender receives
//! its own messages back.

use async_trait::async_trait;
use callcore::{ConversationId, ParticipantId};
use dashmap::DashMap;
use log::{debug, info, trace, warn};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    pub sender: ParticipantId,
    pub text: String,
}

/// Subscription status reported by the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    Error,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn is_available(&self) -> bool {
        matches!(self, Self::Subscribed)
    }
}

#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Message(ChannelMessage),
    Status(ChannelStatus),
}

/// A participant's handle on the message channel.
#[async_trait]
pub trait MessageChannel: Send + Sync {
    /// Publish `text` to the conversation as this participant.
    async fn send(&self, conversation: &ConversationId, text: &str) -> Result<(), anyhow::Error>;

    /// Subscribe to a conversation. The first event reports the subscription
    /// status.
    fn subscribe(&self, conversation: &ConversationId) -> mpsc::UnboundedReceiver<ChannelEvent>;
}

#[derive(Default)]
struct HubInner {
    subscribers: DashMap<ConversationId, Vec<mpsc::UnboundedSender<ChannelEvent>>>,
    status: DashMap<ConversationId, ChannelStatus>,
    history: DashMap<ConversationId, Vec<ChannelMessage>>,
    duplicate_delivery: AtomicBool,
}

/// In-process message channel.
///
/// Every published message goes to every subscriber of the conversation,
/// the sender included. With duplicate delivery switched on each message is
/// delivered twice, exercising at-least-once handling.
#[derive(Clone, Default)]
pub struct InMemoryHub {
    inner: Arc<HubInner>,
}

impl InMemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// A channel handle publishing as `participant`.
    pub fn client(&self, participant: impl Into<ParticipantId>) -> HubClient {
        HubClient {
            hub: self.clone(),
            participant: participant.into(),
        }
    }

    pub fn set_duplicate_delivery(&self, enabled: bool) {
        self.inner.duplicate_delivery.store(enabled, Ordering::SeqCst);
    }

    /// Change a conversation's subscription status and notify subscribers.
    pub fn set_status(&self, conversation: &ConversationId, status: ChannelStatus) {
        info!("Channel {} status -> {:?}", conversation, status);
        self.inner.status.insert(conversation.clone(), status);
        self.fan_out(conversation, ChannelEvent::Status(status), false);
    }

    pub fn status(&self, conversation: &ConversationId) -> ChannelStatus {
        self.inner
            .status
            .get(conversation)
            .map(|s| *s)
            .unwrap_or(ChannelStatus::Subscribed)
    }

    /// Every message published to a conversation, in publish order.
    pub fn history(&self, conversation: &ConversationId) -> Vec<ChannelMessage> {
        self.inner
            .history
            .get(conversation)
            .map(|h| h.clone())
            .unwrap_or_default()
    }

    fn publish(
        &self,
        conversation: &ConversationId,
        sender: &ParticipantId,
        text: &str,
    ) -> Result<(), anyhow::Error> {
        let status = self.status(conversation);
        if !status.is_available() {
            anyhow::bail!("conversation {} channel is {:?}", conversation, status);
        }

        let message = ChannelMessage {
            sender: sender.clone(),
            text: text.to_string(),
        };
        self.inner
            .history
            .entry(conversation.clone())
            .or_default()
            .push(message.clone());

        let duplicate = self.inner.duplicate_delivery.load(Ordering::SeqCst);
        self.fan_out(conversation, ChannelEvent::Message(message), duplicate);
        Ok(())
    }

    fn fan_out(&self, conversation: &ConversationId, event: ChannelEvent, duplicate: bool) {
        if let Some(mut subscribers) = self.inner.subscribers.get_mut(conversation) {
            subscribers.retain(|tx| {
                let delivered = tx.send(event.clone()).is_ok();
                if delivered && duplicate && tx.send(event.clone()).is_err() {
                    trace!("Duplicate delivery to a closed subscriber dropped");
                }
                delivered
            });
        }
    }

    fn subscribe(&self, conversation: &ConversationId) -> mpsc::UnboundedReceiver<ChannelEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let status = self.status(conversation);
        if tx.send(ChannelEvent::Status(status)).is_err() {
            warn!("Subscriber for {} dropped before first event", conversation);
        }
        self.inner
            .subscribers
            .entry(conversation.clone())
            .or_default()
            .push(tx);
        debug!("New subscriber on {}", conversation);
        rx
    }
}

/// [`MessageChannel`] handle for one participant on an [`InMemoryHub`].
#[derive(Clone)]
pub struct HubClient {
    hub: InMemoryHub,
    participant: ParticipantId,
}

impl HubClient {
    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }
}

#[async_trait]
impl MessageChannel for HubClient {
    async fn send(&self, conversation: &ConversationId, text: &str) -> Result<(), anyhow::Error> {
        self.hub.publish(conversation, &self.participant, text)
    }

    fn subscribe(&self, conversation: &ConversationId) -> mpsc::UnboundedReceiver<ChannelEvent> {
        self.hub.subscribe(conversation)
    }
}
