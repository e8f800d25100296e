//! Transport boundary.
//!
//! The core never talks to a BLE stack directly. A [`Transport`] writes bytes to
//! a logical channel and delivers notifications as typed [`Notification`]
//! messages on an `mpsc` queue. One queue carries every channel a subscriber
//! registered for, so the arrival order across the operations and data
//! channels is preserved.

use crate::error::TransportError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::trace;
use uuid::{Uuid, uuid};

pub const OPERATIONS_UUID: Uuid = uuid!("3dda0003-957f-7d4a-34a6-74696673696d");
pub const DATA_UUID: Uuid = uuid!("3dda0004-957f-7d4a-34a6-74696673696d");
pub const AUTHENTICATION_UUID: Uuid = uuid!("3dda0005-957f-7d4a-34a6-74696673696d");

/// Logical channel (one GATT characteristic each)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum Channel {
    /// Control frames: requests and their init/complete responses
    Operations,
    /// Payload packets
    Data,
    /// Handshake frames
    Authentication,
}

impl Channel {
    pub fn uuid(&self) -> Uuid {
        match self {
            Channel::Operations => OPERATIONS_UUID,
            Channel::Data => DATA_UUID,
            Channel::Authentication => AUTHENTICATION_UUID,
        }
    }

    pub fn from_uuid(uuid: &Uuid) -> Option<Channel> {
        [Channel::Operations, Channel::Data, Channel::Authentication]
            .into_iter()
            .find(|c| c.uuid() == *uuid)
    }
}

/// One notification received on a channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: Channel,
    pub value: Bytes,
}

impl Notification {
    pub fn new(channel: Channel, value: impl Into<Bytes>) -> Self {
        Self {
            channel,
            value: value.into(),
        }
    }
}

/// Identifies one subscription on a [`NotificationHub`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Receiving end of a subscription
///
/// Hand it back to [`Transport::unsubscribe`] when done; other subscribers on
/// the same channels are not affected.
#[derive(Debug)]
pub struct NotificationStream {
    id: SubscriptionId,
    channels: Vec<Channel>,
    rx: mpsc::UnboundedReceiver<Notification>,
}

impl NotificationStream {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Next notification; `None` once the subscription is closed
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Notification, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Byte-oriented write/notify channel to the watch
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write `data` to `channel`, with or without a link-layer acknowledgement
    async fn write(&self, channel: Channel, data: &[u8], require_ack: bool) -> Result<(), TransportError>;

    /// Enable notifications on `channels` and return a queue receiving them in arrival order
    async fn subscribe(&self, channels: &[Channel]) -> Result<NotificationStream, TransportError>;

    /// End the subscription behind `stream`
    async fn unsubscribe(&self, stream: NotificationStream) -> Result<(), TransportError>;
}

struct Subscriber {
    id: SubscriptionId,
    channels: Vec<Channel>,
    tx: mpsc::UnboundedSender<Notification>,
}

/// Fan-out of notifications to subscribers, for use inside `Transport` implementations
#[derive(Default)]
pub struct NotificationHub {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channels: &[Channel]) -> NotificationStream {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.push(Subscriber {
            id,
            channels: channels.to_vec(),
            tx,
        });
        NotificationStream {
            id,
            channels: channels.to_vec(),
            rx,
        }
    }

    /// Remove one subscriber and close its stream; returns the channels it listened on
    pub fn unsubscribe(&self, id: SubscriptionId) -> Vec<Channel> {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        match subscribers.iter().position(|s| s.id == id) {
            Some(index) => subscribers.remove(index).channels,
            None => Vec::new(),
        }
    }

    /// Deliver a notification to every live subscriber of its channel
    pub fn publish(&self, notification: Notification) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|s| !s.tx.is_closed());
        let mut delivered = 0;
        for sub in subscribers.iter().filter(|s| s.channels.contains(&notification.channel)) {
            if sub.tx.send(notification.clone()).is_ok() {
                delivered += 1;
            }
        }
        trace!(channel = %notification.channel, len = notification.value.len(), delivered, "Notification");
    }

    /// Whether anyone is listening on `channel`
    pub fn is_subscribed(&self, channel: Channel) -> bool {
        let subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers
            .iter()
            .any(|s| !s.tx.is_closed() && s.channels.contains(&channel))
    }

    /// Drop every subscriber, closing their streams (disconnect)
    pub fn close(&self) {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}
