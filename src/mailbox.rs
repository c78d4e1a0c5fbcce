//! Shared in-memory store of captured messages

use crate::message::Message;
use crate::spam::SpamReport;

use std::collections::HashMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

/// Append-only collection of captured messages with a live event channel.
///
/// One mailbox is created per process and shared as `Arc<Mailbox>` by every
/// SMTP session and by whatever presents the messages. It outlives server
/// restarts.
///
/// New messages are published on a bounded channel. Publishing never blocks
/// the session that appended the message: when the subscriber lags and the
/// channel is full, the event is dropped. The message itself stays available
/// through [`Mailbox::list`] and [`Mailbox::get`].
#[derive(Debug)]
pub struct Mailbox {
    messages: RwLock<Vec<Arc<Message>>>,
    reports: RwLock<HashMap<String, Arc<SpamReport>>>,
    events: Mutex<SyncSender<Arc<Message>>>,
    capacity: usize,
}

impl Mailbox {
    /// Default number of undelivered events buffered for a subscriber
    pub const DEFAULT_EVENT_CAPACITY: usize = 100;

    pub fn new() -> Self {
        Self::with_event_capacity(Self::DEFAULT_EVENT_CAPACITY)
    }

    /// Create a mailbox whose event channel buffers `capacity` messages
    pub fn with_event_capacity(capacity: usize) -> Self {
        // No subscriber yet: events are dropped until `subscribe` is called
        let (sender, _) = mpsc::sync_channel(capacity);
        Self {
            messages: RwLock::new(Vec::new()),
            reports: RwLock::new(HashMap::new()),
            events: Mutex::new(sender),
            capacity,
        }
    }

    /// Start receiving newly appended messages.
    ///
    /// The channel has a single consumer: subscribing again disconnects the
    /// previous receiver.
    pub fn subscribe(&self) -> Receiver<Arc<Message>> {
        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        *self.events.lock().unwrap_or_else(PoisonError::into_inner) = sender;
        receiver
    }

    /// Store a message and publish it to the subscriber.
    ///
    /// The timestamp is raised to the previous message's when the clock went
    /// backwards, so timestamps never decrease in insertion order.
    pub fn append(&self, mut message: Message) -> Arc<Message> {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = messages.last() {
            message.timestamp = message.timestamp.max(last.timestamp);
        }

        let message = Arc::new(message);
        messages.push(Arc::clone(&message));

        // Publish under the write lock so subscribers see append order
        let events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        match events.try_send(Arc::clone(&message)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::debug!("event channel full, dropped notification for {}", message.id);
            }
            Err(TrySendError::Disconnected(_)) => {
                log::debug!("no subscriber for {}", message.id);
            }
        }

        message
    }

    /// Snapshot of all messages in insertion order
    pub fn list(&self) -> Vec<Arc<Message>> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn get(&self, id: &str) -> Option<Arc<Message>> {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|message| message.id == id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every message and every cached spam report
    pub fn clear(&self) {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let mut reports = self.reports.write().unwrap_or_else(PoisonError::into_inner);
        let count = messages.len();
        messages.clear();
        reports.clear();
        log::info!("cleared {count} messages");
    }

    /// Load previously captured messages, e.g. from a snapshot.
    /// They are placed before anything captured since and not published.
    pub fn restore(&self, restored: Vec<Message>) {
        let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
        let captured = std::mem::take(&mut *messages);
        messages.extend(restored.into_iter().map(Arc::new));
        messages.extend(captured);
    }

    pub(crate) fn cached_report(&self, id: &str) -> Option<Arc<SpamReport>> {
        self.reports
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    /// Cache a report unless its message was cleared while it was computed
    pub(crate) fn cache_report(&self, id: &str, report: Arc<SpamReport>) {
        let messages = self.messages.read().unwrap_or_else(PoisonError::into_inner);
        if !messages.iter().any(|message| message.id == id) {
            return;
        }
        self.reports
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.to_owned(), report);
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}
