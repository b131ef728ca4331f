//! Named data channels multiplexed over one peer connection.
//!
//! The signaling session feeds channel arrivals, ready-state changes and
//! inbound bytes into the transport. Consumers never own the connection:
//! they attach handlers per channel label and send through
//! [`DataChannelTransport::send_message`], which refuses (returns `false`)
//! unless the channel is open.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::protocol::{Envelope, MessageKind};
use crate::rtc::{ChannelState, DataChannel};

/// What a channel handler is told about.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The channel is open. Also delivered on attach if it already was.
    Open,
    Message(Envelope),
    Closed,
}

pub type HandlerId = u64;

type Handler = Arc<Mutex<Box<dyn FnMut(&ChannelEvent) + Send>>>;

struct Slot {
    channel: Option<Arc<dyn DataChannel>>,
    state: ChannelState,
}

#[derive(Default)]
struct Inner {
    slots: HashMap<String, Slot>,
    handlers: Vec<(HandlerId, String, Handler)>,
    next_handler: HandlerId,
}

/// Cheap to clone; clones share the same channels and handlers.
#[derive(Clone, Default)]
pub struct DataChannelTransport {
    inner: Arc<Mutex<Inner>>,
}

impl DataChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ready state of `label`, `None` if no such channel exists.
    pub fn channel_state(&self, label: &str) -> Option<ChannelState> {
        self.lock().slots.get(label).map(|s| s.state)
    }

    pub fn is_open(&self, label: &str) -> bool {
        self.channel_state(label) == Some(ChannelState::Open)
    }

    /// Attach a handler for `label`. If the channel is already open the
    /// handler sees [`ChannelEvent::Open`] before this returns.
    pub fn set_channel_handler<F>(&self, label: &str, handler: F) -> HandlerId
    where
        F: FnMut(&ChannelEvent) + Send + 'static,
    {
        let handler: Handler = Arc::new(Mutex::new(Box::new(handler)));
        let (id, open) = {
            let mut inner = self.lock();
            inner.next_handler += 1;
            let id = inner.next_handler;
            inner.handlers.push((id, label.to_string(), Arc::clone(&handler)));
            let open = inner.slots.get(label).is_some_and(|s| s.state == ChannelState::Open);
            (id, open)
        };
        if open {
            call(&handler, &ChannelEvent::Open);
        }
        id
    }

    /// Detach a handler. Returns whether it was attached.
    pub fn clear_channel_handler(&self, id: HandlerId) -> bool {
        let mut inner = self.lock();
        let before = inner.handlers.len();
        inner.handlers.retain(|(h, _, _)| *h != id);
        inner.handlers.len() != before
    }

    /// Send `payload` as an envelope of `kind`. Returns `false` without
    /// sending when the channel is missing or not open.
    pub fn send_message(&self, label: &str, kind: MessageKind, payload: Vec<u8>) -> bool {
        self.send_envelope(label, &Envelope::new(kind, payload))
    }

    pub fn send_envelope(&self, label: &str, envelope: &Envelope) -> bool {
        let channel = {
            let inner = self.lock();
            match inner.slots.get(label) {
                Some(Slot {
                    channel: Some(channel),
                    state: ChannelState::Open,
                }) => Arc::clone(channel),
                _ => {
                    log::debug!("Dropping {:?} on {label}: channel not open", envelope.kind);
                    return false;
                }
            }
        };

        let bytes = match envelope.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("Failed to encode {:?}: {e}", envelope.kind);
                return false;
            }
        };
        match channel.send(&bytes) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Send on {label} failed: {e}");
                false
            }
        }
    }

    // ---------------------------------------------------------------
    // Fed by the signaling session
    // ---------------------------------------------------------------

    pub(crate) fn attach_channel(&self, channel: Arc<dyn DataChannel>) {
        let label = channel.label().to_string();
        let state = channel.ready_state();
        let previous = {
            let mut inner = self.lock();
            inner
                .slots
                .insert(label.clone(), Slot { channel: Some(channel), state })
                .map(|s| s.state)
        };
        if state == ChannelState::Open && previous != Some(ChannelState::Open) {
            self.notify(&label, &ChannelEvent::Open);
        }
    }

    pub(crate) fn update_state(&self, label: &str, state: ChannelState) {
        let changed = {
            let mut inner = self.lock();
            let slot = inner.slots.entry(label.to_string()).or_insert(Slot {
                channel: None,
                state: ChannelState::Connecting,
            });
            let changed = slot.state != state;
            slot.state = state;
            changed
        };
        if !changed {
            return;
        }
        log::debug!("Channel {label} is now {state:?}");
        match state {
            ChannelState::Open => self.notify(label, &ChannelEvent::Open),
            ChannelState::Closed => self.notify(label, &ChannelEvent::Closed),
            ChannelState::Connecting | ChannelState::Closing => {}
        }
    }

    pub(crate) fn deliver(&self, label: &str, bytes: &[u8]) {
        match Envelope::decode(bytes) {
            Ok(envelope) => self.notify(label, &ChannelEvent::Message(envelope)),
            Err(e) => log::warn!("Discarding undecodable message on {label}: {e}"),
        }
    }

    /// Forget every channel. Handlers stay attached for the next connection.
    pub(crate) fn reset(&self) {
        let open: Vec<String> = {
            let mut inner = self.lock();
            let open = inner
                .slots
                .iter()
                .filter(|(_, s)| s.state == ChannelState::Open)
                .map(|(label, _)| label.clone())
                .collect();
            inner.slots.clear();
            open
        };
        for label in open {
            self.notify(&label, &ChannelEvent::Closed);
        }
    }

    fn notify(&self, label: &str, event: &ChannelEvent) {
        // Handlers may send or attach; never call them under the lock.
        let handlers: Vec<Handler> = self
            .lock()
            .handlers
            .iter()
            .filter(|(_, l, _)| l == label)
            .map(|(_, _, h)| Arc::clone(h))
            .collect();
        for handler in handlers {
            call(&handler, event);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn call(handler: &Handler, event: &ChannelEvent) {
    let mut handler = handler.lock().unwrap_or_else(|e| e.into_inner());
    (*handler)(event);
}

/// Queue filled by a channel handler and drained by its owner.
pub(crate) struct Inbox<T>(Arc<Mutex<VecDeque<T>>>);

impl<T> Clone for Inbox<T> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl<T> Default for Inbox<T> {
    fn default() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::new())))
    }
}

impl<T> Inbox<T> {
    pub(crate) fn push(&self, item: T) {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).push_back(item);
    }

    pub(crate) fn drain(&self) -> Vec<T> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).drain(..).collect()
    }
}
