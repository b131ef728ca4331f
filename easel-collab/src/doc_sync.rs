//! Replicates a [`GraphStore`] document over the sync channel.
//!
//! ```text
//! channel open ──► SyncStep1(state vector)
//!                       │
//!             remote ◄──┘ replies SyncStep2(diff)
//! local txn    ──► DocUpdate(update)
//! ```
//!
//! Presence shares the channel; only document kinds are consumed here.
//! Updates produced while the channel is down are not queued: the
//! step1/step2 exchange on reopen carries them.

use easel_core::GraphStore;

use crate::config::CollabConfig;
use crate::protocol::{Envelope, MessageKind};
use crate::transport::{ChannelEvent, DataChannelTransport, HandlerId, Inbox};

#[derive(Debug, Clone)]
enum Inbound {
    Opened,
    Message(Envelope),
}

pub struct DocumentSync {
    transport: DataChannelTransport,
    channel: String,
    inbox: Inbox<Inbound>,
    handler: HandlerId,
    applied: u64,
    rejected: u64,
}

impl DocumentSync {
    pub fn new(transport: DataChannelTransport, config: &CollabConfig) -> Self {
        let inbox = Inbox::default();
        let sink = inbox.clone();
        let handler = transport.set_channel_handler(&config.sync_channel, move |event| match event {
            ChannelEvent::Open => sink.push(Inbound::Opened),
            ChannelEvent::Message(envelope) if envelope.kind.is_document() => {
                sink.push(Inbound::Message(envelope.clone()))
            }
            _ => {}
        });

        Self {
            transport,
            channel: config.sync_channel.clone(),
            inbox,
            handler,
            applied: 0,
            rejected: 0,
        }
    }

    /// Remote updates integrated so far.
    pub fn applied_updates(&self) -> u64 {
        self.applied
    }

    /// Remote updates that failed to decode or apply.
    pub fn rejected_updates(&self) -> u64 {
        self.rejected
    }

    /// Handle inbound traffic, then ship local updates. Returns the number
    /// of messages sent.
    pub fn process(&mut self, store: &mut GraphStore) -> usize {
        let mut sent = 0;

        for inbound in self.inbox.drain() {
            match inbound {
                Inbound::Opened => {
                    log::debug!("Sync channel open, sending state vector");
                    if self.send(MessageKind::SyncStep1, store.state_vector()) {
                        sent += 1;
                    }
                }
                Inbound::Message(envelope) => match envelope.kind {
                    MessageKind::SyncStep1 => match store.encode_diff(&envelope.payload) {
                        Ok(diff) => {
                            if self.send(MessageKind::SyncStep2, diff) {
                                sent += 1;
                            }
                        }
                        Err(e) => {
                            log::warn!("Bad state vector from peer: {e}");
                            self.rejected += 1;
                        }
                    },
                    MessageKind::SyncStep2 | MessageKind::DocUpdate => {
                        match store.apply_remote_update(&envelope.payload) {
                            Ok(()) => self.applied += 1,
                            Err(e) => {
                                log::warn!("Dropping remote update: {e}");
                                self.rejected += 1;
                            }
                        }
                    }
                    _ => {}
                },
            }
        }

        for update in store.take_pending_updates() {
            if self.send(MessageKind::DocUpdate, update) {
                sent += 1;
            }
        }
        sent
    }

    fn send(&self, kind: MessageKind, payload: Vec<u8>) -> bool {
        self.transport.send_message(&self.channel, kind, payload)
    }
}

impl Drop for DocumentSync {
    fn drop(&mut self) {
        self.transport.clear_channel_handler(self.handler);
    }
}
