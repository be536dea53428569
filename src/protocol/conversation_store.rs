//! Direct-message threads keyed by peer node, with delivery tracking.
//!
//! Own messages start `Pending` and move to `Acked` or `Error` when a routing
//! packet correlated by packet id arrives (or when the send itself fails).
//! Both are terminal. "Timed out" is never stored: it is derived at read time by
//! [`ConversationStore::display_status`] from the message age.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::decoder::{routing_error_name, DecodedFrame, PortPayload, RoutingReport};
use super::encoder::{encode_text_message, new_packet_id, TextMessage, DEFAULT_HOP_LIMIT};
use super::node_id::{format_node_id, is_broadcast};
use super::node_store::NodeStore;
use crate::logutil::{escape_log, truncate_for_log};
use crate::metrics;
use crate::protobuf::meshtastic_generated::PortNum;
use crate::storage::PersistenceHandle;
use crate::transport::{FrameSink, TransportError};
use crate::validation::{validate_dm_text, TextError, MAX_TEXT_BYTES};

pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Acked,
    Error,
}

/// What a reader should show; `TimedOut` only exists here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayStatus {
    Pending,
    Acked,
    Error,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Own,
    Peer,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub local_id: u64,
    pub packet_id: u32,
    pub direction: Direction,
    pub from: u32,
    pub to: u32,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub status: MessageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_reason: Option<String>,
}

impl Message {
    pub fn peer(&self) -> u32 {
        match self.direction {
            Direction::Own => self.to,
            Direction::Peer => self.from,
        }
    }

    pub fn is_own(&self) -> bool {
        self.direction == Direction::Own
    }

    /// Identity used for dedupe and for persistence upserts.
    pub fn key(&self) -> MessageKey {
        MessageKey {
            peer: self.peer(),
            direction: self.direction,
            packet_id: self.packet_id,
        }
    }

    pub fn display_status(&self, now: DateTime<Utc>, ack_timeout: Duration) -> DisplayStatus {
        match self.status {
            MessageStatus::Acked => DisplayStatus::Acked,
            MessageStatus::Error => DisplayStatus::Error,
            MessageStatus::Pending => {
                let age = (now - self.timestamp).to_std().unwrap_or_default();
                if age > ack_timeout {
                    DisplayStatus::TimedOut
                } else {
                    DisplayStatus::Pending
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageKey {
    pub peer: u32,
    pub direction: Direction,
    pub packet_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Conversation {
    pub peer: u32,
    pub messages: Vec<Message>,
    pub unread: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub peer: u32,
    pub unread: u32,
    pub message_count: usize,
    pub last_text: Option<String>,
    pub last_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Error)]
pub enum ConversationError {
    #[error(transparent)]
    InvalidText(#[from] TextError),
    #[error("cannot send a direct message to the broadcast address")]
    BroadcastPeer,
    #[error("local node number not known yet (device has not sent my_info)")]
    LocalNodeUnknown,
    #[error("send failed: {0}")]
    Transport(#[from] TransportError),
}

/// Tunables for outbound messages, normally taken from `[messages]` in the config.
#[derive(Debug, Clone)]
pub struct ConversationOptions {
    pub ack_timeout: Duration,
    pub max_text_bytes: usize,
    pub channel: u32,
    pub hop_limit: u32,
}

impl Default for ConversationOptions {
    fn default() -> Self {
        Self {
            ack_timeout: DEFAULT_ACK_TIMEOUT,
            max_text_bytes: MAX_TEXT_BYTES,
            channel: 0,
            hop_limit: DEFAULT_HOP_LIMIT,
        }
    }
}

#[derive(Debug)]
struct ConvState {
    conversations: BTreeMap<u32, Conversation>,
    next_local_id: u64,
    /// Hydrated peer messages not yet matched by a frame in this pass.
    unseen: HashSet<MessageKey>,
}

impl Default for ConvState {
    fn default() -> Self {
        Self {
            conversations: BTreeMap::new(),
            next_local_id: 1,
            unseen: HashSet::new(),
        }
    }
}

impl ConvState {
    fn thread(&mut self, peer: u32) -> &mut Conversation {
        self.conversations.entry(peer).or_insert_with(|| Conversation {
            peer,
            ..Default::default()
        })
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_local_id;
        self.next_local_id += 1;
        id
    }

    fn find_mut(&mut self, local_id: u64) -> Option<&mut Message> {
        self.conversations
            .values_mut()
            .flat_map(|c| c.messages.iter_mut())
            .find(|m| m.local_id == local_id)
    }
}

pub struct ConversationStore {
    state: RwLock<ConvState>,
    nodes: Arc<NodeStore>,
    options: ConversationOptions,
    persistence: Option<PersistenceHandle>,
}

impl ConversationStore {
    pub fn new(nodes: Arc<NodeStore>, options: ConversationOptions) -> Self {
        Self {
            state: RwLock::new(ConvState::default()),
            nodes,
            options,
            persistence: None,
        }
    }

    pub fn with_persistence(mut self, handle: PersistenceHandle) -> Self {
        self.persistence = Some(handle);
        self
    }

    pub fn options(&self) -> &ConversationOptions {
        &self.options
    }

    /// Fold one frame into the conversations. `open_peer` is the thread the
    /// operator is looking at; messages for it do not count as unread.
    pub fn apply_frame(&self, frame: &DecodedFrame, open_peer: Option<u32>) {
        let Some(pkt) = frame.mesh_packet() else {
            return;
        };
        let Some(me) = self.nodes.my_node_num() else {
            return;
        };
        match pkt.port_num() {
            Some(PortNum::TextMessageApp) => {
                let Some(PortPayload::Text(text)) = &pkt.payload else {
                    return;
                };
                if is_broadcast(pkt.to()) {
                    return;
                }
                let direction = if pkt.from() == me {
                    Direction::Own
                } else if pkt.to() == me {
                    Direction::Peer
                } else {
                    return;
                };
                let timestamp = match direction {
                    Direction::Own => frame.received_at,
                    Direction::Peer => {
                        DateTime::from_timestamp(frame.heard_at(), 0).unwrap_or(frame.received_at)
                    }
                };
                self.record_text(pkt.id(), direction, pkt.from(), pkt.to(), text, timestamp, open_peer);
            }
            Some(PortNum::RoutingApp) => {
                let Some(PortPayload::Routing(report)) = &pkt.payload else {
                    return;
                };
                let Some(data) = pkt.data() else {
                    return;
                };
                let correlation = if data.request_id != 0 {
                    data.request_id
                } else {
                    data.reply_id
                };
                if correlation == 0 {
                    return;
                }
                self.apply_routing(correlation, report, frame.received_at);
            }
            _ => {}
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn record_text(
        &self,
        packet_id: u32,
        direction: Direction,
        from: u32,
        to: u32,
        text: &str,
        timestamp: DateTime<Utc>,
        open_peer: Option<u32>,
    ) {
        let peer = match direction {
            Direction::Own => to,
            Direction::Peer => from,
        };
        let saved = {
            let mut state = self.write();
            let duplicate = state.conversations.get(&peer).is_some_and(|c| {
                c.messages
                    .iter()
                    .any(|m| m.direction == direction && m.packet_id == packet_id)
            });
            if duplicate {
                // A replayed frame matching a hydrated message counts once, as it did live.
                let key = MessageKey {
                    peer,
                    direction,
                    packet_id,
                };
                if state.unseen.remove(&key) && open_peer != Some(peer) {
                    state.thread(peer).unread += 1;
                }
                return;
            }
            let local_id = state.alloc_id();
            let msg = Message {
                local_id,
                packet_id,
                direction,
                from,
                to,
                text: text.to_string(),
                timestamp,
                status: match direction {
                    Direction::Own => MessageStatus::Pending,
                    Direction::Peer => MessageStatus::Acked,
                },
                error_reason: None,
            };
            let thread = state.thread(peer);
            thread.messages.push(msg.clone());
            if direction == Direction::Peer && open_peer != Some(peer) {
                thread.unread += 1;
            }
            msg
        };
        debug!(
            "dm {} {} 0x{:08x}: {}",
            if direction == Direction::Own { "to" } else { "from" },
            format_node_id(peer),
            packet_id,
            truncate_for_log(text, 60)
        );
        self.persist(&saved);
    }

    fn apply_routing(&self, correlation: u32, report: &RoutingReport, at: DateTime<Utc>) {
        let (status, reason) = match report {
            RoutingReport::Ack => (MessageStatus::Acked, None),
            RoutingReport::Error(code) => (MessageStatus::Error, Some(routing_error_name(*code))),
            RoutingReport::RouteRequest(_) | RoutingReport::RouteReply(_) => return,
        };
        let updated = {
            let mut state = self.write();
            let Some(msg) = state
                .conversations
                .values_mut()
                .flat_map(|c| c.messages.iter_mut())
                .find(|m| m.is_own() && m.packet_id == correlation)
            else {
                return;
            };
            if msg.status != MessageStatus::Pending {
                return;
            }
            msg.status = status;
            msg.error_reason = reason;
            msg.clone()
        };
        match updated.status {
            MessageStatus::Acked => {
                let latency = (at - updated.timestamp).to_std().unwrap_or_default();
                metrics::observe_dm_ack(latency);
                info!(
                    "dm 0x{:08x} to {} acked after {} ms",
                    correlation,
                    format_node_id(updated.to),
                    latency.as_millis()
                );
            }
            _ => {
                metrics::inc_dm_failed();
                warn!(
                    "dm 0x{:08x} to {} failed: {}",
                    correlation,
                    format_node_id(updated.to),
                    updated.error_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
        self.persist(&updated);
    }

    /// Validate, encode and send a direct message. The message is recorded as
    /// `Pending` before the frame goes out; a failed send marks it `Error` and
    /// returns the failure.
    pub async fn send(
        &self,
        sink: &dyn FrameSink,
        peer: u32,
        text: &str,
    ) -> Result<Message, ConversationError> {
        let text = validate_dm_text(text, self.options.max_text_bytes)?;
        if is_broadcast(peer) {
            return Err(ConversationError::BroadcastPeer);
        }
        let me = self
            .nodes
            .my_node_num()
            .ok_or(ConversationError::LocalNodeUnknown)?;
        let packet_id = new_packet_id();
        let frame = encode_text_message(&TextMessage {
            from: me,
            to: peer,
            channel: self.options.channel,
            hop_limit: self.options.hop_limit,
            packet_id,
            text: &text,
        });

        let msg = {
            let mut state = self.write();
            let local_id = state.alloc_id();
            let msg = Message {
                local_id,
                packet_id,
                direction: Direction::Own,
                from: me,
                to: peer,
                text: text.clone(),
                timestamp: Utc::now(),
                status: MessageStatus::Pending,
                error_reason: None,
            };
            state.thread(peer).messages.push(msg.clone());
            msg
        };
        self.persist(&msg);
        metrics::inc_dm_sent();
        info!(
            "sending dm 0x{:08x} to {}: {}",
            packet_id,
            format_node_id(peer),
            escape_log(&text)
        );

        match sink.send(frame).await {
            Ok(()) => Ok(msg),
            Err(e) => {
                metrics::inc_dm_failed();
                warn!("dm 0x{:08x} to {} not sent: {}", packet_id, format_node_id(peer), e);
                let failed = {
                    let mut state = self.write();
                    state.find_mut(msg.local_id).map(|m| {
                        if m.status == MessageStatus::Pending {
                            m.status = MessageStatus::Error;
                            m.error_reason = Some(e.to_string());
                        }
                        m.clone()
                    })
                };
                if let Some(failed) = failed {
                    self.persist(&failed);
                }
                Err(e.into())
            }
        }
    }

    /// Remove a thread and its durable copy. Returns whether it existed.
    pub fn delete_conversation(&self, peer: u32) -> bool {
        let removed = {
            let mut state = self.write();
            state.unseen.retain(|k| k.peer != peer);
            state.conversations.remove(&peer).is_some()
        };
        if let Some(p) = &self.persistence {
            p.delete_peer(peer);
        }
        removed
    }

    /// Replace the in-memory threads with previously persisted messages.
    ///
    /// Unread counts start at zero. A peer message that is later matched by a
    /// replayed frame counts as unread again unless its thread is open.
    pub fn hydrate<I>(&self, messages: I)
    where
        I: IntoIterator<Item = Message>,
    {
        let mut state = self.write();
        *state = ConvState::default();
        let mut max_id = 0;
        for msg in messages {
            max_id = max_id.max(msg.local_id);
            if msg.direction == Direction::Peer {
                state.unseen.insert(msg.key());
            }
            state.thread(msg.peer()).messages.push(msg);
        }
        for conv in state.conversations.values_mut() {
            conv.messages.sort_by_key(|m| (m.timestamp, m.local_id));
        }
        state.next_local_id = max_id + 1;
        debug!(
            "hydrated {} conversation(s), next local id {}",
            state.conversations.len(),
            state.next_local_id
        );
    }

    pub fn conversation(&self, peer: u32) -> Option<Conversation> {
        self.read().conversations.get(&peer).cloned()
    }

    /// One line per thread, most recent activity first.
    pub fn summaries(&self) -> Vec<ConversationSummary> {
        let mut out: Vec<ConversationSummary> = self
            .read()
            .conversations
            .values()
            .map(|c| {
                let last = c.messages.last();
                ConversationSummary {
                    peer: c.peer,
                    unread: c.unread,
                    message_count: c.messages.len(),
                    last_text: last.map(|m| m.text.clone()),
                    last_timestamp: last.map(|m| m.timestamp),
                }
            })
            .collect();
        out.sort_by(|a, b| {
            b.last_timestamp
                .cmp(&a.last_timestamp)
                .then(a.peer.cmp(&b.peer))
        });
        out
    }

    /// Ensure a (possibly empty) thread exists for `peer`.
    pub fn open_conversation(&self, peer: u32) {
        self.write().thread(peer);
    }

    pub fn mark_read(&self, peer: u32) {
        if let Some(c) = self.write().conversations.get_mut(&peer) {
            c.unread = 0;
        }
    }

    pub fn total_unread(&self) -> u32 {
        self.read().conversations.values().map(|c| c.unread).sum()
    }

    /// Drop all in-memory state. Durable copies are left alone.
    pub fn reset(&self) {
        *self.write() = ConvState::default();
    }

    pub fn display_status(&self, msg: &Message, now: DateTime<Utc>) -> DisplayStatus {
        msg.display_status(now, self.options.ack_timeout)
    }

    fn persist(&self, msg: &Message) {
        if let Some(p) = &self.persistence {
            p.save(msg);
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, ConvState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ConvState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::meshtastic_generated as proto;
    use crate::protocol::decoder::FrameDecoder;
    use async_trait::async_trait;
    use bytes::Bytes;
    use prost::Message as _;
    use proto::from_radio::PayloadVariant as FR;
    use proto::mesh_packet::PayloadVariant as MP;
    use std::sync::Mutex;

    const ME: u32 = 0x1000;
    const PEER: u32 = 0x2000;

    #[derive(Default)]
    struct RecordingSink {
        frames: Mutex<Vec<Bytes>>,
        fail: bool,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send(&self, frame: Bytes) -> Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::HttpStatus {
                    url: "http://test/api/v1/toradio".into(),
                    status: 503,
                });
            }
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
    }

    fn encode(v: FR) -> Vec<u8> {
        proto::FromRadio {
            id: 0,
            payload_variant: Some(v),
        }
        .encode_to_vec()
    }

    fn text(from: u32, to: u32, id: u32, body: &str) -> Vec<u8> {
        encode(FR::Packet(proto::MeshPacket {
            from,
            to,
            id,
            payload_variant: Some(MP::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::copy_from_slice(body.as_bytes()),
                ..Default::default()
            })),
            ..Default::default()
        }))
    }

    fn routing(from: u32, request_id: u32, code: i32) -> Vec<u8> {
        let routing = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(code)),
        };
        encode(FR::Packet(proto::MeshPacket {
            from,
            to: ME,
            id: 99,
            payload_variant: Some(MP::Decoded(proto::Data {
                portnum: proto::PortNum::RoutingApp as i32,
                payload: routing.encode_to_vec().into(),
                request_id,
                ..Default::default()
            })),
            ..Default::default()
        }))
    }

    fn setup() -> (FrameDecoder, Arc<NodeStore>, ConversationStore) {
        let decoder = FrameDecoder::new();
        let nodes = Arc::new(NodeStore::new());
        nodes.apply_frame(&decoder.decode(&encode(FR::MyInfo(proto::MyNodeInfo {
            my_node_num: ME,
            ..Default::default()
        }))));
        let store = ConversationStore::new(Arc::clone(&nodes), ConversationOptions::default());
        (decoder, nodes, store)
    }

    #[test]
    fn incoming_dm_counts_unread_unless_open() {
        let (d, _nodes, store) = setup();
        store.apply_frame(&d.decode(&text(PEER, ME, 1, "hi")), None);
        store.apply_frame(&d.decode(&text(PEER, ME, 2, "there")), Some(PEER));
        let conv = store.conversation(PEER).unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.unread, 1);
        assert!(conv.messages.iter().all(|m| m.status == MessageStatus::Acked));
        store.mark_read(PEER);
        assert_eq!(store.total_unread(), 0);
    }

    #[test]
    fn broadcasts_and_third_party_dms_are_ignored() {
        let (d, _nodes, store) = setup();
        store.apply_frame(&d.decode(&text(PEER, 0xffffffff, 1, "all")), None);
        store.apply_frame(&d.decode(&text(PEER, 0x3000, 2, "not us")), None);
        assert!(store.summaries().is_empty());
    }

    #[test]
    fn duplicate_packets_are_dropped() {
        let (d, _nodes, store) = setup();
        store.apply_frame(&d.decode(&text(PEER, ME, 5, "once")), None);
        store.apply_frame(&d.decode(&text(PEER, ME, 5, "once")), None);
        assert_eq!(store.conversation(PEER).unwrap().messages.len(), 1);
        assert_eq!(store.conversation(PEER).unwrap().unread, 1);
    }

    #[test]
    fn replayed_frames_restore_unread_for_hydrated_messages() {
        let (d, _nodes, live) = setup();
        let first = d.decode(&text(PEER, ME, 5, "one"));
        let second = d.decode(&text(PEER, ME, 6, "two"));
        live.apply_frame(&first, None);
        live.apply_frame(&second, None);
        let history = live.conversation(PEER).unwrap().messages;

        let (_d, _nodes, rebuilt) = setup();
        rebuilt.hydrate(history.clone());
        assert_eq!(rebuilt.total_unread(), 0);
        rebuilt.apply_frame(&first, None);
        rebuilt.apply_frame(&second, None);
        rebuilt.apply_frame(&first, None);
        let conv = rebuilt.conversation(PEER).unwrap();
        assert_eq!(conv.messages.len(), 2);
        assert_eq!(conv.unread, 2);

        rebuilt.hydrate(history);
        rebuilt.apply_frame(&first, Some(PEER));
        assert_eq!(rebuilt.total_unread(), 0);
    }

    #[test]
    fn ack_and_error_transitions_are_terminal() {
        let (d, _nodes, store) = setup();
        store.apply_frame(&d.decode(&text(ME, PEER, 10, "first")), None);
        store.apply_frame(&d.decode(&text(ME, PEER, 11, "second")), None);
        let pending = store.conversation(PEER).unwrap();
        assert!(pending.messages.iter().all(|m| m.status == MessageStatus::Pending));

        store.apply_frame(&d.decode(&routing(PEER, 10, 0)), None);
        store.apply_frame(&d.decode(&routing(ME, 11, proto::routing::Error::MaxRetransmit as i32)), None);
        // A later contradictory report changes nothing.
        store.apply_frame(&d.decode(&routing(PEER, 11, 0)), None);
        store.apply_frame(&d.decode(&routing(PEER, 10, 5)), None);

        let conv = store.conversation(PEER).unwrap();
        assert_eq!(conv.messages[0].status, MessageStatus::Acked);
        assert_eq!(conv.messages[1].status, MessageStatus::Error);
        assert_eq!(conv.messages[1].error_reason.as_deref(), Some("MAX_RETRANSMIT"));
    }

    #[test]
    fn timed_out_is_display_only_and_late_ack_wins() {
        let (d, _nodes, store) = setup();
        let sent_at = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        store.apply_frame(&d.decode_at(&text(ME, PEER, 20, "slow"), sent_at), None);
        let msg = store.conversation(PEER).unwrap().messages[0].clone();
        let later = sent_at + chrono::Duration::seconds(31);
        assert_eq!(store.display_status(&msg, sent_at + chrono::Duration::seconds(5)), DisplayStatus::Pending);
        assert_eq!(store.display_status(&msg, later), DisplayStatus::TimedOut);
        assert_eq!(msg.status, MessageStatus::Pending);

        store.apply_frame(&d.decode(&routing(PEER, 20, 0)), None);
        let msg = store.conversation(PEER).unwrap().messages[0].clone();
        assert_eq!(store.display_status(&msg, later), DisplayStatus::Acked);
    }

    #[tokio::test]
    async fn send_records_pending_then_frame() {
        let (_d, _nodes, store) = setup();
        let sink = RecordingSink::default();
        let msg = store.send(&sink, PEER, "hello").await.unwrap();
        assert_eq!(msg.status, MessageStatus::Pending);
        assert_ne!(msg.packet_id, 0);
        assert_eq!(sink.frames.lock().unwrap().len(), 1);
        let conv = store.conversation(PEER).unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert!(conv.messages[0].is_own());
    }

    #[tokio::test]
    async fn failed_send_marks_error() {
        let (_d, _nodes, store) = setup();
        let sink = RecordingSink {
            fail: true,
            ..Default::default()
        };
        let err = store.send(&sink, PEER, "hello").await.unwrap_err();
        assert!(matches!(err, ConversationError::Transport(_)));
        let conv = store.conversation(PEER).unwrap();
        assert_eq!(conv.messages[0].status, MessageStatus::Error);
    }

    #[tokio::test]
    async fn send_validates_before_touching_state() {
        let (_d, _nodes, store) = setup();
        let sink = RecordingSink::default();
        assert!(matches!(
            store.send(&sink, PEER, "   ").await,
            Err(ConversationError::InvalidText(TextError::Empty))
        ));
        assert!(matches!(
            store.send(&sink, PEER, &"x".repeat(201)).await,
            Err(ConversationError::InvalidText(TextError::TooLong { .. }))
        ));
        assert!(matches!(
            store.send(&sink, 0xffffffff, "hi").await,
            Err(ConversationError::BroadcastPeer)
        ));
        assert!(store.summaries().is_empty());
        assert!(sink.frames.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn send_requires_local_node() {
        let store = ConversationStore::new(Arc::new(NodeStore::new()), ConversationOptions::default());
        let sink = RecordingSink::default();
        assert!(matches!(
            store.send(&sink, PEER, "hi").await,
            Err(ConversationError::LocalNodeUnknown)
        ));
    }

    #[test]
    fn hydrate_delete_and_summaries() {
        let (d, _nodes, store) = setup();
        let old = Message {
            local_id: 41,
            packet_id: 7,
            direction: Direction::Peer,
            from: 0x3000,
            to: ME,
            text: "from disk".into(),
            timestamp: DateTime::from_timestamp(1_600_000_000, 0).unwrap(),
            status: MessageStatus::Acked,
            error_reason: None,
        };
        store.hydrate(vec![old]);
        store.apply_frame(&d.decode(&text(PEER, ME, 1, "fresh")), None);
        let new_msg = &store.conversation(PEER).unwrap().messages[0];
        assert_eq!(new_msg.local_id, 42);

        let summaries = store.summaries();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].peer, PEER);
        assert_eq!(summaries[1].last_text.as_deref(), Some("from disk"));

        assert!(store.delete_conversation(0x3000));
        assert!(!store.delete_conversation(0x3000));
        store.open_conversation(0x4000);
        assert_eq!(store.conversation(0x4000).unwrap().messages.len(), 0);
        store.reset();
        assert!(store.summaries().is_empty());
    }
}
