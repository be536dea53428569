//! Wiring between the device link and the stores.
//!
//! [`MeshState`] owns the decoder and the three stores and registers the store
//! subscriptions on the packet log (nodes first, then conversations, so a DM
//! arriving right after `my_info` is attributed correctly). It has no network
//! dependency. [`MeshSession`] adds the HTTP transport, persistence and the
//! event loop on top.

use std::sync::{Arc, Mutex, RwLock};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::watch;

use crate::config::Config;
use crate::protocol::conversation_store::{ConversationStore, Message};
use crate::protocol::decoder::{DecodedFrame, Envelope, FrameDecoder};
use crate::protocol::encoder::{encode_disconnect, encode_heartbeat, encode_want_config, new_packet_id};
use crate::protocol::node_store::NodeStore;
use crate::protocol::packet_store::{PacketStore, Subscription};
use crate::protocol::{ConversationError, ConversationOptions};
use crate::storage::{JsonMessageStore, MemoryMessageStore, MessageRepository, PersistenceHandle};
use crate::transport::{ConnectionStatus, DeviceOutput, HttpTransport, TransportError};
use crate::validation::safe_filename;

/// Decoder plus stores, wired through packet-log subscriptions.
pub struct MeshState {
    decoder: FrameDecoder,
    packets: PacketStore,
    nodes: Arc<NodeStore>,
    conversations: Arc<ConversationStore>,
    open_peer: Arc<RwLock<Option<u32>>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl MeshState {
    pub fn new(packet_capacity: usize, options: ConversationOptions) -> Self {
        let nodes = Arc::new(NodeStore::new());
        let conversations = Arc::new(ConversationStore::new(Arc::clone(&nodes), options));
        Self::with_stores(packet_capacity, nodes, conversations)
    }

    /// Use pre-built stores (e.g. a conversation store with persistence attached).
    pub fn with_stores(
        packet_capacity: usize,
        nodes: Arc<NodeStore>,
        conversations: Arc<ConversationStore>,
    ) -> Self {
        let packets = PacketStore::with_capacity(packet_capacity);
        let open_peer = Arc::new(RwLock::new(None));

        let node_sub = {
            let nodes = Arc::clone(&nodes);
            packets.subscribe(move |frame| nodes.apply_frame(frame))
        };
        let conv_sub = {
            let conversations = Arc::clone(&conversations);
            let open_peer = Arc::clone(&open_peer);
            packets.subscribe(move |frame| {
                let peer = *open_peer.read().unwrap_or_else(|e| e.into_inner());
                conversations.apply_frame(frame, peer);
            })
        };

        Self {
            decoder: FrameDecoder::new(),
            packets,
            nodes,
            conversations,
            open_peer,
            subscriptions: Mutex::new(vec![node_sub, conv_sub]),
        }
    }

    /// Decode one frame and push it through the packet log.
    pub fn ingest(&self, bytes: &[u8]) -> Arc<DecodedFrame> {
        self.packets.add(self.decoder.decode(bytes))
    }

    pub fn ingest_at(&self, bytes: &[u8], received_at: DateTime<Utc>) -> Arc<DecodedFrame> {
        self.packets.add(self.decoder.decode_at(bytes, received_at))
    }

    pub fn packets(&self) -> &PacketStore {
        &self.packets
    }

    pub fn nodes(&self) -> &Arc<NodeStore> {
        &self.nodes
    }

    pub fn conversations(&self) -> &Arc<ConversationStore> {
        &self.conversations
    }

    pub fn open_peer(&self) -> Option<u32> {
        *self.open_peer.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Select the thread the operator is viewing; it is created if needed and marked read.
    pub fn set_open_peer(&self, peer: Option<u32>) {
        *self.open_peer.write().unwrap_or_else(|e| e.into_inner()) = peer;
        if let Some(p) = peer {
            self.conversations.open_conversation(p);
            self.conversations.mark_read(p);
        }
    }

    /// Rebuild node and conversation state from the frames still in the packet log.
    pub fn rebuild_derived(&self) {
        self.replay(Vec::new());
    }

    /// Like [`rebuild_derived`](Self::rebuild_derived), seeding conversations
    /// with persisted history first. Replayed frames dedupe against it.
    pub fn replay(&self, history: Vec<Message>) {
        self.nodes.clear();
        self.conversations.hydrate(history);
        let open_peer = self.open_peer();
        let frames = self.packets.get_all();
        for frame in &frames {
            self.nodes.apply_frame(frame);
            self.conversations.apply_frame(frame, open_peer);
        }
        debug!("replayed {} frame(s) into derived state", frames.len());
    }

    /// Detach the stores from the packet log.
    pub fn detach(&self) {
        let subs: Vec<Subscription> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for sub in subs {
            sub.unsubscribe();
        }
    }
}

/// A live connection to one device.
pub struct MeshSession {
    state: Arc<MeshState>,
    transport: Arc<HttpTransport>,
    repository: Arc<dyn MessageRepository>,
    persistence: PersistenceHandle,
    session_id: String,
    status_tx: watch::Sender<ConnectionStatus>,
    config_request_id: Mutex<Option<u32>>,
}

impl MeshSession {
    /// Load persisted conversations, then connect. Both failures are fatal.
    pub async fn start(config: &Config, address: &str) -> Result<Self> {
        let session_id = address.trim().trim_end_matches('/').to_string();
        let repository: Arc<dyn MessageRepository> = if config.storage.persist_messages {
            let dir = config.storage.conversations_dir();
            Arc::new(
                JsonMessageStore::new(&dir)
                    .await
                    .with_context(|| format!("opening message store in {}", dir.display()))?,
            )
        } else {
            Arc::new(MemoryMessageStore::new())
        };
        let history = repository
            .load(&session_id)
            .await
            .with_context(|| format!("loading conversations for {}", session_id))?;
        if let Some(path) = repository.path_for(&session_id) {
            info!(
                "loaded {} stored message(s) from {}",
                history.len(),
                path.display()
            );
        }

        let (persistence, _writer) = PersistenceHandle::spawn(
            Arc::clone(&repository),
            session_id.clone(),
            config.storage.writer_queue,
        );
        let nodes = Arc::new(NodeStore::new());
        let conversations = Arc::new(
            ConversationStore::new(Arc::clone(&nodes), config.messages.conversation_options())
                .with_persistence(persistence.clone()),
        );
        conversations.hydrate(history);
        let state = Arc::new(MeshState::with_stores(
            config.packets.capacity,
            nodes,
            conversations,
        ));

        let transport = HttpTransport::connect(address, &config.device)
            .await
            .map_err(|e| anyhow!("{}", e))?;
        let (status_tx, _) = watch::channel(transport.status());

        debug!("session key {}", safe_filename(&session_id));
        Ok(Self {
            state,
            transport,
            repository,
            persistence,
            session_id,
            status_tx,
            config_request_id: Mutex::new(None),
        })
    }

    pub fn state(&self) -> &Arc<MeshState> {
        &self.state
    }

    pub fn transport(&self) -> &Arc<HttpTransport> {
        &self.transport
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    /// Consume transport events until the stream ends.
    pub async fn run(&self) {
        while let Some(event) = self.transport.next_event().await {
            match event {
                DeviceOutput::Status(status) => {
                    self.status_tx.send_replace(status);
                }
                DeviceOutput::Frame(bytes) => {
                    let frame = self.state.ingest(&bytes);
                    if let Some(Envelope::ConfigComplete(id)) = frame.envelope() {
                        let expected = *self
                            .config_request_id
                            .lock()
                            .unwrap_or_else(|e| e.into_inner());
                        if expected == Some(*id) {
                            info!(
                                "config dump complete: {} node(s) known",
                                self.state.nodes().len()
                            );
                        }
                    }
                }
            }
        }
        debug!("transport stream ended");
    }

    /// Ask the device for its node database and configuration. Returns the request id
    /// that the closing `config_complete_id` will carry.
    pub async fn request_config(&self) -> Result<u32, TransportError> {
        let id = new_packet_id();
        *self
            .config_request_id
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(id);
        debug!("requesting config dump, id=0x{:08x}", id);
        self.transport.send(encode_want_config(id)).await?;
        Ok(id)
    }

    pub async fn send_heartbeat(&self) -> Result<(), TransportError> {
        self.transport.send(encode_heartbeat(rand::random())).await
    }

    pub async fn send_direct_message(&self, peer: u32, text: &str) -> Result<Message, ConversationError> {
        self.state
            .conversations()
            .send(self.transport.as_ref(), peer, text)
            .await
    }

    /// Re-derive nodes and conversations from the packet log and stored history.
    pub async fn rebuild_derived(&self) -> Result<()> {
        self.persistence.flush().await;
        let history = self
            .repository
            .load(&self.session_id)
            .await
            .with_context(|| format!("reloading conversations for {}", self.session_id))?;
        self.state.replay(history);
        Ok(())
    }

    /// Tell the device we are leaving, stop polling and flush pending writes.
    pub async fn shutdown(&self) {
        if let Err(e) = self.transport.send(encode_disconnect()).await {
            debug!("disconnect notice not delivered: {}", e);
        }
        self.transport.disconnect().await;
        if !self.persistence.flush().await {
            warn!("persistence writer stopped before flush");
        }
        self.state.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::meshtastic_generated as proto;
    use crate::protocol::MessageStatus;
    use bytes::Bytes;
    use prost::Message as _;
    use proto::from_radio::PayloadVariant as FR;
    use proto::mesh_packet::PayloadVariant as MP;

    const ME: u32 = 0x0a;
    const PEER: u32 = 0x0b;

    fn encode(v: FR) -> Vec<u8> {
        proto::FromRadio {
            id: 0,
            payload_variant: Some(v),
        }
        .encode_to_vec()
    }

    fn dm(from: u32, to: u32, id: u32) -> Vec<u8> {
        encode(FR::Packet(proto::MeshPacket {
            from,
            to,
            id,
            payload_variant: Some(MP::Decoded(proto::Data {
                portnum: proto::PortNum::TextMessageApp as i32,
                payload: Bytes::from_static(b"hey"),
                ..Default::default()
            })),
            ..Default::default()
        }))
    }

    fn my_info() -> Vec<u8> {
        encode(FR::MyInfo(proto::MyNodeInfo {
            my_node_num: ME,
            ..Default::default()
        }))
    }

    #[test]
    fn node_store_sees_frame_before_conversations() {
        let state = MeshState::new(100, ConversationOptions::default());
        state.ingest(&my_info());
        state.ingest(&dm(PEER, ME, 1));
        let conv = state.conversations().conversation(PEER).unwrap();
        assert_eq!(conv.messages.len(), 1);
        assert_eq!(conv.messages[0].status, MessageStatus::Acked);
        assert!(state.nodes().get_node(PEER).is_some());
    }

    #[test]
    fn open_peer_suppresses_unread() {
        let state = MeshState::new(100, ConversationOptions::default());
        state.ingest(&my_info());
        state.set_open_peer(Some(PEER));
        state.ingest(&dm(PEER, ME, 1));
        assert_eq!(state.conversations().conversation(PEER).unwrap().unread, 0);
        state.set_open_peer(None);
        state.ingest(&dm(PEER, ME, 2));
        assert_eq!(state.conversations().conversation(PEER).unwrap().unread, 1);
    }

    #[test]
    fn rebuild_derived_matches_live_state() {
        let state = MeshState::new(100, ConversationOptions::default());
        state.ingest(&my_info());
        state.ingest(&dm(PEER, ME, 1));
        state.ingest(&dm(ME, PEER, 2));
        state.ingest(&[0xff, 0x00]);
        let nodes_before = state.nodes().nodes();
        let conv_before = state.conversations().conversation(PEER);
        state.rebuild_derived();
        assert_eq!(state.nodes().nodes(), nodes_before);
        assert_eq!(state.conversations().conversation(PEER), conv_before);
    }

    #[test]
    fn replay_with_history_keeps_unread_counts() {
        let state = MeshState::new(100, ConversationOptions::default());
        state.ingest(&my_info());
        state.ingest(&dm(PEER, ME, 1));
        let live = state.conversations().conversation(PEER).unwrap();
        assert_eq!(live.unread, 1);

        state.replay(live.messages.clone());
        assert_eq!(state.conversations().conversation(PEER), Some(live.clone()));

        state.set_open_peer(Some(PEER));
        state.replay(live.messages);
        assert_eq!(state.conversations().conversation(PEER).unwrap().unread, 0);
    }

    #[test]
    fn favorites_survive_rebuild() {
        let state = MeshState::new(100, ConversationOptions::default());
        state.ingest(&encode(FR::NodeInfo(proto::NodeInfo {
            num: 5,
            ..Default::default()
        })));
        assert_eq!(state.nodes().toggle_favorite(5), Some(true));
        state.rebuild_derived();
        assert!(state.nodes().get_node(5).unwrap().is_favorite);
    }

    #[test]
    fn detach_stops_updates() {
        let state = MeshState::new(100, ConversationOptions::default());
        state.detach();
        state.ingest(&my_info());
        assert_eq!(state.nodes().my_node_num(), None);
        assert_eq!(state.packets().len(), 1);
    }
}
