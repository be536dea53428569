//! Meshtastic frame protocol: decoding, outbound encoding and the derived state stores.
//!
//! Data flows one way: bytes → [`FrameDecoder`] → [`PacketStore`] → subscribers
//! ([`NodeStore`] first, then [`ConversationStore`]).

pub mod conversation_store;
pub mod decoder;
pub mod encoder;
pub mod node_id;
pub mod node_store;
pub mod packet_store;
pub mod summary;

pub use conversation_store::{
    Conversation, ConversationError, ConversationOptions, ConversationStore, ConversationSummary,
    Direction, DisplayStatus, Message, MessageKey, MessageStatus,
};
pub use decoder::{DecodeError, DecodedFrame, DecodedPacket, Envelope, FrameDecoder, PortPayload};
pub use node_id::{format_node_id, NodeId, BROADCAST_NUM};
pub use node_store::{NodeRecord, NodeStore};
pub use packet_store::{PacketStore, Subscription};
pub use summary::summarize_frame;
