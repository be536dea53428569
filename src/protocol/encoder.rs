//! `ToRadio` frame builders for the few things this client ever sends.

use bytes::Bytes;
use prost::Message;

use super::node_id::is_broadcast;
use crate::protobuf::meshtastic_generated as proto;

use proto::mesh_packet::PayloadVariant as MPPayload;
use proto::to_radio::PayloadVariant as TRPayload;
use proto::{Data, MeshPacket, PortNum, ToRadio};

pub const DEFAULT_HOP_LIMIT: u32 = 3;

/// Outbound text packet parameters.
#[derive(Debug, Clone)]
pub struct TextMessage<'a> {
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub hop_limit: u32,
    pub packet_id: u32,
    pub text: &'a str,
}

/// Random non-zero packet id; zero means "unassigned" to the firmware.
pub fn new_packet_id() -> u32 {
    let mut id: u32 = rand::random();
    if id == 0 {
        id = 1;
    }
    id
}

/// Text packet. Direct messages request an ack at RELIABLE priority; broadcasts do not.
pub fn encode_text_message(msg: &TextMessage<'_>) -> Bytes {
    let is_dm = !is_broadcast(msg.to);
    let data = Data {
        portnum: PortNum::TextMessageApp as i32,
        payload: Bytes::copy_from_slice(msg.text.as_bytes()),
        ..Default::default()
    };
    let pkt = MeshPacket {
        from: msg.from,
        to: msg.to,
        channel: msg.channel,
        id: msg.packet_id,
        hop_limit: msg.hop_limit,
        want_ack: is_dm,
        priority: if is_dm {
            proto::mesh_packet::Priority::Reliable as i32
        } else {
            proto::mesh_packet::Priority::Default as i32
        },
        payload_variant: Some(MPPayload::Decoded(data)),
        ..Default::default()
    };
    to_bytes(TRPayload::Packet(pkt))
}

/// Ask the device to stream its node database and configuration, ending with
/// `config_complete_id == request_id`.
pub fn encode_want_config(request_id: u32) -> Bytes {
    to_bytes(TRPayload::WantConfigId(request_id))
}

pub fn encode_heartbeat(nonce: u32) -> Bytes {
    to_bytes(TRPayload::Heartbeat(proto::Heartbeat { nonce }))
}

pub fn encode_disconnect() -> Bytes {
    to_bytes(TRPayload::Disconnect(true))
}

fn to_bytes(variant: TRPayload) -> Bytes {
    ToRadio {
        payload_variant: Some(variant),
    }
    .encode_to_vec()
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: Bytes) -> ToRadio {
        ToRadio::decode(bytes).expect("valid ToRadio")
    }

    #[test]
    fn direct_text_requests_ack() {
        let bytes = encode_text_message(&TextMessage {
            from: 0x11,
            to: 0x22,
            channel: 0,
            hop_limit: DEFAULT_HOP_LIMIT,
            packet_id: 0xdead,
            text: "ping",
        });
        let Some(TRPayload::Packet(pkt)) = decode(bytes).payload_variant else {
            panic!("expected packet");
        };
        assert!(pkt.want_ack);
        assert_eq!(pkt.id, 0xdead);
        assert_eq!(pkt.to, 0x22);
        let Some(MPPayload::Decoded(data)) = pkt.payload_variant else {
            panic!("expected decoded data");
        };
        assert_eq!(data.portnum, PortNum::TextMessageApp as i32);
        assert_eq!(&data.payload[..], b"ping");
    }

    #[test]
    fn broadcast_text_does_not_request_ack() {
        let bytes = encode_text_message(&TextMessage {
            from: 0x11,
            to: 0xffffffff,
            channel: 1,
            hop_limit: 2,
            packet_id: 5,
            text: "hi all",
        });
        let Some(TRPayload::Packet(pkt)) = decode(bytes).payload_variant else {
            panic!("expected packet");
        };
        assert!(!pkt.want_ack);
        assert_eq!(pkt.channel, 1);
    }

    #[test]
    fn control_frames() {
        assert_eq!(
            decode(encode_want_config(42)).payload_variant,
            Some(TRPayload::WantConfigId(42))
        );
        assert_eq!(
            decode(encode_heartbeat(7)).payload_variant,
            Some(TRPayload::Heartbeat(proto::Heartbeat { nonce: 7 }))
        );
        assert_eq!(
            decode(encode_disconnect()).payload_variant,
            Some(TRPayload::Disconnect(true))
        );
    }

    #[test]
    fn packet_ids_are_non_zero() {
        for _ in 0..1000 {
            assert_ne!(new_packet_id(), 0);
        }
    }
}
