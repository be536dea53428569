//! Frame builders and config fixtures shared by the integration tests.
#![allow(dead_code)]

use bytes::Bytes;
use prost::Message as _;

use meshscope::config::Config;
use meshscope::protobuf::meshtastic_generated as proto;
use proto::from_radio::PayloadVariant as FR;
use proto::mesh_packet::PayloadVariant as MP;

pub const ME: u32 = 0x1000_0001;
pub const PEER: u32 = 0x2000_0002;
pub const OTHER: u32 = 0x3000_0003;

pub fn from_radio(variant: FR) -> Vec<u8> {
    proto::FromRadio {
        id: 0,
        payload_variant: Some(variant),
    }
    .encode_to_vec()
}

pub fn my_info(num: u32) -> Vec<u8> {
    from_radio(FR::MyInfo(proto::MyNodeInfo {
        my_node_num: num,
        ..Default::default()
    }))
}

pub fn node_info(num: u32, short: &str, long: &str) -> Vec<u8> {
    from_radio(FR::NodeInfo(proto::NodeInfo {
        num,
        user: Some(proto::User {
            id: format!("!{:08x}", num),
            short_name: short.to_string(),
            long_name: long.to_string(),
            ..Default::default()
        }),
        last_heard: 1_700_000_000,
        ..Default::default()
    }))
}

pub fn config_complete(id: u32) -> Vec<u8> {
    from_radio(FR::ConfigCompleteId(id))
}

fn data_packet(from: u32, to: u32, id: u32, data: proto::Data) -> Vec<u8> {
    from_radio(FR::Packet(proto::MeshPacket {
        from,
        to,
        id,
        hop_start: 3,
        hop_limit: 2,
        rx_snr: 6.5,
        payload_variant: Some(MP::Decoded(data)),
        ..Default::default()
    }))
}

pub fn text(from: u32, to: u32, id: u32, body: &str) -> Vec<u8> {
    data_packet(
        from,
        to,
        id,
        proto::Data {
            portnum: proto::PortNum::TextMessageApp as i32,
            payload: Bytes::copy_from_slice(body.as_bytes()),
            ..Default::default()
        },
    )
}

/// Routing report for `request_id`; `code` 0 is an ack.
pub fn routing(from: u32, to: u32, request_id: u32, code: i32) -> Vec<u8> {
    let routing = proto::Routing {
        variant: Some(proto::routing::Variant::ErrorReason(code)),
    };
    data_packet(
        from,
        to,
        0x7777_0000 | (request_id & 0xffff),
        proto::Data {
            portnum: proto::PortNum::RoutingApp as i32,
            payload: routing.encode_to_vec().into(),
            request_id,
            ..Default::default()
        },
    )
}

pub fn battery(from: u32, level: u32) -> Vec<u8> {
    let telemetry = proto::Telemetry {
        time: 0,
        variant: Some(proto::telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
            battery_level: Some(level),
            voltage: Some(4.1),
            ..Default::default()
        })),
    };
    data_packet(
        from,
        0xffff_ffff,
        0x4242,
        proto::Data {
            portnum: proto::PortNum::TelemetryApp as i32,
            payload: telemetry.encode_to_vec().into(),
            ..Default::default()
        },
    )
}

/// Config pointed at `data_dir` with a fast poll loop.
pub fn test_config(data_dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.device.poll_interval_ms = 20;
    config.device.request_timeout_ms = 1000;
    config.storage.data_dir = data_dir.to_string_lossy().into_owned();
    config.logging.level = "error".into();
    config
}

/// Decode a `ToRadio` body captured from the mock device.
pub fn decode_to_radio(body: &[u8]) -> proto::ToRadio {
    proto::ToRadio::decode(body).expect("ToRadio")
}

/// Mock `fromradio` endpoint: each GET pops the next queued frame, or answers
/// with an empty body when nothing is queued.
#[derive(Clone, Default)]
pub struct FrameQueue {
    frames: std::sync::Arc<std::sync::Mutex<std::collections::VecDeque<Vec<u8>>>>,
}

impl FrameQueue {
    pub fn push(&self, frame: Vec<u8>) {
        self.frames.lock().unwrap().push_back(frame);
    }

    pub fn pending(&self) -> usize {
        self.frames.lock().unwrap().len()
    }

    /// Serve `fromradio` from this queue and accept every `toradio` PUT.
    pub async fn mount(&self, server: &wiremock::MockServer) {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, ResponseTemplate};
        Mock::given(method("GET"))
            .and(path("/api/v1/fromradio"))
            .respond_with(self.clone())
            .mount(server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/api/v1/toradio"))
            .respond_with(ResponseTemplate::new(200))
            .mount(server)
            .await;
    }
}

impl wiremock::Respond for FrameQueue {
    fn respond(&self, _request: &wiremock::Request) -> wiremock::ResponseTemplate {
        match self.frames.lock().unwrap().pop_front() {
            Some(frame) => wiremock::ResponseTemplate::new(200).set_body_bytes(frame),
            None => wiremock::ResponseTemplate::new(200),
        }
    }
}

/// Poll `check` until it holds or five seconds pass.
pub async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(5);
    while !check() {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

/// `ToRadio` packets captured by the mock device, oldest first.
pub async fn sent_packets(server: &wiremock::MockServer) -> Vec<proto::MeshPacket> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|r| r.method.as_str() == "PUT")
        .filter_map(|r| match decode_to_radio(&r.body).payload_variant {
            Some(proto::to_radio::PayloadVariant::Packet(p)) => Some(p),
            _ => None,
        })
        .collect()
}
