//! Two-stage decoder for `FromRadio` frames.
//!
//! Stage 1 parses the outer envelope and picks its variant. Stage 2 runs only for
//! mesh packets and turns the `Data.payload` bytes into a port-specific shape.
//! Only stage-1 failures are reported as [`DecodeError`]; a packet whose payload
//! cannot be decoded is still a valid envelope with `payload: None`.

use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use log::{debug, trace};
use prost::Message;
use serde::Serialize;
use thiserror::Error;

use crate::logutil::hex_snippet;
use crate::metrics;
use crate::protobuf::meshtastic_generated as proto;

use proto::from_radio::PayloadVariant as FRPayload;
use proto::mesh_packet::PayloadVariant as MPPayload;
use proto::PortNum;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("empty frame")]
    Empty,
    #[error("malformed FromRadio: {0}")]
    Malformed(String),
    #[error("FromRadio carries no known payload variant")]
    UnknownVariant,
}

/// One unit of device output, successfully decoded or not.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrame {
    pub id: u64,
    pub received_at: DateTime<Utc>,
    pub raw: Bytes,
    pub body: Result<Envelope, DecodeError>,
}

impl DecodedFrame {
    pub fn envelope(&self) -> Option<&Envelope> {
        self.body.as_ref().ok()
    }

    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.body.as_ref().err()
    }

    pub fn mesh_packet(&self) -> Option<&DecodedPacket> {
        match self.envelope() {
            Some(Envelope::Packet(pkt)) => Some(pkt),
            _ => None,
        }
    }

    pub fn port_number(&self) -> Option<i32> {
        self.mesh_packet().and_then(|p| p.port)
    }

    pub fn port_payload(&self) -> Option<&PortPayload> {
        self.mesh_packet().and_then(|p| p.payload.as_ref())
    }

    /// Best timestamp for the frame in unix seconds: the radio's `rx_time` when the
    /// packet carries one, otherwise the local receive time.
    pub fn heard_at(&self) -> i64 {
        self.mesh_packet()
            .and_then(DecodedPacket::rx_time)
            .map(i64::from)
            .unwrap_or_else(|| self.received_at.timestamp())
    }
}

/// The populated `FromRadio` variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    Packet(DecodedPacket),
    MyInfo(proto::MyNodeInfo),
    NodeInfo(proto::NodeInfo),
    Config(proto::Config),
    ModuleConfig(proto::ModuleConfig),
    Channel(proto::Channel),
    ConfigComplete(u32),
    LogRecord(proto::LogRecord),
    Rebooted(bool),
    QueueStatus(proto::QueueStatus),
    Metadata(proto::DeviceMetadata),
    Other(OtherKind),
}

/// Variants the client recognises but does not model further.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OtherKind {
    XModem,
    MqttClientProxy,
    FileInfo(String),
    ClientNotification(String),
    DeviceUiConfig,
}

impl Envelope {
    /// Variant name as it appears in the protobuf schema.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Envelope::Packet(_) => "packet",
            Envelope::MyInfo(_) => "myInfo",
            Envelope::NodeInfo(_) => "nodeInfo",
            Envelope::Config(_) => "config",
            Envelope::ModuleConfig(_) => "moduleConfig",
            Envelope::Channel(_) => "channel",
            Envelope::ConfigComplete(_) => "configCompleteId",
            Envelope::LogRecord(_) => "logRecord",
            Envelope::Rebooted(_) => "rebooted",
            Envelope::QueueStatus(_) => "queueStatus",
            Envelope::Metadata(_) => "metadata",
            Envelope::Other(OtherKind::XModem) => "xmodemPacket",
            Envelope::Other(OtherKind::MqttClientProxy) => "mqttClientProxyMessage",
            Envelope::Other(OtherKind::FileInfo(_)) => "fileInfo",
            Envelope::Other(OtherKind::ClientNotification(_)) => "clientNotification",
            Envelope::Other(OtherKind::DeviceUiConfig) => "deviceuiConfig",
        }
    }
}

/// A mesh packet with its payload decoded according to the port number.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedPacket {
    pub packet: proto::MeshPacket,
    /// Raw port number; `None` when the packet is still encrypted.
    pub port: Option<i32>,
    /// Structured payload; `None` for encrypted packets or undecodable payloads.
    pub payload: Option<PortPayload>,
}

impl DecodedPacket {
    pub fn from(&self) -> u32 {
        self.packet.from
    }

    pub fn to(&self) -> u32 {
        self.packet.to
    }

    pub fn id(&self) -> u32 {
        self.packet.id
    }

    pub fn data(&self) -> Option<&proto::Data> {
        match &self.packet.payload_variant {
            Some(MPPayload::Decoded(data)) => Some(data),
            _ => None,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.packet.payload_variant, Some(MPPayload::Encrypted(_)))
    }

    pub fn port_num(&self) -> Option<PortNum> {
        self.port.and_then(|p| PortNum::try_from(p).ok())
    }

    pub fn rx_time(&self) -> Option<u32> {
        (self.packet.rx_time != 0).then_some(self.packet.rx_time)
    }

    /// Relay hops between the originator and our device, when the firmware
    /// reports `hop_start`.
    pub fn hops_away(&self) -> Option<u32> {
        let p = &self.packet;
        (p.hop_start > 0 && p.hop_start >= p.hop_limit).then(|| p.hop_start - p.hop_limit)
    }

    /// SNR of the received packet, when the packet carries radio metrics at all.
    pub fn rx_snr(&self) -> Option<f32> {
        let p = &self.packet;
        (p.rx_snr != 0.0 || p.rx_rssi != 0).then_some(p.rx_snr)
    }

    pub fn rx_rssi(&self) -> Option<i32> {
        (self.packet.rx_rssi != 0).then_some(self.packet.rx_rssi)
    }
}

/// Port-specific payload shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum PortPayload {
    Text(String),
    Position(PositionReport),
    NodeInfo(proto::User),
    Telemetry(TelemetryReport),
    Routing(RoutingReport),
    Traceroute(TracerouteReport),
    Admin(proto::AdminMessage),
    Waypoint(proto::Waypoint),
    RangeTest(String),
    StoreForward(proto::StoreAndForward),
    NeighborInfo(proto::NeighborInfo),
    Opaque(Bytes),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionReport {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub altitude: Option<i32>,
    pub time: Option<u32>,
    pub sats_in_view: u32,
    pub ground_speed: Option<u32>,
}

impl From<&proto::Position> for PositionReport {
    fn from(pos: &proto::Position) -> Self {
        Self {
            latitude: pos.latitude_i.map(|v| v as f64 * 1e-7),
            longitude: pos.longitude_i.map(|v| v as f64 * 1e-7),
            altitude: pos.altitude.or(pos.altitude_hae),
            time: (pos.time != 0).then_some(pos.time),
            sats_in_view: pos.sats_in_view,
            ground_speed: pos.ground_speed,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TelemetryReport {
    pub time: u32,
    pub metrics: TelemetryMetrics,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryMetrics {
    Device(proto::DeviceMetrics),
    Environment(proto::EnvironmentMetrics),
    Power(proto::PowerMetrics),
    LocalStats(proto::LocalStats),
    /// A telemetry variant this client does not model (air quality, health, ...).
    Unrecognised,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoutingReport {
    /// `error_reason == NONE`: delivery confirmation.
    Ack,
    /// Any other error code, kept raw so codes newer than the schema survive.
    Error(i32),
    RouteRequest(Vec<u32>),
    RouteReply(Vec<u32>),
}

impl RoutingReport {
    pub fn is_ack(&self) -> bool {
        matches!(self, RoutingReport::Ack)
    }
}

/// Name of a routing error code, e.g. `MAX_RETRANSMIT`.
pub fn routing_error_name(code: i32) -> String {
    proto::routing::Error::try_from(code)
        .map(|e| e.as_str_name().to_string())
        .unwrap_or_else(|_| format!("ERROR_{code}"))
}

/// Name of a port number, e.g. `TEXT_MESSAGE_APP`.
pub fn port_name(port: i32) -> String {
    PortNum::try_from(port)
        .map(|p| p.as_str_name().to_string())
        .unwrap_or_else(|_| format!("PORT_{port}"))
}

/// Traceroute result. SNR values are in dB (the wire carries quarter-dB steps).
#[derive(Debug, Clone, PartialEq)]
pub struct TracerouteReport {
    pub route: Vec<u32>,
    pub snr_towards: Vec<f32>,
    pub route_back: Vec<u32>,
    pub snr_back: Vec<f32>,
}

impl From<proto::RouteDiscovery> for TracerouteReport {
    fn from(rd: proto::RouteDiscovery) -> Self {
        let quarter_db = |v: &i32| *v as f32 / 4.0;
        Self {
            snr_towards: rd.snr_towards.iter().map(quarter_db).collect(),
            snr_back: rd.snr_back.iter().map(quarter_db).collect(),
            route: rd.route,
            route_back: rd.route_back,
        }
    }
}

/// Stateful only in that it hands out frame ids.
#[derive(Debug)]
pub struct FrameDecoder {
    next_id: AtomicU64,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> DecodedFrame {
        self.decode_at(bytes, Utc::now())
    }

    /// Decode with an explicit receive time (replays, tests).
    pub fn decode_at(&self, bytes: &[u8], received_at: DateTime<Utc>) -> DecodedFrame {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let raw = Bytes::copy_from_slice(bytes);
        let body = decode_envelope(&raw);
        metrics::inc_frames_received();
        match &body {
            Ok(env) => trace!("frame #{} decoded as {}", id, env.kind_name()),
            Err(e) => {
                metrics::inc_decode_failed();
                debug!(
                    "frame #{} failed to decode ({} bytes, {}): {}",
                    id,
                    raw.len(),
                    hex_snippet(&raw, 24),
                    e
                );
            }
        }
        DecodedFrame {
            id,
            received_at,
            raw,
            body,
        }
    }
}

fn decode_envelope(raw: &Bytes) -> Result<Envelope, DecodeError> {
    if raw.is_empty() {
        return Err(DecodeError::Empty);
    }
    let msg = proto::FromRadio::decode(raw.clone())
        .map_err(|e| DecodeError::Malformed(e.to_string()))?;
    let variant = msg.payload_variant.ok_or(DecodeError::UnknownVariant)?;
    Ok(match variant {
        FRPayload::Packet(pkt) => Envelope::Packet(decode_packet(pkt)),
        FRPayload::MyInfo(info) => Envelope::MyInfo(info),
        FRPayload::NodeInfo(info) => Envelope::NodeInfo(info),
        FRPayload::Config(cfg) => Envelope::Config(cfg),
        FRPayload::LogRecord(rec) => Envelope::LogRecord(rec),
        FRPayload::ConfigCompleteId(id) => Envelope::ConfigComplete(id),
        FRPayload::Rebooted(flag) => Envelope::Rebooted(flag),
        FRPayload::ModuleConfig(cfg) => Envelope::ModuleConfig(cfg),
        FRPayload::Channel(ch) => Envelope::Channel(ch),
        FRPayload::QueueStatus(qs) => Envelope::QueueStatus(qs),
        FRPayload::XmodemPacket(_) => Envelope::Other(OtherKind::XModem),
        FRPayload::Metadata(md) => Envelope::Metadata(md),
        FRPayload::MqttClientProxyMessage(_) => Envelope::Other(OtherKind::MqttClientProxy),
        FRPayload::FileInfo(fi) => Envelope::Other(OtherKind::FileInfo(fi.file_name)),
        FRPayload::ClientNotification(cn) => {
            Envelope::Other(OtherKind::ClientNotification(cn.message))
        }
        FRPayload::DeviceuiConfig(_) => Envelope::Other(OtherKind::DeviceUiConfig),
    })
}

fn decode_packet(packet: proto::MeshPacket) -> DecodedPacket {
    let (port, payload) = match &packet.payload_variant {
        Some(MPPayload::Decoded(data)) => {
            let payload = decode_port_payload(data.portnum, &data.payload);
            if payload.is_none() {
                debug!(
                    "packet 0x{:08x} from !{:08x}: {} payload did not decode ({} bytes)",
                    packet.id,
                    packet.from,
                    port_name(data.portnum),
                    data.payload.len()
                );
            }
            (Some(data.portnum), payload)
        }
        Some(MPPayload::Encrypted(_)) | None => (None, None),
    };
    DecodedPacket {
        packet,
        port,
        payload,
    }
}

/// Stage 2. Returns `None` when a known port's payload does not parse.
fn decode_port_payload(port: i32, payload: &Bytes) -> Option<PortPayload> {
    let Ok(known) = PortNum::try_from(port) else {
        return Some(text_or_opaque(payload));
    };
    match known {
        PortNum::TextMessageApp | PortNum::AlertApp | PortNum::DetectionSensorApp => {
            std::str::from_utf8(payload)
                .ok()
                .map(|s| PortPayload::Text(s.to_string()))
        }
        PortNum::RangeTestApp => std::str::from_utf8(payload)
            .ok()
            .map(|s| PortPayload::RangeTest(s.to_string())),
        PortNum::PositionApp => proto::Position::decode(payload.clone())
            .ok()
            .map(|pos| PortPayload::Position(PositionReport::from(&pos))),
        PortNum::NodeinfoApp => proto::User::decode(payload.clone())
            .ok()
            .map(PortPayload::NodeInfo),
        PortNum::TelemetryApp => proto::Telemetry::decode(payload.clone())
            .ok()
            .map(|t| PortPayload::Telemetry(telemetry_report(t))),
        PortNum::RoutingApp => {
            let routing = proto::Routing::decode(payload.clone()).ok()?;
            use proto::routing::{Error as RErr, Variant as RVar};
            let report = match routing.variant? {
                RVar::ErrorReason(code) if code == RErr::None as i32 => RoutingReport::Ack,
                RVar::ErrorReason(code) => RoutingReport::Error(code),
                RVar::RouteRequest(rd) => RoutingReport::RouteRequest(rd.route),
                RVar::RouteReply(rd) => RoutingReport::RouteReply(rd.route),
            };
            Some(PortPayload::Routing(report))
        }
        PortNum::TracerouteApp => proto::RouteDiscovery::decode(payload.clone())
            .ok()
            .map(|rd| PortPayload::Traceroute(rd.into())),
        PortNum::AdminApp => proto::AdminMessage::decode(payload.clone())
            .ok()
            .map(PortPayload::Admin),
        PortNum::WaypointApp => proto::Waypoint::decode(payload.clone())
            .ok()
            .map(PortPayload::Waypoint),
        PortNum::StoreForwardApp => proto::StoreAndForward::decode(payload.clone())
            .ok()
            .map(PortPayload::StoreForward),
        PortNum::NeighborinfoApp => proto::NeighborInfo::decode(payload.clone())
            .ok()
            .map(PortPayload::NeighborInfo),
        _ => Some(text_or_opaque(payload)),
    }
}

fn telemetry_report(t: proto::Telemetry) -> TelemetryReport {
    use proto::telemetry::Variant as TVar;
    let metrics = match t.variant {
        Some(TVar::DeviceMetrics(dm)) => TelemetryMetrics::Device(dm),
        Some(TVar::EnvironmentMetrics(env)) => TelemetryMetrics::Environment(env),
        Some(TVar::PowerMetrics(pm)) => TelemetryMetrics::Power(pm),
        Some(TVar::LocalStats(ls)) => TelemetryMetrics::LocalStats(ls),
        None => TelemetryMetrics::Unrecognised,
    };
    TelemetryReport {
        time: t.time,
        metrics,
    }
}

/// Ports without a structured shape: printable UTF-8 becomes text, anything
/// else stays as bytes.
fn text_or_opaque(payload: &Bytes) -> PortPayload {
    match std::str::from_utf8(payload) {
        Ok(s) if !s.is_empty() && s.chars().all(|c| !c.is_control() || c.is_whitespace()) => {
            PortPayload::Text(s.to_string())
        }
        _ => PortPayload::Opaque(payload.clone()),
    }
}
