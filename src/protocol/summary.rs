//! One-line text renderings of decoded frames for logs and the `monitor` command.

use super::decoder::{
    port_name, routing_error_name, DecodedFrame, DecodedPacket, Envelope, OtherKind, PortPayload,
    RoutingReport, TelemetryMetrics,
};
use super::node_id::{format_node_id, is_broadcast};
use super::node_store::NodeStore;
use crate::logutil::{escape_log, truncate_for_log};
use crate::protobuf::meshtastic_generated as proto;

const TEXT_PREVIEW_BYTES: usize = 80;

pub fn summarize_frame(frame: &DecodedFrame, nodes: &NodeStore) -> String {
    let body = match &frame.body {
        Err(e) => format!("decode error: {} ({} bytes)", e, frame.raw.len()),
        Ok(Envelope::Packet(pkt)) => summarize_packet(pkt, nodes),
        Ok(env) => summarize_envelope(env, nodes),
    };
    format!("#{} {}", frame.id, body)
}

fn summarize_envelope(env: &Envelope, nodes: &NodeStore) -> String {
    match env {
        Envelope::Packet(pkt) => summarize_packet(pkt, nodes),
        Envelope::MyInfo(info) => format!(
            "myInfo node={} reboots={}",
            format_node_id(info.my_node_num),
            info.reboot_count
        ),
        Envelope::NodeInfo(info) => {
            let name = info
                .user
                .as_ref()
                .map(user_label)
                .unwrap_or_else(|| "user".to_string());
            let mut out = format!("nodeInfo {} {}", format_node_id(info.num), name);
            if let Some(h) = info.hops_away {
                out.push_str(&format!(" hops={}", h));
            }
            out
        }
        Envelope::Config(cfg) => format!(
            "config/{}",
            cfg.payload_variant
                .as_ref()
                .map(config_variant_name)
                .unwrap_or("empty")
        ),
        Envelope::ModuleConfig(cfg) => format!(
            "moduleConfig/{}",
            cfg.payload_variant
                .as_ref()
                .map(module_config_variant_name)
                .unwrap_or("empty")
        ),
        Envelope::Channel(ch) => {
            let role = proto::channel::Role::try_from(ch.role)
                .map(|r| r.as_str_name())
                .unwrap_or("UNKNOWN");
            let name = ch
                .settings
                .as_ref()
                .map(|s| s.name.trim())
                .filter(|n| !n.is_empty())
                .unwrap_or("(default)");
            format!("channel #{} {} {}", ch.index, role, escape_log(name))
        }
        Envelope::ConfigComplete(id) => format!("configComplete id=0x{:08x}", id),
        Envelope::LogRecord(rec) => {
            let level = proto::log_record::Level::try_from(rec.level)
                .map(|l| l.as_str_name())
                .unwrap_or("UNSET");
            format!(
                "log {} {}: {}",
                level,
                rec.source,
                truncate_for_log(&rec.message, TEXT_PREVIEW_BYTES)
            )
        }
        Envelope::Rebooted(_) => "rebooted".to_string(),
        Envelope::QueueStatus(qs) => format!(
            "queueStatus free={}/{} res={} packet=0x{:08x}",
            qs.free, qs.maxlen, qs.res, qs.mesh_packet_id
        ),
        Envelope::Metadata(md) => format!(
            "metadata fw={} hw={}",
            md.firmware_version,
            super::node_store::hw_model_name(md.hw_model)
        ),
        Envelope::Other(OtherKind::FileInfo(name)) => format!("fileInfo {}", escape_log(name)),
        Envelope::Other(OtherKind::ClientNotification(msg)) => {
            format!("clientNotification {}", truncate_for_log(msg, TEXT_PREVIEW_BYTES))
        }
        Envelope::Other(other) => match other {
            OtherKind::XModem => "xmodemPacket",
            OtherKind::MqttClientProxy => "mqttClientProxyMessage",
            _ => "deviceuiConfig",
        }
        .to_string(),
    }
}

fn summarize_packet(pkt: &DecodedPacket, nodes: &NodeStore) -> String {
    let from = nodes.get_node_name(pkt.from());
    let to = if is_broadcast(pkt.to()) {
        "^all".to_string()
    } else {
        nodes.get_node_name(pkt.to())
    };
    let mut out = format!("{} -> {}", from, to);
    match pkt.port {
        None => out.push_str(&format!(
            " encrypted ({} bytes)",
            match &pkt.packet.payload_variant {
                Some(proto::mesh_packet::PayloadVariant::Encrypted(b)) => b.len(),
                _ => 0,
            }
        )),
        Some(port) => {
            out.push(' ');
            out.push_str(&port_name(port));
            match &pkt.payload {
                Some(payload) => {
                    let detail = summarize_payload(payload, nodes);
                    if !detail.is_empty() {
                        out.push(' ');
                        out.push_str(&detail);
                    }
                }
                None => out.push_str(" (undecodable payload)"),
            }
        }
    }
    if let Some(h) = pkt.hops_away() {
        out.push_str(&format!(" hops={}", h));
    }
    if let Some(snr) = pkt.rx_snr() {
        out.push_str(&format!(" snr={:.1}", snr));
    }
    out
}

fn summarize_payload(payload: &PortPayload, nodes: &NodeStore) -> String {
    match payload {
        PortPayload::Text(t) => format!("\"{}\"", truncate_for_log(t, TEXT_PREVIEW_BYTES)),
        PortPayload::Position(pos) => {
            let mut parts = Vec::new();
            if let (Some(la), Some(lo)) = (pos.latitude, pos.longitude) {
                parts.push(format!("lat={:.5} lon={:.5}", la, lo));
            }
            if let Some(a) = pos.altitude {
                parts.push(format!("alt={}m", a));
            }
            if pos.sats_in_view > 0 {
                parts.push(format!("sats={}", pos.sats_in_view));
            }
            parts.join(" ")
        }
        PortPayload::NodeInfo(user) => user_label(user),
        PortPayload::Telemetry(t) => summarize_telemetry(&t.metrics),
        PortPayload::Routing(RoutingReport::Ack) => "ACK".to_string(),
        PortPayload::Routing(RoutingReport::Error(code)) => {
            format!("NAK {}", routing_error_name(*code))
        }
        PortPayload::Routing(RoutingReport::RouteRequest(route)) => {
            format!("route request via {} hops", route.len())
        }
        PortPayload::Routing(RoutingReport::RouteReply(route)) => {
            format!("route reply via {} hops", route.len())
        }
        PortPayload::Traceroute(tr) => {
            let path: Vec<String> = tr.route.iter().map(|n| nodes.get_node_name(*n)).collect();
            let mut out = format!("via {} hops", tr.route.len());
            if !path.is_empty() {
                out.push_str(&format!(" [{}]", path.join(" > ")));
            }
            if !tr.route_back.is_empty() {
                out.push_str(&format!(" back via {} hops", tr.route_back.len()));
            }
            out
        }
        PortPayload::Admin(admin) => admin
            .payload_variant
            .as_ref()
            .map(admin_variant_name)
            .unwrap_or("empty")
            .to_string(),
        PortPayload::Waypoint(wp) => {
            let mut out = format!("\"{}\"", escape_log(&wp.name));
            if let (Some(la), Some(lo)) = (wp.latitude_i, wp.longitude_i) {
                out.push_str(&format!(
                    " lat={:.5} lon={:.5}",
                    la as f64 * 1e-7,
                    lo as f64 * 1e-7
                ));
            }
            out
        }
        PortPayload::RangeTest(seq) => format!("\"{}\"", truncate_for_log(seq, 40)),
        PortPayload::StoreForward(sf) => proto::store_and_forward::RequestResponse::try_from(sf.rr)
            .map(|rr| rr.as_str_name().to_string())
            .unwrap_or_else(|_| format!("rr={}", sf.rr)),
        PortPayload::NeighborInfo(ni) => format!("{} neighbors", ni.neighbors.len()),
        PortPayload::Opaque(bytes) => format!("{} bytes", bytes.len()),
    }
}

fn summarize_telemetry(metrics: &TelemetryMetrics) -> String {
    match metrics {
        TelemetryMetrics::Device(dm) => {
            let mut parts: Vec<String> = vec!["device".to_string()];
            if let Some(batt) = dm.battery_level {
                parts.push(format!("batt={}%", batt));
            }
            if let Some(v) = dm.voltage {
                parts.push(format!("v={:.2}V", v));
            }
            if let Some(util) = dm.channel_utilization {
                parts.push(format!("util={}", fmt_percent(util)));
            }
            if let Some(tx) = dm.air_util_tx {
                parts.push(format!("tx={}", fmt_percent(tx)));
            }
            parts.join(" ")
        }
        TelemetryMetrics::Environment(env) => {
            let mut parts: Vec<String> = vec!["env".to_string()];
            if let Some(t) = env.temperature {
                parts.push(format!("temp={:.1}C", t));
            }
            if let Some(h) = env.relative_humidity {
                parts.push(format!("hum={:.0}%", h));
            }
            if let Some(p) = env.barometric_pressure {
                parts.push(format!("press={:.0}hPa", p));
            }
            parts.join(" ")
        }
        TelemetryMetrics::Power(_) => "power".to_string(),
        TelemetryMetrics::LocalStats(ls) => format!(
            "local up={}s util={} tx={} rx={} bad={} dupe={} online={}/{}",
            ls.uptime_seconds,
            fmt_percent(ls.channel_utilization),
            fmt_percent(ls.air_util_tx),
            ls.num_packets_rx,
            ls.num_packets_rx_bad,
            ls.num_rx_dupe,
            ls.num_online_nodes,
            ls.num_total_nodes
        ),
        TelemetryMetrics::Unrecognised => "other".to_string(),
    }
}

/// Device-reported utilisation is either a 0..1 fraction or already a percentage.
fn fmt_percent(val: f32) -> String {
    if !val.is_finite() {
        "na".to_string()
    } else if val <= 1.0 {
        format!("{:.0}%", val * 100.0)
    } else {
        format!("{:.0}%", val)
    }
}

fn user_label(u: &proto::User) -> String {
    let ln = escape_log(u.long_name.trim());
    let sn = escape_log(u.short_name.trim());
    match (ln.is_empty(), sn.is_empty()) {
        (false, false) => format!("{} ({})", ln, sn),
        (true, true) => "user".to_string(),
        _ => format!("{}{}", ln, sn),
    }
}

pub fn config_variant_name(v: &proto::config::PayloadVariant) -> &'static str {
    use proto::config::PayloadVariant as C;
    match v {
        C::Device(_) => "device",
        C::Position(_) => "position",
        C::Power(_) => "power",
        C::Network(_) => "network",
        C::Display(_) => "display",
        C::Lora(_) => "lora",
        C::Bluetooth(_) => "bluetooth",
        C::Security(_) => "security",
        C::Sessionkey(_) => "sessionkey",
        C::DeviceUi(_) => "deviceUi",
    }
}

pub fn module_config_variant_name(v: &proto::module_config::PayloadVariant) -> &'static str {
    use proto::module_config::PayloadVariant as M;
    match v {
        M::Mqtt(_) => "mqtt",
        M::Serial(_) => "serial",
        M::ExternalNotification(_) => "externalNotification",
        M::StoreForward(_) => "storeForward",
        M::RangeTest(_) => "rangeTest",
        M::Telemetry(_) => "telemetry",
        M::CannedMessage(_) => "cannedMessage",
        M::Audio(_) => "audio",
        M::RemoteHardware(_) => "remoteHardware",
        M::NeighborInfo(_) => "neighborInfo",
        M::AmbientLighting(_) => "ambientLighting",
        M::DetectionSensor(_) => "detectionSensor",
        M::Paxcounter(_) => "paxcounter",
    }
}

fn admin_variant_name(v: &proto::admin_message::PayloadVariant) -> &'static str {
    use proto::admin_message::PayloadVariant as A;
    match v {
        A::GetChannelRequest(_) => "get_channel_request",
        A::GetChannelResponse(_) => "get_channel_response",
        A::GetOwnerRequest(_) => "get_owner_request",
        A::GetOwnerResponse(_) => "get_owner_response",
        A::GetConfigRequest(_) => "get_config_request",
        A::GetConfigResponse(_) => "get_config_response",
        A::GetModuleConfigRequest(_) => "get_module_config_request",
        A::GetModuleConfigResponse(_) => "get_module_config_response",
        A::GetDeviceMetadataRequest(_) => "get_device_metadata_request",
        A::GetDeviceMetadataResponse(_) => "get_device_metadata_response",
        A::SetOwner(_) => "set_owner",
        A::SetChannel(_) => "set_channel",
        A::SetConfig(_) => "set_config",
        A::SetModuleConfig(_) => "set_module_config",
        A::RemoveByNodenum(_) => "remove_by_nodenum",
        A::SetFavoriteNode(_) => "set_favorite_node",
        A::RemoveFavoriteNode(_) => "remove_favorite_node",
        A::BeginEditSettings(_) => "begin_edit_settings",
        A::CommitEditSettings(_) => "commit_edit_settings",
        A::RebootSeconds(_) => "reboot_seconds",
        A::ShutdownSeconds(_) => "shutdown_seconds",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decoder::FrameDecoder;
    use prost::Message;
    use proto::from_radio::PayloadVariant as FR;
    use proto::mesh_packet::PayloadVariant as MP;

    fn encode(v: FR) -> Vec<u8> {
        proto::FromRadio {
            id: 0,
            payload_variant: Some(v),
        }
        .encode_to_vec()
    }

    fn packet(to: u32, port: proto::PortNum, payload: Vec<u8>) -> Vec<u8> {
        encode(FR::Packet(proto::MeshPacket {
            from: 0xabcd1234,
            to,
            payload_variant: Some(MP::Decoded(proto::Data {
                portnum: port as i32,
                payload: payload.into(),
                ..Default::default()
            })),
            ..Default::default()
        }))
    }

    #[test]
    fn broadcast_text_uses_compact_label() {
        let nodes = NodeStore::new();
        let f = FrameDecoder::new().decode(&packet(0xffffffff, proto::PortNum::TextMessageApp, b"hello".to_vec()));
        assert_eq!(
            summarize_frame(&f, &nodes),
            "#1 !abcd1234 -> ^all TEXT_MESSAGE_APP \"hello\""
        );
    }

    #[test]
    fn routing_ack_and_nak() {
        let nodes = NodeStore::new();
        let d = FrameDecoder::new();
        let ack = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(0)),
        };
        let s = summarize_frame(&d.decode(&packet(1, proto::PortNum::RoutingApp, ack.encode_to_vec())), &nodes);
        assert!(s.ends_with("ROUTING_APP ACK"), "{s}");
        let nak = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(3)),
        };
        let s = summarize_frame(&d.decode(&packet(1, proto::PortNum::RoutingApp, nak.encode_to_vec())), &nodes);
        assert!(s.ends_with("NAK TIMEOUT"), "{s}");
    }

    #[test]
    fn traceroute_hop_count() {
        let nodes = NodeStore::new();
        let rd = proto::RouteDiscovery {
            route: vec![1, 2],
            ..Default::default()
        };
        let s = summarize_frame(
            &FrameDecoder::new().decode(&packet(5, proto::PortNum::TracerouteApp, rd.encode_to_vec())),
            &nodes,
        );
        assert!(s.contains("via 2 hops"), "{s}");
    }

    #[test]
    fn config_variants_and_errors() {
        let nodes = NodeStore::new();
        let d = FrameDecoder::new();
        let cfg = proto::Config {
            payload_variant: Some(proto::config::PayloadVariant::Lora(Default::default())),
        };
        assert_eq!(summarize_frame(&d.decode(&encode(FR::Config(cfg))), &nodes), "#1 config/lora");
        let s = summarize_frame(&d.decode(&[0xff, 0xff]), &nodes);
        assert!(s.starts_with("#2 decode error"), "{s}");
    }
}
