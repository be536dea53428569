//! Registry of every node the device has told us about or that we heard transmit.
//!
//! Records are created or updated, never removed (short of [`NodeStore::clear`]).
//! All mutation goes through [`NodeStore::apply_frame`], which makes the store a
//! pure function of the frame sequence.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use log::debug;
use serde::Serialize;

use super::decoder::{
    DecodedFrame, DecodedPacket, Envelope, PortPayload, PositionReport, TelemetryMetrics,
    TelemetryReport,
};
use super::node_id::format_node_id;
use crate::logutil::escape_log;
use crate::protobuf::meshtastic_generated as proto;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub num: u32,
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hw_model: Option<String>,
    pub hops_away: Option<u32>,
    pub snr: Option<f32>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub is_favorite: bool,
    /// Unix seconds; 0 means never heard.
    pub last_heard: i64,
    pub position: Option<PositionReport>,
}

impl NodeRecord {
    fn new(num: u32) -> Self {
        Self {
            num,
            short_name: None,
            long_name: None,
            hw_model: None,
            hops_away: None,
            snr: None,
            battery_level: None,
            voltage: None,
            is_favorite: false,
            last_heard: 0,
            position: None,
        }
    }

    /// Short name, else the first ten characters of the long name, else `!xxxxxxxx`.
    pub fn display_name(&self) -> String {
        if let Some(short) = self.short_name.as_deref() {
            return short.to_string();
        }
        if let Some(long) = self.long_name.as_deref() {
            return long.chars().take(10).collect();
        }
        format_node_id(self.num)
    }

    fn heard(&mut self, at: i64) {
        self.last_heard = self.last_heard.max(at);
    }

    fn apply_user(&mut self, user: &proto::User) {
        self.short_name = non_empty(&user.short_name);
        self.long_name = non_empty(&user.long_name);
        self.hw_model = Some(hw_model_name(user.hw_model));
    }

    fn apply_device_metrics(&mut self, dm: &proto::DeviceMetrics) {
        if dm.battery_level.is_some() {
            self.battery_level = dm.battery_level;
        }
        if dm.voltage.is_some() {
            self.voltage = dm.voltage;
        }
    }

    fn apply_position(&mut self, pos: PositionReport) {
        if pos.latitude.is_some() && pos.longitude.is_some() {
            self.position = Some(pos);
        }
    }
}

fn non_empty(s: &str) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

pub fn hw_model_name(model: i32) -> String {
    proto::HardwareModel::try_from(model)
        .map(|m| m.as_str_name().to_string())
        .unwrap_or_else(|_| format!("HW_{model}"))
}

#[derive(Debug, Default)]
struct NodeState {
    nodes: HashMap<u32, NodeRecord>,
    my_node_num: Option<u32>,
    /// Operator favorite toggles. Never derived from frames, so `clear` keeps them.
    favorites: HashMap<u32, bool>,
}

impl NodeState {
    /// Returns the record and whether it was just created.
    fn upsert(&mut self, num: u32) -> (&mut NodeRecord, bool) {
        let mut created = false;
        let favorite = self.favorites.get(&num).copied();
        let rec = self.nodes.entry(num).or_insert_with(|| {
            created = true;
            let mut rec = NodeRecord::new(num);
            rec.is_favorite = favorite.unwrap_or(false);
            rec
        });
        (rec, created)
    }
}

#[derive(Debug, Default)]
pub struct NodeStore {
    state: RwLock<NodeState>,
}

impl NodeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply_frame(&self, frame: &DecodedFrame) {
        let Some(envelope) = frame.envelope() else {
            return;
        };
        let mut state = self.write();
        match envelope {
            Envelope::MyInfo(info) if info.my_node_num != 0 => {
                if state.my_node_num != Some(info.my_node_num) {
                    debug!("local node is {}", format_node_id(info.my_node_num));
                }
                state.my_node_num = Some(info.my_node_num);
            }
            Envelope::NodeInfo(info) if info.num != 0 => apply_node_info(&mut state, info),
            Envelope::Packet(pkt) if pkt.from() != 0 => {
                apply_packet(&mut state, pkt, frame.heard_at())
            }
            _ => {}
        }
    }

    pub fn get_node(&self, num: u32) -> Option<NodeRecord> {
        self.read().nodes.get(&num).cloned()
    }

    /// Never empty: falls back to the hex node id for unknown nodes.
    pub fn get_node_name(&self, num: u32) -> String {
        self.read()
            .nodes
            .get(&num)
            .map(NodeRecord::display_name)
            .unwrap_or_else(|| format_node_id(num))
    }

    /// Flip the local favorite flag. Unknown nodes are left alone and yield `None`.
    ///
    /// The choice is remembered apart from the records: it survives [`clear`](Self::clear)
    /// and overrides the device's `is_favorite` when the node is seen again.
    pub fn toggle_favorite(&self, num: u32) -> Option<bool> {
        let mut state = self.write();
        let rec = state.nodes.get_mut(&num)?;
        rec.is_favorite = !rec.is_favorite;
        let favorite = rec.is_favorite;
        state.favorites.insert(num, favorite);
        Some(favorite)
    }

    /// All nodes, most recently heard first.
    pub fn nodes(&self) -> Vec<NodeRecord> {
        let mut out: Vec<NodeRecord> = self.read().nodes.values().cloned().collect();
        out.sort_by(|a, b| b.last_heard.cmp(&a.last_heard).then(a.num.cmp(&b.num)));
        out
    }

    pub fn my_node_num(&self) -> Option<u32> {
        self.read().my_node_num
    }

    pub fn len(&self) -> usize {
        self.read().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().nodes.is_empty()
    }

    /// Forget every frame-derived record. Local favorite toggles are kept.
    pub fn clear(&self) {
        let mut state = self.write();
        let favorites = std::mem::take(&mut state.favorites);
        *state = NodeState {
            favorites,
            ..NodeState::default()
        };
    }

    fn read(&self) -> RwLockReadGuard<'_, NodeState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, NodeState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn apply_node_info(state: &mut NodeState, info: &proto::NodeInfo) {
    let toggled = state.favorites.contains_key(&info.num);
    let (rec, created) = state.upsert(info.num);
    if created && !toggled {
        // The device's favorite flag seeds the record; afterwards the local toggle wins.
        rec.is_favorite = info.is_favorite;
    }
    if let Some(user) = &info.user {
        rec.apply_user(user);
        debug!(
            "nodeinfo {} -> {}",
            format_node_id(info.num),
            escape_log(&rec.display_name())
        );
    }
    rec.heard(i64::from(info.last_heard));
    if info.hops_away.is_some() {
        rec.hops_away = info.hops_away;
    }
    if info.snr != 0.0 {
        rec.snr = Some(info.snr);
    }
    if let Some(dm) = &info.device_metrics {
        rec.apply_device_metrics(dm);
    }
    if let Some(pos) = &info.position {
        rec.apply_position(PositionReport::from(pos));
    }
}

fn apply_packet(state: &mut NodeState, pkt: &DecodedPacket, heard_at: i64) {
    let (rec, _) = state.upsert(pkt.from());
    rec.heard(heard_at);
    if let Some(hops) = pkt.hops_away() {
        rec.hops_away = Some(hops);
    }
    if let Some(snr) = pkt.rx_snr() {
        rec.snr = Some(snr);
    }
    match &pkt.payload {
        Some(PortPayload::Telemetry(TelemetryReport {
            metrics: TelemetryMetrics::Device(dm),
            ..
        })) => rec.apply_device_metrics(dm),
        Some(PortPayload::NodeInfo(user)) => rec.apply_user(user),
        Some(PortPayload::Position(pos)) => rec.apply_position(pos.clone()),
        _ => {}
    }
}
