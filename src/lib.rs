//! # meshscope - field diagnostics for Meshtastic devices
//!
//! meshscope attaches to a Meshtastic node over its HTTP API, polls the
//! `fromradio` endpoint for protobuf frames and keeps a live, in-memory picture
//! of the mesh: a bounded packet log, the node database and direct-message
//! conversations with delivery tracking.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshscope::config::Config;
//! use meshscope::session::MeshSession;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_or_default("meshscope.toml").await?;
//!     let session = MeshSession::start(&config, "192.168.1.50").await?;
//!     session.request_config().await?;
//!     session.run().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`transport`] - HTTP polling link to the device and its status stream
//! - [`protocol`] - frame decoding, outbound encoding and the derived stores
//! - [`session`] - wiring between the transport and the stores
//! - [`storage`] - conversation persistence
//! - [`config`] - configuration loading and validation
//! - [`validation`] - outgoing text checks and safe file names
//! - [`protobuf`] - generated Meshtastic protobuf types
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │  HttpTransport  │ ← polls /api/v1/fromradio, PUTs /api/v1/toradio
//! └─────────────────┘
//!          │ DeviceOutput
//! ┌─────────────────┐
//! │  FrameDecoder   │ ← bytes → DecodedFrame
//! └─────────────────┘
//!          │
//! ┌─────────────────┐
//! │  PacketStore    │ ← bounded log, notifies subscribers
//! └─────────────────┘
//!     │          │
//! NodeStore  ConversationStore
//! ```

pub mod config;
pub mod logutil;
pub mod metrics;
pub mod protobuf;
pub mod protocol;
pub mod session;
pub mod storage;
pub mod transport;
pub mod validation;
