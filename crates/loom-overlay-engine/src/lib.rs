// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Peer-to-peer overlay engine: a sans-IO transport and security stack plus
//! the tokio actor that drives it from real sockets.

pub mod engine;
pub mod error;
pub mod ngsocket;
pub mod outbox;
pub mod peers;
pub mod policy;
pub mod security;
pub mod session;
pub mod settings;
pub mod stack;
pub mod status;

pub use engine::{Delivery, OverlayEngine, OverlayEngineConfig};
pub use error::{EngineError, Result, SessionError};
pub use ngsocket::{BaseConnectionType, NgSocket};
pub use outbox::{Outbox, Transmit};
pub use peers::{Peer, PeerHandle, PeerRegistry, MAX_ADDRESSES, MAX_SOURCE_ADDRESSES};
pub use policy::{AllowAll, AllowList, PeerPolicy};
pub use security::{SecurityLayer, LATENCY_TIMEOUT, MAX_PAYLOAD_LEN, MAX_QUEUED_PACKETS};
pub use session::{KxKeypair, KxRole, ReplayWindow, SessionKey, SessionKeys};
pub use settings::{split_host_port, EngineSettings, BASE_SERVER_PORT};
pub use stack::OverlayStack;
pub use status::{EngineStatus, PeerStatus};
