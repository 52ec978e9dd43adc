// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

pub mod base_conn;
pub mod error;
pub mod local;
pub mod reestablish;
pub mod udp;

pub use base_conn::{spawn_base_connection, BaseCommand, BaseEvent, BASE_CONNECT_TIMEOUT};
pub use error::{ConnError, Result};
pub use local::interface_addresses;
pub use reestablish::{
	base_reconnect_timeout, candidate_addresses, may_retry, should_fall_back_to_relay,
	should_reestablish_on_send, since, MAX_FAILED_ESTABLISHMENTS, NAT_INIT_TIMEOUT,
	PERIODIC_INTERVAL, REESTABLISH_TIMEOUT, REFRESH_TIMEOUT, TCP_PONG_TIMEOUT, TEARDOWN_TIMEOUT,
	UDP_BASE_TIMEOUT,
};
pub use udp::{
	bind_multicast_v4, bind_multicast_v6, bind_unicast, multicast_group_addrs, MulticastSocket,
	UnicastSocket, DEFAULT_SOURCE_PORT, MULTICAST_PORT,
};
