// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::net::IpAddr;
use tracing::warn;

/// Non-loopback interface addresses, sorted. Returns an empty list when
/// enumeration fails.
pub fn interface_addresses() -> Vec<IpAddr> {
	match if_addrs::get_if_addrs() {
		Ok(interfaces) => {
			let mut addrs: Vec<IpAddr> = interfaces
				.into_iter()
				.filter(|iface| !iface.is_loopback())
				.map(|iface| iface.ip())
				.collect();
			addrs.sort();
			addrs.dedup();
			addrs
		}
		Err(e) => {
			warn!(error = %e, "failed to enumerate local interfaces");
			Vec::new()
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_interface_addresses_exclude_loopback() {
		let addrs = interface_addresses();
		assert!(addrs.iter().all(|a| !a.is_loopback()));
		assert!(addrs.windows(2).all(|w| w[0] < w[1]));
	}
}
