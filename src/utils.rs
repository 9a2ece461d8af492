/*
 *  Copyright (C) 2025 Michael Bachmann
 *
 *  This program is free software: you can redistribute it and/or modify
 *  it under the terms of the GNU Affero General Public License as published by
 *  the Free Software Foundation, either version 3 of the License, or
 *  (at your option) any later version.
 *
 *  This program is distributed in the hope that it will be useful,
 *  but WITHOUT ANY WARRANTY; without even the implied warranty of
 *  MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 *  GNU Affero General Public License for more details.
 *
 *  You should have received a copy of the GNU Affero General Public License
 *  along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

use crate::error::{SkeletonCrewError, SkeletonCrewResult};
use pnet::datalink::{self, NetworkInterface};
use rand::Rng;
use std::{net::IpAddr, time::Duration};
use thread_priority::{
    RealtimeThreadSchedulePolicy, ThreadPriority, ThreadSchedulePolicy,
    set_thread_priority_and_policy, thread_native_id,
};
use tracing::{info, warn};

/// The NIC that carries the given address. Used to pin multicast
/// membership to the interface the operator configured.
pub fn find_network_interface(ip: IpAddr) -> SkeletonCrewResult<NetworkInterface> {
    datalink::interfaces()
        .into_iter()
        .find(|iface| iface.ips.iter().any(|ipn| ipn.ip() == ip))
        .ok_or_else(|| {
            SkeletonCrewError::Other(format!("no network interface with address {ip}"))
        })
}

pub fn set_realtime_priority() {
    let pid = thread_native_id();
    if let Err(e) = set_thread_priority_and_policy(
        pid,
        ThreadPriority::Max,
        ThreadSchedulePolicy::Realtime(RealtimeThreadSchedulePolicy::Fifo),
    ) {
        warn!("Could not set thread priority: {e}");
    } else {
        info!("Successfully set real time priority for thread {pid}.");
    }
}

/// `base` plus a uniform random delay in `[0, jitter]`, so that periodic
/// senders on the same LAN don't phase-lock.
pub fn jittered(base: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return base;
    }
    let extra = rand::rng().random_range(0..=jitter.as_millis() as u64);
    base + Duration::from_millis(extra)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_stays_within_bounds() {
        let base = Duration::from_secs(2);
        let jitter = Duration::from_millis(250);
        for _ in 0..100 {
            let d = jittered(base, jitter);
            assert!(d >= base);
            assert!(d <= base + jitter);
        }
    }

    #[test]
    fn zero_jitter_is_exact() {
        assert_eq!(
            jittered(Duration::from_secs(2), Duration::ZERO),
            Duration::from_secs(2)
        );
    }

    #[test]
    fn loopback_resolves_to_an_interface() {
        let iface =
            find_network_interface("127.0.0.1".parse().expect("ip")).expect("loopback interface");
        assert!(iface.ips.iter().any(|ipn| ipn.ip().is_loopback()));
    }

    #[test]
    fn unknown_addresses_resolve_to_an_error() {
        // TEST-NET-2, never assigned to a local interface.
        assert!(find_network_interface("198.51.100.77".parse().expect("ip")).is_err());
    }
}
