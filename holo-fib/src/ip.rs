//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;

use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};

// Extension methods for IpNetwork.
pub trait IpNetworkExt {
    // Apply mask to prefix.
    #[must_use]
    fn apply_mask(&self) -> IpNetwork;

    // Returns true if this is a host prefix.
    fn is_host_prefix(&self) -> bool;

    // Returns true if this is the default route prefix.
    fn is_default(&self) -> bool;

    // Returns the masked prefix of this network with the given length.
    fn supernet(&self, prefixlen: u8) -> IpNetwork;
}

// Extension methods for IpAddr.
pub trait IpAddrExt {
    // Converts this IP address into a host prefix network.
    fn to_host_prefix(&self) -> IpNetwork;
}

// ===== impl IpNetwork =====

impl IpNetworkExt for IpNetwork {
    fn apply_mask(&self) -> IpNetwork {
        self.supernet(self.prefix())
    }

    fn is_host_prefix(&self) -> bool {
        match self {
            IpNetwork::V4(prefix) => prefix.prefix() == 32,
            IpNetwork::V6(prefix) => prefix.prefix() == 128,
        }
    }

    fn is_default(&self) -> bool {
        self.prefix() == 0
    }

    fn supernet(&self, prefixlen: u8) -> IpNetwork {
        match self {
            IpNetwork::V4(prefix) => {
                let prefix = Ipv4Network::new(prefix.ip(), prefixlen).unwrap();
                Ipv4Network::new(prefix.network(), prefixlen).unwrap().into()
            }
            IpNetwork::V6(prefix) => {
                let prefix = Ipv6Network::new(prefix.ip(), prefixlen).unwrap();
                Ipv6Network::new(prefix.network(), prefixlen).unwrap().into()
            }
        }
    }
}

// ===== impl IpAddr =====

impl IpAddrExt for IpAddr {
    fn to_host_prefix(&self) -> IpNetwork {
        match self {
            IpAddr::V4(addr) => Ipv4Network::new(*addr, 32).unwrap().into(),
            IpAddr::V6(addr) => Ipv6Network::new(*addr, 128).unwrap().into(),
        }
    }
}
