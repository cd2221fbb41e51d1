//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::net::IpAddr;
use std::str::FromStr;

use bitflags::bitflags;
use derive_new::new;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};

// VRF identifier.
pub type VrfId = u32;

// Default VRF.
pub const VRF_DEFAULT: VrfId = 0;

// Address family.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

// MPLS label.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub struct Label(u32);

// Route origin.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    KERNEL,
    DIRECT,
    STATIC,
    TABLE,
    BGP,
    ISIS,
    LDP,
    OSPFV2,
    OSPFV3,
    RIPV2,
    RIPNG,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct InterfaceFlags: u8 {
        const LOOPBACK = 0x01;
        const OPERATIVE = 0x02;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct AddressFlags: u8 {
        const UNNUMBERED = 0x01;
    }
}

// Forwarding target of a nexthop.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum NexthopAddr {
    Gateway(IpAddr),
    GatewayIfindex(IpAddr, u32),
    Interface(u32),
    Special(NexthopSpecial),
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[derive(Deserialize, Serialize)]
pub enum NexthopSpecial {
    Blackhole,
    Unreachable,
    Prohibit,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct NexthopFlags: u8 {
        const ACTIVE = 0x01;
        const FIB = 0x02;
        const RECURSIVE = 0x04;
        const ONLINK = 0x08;
    }
}

// Route nexthop.
//
// The `addr`, `vrf_id` and `labels` fields are the configured identity of the
// nexthop. All other fields are runtime resolution state.
#[derive(Clone, Debug, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub struct Nexthop {
    pub addr: NexthopAddr,
    pub vrf_id: VrfId,
    pub labels: Vec<Label>,
    #[serde(default)]
    pub flags: NexthopFlags,
    #[serde(default)]
    pub ifindex: Option<u32>,
    #[serde(default)]
    pub src: Option<IpAddr>,
    #[serde(default)]
    pub resolved: Vec<Nexthop>,
    #[serde(default)]
    pub resolved_via: Option<u32>,
}

// Identity of a nexthop, as used for NHG content hashing.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NexthopKey {
    pub vrf_id: VrfId,
    pub addr: NexthopAddr,
    pub labels: Vec<Label>,
}

// MPLS LSP.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Lsp {
    pub in_label: Label,
    pub addr_family: AddressFamily,
    pub nhlfes: Vec<Nhlfe>,
    #[serde(default)]
    pub flags: LspFlags,
    #[serde(skip)]
    pub dplane_seq: u32,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct LspFlags: u8 {
        const INSTALLED = 0x01;
        const CHANGED = 0x02;
        const REMOVED = 0x04;
        const FAILED = 0x08;
    }
}

// Next-hop label forwarding entry.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Nhlfe {
    pub protocol: Protocol,
    pub nexthop: Option<Nexthop>,
    pub out_labels: Vec<Label>,
    #[serde(default)]
    pub flags: NhlfeFlags,
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Deserialize, Serialize)]
    #[serde(transparent)]
    pub struct NhlfeFlags: u8 {
        const SELECTED = 0x01;
        const INSTALLED = 0x02;
    }
}

// Pseudowire.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct Pseudowire {
    pub ifname: String,
    pub ifindex: u32,
    pub vrf_id: VrfId,
    pub pw_type: u16,
    pub addr_family: AddressFamily,
    pub dest: IpAddr,
    pub local_label: Label,
    pub remote_label: Label,
    pub flags: u8,
    #[serde(default)]
    pub status: PwStatus,
    #[serde(skip)]
    pub dplane_seq: u32,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[derive(Deserialize, Serialize)]
pub enum PwStatus {
    #[default]
    Down,
    Up,
}

// ===== Control plane messages =====

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct InterfaceUpdateMsg {
    pub ifname: String,
    pub ifindex: u32,
    pub mtu: u32,
    pub flags: InterfaceFlags,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct AddressMsg {
    pub ifname: String,
    pub addr: IpNetwork,
    pub flags: AddressFlags,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct RouteMsg {
    pub protocol: Protocol,
    pub vrf_id: VrfId,
    pub table_id: u32,
    pub prefix: IpNetwork,
    pub distance: u32,
    pub metric: u32,
    pub tag: Option<u32>,
    pub instance: u16,
    pub mtu: u32,
    pub nexthops: Vec<Nexthop>,
}

#[derive(Clone, Debug, new)]
#[derive(Deserialize, Serialize)]
pub struct RouteKeyMsg {
    pub protocol: Protocol,
    pub vrf_id: VrfId,
    pub prefix: IpNetwork,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct LabelInstallMsg {
    pub protocol: Protocol,
    pub label: Label,
    pub addr_family: AddressFamily,
    pub nhlfes: Vec<Nhlfe>,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct LabelUninstallMsg {
    pub protocol: Protocol,
    pub label: Label,
}

// Nexthop group learned from the kernel.
#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub struct KernelNhgMsg {
    pub id: u32,
    pub vrf_id: VrfId,
    pub addr_family: AddressFamily,
    pub kind: KernelNhgKind,
}

#[derive(Clone, Debug)]
#[derive(Deserialize, Serialize)]
pub enum KernelNhgKind {
    Nexthop(Nexthop),
    Group(Vec<u32>),
}

// ===== impl AddressFamily =====

impl AddressFamily {
    pub fn from_addr(addr: &IpAddr) -> AddressFamily {
        match addr {
            IpAddr::V4(_) => AddressFamily::Ipv4,
            IpAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    pub fn from_prefix(prefix: &IpNetwork) -> AddressFamily {
        match prefix {
            IpNetwork::V4(_) => AddressFamily::Ipv4,
            IpNetwork::V6(_) => AddressFamily::Ipv6,
        }
    }
}

impl std::fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "ipv4"),
            AddressFamily::Ipv6 => write!(f, "ipv6"),
        }
    }
}

// ===== impl Label =====

impl Label {
    // Well-known MPLS labels.
    pub const IPV4_EXPLICIT_NULL: u32 = 0;
    pub const IPV6_EXPLICIT_NULL: u32 = 2;
    pub const IMPLICIT_NULL: u32 = 3;

    pub const UNRESERVED_RANGE: std::ops::RangeInclusive<u32> = 16..=1048575;

    pub fn new(label: u32) -> Label {
        if label > *Self::UNRESERVED_RANGE.end() {
            panic!("invalid label value: {}", label);
        }
        Label(label)
    }

    pub fn get(&self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0 {
            Label::IPV4_EXPLICIT_NULL => write!(f, "ipv4-explicit-null"),
            Label::IPV6_EXPLICIT_NULL => write!(f, "ipv6-explicit-null"),
            Label::IMPLICIT_NULL => write!(f, "implicit-null"),
            _ => write!(f, "{}", self.0),
        }
    }
}

// ===== impl Protocol =====

impl std::fmt::Display for Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Protocol::KERNEL => write!(f, "kernel"),
            Protocol::DIRECT => write!(f, "direct"),
            Protocol::STATIC => write!(f, "static"),
            Protocol::TABLE => write!(f, "table"),
            Protocol::BGP => write!(f, "bgp"),
            Protocol::ISIS => write!(f, "isis"),
            Protocol::LDP => write!(f, "ldp"),
            Protocol::OSPFV2 => write!(f, "ospfv2"),
            Protocol::OSPFV3 => write!(f, "ospfv3"),
            Protocol::RIPV2 => write!(f, "ripv2"),
            Protocol::RIPNG => write!(f, "ripng"),
        }
    }
}

impl FromStr for Protocol {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_ref() {
            "kernel" => Ok(Protocol::KERNEL),
            "direct" => Ok(Protocol::DIRECT),
            "static" => Ok(Protocol::STATIC),
            "table" => Ok(Protocol::TABLE),
            "bgp" => Ok(Protocol::BGP),
            "isis" => Ok(Protocol::ISIS),
            "ldp" => Ok(Protocol::LDP),
            "ospfv2" => Ok(Protocol::OSPFV2),
            "ospfv3" => Ok(Protocol::OSPFV3),
            "ripv2" => Ok(Protocol::RIPV2),
            "ripng" => Ok(Protocol::RIPNG),
            _ => Err(()),
        }
    }
}

// ===== impl Nexthop =====

impl Nexthop {
    pub fn new(addr: NexthopAddr, vrf_id: VrfId) -> Nexthop {
        Nexthop {
            addr,
            vrf_id,
            labels: Default::default(),
            flags: Default::default(),
            ifindex: None,
            src: None,
            resolved: Default::default(),
            resolved_via: None,
        }
    }

    pub fn with_labels(mut self, labels: Vec<Label>) -> Nexthop {
        self.labels = labels;
        self
    }

    pub fn key(&self) -> NexthopKey {
        NexthopKey {
            vrf_id: self.vrf_id,
            addr: self.addr,
            labels: self.labels.clone(),
        }
    }

    // Compares two nexthops ignoring their resolution state.
    pub fn same(&self, other: &Nexthop) -> bool {
        self.addr == other.addr
            && self.vrf_id == other.vrf_id
            && self.labels == other.labels
    }

    pub fn gateway(&self) -> Option<IpAddr> {
        match self.addr {
            NexthopAddr::Gateway(addr)
            | NexthopAddr::GatewayIfindex(addr, _) => Some(addr),
            _ => None,
        }
    }

    // Returns the configured output interface, if any.
    pub fn configured_ifindex(&self) -> Option<u32> {
        match self.addr {
            NexthopAddr::GatewayIfindex(_, ifindex)
            | NexthopAddr::Interface(ifindex) => Some(ifindex),
            _ => None,
        }
    }

    // Returns the effective output interface, if known.
    pub fn output_ifindex(&self) -> Option<u32> {
        self.configured_ifindex().or(self.ifindex)
    }

    pub fn is_active(&self) -> bool {
        self.flags.contains(NexthopFlags::ACTIVE)
    }

    pub fn is_recursive(&self) -> bool {
        self.flags.contains(NexthopFlags::RECURSIVE)
    }

    pub fn address_family(&self) -> Option<AddressFamily> {
        self.gateway().map(|addr| AddressFamily::from_addr(&addr))
    }

    // Clears all resolution state learned in a previous activation check.
    pub fn reset_resolution(&mut self) {
        self.flags
            .remove(NexthopFlags::ACTIVE | NexthopFlags::RECURSIVE);
        self.ifindex = None;
        self.src = None;
        self.resolved.clear();
        self.resolved_via = None;
    }
}

impl std::fmt::Display for Nexthop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.addr {
            NexthopAddr::Gateway(addr) => write!(f, "via {}", addr)?,
            NexthopAddr::GatewayIfindex(addr, ifindex) => {
                write!(f, "via {} ifindex {}", addr, ifindex)?
            }
            NexthopAddr::Interface(ifindex) => {
                write!(f, "ifindex {}", ifindex)?
            }
            NexthopAddr::Special(special) => write!(f, "{:?}", special)?,
        }
        if !self.labels.is_empty() {
            let labels = self
                .labels
                .iter()
                .map(|label| label.to_string())
                .collect::<Vec<_>>();
            write!(f, " labels {}", labels.join("/"))?;
        }
        Ok(())
    }
}

// ===== impl Lsp =====

impl Lsp {
    // Returns the selected NHLFEs.
    pub fn selected_nhlfes(&self) -> impl Iterator<Item = &Nhlfe> {
        self.nhlfes
            .iter()
            .filter(|nhlfe| nhlfe.flags.contains(NhlfeFlags::SELECTED))
    }

    // Number of NHLFEs used for ECMP forwarding.
    pub fn num_ecmp(&self) -> usize {
        self.selected_nhlfes().count()
    }

    // Index of the preferred NHLFE.
    pub fn best_nhlfe(&self) -> Option<usize> {
        self.nhlfes
            .iter()
            .position(|nhlfe| nhlfe.flags.contains(NhlfeFlags::SELECTED))
    }
}
