//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::IpAddr;

use generational_arena::{Arena, Index};
use ipnetwork::IpNetwork;

use crate::southbound::{AddressFamily, AddressFlags, InterfaceFlags};

#[derive(Debug)]
pub struct Interface {
    pub name: String,
    pub ifindex: u32,
    pub mtu: u32,
    pub flags: InterfaceFlags,
    pub addresses: BTreeMap<IpNetwork, AddressFlags>,
    // Leaf nexthop groups whose output is this interface.
    pub nhe_dependents: BTreeSet<u32>,
}

#[derive(Debug, Default)]
pub struct Interfaces {
    // Interface arena.
    arena: Arena<Interface>,
    // Interface binary tree keyed by name.
    name_tree: BTreeMap<String, Index>,
    // Interface hash table keyed by ifindex.
    ifindex_tree: HashMap<u32, Index>,
}

// ===== impl Interface =====

impl Interface {
    pub fn is_operative(&self) -> bool {
        self.flags.contains(InterfaceFlags::OPERATIVE)
    }

    pub fn is_unnumbered(&self) -> bool {
        self.addresses
            .values()
            .any(|flags| flags.contains(AddressFlags::UNNUMBERED))
    }

    // Returns the first numbered address of the given address family.
    pub fn source_address(&self, af: AddressFamily) -> Option<IpAddr> {
        self.addresses
            .iter()
            .filter(|(_, flags)| !flags.contains(AddressFlags::UNNUMBERED))
            .map(|(addr, _)| addr.ip())
            .find(|addr| AddressFamily::from_addr(addr) == af)
    }
}

// ===== impl Interfaces =====

impl Interfaces {
    // Adds or updates the interface with the specified attributes.
    //
    // Returns the previous operational state, or `None` for new interfaces.
    pub(crate) fn update(
        &mut self,
        ifname: String,
        ifindex: u32,
        mtu: u32,
        flags: InterfaceFlags,
    ) -> Option<bool> {
        match self.ifindex_tree.get(&ifindex).copied() {
            Some(iface_idx) => {
                let iface = &mut self.arena[iface_idx];
                let was_operative = iface.is_operative();

                // Update the existing interface with the new information.
                if iface.name != ifname {
                    self.name_tree.remove(&iface.name);
                    iface.name.clone_from(&ifname);
                    self.name_tree.insert(ifname, iface_idx);
                }
                iface.mtu = mtu;
                iface.flags = flags;
                Some(was_operative)
            }
            None => {
                // If the interface does not exist, create a new entry.
                let iface = Interface {
                    name: ifname.clone(),
                    ifindex,
                    mtu,
                    flags,
                    addresses: Default::default(),
                    nhe_dependents: Default::default(),
                };
                let iface_idx = self.arena.insert(iface);
                self.name_tree.insert(ifname, iface_idx);
                self.ifindex_tree.insert(ifindex, iface_idx);
                None
            }
        }
    }

    // Removes the specified interface, returning its dependent nexthop
    // groups.
    pub(crate) fn remove(&mut self, ifname: &str) -> BTreeSet<u32> {
        let Some(iface_idx) = self.name_tree.get(ifname).copied() else {
            return Default::default();
        };
        let iface = &mut self.arena[iface_idx];

        // Remove interface.
        self.name_tree.remove(&iface.name);
        self.ifindex_tree.remove(&iface.ifindex);
        self.arena
            .remove(iface_idx)
            .map(|iface| iface.nhe_dependents)
            .unwrap_or_default()
    }

    pub(crate) fn address_add(
        &mut self,
        ifname: &str,
        addr: IpNetwork,
        flags: AddressFlags,
    ) {
        if let Some(iface) = self.get_mut_by_name(ifname) {
            iface.addresses.insert(addr, flags);
        }
    }

    pub(crate) fn address_del(&mut self, ifname: &str, addr: &IpNetwork) {
        if let Some(iface) = self.get_mut_by_name(ifname) {
            iface.addresses.remove(addr);
        }
    }

    // Attaches a leaf nexthop group to its output interface.
    pub(crate) fn nhe_attach(&mut self, ifindex: u32, nhe_id: u32) -> bool {
        match self.get_mut_by_ifindex(ifindex) {
            Some(iface) => {
                iface.nhe_dependents.insert(nhe_id);
                true
            }
            None => false,
        }
    }

    pub(crate) fn nhe_detach(&mut self, ifindex: u32, nhe_id: u32) {
        if let Some(iface) = self.get_mut_by_ifindex(ifindex) {
            iface.nhe_dependents.remove(&nhe_id);
        }
    }

    // Returns a reference to the interface corresponding to the given name.
    pub fn get_by_name(&self, ifname: &str) -> Option<&Interface> {
        self.name_tree
            .get(ifname)
            .copied()
            .map(|iface_idx| &self.arena[iface_idx])
    }

    // Returns a mutable reference to the interface corresponding to the given
    // name.
    pub(crate) fn get_mut_by_name(
        &mut self,
        ifname: &str,
    ) -> Option<&mut Interface> {
        self.name_tree
            .get(ifname)
            .copied()
            .map(move |iface_idx| &mut self.arena[iface_idx])
    }

    // Returns a reference to the interface corresponding to the given ifindex.
    pub fn get_by_ifindex(&self, ifindex: u32) -> Option<&Interface> {
        self.ifindex_tree
            .get(&ifindex)
            .copied()
            .map(|iface_idx| &self.arena[iface_idx])
    }

    // Returns a mutable reference to the interface corresponding to the given
    // ifindex.
    pub(crate) fn get_mut_by_ifindex(
        &mut self,
        ifindex: u32,
    ) -> Option<&mut Interface> {
        self.ifindex_tree
            .get(&ifindex)
            .copied()
            .map(move |iface_idx| &mut self.arena[iface_idx])
    }

    // Returns an iterator visiting all interfaces.
    //
    // Interfaces are ordered by their names.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Interface> + '_ {
        self.name_tree
            .values()
            .map(|iface_idx| &self.arena[*iface_idx])
    }
}
