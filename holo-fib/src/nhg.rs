//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

use std::collections::{BTreeSet, HashMap, VecDeque};

use bitflags::bitflags;
use generational_arena::{Arena, Index};
use itertools::Itertools;
use serde::Serialize;

use crate::debug::Debug;
use crate::dplane::{Context, Dplane, DplaneOp, DplaneResult};
use crate::error::Error;
use crate::interface::Interfaces;
use crate::southbound::{
    AddressFamily, KernelNhgKind, KernelNhgMsg, Nexthop, NexthopKey, VrfId,
};

bitflags! {
    #[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
    #[derive(Serialize)]
    #[serde(transparent)]
    pub struct NheFlags: u8 {
        const VALID = 0x01;
        const INSTALLED = 0x02;
        const QUEUED = 0x04;
        const RECURSIVE = 0x08;
        const KERNEL = 0x10;
    }
}

// Content identity of a nexthop group.
//
// Nexthops are kept sorted so that the same set always yields the same key.
// Resolution state never takes part in the comparison.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct NheKey {
    pub vrf_id: VrfId,
    pub addr_family: AddressFamily,
    pub nexthops: Vec<NexthopKey>,
}

// Nexthop hash entry.
#[derive(Debug)]
pub struct Nhe {
    pub id: u32,
    pub vrf_id: VrfId,
    pub addr_family: AddressFamily,
    pub nexthops: Vec<Nexthop>,
    // Entries this one is built from (group members or resolution target).
    pub depends: BTreeSet<u32>,
    // Entries built from this one.
    pub dependents: BTreeSet<u32>,
    pub refcnt: u32,
    pub flags: NheFlags,
    // Output interface of a single-nexthop entry.
    pub ifindex: Option<u32>,
    pub dplane_seq: u32,
    // Whether the kernel holds a copy of the entry. Unlike INSTALLED, this
    // survives invalidation.
    in_kernel: bool,
}

// Table of shared nexthop groups, indexed by ID and by content.
#[derive(Debug, Default)]
pub struct NhgTable {
    arena: Arena<Nhe>,
    id_tree: HashMap<u32, Index>,
    key_tree: HashMap<NheKey, Index>,
    id_counter: u32,
}

// ===== impl NheKey =====

impl NheKey {
    pub fn new(
        nexthops: &[Nexthop],
        vrf_id: VrfId,
        addr_family: AddressFamily,
    ) -> NheKey {
        let nexthops = nexthops.iter().map(Nexthop::key).sorted().collect();
        NheKey {
            vrf_id,
            addr_family,
            nexthops,
        }
    }
}

// ===== impl Nhe =====

impl Nhe {
    pub fn key(&self) -> NheKey {
        NheKey::new(&self.nexthops, self.vrf_id, self.addr_family)
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(NheFlags::VALID)
    }

    pub fn is_installed(&self) -> bool {
        self.flags.contains(NheFlags::INSTALLED)
    }

    pub fn is_in_kernel(&self) -> bool {
        self.in_kernel
    }

    pub fn is_kernel(&self) -> bool {
        self.flags.contains(NheFlags::KERNEL)
    }

    pub fn is_recursive(&self) -> bool {
        self.flags.contains(NheFlags::RECURSIVE)
    }

    // Checks whether this entry is a group of member entries.
    pub fn is_group(&self) -> bool {
        !self.depends.is_empty() && !self.is_recursive()
    }
}

// ===== impl NhgTable =====

impl NhgTable {
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    // Returns a reference to the entry corresponding to the given ID.
    pub fn get(&self, id: u32) -> Option<&Nhe> {
        self.id_tree.get(&id).copied().map(|idx| &self.arena[idx])
    }

    fn get_mut(&mut self, id: u32) -> Option<&mut Nhe> {
        self.id_tree
            .get(&id)
            .copied()
            .map(move |idx| &mut self.arena[idx])
    }

    // Returns the ID of the entry with the given content, if one exists.
    pub fn find(
        &self,
        nexthops: &[Nexthop],
        vrf_id: VrfId,
        addr_family: AddressFamily,
    ) -> Option<u32> {
        let key = NheKey::new(nexthops, vrf_id, addr_family);
        self.key_tree.get(&key).map(|idx| self.arena[*idx].id)
    }

    // Returns an iterator visiting all entries.
    //
    // Order of iteration is not defined.
    pub fn iter(&self) -> impl Iterator<Item = &'_ Nhe> + '_ {
        self.arena.iter().map(|(_, nhe)| nhe)
    }

    // Finds an entry matching the given content, or creates one.
    //
    // An explicit ID is authoritative: it must either name an entry with the
    // same content or be unused, and the content must not already exist under
    // another ID.
    pub fn find_or_create(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        nexthops: &[Nexthop],
        vrf_id: VrfId,
        addr_family: AddressFamily,
        id: Option<u32>,
        depends: &[u32],
        is_kernel: bool,
    ) -> Result<u32, Error> {
        let key = NheKey::new(nexthops, vrf_id, addr_family);
        match id {
            Some(id) => {
                if let Some(idx) = self.id_tree.get(&id).copied() {
                    if self.arena[idx].key() == key {
                        return Ok(id);
                    }
                    return Err(Error::NhgContentMismatch(id));
                }
                if let Some(idx) = self.key_tree.get(&key).copied() {
                    return Err(Error::NhgIdCollision(id, self.arena[idx].id));
                }
            }
            None => {
                if let Some(idx) = self.key_tree.get(&key).copied() {
                    return Ok(self.arena[idx].id);
                }
            }
        }

        // All dependencies must exist before the entry is created.
        if let Some(depend_id) =
            depends.iter().find(|dep| !self.id_tree.contains_key(*dep))
        {
            return Err(Error::NhgDependNotFound(id.unwrap_or(0), *depend_id));
        }

        let id = match id {
            Some(id) => {
                self.id_counter = self.id_counter.max(id);
                id
            }
            None => self.next_id(),
        };

        let mut nhe = Nhe {
            id,
            vrf_id,
            addr_family,
            nexthops: nexthops.to_vec(),
            depends: Default::default(),
            dependents: Default::default(),
            refcnt: 0,
            flags: NheFlags::empty(),
            ifindex: None,
            dplane_seq: 0,
            in_kernel: is_kernel,
        };
        if is_kernel {
            nhe.flags.insert(
                NheFlags::VALID | NheFlags::INSTALLED | NheFlags::KERNEL,
            );
        }

        // Attach single-nexthop entries to their output interface.
        if depends.is_empty() && nexthops.len() == 1 {
            if let Some(ifindex) = nexthops[0].output_ifindex() {
                if interfaces.nhe_attach(ifindex, id) {
                    nhe.ifindex = Some(ifindex);
                } else {
                    Error::InterfaceNotFound(ifindex).log();
                }
            }
        }

        Debug::NheCreate(id, nexthops.len()).log();
        let idx = self.arena.insert(nhe);
        self.id_tree.insert(id, idx);
        self.key_tree.insert(key, idx);
        for depend_id in depends {
            self.depends_add(id, *depend_id);
        }

        if !is_kernel {
            self.install(dplane, id);
        }

        Ok(id)
    }

    // Finds or creates the entry for a route's nexthop set.
    //
    // Multi-nexthop sets are built as a group of single-nexthop entries.
    pub fn find_or_create_nexthops(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        nexthops: &[Nexthop],
        vrf_id: VrfId,
        addr_family: AddressFamily,
    ) -> Result<u32, Error> {
        if nexthops.len() > 1 {
            if let Some(id) = self.find(nexthops, vrf_id, addr_family) {
                return Ok(id);
            }

            let mut depends = Vec::with_capacity(nexthops.len());
            for nexthop in nexthops {
                let depend_id = self.find_or_create(
                    dplane,
                    interfaces,
                    std::slice::from_ref(nexthop),
                    vrf_id,
                    addr_family,
                    None,
                    &[],
                    false,
                )?;
                depends.push(depend_id);
            }
            return self.find_or_create(
                dplane,
                interfaces,
                nexthops,
                vrf_id,
                addr_family,
                None,
                &depends,
                false,
            );
        }

        self.find_or_create(
            dplane,
            interfaces,
            nexthops,
            vrf_id,
            addr_family,
            None,
            &[],
            false,
        )
    }

    // Processes a nexthop group learned from the kernel.
    pub fn kernel_update(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        msg: KernelNhgMsg,
    ) -> Result<u32, Error> {
        match msg.kind {
            KernelNhgKind::Nexthop(nexthop) => self.find_or_create(
                dplane,
                interfaces,
                &[nexthop],
                msg.vrf_id,
                msg.addr_family,
                Some(msg.id),
                &[],
                true,
            ),
            KernelNhgKind::Group(depends) => {
                let mut nexthops = vec![];
                for depend_id in &depends {
                    let Some(depend) = self.get(*depend_id) else {
                        return Err(Error::NhgDependNotFound(
                            msg.id, *depend_id,
                        ));
                    };
                    nexthops.extend(depend.nexthops.iter().cloned());
                }
                self.find_or_create(
                    dplane,
                    interfaces,
                    &nexthops,
                    msg.vrf_id,
                    msg.addr_family,
                    Some(msg.id),
                    &depends,
                    true,
                )
            }
        }
    }

    // Processes the removal of a nexthop group by the kernel.
    pub fn kernel_delete(&mut self, interfaces: &mut Interfaces, id: u32) {
        let Some(nhe) = self.get(id) else {
            Error::NhgIdNotFound(id).log();
            return;
        };
        let release = nhe.is_kernel() && nhe.refcnt == 0;

        self.set_invalid(id);
        if release {
            self.release(interfaces, id);
        }
    }

    // Adds a reference to the entry and, recursively, to its members.
    pub fn increment_ref(&mut self, dplane: &Dplane, id: u32) {
        let mut path = BTreeSet::new();
        self.increment_ref_rec(dplane, id, &mut path);
    }

    fn increment_ref_rec(
        &mut self,
        dplane: &Dplane,
        id: u32,
        path: &mut BTreeSet<u32>,
    ) {
        let Some(nhe) = self.get(id) else {
            Error::NhgIdNotFound(id).log();
            return;
        };
        if !path.insert(id) {
            return;
        }

        // Resolution edges carry no references.
        if !nhe.is_recursive() {
            let depends = nhe.depends.iter().copied().collect::<Vec<_>>();
            for depend_id in depends {
                self.increment_ref_rec(dplane, depend_id, path);
            }
        }

        if let Some(nhe) = self.get_mut(id) {
            nhe.refcnt += 1;
            Debug::NheRefcnt(id, nhe.refcnt).log();

            // Reinstall entries that are being brought back into use.
            if nhe.refcnt == 1
                && !nhe.flags.intersects(
                    NheFlags::KERNEL | NheFlags::INSTALLED | NheFlags::QUEUED,
                )
            {
                self.install(dplane, id);
            }
        }

        path.remove(&id);
    }

    // Drops a reference from the entry and, recursively, from its members.
    //
    // Local entries reaching zero references are uninstalled.
    pub fn decrement_ref(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        id: u32,
    ) {
        let mut path = BTreeSet::new();
        self.decrement_ref_rec(dplane, interfaces, id, &mut path);
    }

    fn decrement_ref_rec(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        id: u32,
        path: &mut BTreeSet<u32>,
    ) {
        let Some(nhe) = self.get_mut(id) else {
            Error::NhgIdNotFound(id).log();
            return;
        };
        if nhe.refcnt == 0 {
            Error::NhgRefcntUnderflow(id).log();
            return;
        }
        if !path.insert(id) {
            return;
        }

        nhe.refcnt -= 1;
        Debug::NheRefcnt(id, nhe.refcnt).log();
        let depends = if nhe.is_recursive() {
            vec![]
        } else {
            nhe.depends.iter().copied().collect::<Vec<_>>()
        };
        if nhe.refcnt == 0 && !nhe.is_kernel() {
            self.uninstall(dplane, interfaces, id);
        }

        for depend_id in depends {
            self.decrement_ref_rec(dplane, interfaces, depend_id, path);
        }

        path.remove(&id);
    }

    // Marks the entry and everything built on top of it as unusable.
    pub fn set_invalid(&mut self, id: u32) {
        let mut visited = BTreeSet::new();
        let mut queue = VecDeque::from([id]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            let Some(nhe) = self.get_mut(id) else {
                continue;
            };

            nhe.flags.remove(NheFlags::VALID | NheFlags::INSTALLED);
            Debug::NheInvalidate(id).log();
            queue.extend(nhe.dependents.iter().copied());
        }
    }

    // Requests the reinstallation of an invalidated entry that is still in
    // use.
    pub fn revalidate(&mut self, dplane: &Dplane, id: u32) {
        let Some(nhe) = self.get(id) else {
            return;
        };
        if nhe.refcnt > 0
            && !nhe.flags.intersects(
                NheFlags::VALID | NheFlags::QUEUED | NheFlags::KERNEL,
            )
        {
            self.install(dplane, id);
        }
    }

    // Records that a single-nexthop entry resolves through another entry.
    pub fn set_resolved_via(&mut self, id: u32, target: u32) {
        let Some(nhe) = self.get(id) else {
            Error::NhgIdNotFound(id).log();
            return;
        };
        if nhe.is_recursive() && nhe.depends.iter().eq([target].iter()) {
            return;
        }
        if nhe.is_group() || id == target {
            return;
        }
        if !self.id_tree.contains_key(&target) {
            Error::NhgIdNotFound(target).log();
            return;
        }

        self.clear_resolved_via(id);

        // Refuse edges that would close a resolution loop.
        if self.resolve_path(target).contains(&id) {
            return;
        }

        self.depends_add(id, target);
        if let Some(nhe) = self.get_mut(id) {
            nhe.flags.insert(NheFlags::RECURSIVE);
        }
        Debug::NheResolvedVia(id, Some(target)).log();
    }

    pub fn clear_resolved_via(&mut self, id: u32) {
        let Some(nhe) = self.get_mut(id) else {
            return;
        };
        if !nhe.is_recursive() {
            return;
        }

        nhe.flags.remove(NheFlags::RECURSIVE);
        let depends = std::mem::take(&mut nhe.depends);
        for depend_id in depends {
            if let Some(depend) = self.get_mut(depend_id) {
                depend.dependents.remove(&id);
            }
        }
        Debug::NheResolvedVia(id, None).log();
    }

    // Follows resolution edges down to the entry that actually forwards.
    pub fn resolve(&self, id: u32) -> Option<u32> {
        self.resolve_path(id).last().copied()
    }

    fn resolve_path(&self, id: u32) -> Vec<u32> {
        let mut path = vec![];
        let mut id = id;
        while let Some(nhe) = self.get(id) {
            if path.contains(&id) {
                break;
            }
            path.push(id);
            if !nhe.is_recursive() {
                break;
            }
            match nhe.depends.first() {
                Some(depend_id) => id = *depend_id,
                None => break,
            }
        }
        path
    }

    // Processes the result of a nexthop group update.
    pub fn process_result(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        ctx: &Context,
    ) {
        let Some(info) = ctx.nexthop_group() else {
            return;
        };
        let id = info.id;
        let Some(nhe) = self.get_mut(id) else {
            Error::NhgIdNotFound(id).log();
            return;
        };
        if nhe.dplane_seq != ctx.seq() {
            Debug::ContextStale(ctx.op(), ctx.seq()).log();
            return;
        }
        Debug::ContextResult(ctx.op(), ctx.seq(), ctx.status()).log();

        nhe.flags.remove(NheFlags::QUEUED);
        match (ctx.op(), ctx.status()) {
            (
                DplaneOp::NhInstall | DplaneOp::NhUpdate,
                DplaneResult::Success,
            ) => {
                nhe.flags.insert(NheFlags::VALID | NheFlags::INSTALLED);
                nhe.in_kernel = true;
            }
            (DplaneOp::NhInstall | DplaneOp::NhUpdate, _) => {
                nhe.flags.remove(NheFlags::VALID | NheFlags::INSTALLED);
            }
            (DplaneOp::NhDelete, DplaneResult::Success) => {
                nhe.flags.remove(NheFlags::VALID | NheFlags::INSTALLED);
                nhe.in_kernel = false;
                if nhe.refcnt == 0 {
                    self.release(interfaces, id);
                } else {
                    self.install(dplane, id);
                }
            }
            _ => (),
        }
    }

    fn install(&mut self, dplane: &Dplane, id: u32) {
        let Some(nhe) = self.get_mut(id) else {
            return;
        };

        let op = if nhe.in_kernel {
            DplaneOp::NhUpdate
        } else {
            DplaneOp::NhInstall
        };
        match dplane.submit_nexthop_group(op, nhe) {
            DplaneResult::Queued => nhe.flags.insert(NheFlags::QUEUED),
            DplaneResult::Success => {
                nhe.flags.insert(NheFlags::VALID | NheFlags::INSTALLED);
                nhe.in_kernel = true;
            }
            DplaneResult::Failure => (),
        }
    }

    fn uninstall(
        &mut self,
        dplane: &Dplane,
        interfaces: &mut Interfaces,
        id: u32,
    ) {
        let Some(nhe) = self.get_mut(id) else {
            return;
        };

        // Nothing to remove from the kernel.
        if !nhe.in_kernel && !nhe.flags.contains(NheFlags::QUEUED) {
            self.release(interfaces, id);
            return;
        }

        match dplane.submit_nexthop_group(DplaneOp::NhDelete, nhe) {
            DplaneResult::Queued => nhe.flags.insert(NheFlags::QUEUED),
            DplaneResult::Success | DplaneResult::Failure => (),
        }
    }

    // Removes the entry from the table and detaches all of its edges.
    fn release(&mut self, interfaces: &mut Interfaces, id: u32) {
        let Some(idx) = self.id_tree.remove(&id) else {
            return;
        };
        let Some(nhe) = self.arena.remove(idx) else {
            return;
        };
        let key = nhe.key();
        if self.key_tree.get(&key) == Some(&idx) {
            self.key_tree.remove(&key);
        }

        for depend_id in &nhe.depends {
            if let Some(depend) = self.get_mut(*depend_id) {
                depend.dependents.remove(&id);
            }
        }
        for dependent_id in &nhe.dependents {
            if let Some(dependent) = self.get_mut(*dependent_id) {
                dependent.depends.remove(&id);
                if dependent.is_recursive() && dependent.depends.is_empty() {
                    dependent.flags.remove(NheFlags::RECURSIVE);
                }
            }
        }
        if let Some(ifindex) = nhe.ifindex {
            interfaces.nhe_detach(ifindex, id);
        }

        Debug::NheRelease(id).log();
    }

    fn depends_add(&mut self, id: u32, depend_id: u32) {
        if let Some(nhe) = self.get_mut(id) {
            nhe.depends.insert(depend_id);
        }
        if let Some(depend) = self.get_mut(depend_id) {
            depend.dependents.insert(id);
        }
    }

    fn next_id(&mut self) -> u32 {
        loop {
            self.id_counter = self.id_counter.wrapping_add(1).max(1);
            if !self.id_tree.contains_key(&self.id_counter) {
                return self.id_counter;
            }
        }
    }
}
