// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Capability transfer between protection domains (delegate, translate, revoke)
//! OWNERS: @kernel-cap-team
//! PUBLIC API: XferError; (crate) xfer_items, delegate_ipc, revoke, lookup_crd, tlb_shootdown
//! DEPENDS_ON: space::Space (derivation links), cap::{Crd, XferItem}
//! INVARIANTS: A failed transfer leaves the receiver's spaces exactly as they were;
//!             every delegated node links to the node it was derived from;
//!             revoking a node removes its whole subtree, children first
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

extern crate alloc;

use alloc::collections::BTreeSet;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use crate::cap::{Crd, CrdKind, XferItem, XferKind};
use crate::cpu::ShootdownTicket;
use crate::diag::trace::{TraceEvent, TraceKind};
use crate::ec::Continuation;
use crate::hal::Hal;
use crate::kernel::Kernel;
use crate::obj::PdId;
use crate::sched::Scheduler;
use crate::space::{Link, Node, SpaceError};
use crate::types::{CpuId, PAGE_BITS};

/// Largest order a single delegation may populate.
pub const MAX_XFER_ORDER: u8 = 10;

#[must_use = "transfer errors must reach the sender"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XferError {
    /// The receiving domain's quota is exhausted.
    OutOfMemory,
    /// Descriptor and window do not fit together.
    InvalidMapping,
}

impl From<SpaceError> for XferError {
    fn from(value: SpaceError) -> Self {
        match value {
            SpaceError::OutOfMemory => Self::OutOfMemory,
            SpaceError::Occupied | SpaceError::InvalidMapping => Self::InvalidMapping,
        }
    }
}

/// Node inserted by an unfinished transfer.
#[derive(Clone, Copy, Debug)]
struct Inserted {
    kind: CrdKind,
    at: Link,
}

impl<H: Hal, S: Scheduler> Kernel<H, S> {
    /// Transfers `items` from `src` to `dst`. Delegations land in `del`,
    /// translations are looked up in `xlt`. All or nothing: on error every
    /// node inserted so far is removed again.
    pub(crate) fn xfer_items(
        &mut self,
        src: PdId,
        dst: PdId,
        xlt: Crd,
        del: Crd,
        items: &[XferItem],
    ) -> Result<Vec<XferItem>, XferError> {
        let mut undo = Vec::new();
        let mut results = Vec::with_capacity(items.len());
        for item in items {
            let result = match item.kind {
                XferKind::Delegate => self.delegate_item(src, dst, *item, del, &mut undo),
                XferKind::Translate => Ok(self.translate_item(src, dst, *item, xlt)),
            };
            match result {
                Ok(r) => results.push(r),
                Err(err) => {
                    log_debug!(target: "xfer", "transfer {:?} -> {:?} failed: {:?}", src, dst, err);
                    self.rollback(undo);
                    return Err(err);
                }
            }
        }
        Ok(results)
    }

    fn delegate_item(
        &mut self,
        src: PdId,
        dst: PdId,
        item: XferItem,
        window: Crd,
        undo: &mut Vec<Inserted>,
    ) -> Result<XferItem, XferError> {
        let snd = item.crd;
        if snd.is_null() {
            return Ok(XferItem::delegate(Crd::null(), item.hotspot));
        }
        if window.is_null() || window.kind != snd.kind {
            return Err(XferError::InvalidMapping);
        }
        let (src_base, dst_base, order) = Crd::place(snd, window, item.hotspot);
        if order > MAX_XFER_ORDER {
            return Err(XferError::InvalidMapping);
        }
        for offset in 0..(1u64 << order) {
            let from = Link { pd: src, index: src_base + offset };
            let to = Link { pd: dst, index: dst_base + offset };
            self.derive(snd.kind, from, to, snd.attr, undo)?;
        }
        let placed = Crd { kind: snd.kind, base: dst_base, order, attr: snd.attr };
        Ok(XferItem::delegate(placed, item.hotspot))
    }

    /// Copies the node at `from` to `to`, masking its rights with `attr`.
    /// Empty sources and occupied destinations are skipped.
    fn derive(
        &mut self,
        kind: CrdKind,
        from: Link,
        to: Link,
        attr: u8,
        undo: &mut Vec<Inserted>,
    ) -> Result<(), XferError> {
        let Some(src_pd) = self.pds.get(from.pd) else {
            return Ok(());
        };
        let obj = match kind {
            CrdKind::Obj => match src_pd.obj.get(from.index) {
                Some((obj, rights)) => Some((Some(obj), 0, rights & attr)),
                None => None,
            },
            CrdKind::Mem => {
                src_pd.mem.get(from.index).map(|(page, rights)| (None, page, rights & attr))
            }
            CrdKind::Null => None,
        };
        let Some((obj, page, rights)) = obj else {
            return Ok(());
        };
        if rights == 0 {
            return Ok(());
        }
        let Some(dst_pd) = self.pds.get_mut(to.pd) else {
            return Err(XferError::InvalidMapping);
        };
        let occupied = match kind {
            CrdKind::Obj => dst_pd.obj.lookup(to.index).is_some(),
            _ => dst_pd.mem.lookup(to.index).is_some(),
        };
        if occupied {
            return Ok(());
        }
        dst_pd.quota.charge()?;
        if let Some(obj) = obj {
            if !self.add_ref(obj) {
                if let Some(pd) = self.pds.get_mut(to.pd) {
                    pd.quota.release();
                }
                return Ok(());
            }
        }
        if let Some(dst_pd) = self.pds.get_mut(to.pd) {
            let parent = Some(from);
            let inserted = match obj {
                Some(obj) => dst_pd.obj.insert(
                    to.index,
                    Node { value: obj, attr: rights, parent, children: Vec::new() },
                ),
                None => dst_pd.mem.insert(
                    to.index,
                    Node { value: page, attr: rights, parent, children: Vec::new() },
                ),
            };
            inserted?;
        }
        self.with_node_children(kind, from, |children| children.push(to));
        undo.push(Inserted { kind, at: to });
        Ok(())
    }

    fn rollback(&mut self, undo: Vec<Inserted>) {
        for entry in undo.into_iter().rev() {
            self.remove_node(entry.kind, entry.at, &mut BTreeSet::new());
        }
    }

    /// Where `dst` already holds the capability named by `item`, as a
    /// descriptor in `dst`'s terms. Null when it holds none inside `window`.
    fn translate_item(&self, src: PdId, dst: PdId, item: XferItem, window: Crd) -> XferItem {
        let crd = item.crd;
        if crd.is_null() || window.kind != crd.kind {
            return XferItem::translate(Crd::null());
        }
        let start = Link { pd: src, index: crd.base };
        let found = self
            .ancestors(crd.kind, start)
            .into_iter()
            .chain(self.node(crd.kind, start).map(|n| n.1).unwrap_or_default())
            .find(|link| link.pd == dst && window.contains(link.index));
        match found.and_then(|link| self.node(crd.kind, link).map(|(attr, _)| (link, attr))) {
            Some((link, attr)) => {
                XferItem::translate(Crd { kind: crd.kind, base: link.index, order: 0, attr })
            }
            None => XferItem::translate(Crd::null()),
        }
    }

    fn ancestors(&self, kind: CrdKind, start: Link) -> Vec<Link> {
        let mut chain = Vec::new();
        let mut at = self.parent_of(kind, start);
        while let Some(link) = at {
            chain.push(link);
            at = self.parent_of(kind, link);
        }
        chain
    }

    fn parent_of(&self, kind: CrdKind, at: Link) -> Option<Link> {
        let pd = self.pds.get(at.pd)?;
        match kind {
            CrdKind::Obj => pd.obj.lookup(at.index)?.parent,
            CrdKind::Mem => pd.mem.lookup(at.index)?.parent,
            CrdKind::Null => None,
        }
    }

    /// Rights and children of the node at `at`.
    fn node(&self, kind: CrdKind, at: Link) -> Option<(u8, Vec<Link>)> {
        let pd = self.pds.get(at.pd)?;
        match kind {
            CrdKind::Obj => pd.obj.lookup(at.index).map(|n| (n.attr, n.children.clone())),
            CrdKind::Mem => pd.mem.lookup(at.index).map(|n| (n.attr, n.children.clone())),
            CrdKind::Null => None,
        }
    }

    fn with_node_children(&mut self, kind: CrdKind, at: Link, f: impl FnOnce(&mut Vec<Link>)) {
        let Some(pd) = self.pds.get_mut(at.pd) else {
            return;
        };
        match kind {
            CrdKind::Obj => {
                if let Some(n) = pd.obj.lookup_mut(at.index) {
                    f(&mut n.children);
                }
            }
            CrdKind::Mem => {
                if let Some(n) = pd.mem.lookup_mut(at.index) {
                    f(&mut n.children);
                }
            }
            CrdKind::Null => {}
        }
    }

    /// Removes one node, unlinks it from its parent and drops what it held.
    fn remove_node(&mut self, kind: CrdKind, at: Link, flush: &mut BTreeSet<u32>) {
        let Some(pd) = self.pds.get_mut(at.pd) else {
            return;
        };
        let (parent, obj) = match kind {
            CrdKind::Obj => match pd.obj.remove(at.index) {
                Some(n) => (n.parent, Some(n.value)),
                None => return,
            },
            CrdKind::Mem => match pd.mem.remove(at.index) {
                Some(n) => {
                    flush.insert(at.pd.index());
                    (n.parent, None)
                }
                None => return,
            },
            CrdKind::Null => return,
        };
        pd.quota.release();
        if let Some(parent) = parent {
            self.with_node_children(kind, parent, |children| children.retain(|c| *c != at));
        }
        if let Some(obj) = obj {
            self.put(obj);
        }
    }

    /// Transfers the typed items of the current call. `to_callee` selects
    /// the direction: caller to callee on receive, callee to caller on reply.
    pub(crate) fn delegate_ipc(&mut self, cpu: CpuId, to_callee: bool) -> Result<(), XferError> {
        let cur = self.current(cpu);
        let Some(caller) = self.ecs.get(cur).and_then(|e| e.rcap) else {
            return Ok(());
        };
        let (src, dst) = if to_callee { (caller, cur) } else { (cur, caller) };
        let (Some(src_ec), Some(dst_ec)) = (self.ecs.get(src), self.ecs.get(dst)) else {
            return Ok(());
        };
        let user = to_callee || dst_ec.cont == Some(Continuation::RetUserSysexit);
        let (xlt, del) = match (user, dst_ec.utcb.as_deref()) {
            (true, Some(utcb)) => (utcb.xlt, utcb.del),
            _ => {
                let page = if dst_ec.cont == Some(Continuation::RetUserIret) {
                    dst_ec.regs.cr2 >> PAGE_BITS
                } else {
                    0
                };
                (Crd::null(), Crd::mem(page, Crd::MAX_ORDER, 0x1f))
            }
        };
        let items = src_ec.utcb.as_deref().map(|u| u.items.clone()).unwrap_or_default();
        let (src_pd, dst_pd) = (src_ec.pd, dst_ec.pd);
        let results = self.xfer_items(src_pd, dst_pd, xlt, del, &items)?;
        if user {
            if let Some(utcb) = self.ecs.get_mut(dst).and_then(|e| e.utcb.as_deref_mut()) {
                utcb.items = results;
            }
        }
        Ok(())
    }

    /// Removes everything derived from the range `crd` of `pd`, and the
    /// range itself when `include_self` is set. Memory revocations shoot
    /// down the TLBs of the affected domains.
    pub(crate) fn revoke(&mut self, cpu: CpuId, pd: PdId, crd: Crd, include_self: bool) {
        let kind = crd.kind;
        let Some(space) = self.pds.get(pd) else {
            return;
        };
        let indices = match kind {
            CrdKind::Obj => space.obj.indices(crd.aligned_base(), crd.size()),
            CrdKind::Mem => space.mem.indices(crd.aligned_base(), crd.size()),
            CrdKind::Null => return,
        };
        let mut flush = BTreeSet::new();
        for index in indices {
            self.revoke_subtree(kind, Link { pd, index }, include_self, &mut flush);
        }
        let affected: Vec<PdId> =
            self.pds.handles().into_iter().filter(|h| flush.contains(&h.index())).collect();
        for target in affected {
            let ticket = self.tlb_shootdown(cpu, target);
            log_trace!(
                target: "xfer",
                "revoke shootdown pd={:?} targets={}",
                target,
                ticket.targets.len()
            );
        }
    }

    fn revoke_subtree(
        &mut self,
        kind: CrdKind,
        root: Link,
        include_self: bool,
        flush: &mut BTreeSet<u32>,
    ) {
        let mut order = Vec::new();
        let mut stack = alloc::vec![root];
        while let Some(link) = stack.pop() {
            order.push(link);
            if let Some((_, children)) = self.node(kind, link) {
                stack.extend(children);
            }
        }
        for link in order.into_iter().rev() {
            if link == root && !include_self {
                continue;
            }
            self.remove_node(kind, link, flush);
        }
    }

    /// Descriptor of the node at `crd.base` in `pd`, or null.
    pub(crate) fn lookup_crd(&self, pd: PdId, crd: Crd) -> Crd {
        let at = Link { pd, index: crd.base };
        let Some(attr) = self.node(crd.kind, at).map(|(attr, _)| attr) else {
            return Crd::null();
        };
        Crd { kind: crd.kind, base: crd.base, order: 0, attr }
    }

    /// Invalidates `pd`'s translations on every processor it ran on. The
    /// local TLB is flushed right away; remote processors are sent an NMI.
    pub(crate) fn tlb_shootdown(&mut self, cpu: CpuId, pd: PdId) -> ShootdownTicket {
        let mut ticket = ShootdownTicket::default();
        let Some(cpus) = self.pds.get(pd).map(|p| p.cpus) else {
            return ticket;
        };
        for target in cpus.iter() {
            let shadow = &self.cpus[target.as_index()].shadow;
            if target == cpu {
                shadow.stale_tlb.store(false, Ordering::Release);
                self.hal.flush_all();
                continue;
            }
            shadow.stale_tlb.store(true, Ordering::Release);
            ticket.targets.push((target, shadow.shootdown_count()));
            self.hal.send_nmi(target);
        }
        self.trace.record(TraceEvent::new(TraceKind::Shootdown, cpu.as_raw(), pd.index(), 0));
        ticket
    }

    /// Whether every target of `ticket` took the NMI since it was issued.
    pub fn shootdown_complete(&self, ticket: &ShootdownTicket) -> bool {
        ticket
            .targets
            .iter()
            .all(|(cpu, seen)| self.cpus[cpu.as_index()].shadow.shootdown_count() != *seen)
    }
}
