// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Object capabilities, permissions and capability range descriptors
//! OWNERS: @kernel-cap-team
//! PUBLIC API: Capability{obj,perms}, ObjRef, Perms, Typed (cast), Crd, XferItem, CapError
//! DEPENDS_ON: obj (handle types), arena::Handle
//! INVARIANTS: Casts check type and permissions together; a failed cast never reveals the object;
//!             Crd::place keeps both ranges inside their windows
//! ADR: docs/adr/0001-runtime-roles-and-boundaries.md

use bitflags::bitflags;
use core::fmt;

use crate::arena::Handle;
use crate::ec::Ec;
use crate::obj::{Kp, Pd, Pt, Sc, Sm};

bitflags! {
    /// Capability permissions. Bit meaning depends on the object kind.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Perms: u8 {
        /// PD: create objects in this domain.
        const OBJ_CREATION = 1 << 0;
        /// EC: recall.
        const EC_CTRL = 1 << 0;
        /// EC: bind a scheduling context.
        const CREATE_SC = 1 << 2;
        /// EC: bind a portal.
        const CREATE_PT = 1 << 3;
        const SC_CTRL = 1 << 0;
        const PT_CTRL = 1 << 0;
        const PT_CALL = 1 << 1;
        /// SM permissions are `1 << op`.
        const SM_UP = 1 << 0;
        const SM_DOWN = 1 << 1;
        const KP_CTRL = 1 << 0;
        const ALL = 0x1f;
    }
}

/// Reference to a kernel object of any kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ObjRef {
    Pd(Handle<Pd>),
    Ec(Handle<Ec>),
    Sc(Handle<Sc>),
    Pt(Handle<Pt>),
    Sm(Handle<Sm>),
    Kp(Handle<Kp>),
}

/// Object types reachable through capabilities.
pub trait Typed: Sized {
    fn from_ref(obj: ObjRef) -> Option<Handle<Self>>;
    fn to_ref(h: Handle<Self>) -> ObjRef;
}

macro_rules! typed {
    ($ty:ty, $variant:ident) => {
        impl Typed for $ty {
            #[inline]
            fn from_ref(obj: ObjRef) -> Option<Handle<Self>> {
                match obj {
                    ObjRef::$variant(h) => Some(h),
                    _ => None,
                }
            }

            #[inline]
            fn to_ref(h: Handle<Self>) -> ObjRef {
                ObjRef::$variant(h)
            }
        }
    };
}

typed!(Pd, Pd);
typed!(Ec, Ec);
typed!(Sc, Sc);
typed!(Pt, Pt);
typed!(Sm, Sm);
typed!(Kp, Kp);

/// Errors produced when resolving a capability.
#[must_use = "capability errors must be reported to the caller"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapError {
    /// Selector is empty.
    NotFound,
    /// Selector names an object of another kind.
    WrongType,
    /// Insufficient permissions for the requested operation.
    PermissionDenied,
}

/// Object space entry.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Capability {
    pub obj: ObjRef,
    pub perms: Perms,
}

impl Capability {
    pub const fn new(obj: ObjRef, perms: Perms) -> Self {
        Self { obj, perms }
    }

    /// Resolves to a handle of type `T` if the capability carries all of `needed`.
    pub fn cast<T: Typed>(self, needed: Perms) -> Result<Handle<T>, CapError> {
        let h = T::from_ref(self.obj).ok_or(CapError::WrongType)?;
        if !self.perms.contains(needed) {
            return Err(CapError::PermissionDenied);
        }
        Ok(h)
    }
}

impl fmt::Debug for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capability")
            .field("obj", &self.obj)
            .field("perms", &self.perms.bits())
            .finish()
    }
}

/// Space a range descriptor refers to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum CrdKind {
    Null = 0,
    Mem = 1,
    Obj = 3,
}

/// Capability range descriptor: `2^order` entries starting at `base`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Crd {
    pub kind: CrdKind,
    pub base: u64,
    pub order: u8,
    pub attr: u8,
}

impl Crd {
    /// Largest order a descriptor can express.
    pub const MAX_ORDER: u8 = 0x1f;

    pub const fn null() -> Self {
        Self { kind: CrdKind::Null, base: 0, order: 0, attr: 0 }
    }

    pub const fn obj(base: u64, order: u8, attr: u8) -> Self {
        Self { kind: CrdKind::Obj, base, order, attr }
    }

    pub const fn mem(base: u64, order: u8, attr: u8) -> Self {
        Self { kind: CrdKind::Mem, base, order, attr }
    }

    /// Register layout: type [1:0], attr [6:2], order [11:7], base [63:12].
    pub fn decode(raw: u64) -> Self {
        let kind = match raw & 0x3 {
            1 => CrdKind::Mem,
            3 => CrdKind::Obj,
            _ => return Self::null(),
        };
        Self {
            kind,
            base: raw >> 12,
            order: ((raw >> 7) & 0x1f) as u8,
            attr: ((raw >> 2) & 0x1f) as u8,
        }
    }

    pub const fn encode(self) -> u64 {
        (self.base << 12)
            | ((self.order as u64 & 0x1f) << 7)
            | ((self.attr as u64 & 0x1f) << 2)
            | self.kind as u64
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        matches!(self.kind, CrdKind::Null)
    }

    /// Base rounded down to the descriptor's natural alignment.
    #[inline]
    pub const fn aligned_base(self) -> u64 {
        self.base & !mask(self.order)
    }

    /// Number of entries covered.
    #[inline]
    pub const fn size(self) -> u64 {
        1u64 << self.order
    }

    #[inline]
    pub fn contains(self, index: u64) -> bool {
        index >= self.aligned_base() && index - self.aligned_base() < self.size()
    }

    /// Placement of a send range into a receive window.
    ///
    /// The smaller order wins; the hotspot selects the sub-range on the
    /// larger side. Returns `(source base, destination base, order)`.
    pub fn place(snd: Crd, rcv: Crd, hotspot: u64) -> (u64, u64, u8) {
        let sb = snd.aligned_base();
        let rb = rcv.aligned_base();
        if snd.order > rcv.order {
            let sub = hotspot & mask(snd.order) & !mask(rcv.order);
            (sb | sub, rb, rcv.order)
        } else {
            let sub = hotspot & mask(rcv.order) & !mask(snd.order);
            (sb, rb | sub, snd.order)
        }
    }
}

#[inline]
const fn mask(order: u8) -> u64 {
    if order >= 64 {
        u64::MAX
    } else {
        (1u64 << order) - 1
    }
}

/// What a typed message item asks for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum XferKind {
    /// Report where the receiver already holds the sender's capability.
    Translate,
    /// Grant the range to the receiver.
    Delegate,
}

/// Typed message item.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct XferItem {
    pub kind: XferKind,
    pub crd: Crd,
    pub hotspot: u64,
}

impl XferItem {
    pub const fn delegate(crd: Crd, hotspot: u64) -> Self {
        Self { kind: XferKind::Delegate, crd, hotspot }
    }

    pub const fn translate(crd: Crd) -> Self {
        Self { kind: XferKind::Translate, crd, hotspot: 0 }
    }

    /// Two-word register form: `crd`, then `hotspot << 12 | kind`.
    pub fn decode(crd: u64, flags: u64) -> Self {
        let kind = if flags & 1 != 0 { XferKind::Delegate } else { XferKind::Translate };
        Self { kind, crd: Crd::decode(crd), hotspot: flags >> 12 }
    }

    pub fn encode(self) -> (u64, u64) {
        let kind = match self.kind {
            XferKind::Translate => 0,
            XferKind::Delegate => 1,
        };
        (self.crd.encode(), (self.hotspot << 12) | kind)
    }
}

#[cfg(test)]
mod tests_prop;
