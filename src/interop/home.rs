//! Where a value lives while a stub is being emitted.

use crate::{
    assembly::{CodeStream, LocalId},
    metadata::typesystem::MarshalType,
    Error, Result,
};

/// Storage slot of a home.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    /// Stub parameter, zero based
    Argument(u16),
    /// Stub local
    Local(LocalId),
}

/// A value location with uniform load and store operations.
///
/// A by-ref home holds the address of the value rather than the value. Loads go through the
/// address; stores are refused because `stobj` needs the address pushed before the value, which
/// the marshalling phases cannot arrange. By-ref values are therefore staged through a plain
/// local and copied back explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Home {
    slot: Slot,
    ty: MarshalType,
    by_ref: bool,
}

impl Home {
    /// A home in stub parameter `index`.
    #[must_use]
    pub fn argument(index: u16, ty: MarshalType, by_ref: bool) -> Self {
        Home {
            slot: Slot::Argument(index),
            ty,
            by_ref,
        }
    }

    /// A home in `local`.
    #[must_use]
    pub fn local(local: LocalId, ty: MarshalType, by_ref: bool) -> Self {
        Home {
            slot: Slot::Local(local),
            ty,
            by_ref,
        }
    }

    /// Type of the value, not of the slot.
    #[must_use]
    pub fn ty(&self) -> &MarshalType {
        &self.ty
    }

    /// The underlying slot.
    #[must_use]
    pub fn slot(&self) -> Slot {
        self.slot
    }

    /// Returns `true` if the slot holds an address.
    #[must_use]
    pub fn is_by_ref(&self) -> bool {
        self.by_ref
    }

    /// Push the value.
    pub fn load_value(&self, stream: &mut CodeStream) {
        self.load_slot(stream);
        if self.by_ref {
            stream.emit_ldind(&self.ty);
        }
    }

    /// Push the address of the value.
    pub fn load_address(&self, stream: &mut CodeStream) {
        match (self.slot, self.by_ref) {
            (Slot::Argument(index), false) => stream.emit_ldarga(index),
            (Slot::Local(local), false) => stream.emit_ldloca(local),
            _ => self.load_slot(stream),
        }
    }

    /// Pop a value into the home.
    ///
    /// # Errors
    /// Returns [`crate::Error::InvalidHomeStore`] for by-ref homes.
    pub fn store_value(&self, stream: &mut CodeStream) -> Result<()> {
        if self.by_ref {
            return Err(Error::InvalidHomeStore("by-ref"));
        }

        match self.slot {
            Slot::Argument(index) => stream.emit_starg(index),
            Slot::Local(local) => stream.emit_stloc(local),
        }
        Ok(())
    }

    fn load_slot(&self, stream: &mut CodeStream) {
        match self.slot {
            Slot::Argument(index) => stream.emit_ldarg(index),
            Slot::Local(local) => stream.emit_ldloc(local),
        }
    }
}
