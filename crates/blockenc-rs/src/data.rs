//! Out-of-line pointer slots (64-bit long branches).
//!
//! A long branch jumps through an 8-byte cell placed after the block's code.
//! Slots are allocated during relaxation and may be invalidated again when
//! their branch shrinks; only valid slots get an address, are written, and
//! are reported as relocations.

use alloc::vec::Vec;

use crate::block::{RelocInfo, RelocKind};

/// Size and alignment of a pointer slot.
pub(crate) const POINTER_SIZE: u64 = 8;

/// Handle to a slot in a [`PointerData`] region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlotId(usize);

#[derive(Debug, Clone)]
struct Slot {
    value: u64,
    address: Option<u64>,
    valid: bool,
}

/// The pointer-slot region of one block.
#[derive(Debug, Default, Clone)]
pub(crate) struct PointerData {
    slots: Vec<Slot>,
    start: Option<u64>,
}

impl PointerData {
    pub(crate) fn alloc(&mut self) -> SlotId {
        assert!(
            self.start.is_none(),
            "pointer slot allocated after addresses were assigned"
        );
        let id = SlotId(self.slots.len());
        self.slots.push(Slot {
            value: 0,
            address: None,
            valid: true,
        });
        tracing::trace!(slot = id.0, "allocated pointer slot");
        id
    }

    pub(crate) fn invalidate(&mut self, id: SlotId) {
        self.slots[id.0].valid = false;
        tracing::trace!(slot = id.0, "invalidated pointer slot");
    }

    #[cfg(test)]
    pub(crate) fn is_valid(&self, id: SlotId) -> bool {
        self.slots[id.0].valid
    }

    /// Number of valid slots.
    pub(crate) fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.valid).count()
    }

    /// Place the valid slots after `code_end`, aligned to 8 bytes.
    ///
    /// Returns the data start.  Without valid slots the region is empty and
    /// starts at `code_end` itself.
    pub(crate) fn assign_addresses(&mut self, code_end: u64) -> u64 {
        let start = if self.len() == 0 {
            code_end
        } else {
            code_end.wrapping_add(code_end.wrapping_neg() & (POINTER_SIZE - 1))
        };
        let mut addr = start;
        for slot in self.slots.iter_mut().filter(|s| s.valid) {
            slot.address = Some(addr);
            addr = addr.wrapping_add(POINTER_SIZE);
        }
        self.start = Some(start);
        start
    }

    /// Address of a valid slot.
    ///
    /// # Panics
    ///
    /// Panics if the slot is invalid or addresses were not assigned yet.
    pub(crate) fn address(&self, id: SlotId) -> u64 {
        let slot = &self.slots[id.0];
        assert!(slot.valid, "address of an invalidated pointer slot");
        match slot.address {
            Some(addr) => addr,
            None => panic!("pointer slot address read before layout was final"),
        }
    }

    pub(crate) fn set_value(&mut self, id: SlotId, value: u64) {
        let slot = &mut self.slots[id.0];
        assert!(slot.valid, "write to an invalidated pointer slot");
        slot.value = value;
    }

    /// Append the slot contents (little-endian) to `out`.
    pub(crate) fn write(&self, out: &mut Vec<u8>) {
        for slot in self.slots.iter().filter(|s| s.valid) {
            out.extend_from_slice(&slot.value.to_le_bytes());
        }
    }

    /// One relocation per valid slot.
    pub(crate) fn reloc_infos(&self) -> Vec<RelocInfo> {
        self.slots
            .iter()
            .filter(|s| s.valid)
            .filter_map(|s| s.address)
            .map(|address| RelocInfo {
                kind: RelocKind::Offset64,
                address,
            })
            .collect()
    }
}
