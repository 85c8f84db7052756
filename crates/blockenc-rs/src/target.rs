//! Branch-target classification and the live address layout.
//!
//! A target either names an instruction of one of the blocks being encoded
//! (and then moves with it) or is a fixed external address.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use crate::ir::Instruction;

/// Current address of every instruction, per block.
///
/// Owned by the block encoder.  During a relaxation pass each address is
/// rewritten just before its instruction is visited, so an instruction sees
/// the final sizes of everything before it and sizes from the previous pass
/// for everything after it.  Variants only read it.
///
/// It also keeps the lowest address every instruction can still end up at
/// (all instructions in their smallest form), since sizes only shrink.
#[derive(Debug, Default, Clone)]
pub(crate) struct Layout {
    addresses: Vec<Vec<u64>>,
    min_addresses: Vec<Vec<u64>>,
    ends: Vec<u64>,
}

fn lay_out(addrs: &mut Vec<u64>, rip: u64, sizes: impl Iterator<Item = usize>) -> u64 {
    addrs.clear();
    let mut ip = rip;
    for size in sizes {
        addrs.push(ip);
        ip = ip.wrapping_add(size as u64);
    }
    ip
}

impl Layout {
    pub(crate) fn with_blocks(count: usize) -> Self {
        Self {
            addresses: alloc::vec![Vec::new(); count],
            min_addresses: alloc::vec![Vec::new(); count],
            ends: alloc::vec![0; count],
        }
    }

    /// Lay out block `block` at `rip` from its instruction sizes.
    pub(crate) fn update(&mut self, block: usize, rip: u64, sizes: impl Iterator<Item = usize>) {
        self.ends[block] = lay_out(&mut self.addresses[block], rip, sizes);
    }

    /// Lay out the lower bounds of block `block` from the smallest size each
    /// instruction can take.
    pub(crate) fn update_min(&mut self, block: usize, rip: u64, sizes: impl Iterator<Item = usize>) {
        lay_out(&mut self.min_addresses[block], rip, sizes);
    }

    /// Move instruction `index` of block `block` to `ip`.
    pub(crate) fn set_address(&mut self, block: usize, index: usize, ip: u64) {
        self.addresses[block][index] = ip;
    }

    pub(crate) fn set_end(&mut self, block: usize, end: u64) {
        self.ends[block] = end;
    }

    /// Address of instruction `index` of block `block`.
    pub(crate) fn address(&self, block: usize, index: usize) -> u64 {
        self.addresses[block][index]
    }

    /// Lowest address instruction `index` of block `block` can still get.
    pub(crate) fn min_address(&self, block: usize, index: usize) -> u64 {
        self.min_addresses[block][index]
    }

    /// Address just past the last instruction of `block`.
    pub(crate) fn end(&self, block: usize) -> u64 {
        self.ends[block]
    }
}

/// Where a branch (or IP-relative memory operand) points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TargetRef {
    /// Instruction `index` of block `block`; follows its relocation.
    InBlock { block: usize, index: usize },
    /// Fixed absolute address.
    External(u64),
}

impl TargetRef {
    /// The live target address under `layout`.
    pub(crate) fn address(&self, layout: &Layout) -> u64 {
        match *self {
            TargetRef::InBlock { block, index } => layout.address(block, index),
            TargetRef::External(addr) => addr,
        }
    }

    /// The lowest address the target can still move down to.
    pub(crate) fn min_address(&self, layout: &Layout) -> u64 {
        match *self {
            TargetRef::InBlock { block, index } => layout.min_address(block, index),
            TargetRef::External(addr) => addr,
        }
    }

    /// Whether the target is an instruction of block `block`.
    pub(crate) fn is_in_block(&self, block: usize) -> bool {
        matches!(*self, TargetRef::InBlock { block: b, .. } if b == block)
    }
}

/// Maps original instruction addresses to their position in the request.
#[derive(Debug, Default)]
pub(crate) struct TargetResolver {
    by_ip: BTreeMap<u64, (usize, usize)>,
}

impl TargetResolver {
    /// Index the original addresses of all blocks.  When two instructions
    /// share an address the first one wins.
    pub(crate) fn new<'a>(blocks: impl IntoIterator<Item = &'a [Instruction]>) -> Self {
        let mut by_ip = BTreeMap::new();
        for (block, instrs) in blocks.into_iter().enumerate() {
            for (index, instr) in instrs.iter().enumerate() {
                by_ip.entry(instr.ip()).or_insert((block, index));
            }
        }
        Self { by_ip }
    }

    /// Classify an original target address.  Never fails: anything that is
    /// not the start of an instruction is external.
    pub(crate) fn resolve(&self, address: u64) -> TargetRef {
        match self.by_ip.get(&address) {
            Some(&(block, index)) => TargetRef::InBlock { block, index },
            None => TargetRef::External(address),
        }
    }
}
