//! Binary code emission buffers.
//!
//! The emitter writes little-endian instruction words into a per-function
//! [`CodeBuffer`]. In-function branch targets are recorded as label fixups
//! and patched once every block's offset is known; references that cross
//! the function boundary (calls, symbol addresses) become relocation
//! entries for the object writer.

use crate::ir::{Block, SymRef};
use cranelift_entity::SecondaryMap;

/// Offset in bytes from the beginning of the function.
///
/// The backend can run as a cross compiler, so this is a fixed-width type
/// rather than `usize`.
pub type CodeOffset = u32;

/// Addend to add to a relocated symbol value.
pub type Addend = i64;

/// Relocation kinds the ARM64 backend emits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Reloc {
    /// 26-bit PC-relative branch (B/BL).
    Branch26,
    /// ADRP page, 21-bit PC-relative.
    Page21,
    /// ADD/LDR low 12 bits of a page offset.
    PageOff12,
    /// Absolute 8-byte pointer in data.
    Abs8,
}

/// One relocation against a symbol.
#[derive(Clone, Debug)]
pub struct RelocEntry {
    /// Where in the function's code the fixup applies.
    pub offset: CodeOffset,
    /// Kind of fixup.
    pub kind: Reloc,
    /// The referenced symbol.
    pub target: SymRef,
    /// Constant added to the symbol address.
    pub addend: Addend,
}

#[derive(Copy, Clone, Debug)]
enum FixupKind {
    /// B/BL, 26-bit word offset at bit 0.
    Branch26,
    /// B.cond/CBZ/CBNZ, 19-bit word offset at bit 5.
    Branch19,
}

#[derive(Copy, Clone, Debug)]
struct Fixup {
    offset: CodeOffset,
    target: Block,
    kind: FixupKind,
}

/// A growable machine-code buffer with label fixups and relocations.
#[derive(Default)]
pub struct CodeBuffer {
    bytes: Vec<u8>,
    relocs: Vec<RelocEntry>,
    fixups: Vec<Fixup>,
    block_offsets: SecondaryMap<Block, CodeOffset>,
    bound: SecondaryMap<Block, bool>,
}

impl CodeBuffer {
    /// An empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current position.
    pub fn offset(&self) -> CodeOffset {
        self.bytes.len() as CodeOffset
    }

    /// Append one instruction word, little-endian.
    pub fn put4(&mut self, word: u32) {
        self.bytes.extend_from_slice(&word.to_le_bytes());
    }

    /// Record the current offset as the start of `block`.
    pub fn bind_block(&mut self, block: Block) {
        self.block_offsets[block] = self.offset();
        self.bound[block] = true;
    }

    /// Append a B/BL-class word whose 26-bit target field is patched once
    /// `target`'s offset is known.
    pub fn put4_branch26(&mut self, word: u32, target: Block) {
        self.fixups.push(Fixup {
            offset: self.offset(),
            target,
            kind: FixupKind::Branch26,
        });
        self.put4(word);
    }

    /// Append a B.cond/CBZ/CBNZ-class word whose 19-bit target field is
    /// patched once `target`'s offset is known.
    pub fn put4_branch19(&mut self, word: u32, target: Block) {
        self.fixups.push(Fixup {
            offset: self.offset(),
            target,
            kind: FixupKind::Branch19,
        });
        self.put4(word);
    }

    /// Record a relocation at the current offset.
    pub fn reloc(&mut self, kind: Reloc, target: SymRef, addend: Addend) {
        self.relocs.push(RelocEntry {
            offset: self.offset(),
            kind,
            target,
            addend,
        });
    }

    /// Patch all branch fixups and return the code plus its relocations.
    pub fn finish(mut self) -> (Vec<u8>, Vec<RelocEntry>) {
        for fixup in core::mem::take(&mut self.fixups) {
            assert!(
                self.bound[fixup.target],
                "branch to unemitted {}",
                fixup.target
            );
            let delta = self.block_offsets[fixup.target] as i64 - fixup.offset as i64;
            debug_assert_eq!(delta & 3, 0);
            let words = delta >> 2;
            let at = fixup.offset as usize;
            let mut insn = u32::from_le_bytes(self.bytes[at..at + 4].try_into().unwrap());
            match fixup.kind {
                FixupKind::Branch26 => {
                    assert!((-(1 << 25)..(1 << 25)).contains(&words), "branch out of range");
                    insn |= (words as u32) & 0x03ff_ffff;
                }
                FixupKind::Branch19 => {
                    assert!((-(1 << 18)..(1 << 18)).contains(&words), "branch out of range");
                    insn |= ((words as u32) & 0x7ffff) << 5;
                }
            }
            self.bytes[at..at + 4].copy_from_slice(&insn.to_le_bytes());
        }
        (self.bytes, self.relocs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cranelift_entity::EntityRef;

    #[test]
    fn backward_branch_is_patched() {
        let b0 = Block::new(0);
        let mut buf = CodeBuffer::new();
        buf.bind_block(b0);
        buf.put4(0xd503201f); // nop
        buf.put4_branch26(0x14000000, b0); // b b0
        let (bytes, relocs) = buf.finish();
        assert!(relocs.is_empty());
        let b = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        // B with offset -1 word.
        assert_eq!(b, 0x17ffffff);
    }

    #[test]
    fn forward_cond_branch_is_patched() {
        let b0 = Block::new(0);
        let mut buf = CodeBuffer::new();
        buf.put4_branch19(0x54000000, b0); // b.eq b0
        buf.put4(0xd503201f);
        buf.bind_block(b0);
        let (bytes, _) = buf.finish();
        let b = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        // Offset +2 words in bits 5..24.
        assert_eq!(b, 0x54000000 | (2 << 5));
    }
}
