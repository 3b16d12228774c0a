//! Code buffer for building machine code.
//!
//! Code for all functions of a module is emitted into one buffer. Branches
//! to IR labels are recorded as fixups and patched when the current function
//! is finished; references to symbols are recorded as relocations and left
//! for the linker.

use std::collections::HashMap;

use super::object::{RelocKind, Relocation, SectionKind};

/// Encoding of a label reference to patch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixupKind {
    /// 32-bit displacement relative to the end of the field (x86-64 JMP/Jcc)
    Rel32,
    /// 26-bit word offset of an AArch64 B instruction
    AArch64Branch26,
    /// 19-bit word offset of an AArch64 CBZ/CBNZ/B.cond instruction
    AArch64Branch19,
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    /// Label id -> offset, for the function being emitted
    labels: HashMap<u32, usize>,
    /// Pending label references (field offset, label, kind)
    fixups: Vec<(usize, u32, FixupKind)>,
    relocations: Vec<Relocation>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            labels: HashMap::new(),
            fixups: Vec::new(),
            relocations: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    pub fn emit_u64(&mut self, value: u64) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Define a label at the current position.
    pub fn define_label(&mut self, label: u32) {
        self.labels.insert(label, self.code.len());
    }

    /// Record that the field at `offset` refers to `label`.
    pub fn add_fixup(&mut self, offset: usize, label: u32, kind: FixupKind) {
        self.fixups.push((offset, label, kind));
    }

    /// Record a relocation against a symbol at `offset` in the text section.
    pub fn add_relocation(&mut self, offset: usize, kind: RelocKind, target: &str) {
        self.relocations.push(Relocation {
            section: SectionKind::Text,
            offset,
            kind,
            target: target.to_string(),
            addend: 0,
        });
    }

    fn read_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.code[offset],
            self.code[offset + 1],
            self.code[offset + 2],
            self.code[offset + 3],
        ])
    }

    fn write_u32(&mut self, offset: usize, value: u32) {
        self.code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }

    /// Patch all label references of the current function and forget its labels.
    pub fn finish_function(&mut self) -> Result<(), String> {
        let fixups = std::mem::take(&mut self.fixups);
        for (offset, label, kind) in fixups {
            let target = self
                .labels
                .get(&label)
                .copied()
                .ok_or_else(|| format!("undefined label: {}", label))?;

            match kind {
                FixupKind::Rel32 => {
                    let rel = (target as i64) - (offset as i64 + 4);
                    if rel < i32::MIN as i64 || rel > i32::MAX as i64 {
                        return Err(format!("relative offset out of range for label: {}", label));
                    }
                    self.write_u32(offset, rel as i32 as u32);
                }
                FixupKind::AArch64Branch26 => {
                    let rel = ((target as i64) - (offset as i64)) / 4;
                    if !(-(1 << 25)..(1 << 25)).contains(&rel) {
                        return Err(format!("branch offset out of range for label: {}", label));
                    }
                    let inst = (self.read_u32(offset) & 0xFC00_0000) | ((rel as u32) & 0x03FF_FFFF);
                    self.write_u32(offset, inst);
                }
                FixupKind::AArch64Branch19 => {
                    let rel = ((target as i64) - (offset as i64)) / 4;
                    if !(-(1 << 18)..(1 << 18)).contains(&rel) {
                        return Err(format!("branch offset out of range for label: {}", label));
                    }
                    let inst =
                        (self.read_u32(offset) & 0xFF00_001F) | (((rel as u32) & 0x7FFFF) << 5);
                    self.write_u32(offset, inst);
                }
            }
        }
        self.labels.clear();
        Ok(())
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer, returning the code bytes and symbol relocations.
    pub fn into_parts(self) -> (Vec<u8>, Vec<Relocation>) {
        (self.code, self.relocations)
    }

    /// Align the code to the given boundary, padding with `fill`.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        let current = self.code.len();
        let aligned = (current + alignment - 1) & !(alignment - 1);
        for _ in current..aligned {
            self.emit_u8(fill);
        }
    }
}

impl Default for CodeBuffer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_bytes() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.emit_u32(0xDEADBEEF);

        assert_eq!(buf.len(), 5);
        assert_eq!(buf.code(), &[0x90, 0xEF, 0xBE, 0xAD, 0xDE]);
    }

    #[test]
    fn test_rel32_fixup_backward() {
        let mut buf = CodeBuffer::new();
        buf.define_label(7);
        buf.emit_u8(0x90);
        buf.emit_u8(0xE9);
        let field = buf.offset();
        buf.emit_u32(0);
        buf.add_fixup(field, 7, FixupKind::Rel32);
        buf.finish_function().unwrap();

        // target 0, field ends at 6 -> -6
        assert_eq!(&buf.code()[2..6], &(-6i32).to_le_bytes());
        // Labels are forgotten once the function is finished
        assert!(buf.labels.is_empty());
    }

    #[test]
    fn test_branch26_fixup_forward() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0x1400_0000);
        buf.add_fixup(0, 1, FixupKind::AArch64Branch26);
        buf.emit_u32(0xD503_201F);
        buf.define_label(1);
        buf.finish_function().unwrap();

        assert_eq!(buf.read_u32(0), 0x1400_0002);
    }

    #[test]
    fn test_branch19_fixup_backward() {
        let mut buf = CodeBuffer::new();
        buf.define_label(3);
        buf.emit_u32(0xD503_201F);
        buf.emit_u32(0xB400_0000);
        buf.add_fixup(4, 3, FixupKind::AArch64Branch19);
        buf.finish_function().unwrap();

        // -1 word in imm19, Rt = x0
        assert_eq!(buf.read_u32(4), 0xB400_0000 | (0x7FFFF << 5));
    }

    #[test]
    fn test_undefined_label() {
        let mut buf = CodeBuffer::new();
        buf.emit_u32(0);
        buf.add_fixup(0, 9, FixupKind::Rel32);
        assert!(buf.finish_function().is_err());
    }

    #[test]
    fn test_alignment() {
        let mut buf = CodeBuffer::new();
        buf.emit_u8(0x90);
        buf.align(16, 0xCC);

        assert_eq!(buf.len(), 16);
        assert_eq!(buf.code()[15], 0xCC);
    }
}
