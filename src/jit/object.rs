//! Relocatable object format produced by the compile layer.
//!
//! An `ObjectBuffer` holds the raw bytes of each section, the symbols the
//! object defines and the relocations the linker must apply once section
//! addresses are known. Symbol and relocation names are already mangled for
//! the target.

use std::collections::HashMap;
use std::fmt;

use serde::Serialize;

/// The sections an object may carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SectionKind {
    /// Executable code
    Text,
    /// Immutable data
    ReadOnlyData,
    /// Writable data, never executable
    Data,
}

impl fmt::Display for SectionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKind::Text => write!(f, "text"),
            SectionKind::ReadOnlyData => write!(f, "rodata"),
            SectionKind::Data => write!(f, "data"),
        }
    }
}

/// Byte sizes of each section, used to request memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionSizes {
    pub text: usize,
    pub rodata: usize,
    pub data: usize,
}

/// How a relocation patches its location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocKind {
    /// Full 64-bit absolute address written little-endian.
    Abs64,
    /// MOVZ + 3×MOVK sequence; each instruction's imm16 receives 16 bits of
    /// the absolute address.
    Aarch64MovWide,
}

impl RelocKind {
    /// Number of bytes the relocation covers.
    pub fn width(self) -> usize {
        match self {
            RelocKind::Abs64 => 8,
            RelocKind::Aarch64MovWide => 16,
        }
    }
}

/// A symbol defined by an object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectSymbol {
    /// Mangled name
    pub name: String,
    pub section: SectionKind,
    pub offset: usize,
    pub size: usize,
    /// Published into the target library when linked
    pub exported: bool,
}

/// A location to patch once the target symbol's address is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relocation {
    pub section: SectionKind,
    pub offset: usize,
    pub kind: RelocKind,
    /// Mangled name of the referenced symbol
    pub target: String,
    pub addend: i64,
}

/// Finished native object code for one module.
#[derive(Debug, Clone, Default)]
pub struct ObjectBuffer {
    pub module: String,
    pub text: Vec<u8>,
    pub rodata: Vec<u8>,
    pub data: Vec<u8>,
    pub symbols: Vec<ObjectSymbol>,
    pub relocations: Vec<Relocation>,
}

impl ObjectBuffer {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            ..Default::default()
        }
    }

    pub fn section(&self, kind: SectionKind) -> &[u8] {
        match kind {
            SectionKind::Text => &self.text,
            SectionKind::ReadOnlyData => &self.rodata,
            SectionKind::Data => &self.data,
        }
    }

    pub fn section_sizes(&self) -> SectionSizes {
        SectionSizes {
            text: self.text.len(),
            rodata: self.rodata.len(),
            data: self.data.len(),
        }
    }

    /// Symbols keyed by name, for local relocation resolution.
    pub fn symbol_map(&self) -> HashMap<&str, &ObjectSymbol> {
        self.symbols.iter().map(|s| (s.name.as_str(), s)).collect()
    }

    pub fn exported_symbols(&self) -> impl Iterator<Item = &ObjectSymbol> {
        self.symbols.iter().filter(|s| s.exported)
    }

    /// Names referenced by relocations that this object does not define.
    pub fn external_references(&self) -> Vec<&str> {
        let local = self.symbol_map();
        let mut externals: Vec<&str> = self
            .relocations
            .iter()
            .map(|r| r.target.as_str())
            .filter(|name| !local.contains_key(name))
            .collect();
        externals.sort_unstable();
        externals.dedup();
        externals
    }
}
