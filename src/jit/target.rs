//! Host target description.
//!
//! The description is computed once when an engine is created and shared
//! read-only by every component afterwards.

use std::fmt;

use serde::Serialize;

use crate::error::CreationError;

/// Architectures with a code generator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    X86_64,
    AArch64,
}

impl Arch {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "x86_64" => Some(Arch::X86_64),
            "aarch64" => Some(Arch::AArch64),
            _ => None,
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Arch::X86_64 => write!(f, "x86_64"),
            Arch::AArch64 => write!(f, "aarch64"),
        }
    }
}

/// Operating systems whose executable memory and symbol search we support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    Linux,
    MacOs,
    FreeBsd,
}

impl Os {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "linux" => Some(Os::Linux),
            "macos" => Some(Os::MacOs),
            "freebsd" => Some(Os::FreeBsd),
            _ => None,
        }
    }

    /// Object file format naming convention.
    fn is_mach_o(self) -> bool {
        matches!(self, Os::MacOs)
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Os::Linux => write!(f, "linux"),
            Os::MacOs => write!(f, "macos"),
            Os::FreeBsd => write!(f, "freebsd"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Endianness {
    Little,
    Big,
}

/// Sizes, alignment and symbol naming rules of a target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataLayout {
    /// LLVM-style layout string
    pub description: String,
    /// Prefix prepended to every global symbol name (`_` on Mach-O)
    pub global_prefix: Option<char>,
    pub pointer_width: u32,
    pub endianness: Endianness,
    /// Required stack alignment at call sites, in bytes
    pub stack_alignment: u32,
}

impl DataLayout {
    fn for_target(arch: Arch, os: Os) -> Self {
        let mangling = if os.is_mach_o() { "m:o" } else { "m:e" };
        let description = match arch {
            Arch::X86_64 => format!(
                "e-{mangling}-p270:32:32-p271:32:32-p272:64:64-i64:64-i128:128-f80:128-n8:16:32:64-S128"
            ),
            Arch::AArch64 => format!("e-{mangling}-i8:8:32-i16:16:32-i64:64-i128:128-n32:64-S128"),
        };
        Self {
            description,
            global_prefix: if os.is_mach_o() { Some('_') } else { None },
            pointer_width: 64,
            endianness: Endianness::Little,
            stack_alignment: 16,
        }
    }
}

/// Immutable description of the target code is generated for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetDescription {
    pub arch: Arch,
    pub os: Os,
    pub data_layout: DataLayout,
    /// Integer arguments passed in registers; the IR calling convention
    /// allows no more parameters than this.
    pub max_register_args: usize,
}

impl TargetDescription {
    /// Describe a known architecture/OS pair.
    pub fn new(arch: Arch, os: Os) -> Self {
        let max_register_args = match arch {
            Arch::X86_64 => 6,
            Arch::AArch64 => 8,
        };
        Self {
            arch,
            os,
            data_layout: DataLayout::for_target(arch, os),
            max_register_args,
        }
    }

    /// Describe the machine this process runs on.
    pub fn detect_host() -> Result<Self, CreationError> {
        Self::from_names(std::env::consts::ARCH, std::env::consts::OS)
    }

    /// Build a description from Rust's architecture and OS names.
    pub fn from_names(arch: &str, os: &str) -> Result<Self, CreationError> {
        let unsupported = || CreationError::UnsupportedHost {
            arch: arch.to_string(),
            os: os.to_string(),
        };
        let arch = Arch::from_name(arch).ok_or_else(unsupported)?;
        let os = Os::from_name(os).ok_or_else(unsupported)?;
        Ok(Self::new(arch, os))
    }

    pub fn global_prefix(&self) -> Option<char> {
        self.data_layout.global_prefix
    }

    /// Target triple, e.g. `x86_64-unknown-linux`.
    pub fn triple(&self) -> String {
        match self.os {
            Os::MacOs => format!("{}-apple-darwin", self.arch),
            os => format!("{}-unknown-{}", self.arch, os),
        }
    }
}
