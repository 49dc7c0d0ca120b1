//! Saved machine context layout
//!
//! The minimal CPU state needed to resume a suspended fiber: the
//! callee-saved registers, stack pointer, and resume address of the
//! platform ABI. Field offsets are load-bearing: the context-switch
//! assembly in `strand-runtime` addresses these fields by byte offset.

/// Saved callee-saved register state (System V AMD64).
///
/// Offsets used by the assembly:
///
/// | field | offset |
/// |-------|--------|
/// | rsp   | 0x00   |
/// | rip   | 0x08   |
/// | rbx   | 0x10   |
/// | rbp   | 0x18   |
/// | r12   | 0x20   |
/// | r13   | 0x28   |
/// | r14   | 0x30   |
/// | r15   | 0x38   |
///
/// The SysV ABI marks the XMM registers caller-saved, so they are not
/// part of the record.
#[cfg(target_arch = "x86_64")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rip: u64,
    pub rbx: u64,
    pub rbp: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
}

#[cfg(target_arch = "x86_64")]
impl Context {
    /// An all-zero context, suitable as a save target
    pub const fn zeroed() -> Self {
        Context {
            rsp: 0,
            rip: 0,
            rbx: 0,
            rbp: 0,
            r12: 0,
            r13: 0,
            r14: 0,
            r15: 0,
        }
    }
}

/// Saved callee-saved register state (AArch64 AAPCS).
///
/// Offsets used by the assembly:
///
/// | field     | offset      |
/// |-----------|-------------|
/// | sp        | 0x00        |
/// | pc        | 0x08        |
/// | x19..x28  | 0x10..0x58  |
/// | fp (x29)  | 0x60        |
/// | lr (x30)  | 0x68        |
#[cfg(target_arch = "aarch64")]
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Context {
    pub sp: u64,
    pub pc: u64,
    pub x19: u64,
    pub x20: u64,
    pub x21: u64,
    pub x22: u64,
    pub x23: u64,
    pub x24: u64,
    pub x25: u64,
    pub x26: u64,
    pub x27: u64,
    pub x28: u64,
    pub fp: u64,
    pub lr: u64,
}

#[cfg(target_arch = "aarch64")]
impl Context {
    /// An all-zero context, suitable as a save target
    pub const fn zeroed() -> Self {
        Context {
            sp: 0,
            pc: 0,
            x19: 0,
            x20: 0,
            x21: 0,
            x22: 0,
            x23: 0,
            x24: 0,
            x25: 0,
            x26: 0,
            x27: 0,
            x28: 0,
            fp: 0,
            lr: 0,
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::zeroed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::mem::offset_of;

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_x86_64_offsets() {
        assert_eq!(offset_of!(Context, rsp), 0x00);
        assert_eq!(offset_of!(Context, rip), 0x08);
        assert_eq!(offset_of!(Context, rbx), 0x10);
        assert_eq!(offset_of!(Context, rbp), 0x18);
        assert_eq!(offset_of!(Context, r12), 0x20);
        assert_eq!(offset_of!(Context, r13), 0x28);
        assert_eq!(offset_of!(Context, r14), 0x30);
        assert_eq!(offset_of!(Context, r15), 0x38);
    }

    #[cfg(target_arch = "aarch64")]
    #[test]
    fn test_aarch64_offsets() {
        assert_eq!(offset_of!(Context, sp), 0x00);
        assert_eq!(offset_of!(Context, pc), 0x08);
        assert_eq!(offset_of!(Context, x19), 0x10);
        assert_eq!(offset_of!(Context, x28), 0x58);
        assert_eq!(offset_of!(Context, fp), 0x60);
        assert_eq!(offset_of!(Context, lr), 0x68);
    }
}
