// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in the `#if`/`#elif RNS_OS_WINDOWS`/`RNS_OS_LINUX` register
// tables in `x86_64.cpp` (~lines 660-789) and the prologue/epilogue split
// inside `fn_end`. Replaces the original's compile-time preprocessor switch
// with a runtime `CallingConvention` value, since nothing stops one process
// from wanting to generate code under either ABI (e.g. cross-compiling a
// Windows callback table from a Linux host).

use anna_encoding_x86_64::Register;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallingConvention {
    MicrosoftX64,
    SystemV,
}

impl CallingConvention {
    pub fn host_default() -> CallingConvention {
        if cfg!(target_os = "windows") {
            CallingConvention::MicrosoftX64
        } else {
            CallingConvention::SystemV
        }
    }

    pub fn parameter_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::MicrosoftX64 => {
                &[Register::C, Register::D, Register::R8, Register::R9]
            }
            CallingConvention::SystemV => &[
                Register::Di,
                Register::Si,
                Register::D,
                Register::C,
                Register::R8,
                Register::R9,
            ],
        }
    }

    pub fn return_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::MicrosoftX64 => &[Register::A],
            CallingConvention::SystemV => &[Register::A, Register::D],
        }
    }

    /// Callee-saved registers: the function builder must restore these to
    /// their entry values before returning if it clobbers them. `rsp`/`rbp`
    /// are handled separately by the prologue/epilogue, not through this
    /// list.
    pub fn preserved_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::MicrosoftX64 => &[
                Register::B,
                Register::Di,
                Register::Si,
                Register::R12,
                Register::R13,
                Register::R14,
                Register::R15,
            ],
            CallingConvention::SystemV => &[
                Register::B,
                Register::R12,
                Register::R13,
                Register::R14,
                Register::R15,
            ],
        }
    }

    /// Caller-saved registers: free for the "everything on the stack"
    /// allocator to use as scratch space between statements without having
    /// to save/restore them.
    pub fn scratch_registers(self) -> &'static [Register] {
        match self {
            CallingConvention::MicrosoftX64 => &[Register::A, Register::C, Register::D, Register::R8, Register::R9, Register::R10, Register::R11],
            CallingConvention::SystemV => &[
                Register::A,
                Register::C,
                Register::D,
                Register::Si,
                Register::Di,
                Register::R8,
                Register::R9,
                Register::R10,
                Register::R11,
            ],
        }
    }

    /// Bytes of stack the caller must leave available to the callee below
    /// the return address even when no stack arguments are passed
    /// (Microsoft's "shadow space"); zero under System V.
    pub fn shadow_space_size(self) -> i64 {
        match self {
            CallingConvention::MicrosoftX64 => 32,
            CallingConvention::SystemV => 0,
        }
    }

    /// Whether `fn_end` emits a `push rbp; mov rbp, rsp` / `pop rbp; ret`
    /// frame-pointer prologue (System V) instead of a flat
    /// `sub rsp, frame_size` / `add rsp, frame_size; ret` frame
    /// (Microsoft x64, which instead relies on unwind metadata this
    /// backend doesn't emit).
    pub fn uses_frame_pointer_prologue(self) -> bool {
        matches!(self, CallingConvention::SystemV)
    }
}
