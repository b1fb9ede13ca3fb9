// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Top-level facade crate (spec §1/§6's "output interface"): owns the
// executable-memory arena, places each `FrozenFunction` a `FunctionBuilder`
// produces into it, resolves the RIP-relative patches that only make sense
// once a function has a real load address, and hands back an opaque
// function pointer plus its signature. Invoking that pointer as the correct
// `extern "C" fn(...)` — the emitted code already follows the configured
// ABI, so a native Rust call is exactly what's required — is left to the
// caller (`tests/` and demos), the same division of labor the teacher's
// own JIT tests used around `get_finalized_function`.

pub mod config;
pub mod memory;

use anna_builder_x86_64::{FrozenFunction, FunctionDescriptor};
use anna_types::{EncodingError, ResourceError};

pub use config::{CodeGenConfig, DEFAULT_ARENA_CAPACITY};
pub use memory::ExecutableMemory;

#[derive(Debug, thiserror::Error)]
pub enum AssemblerError {
    #[error(transparent)]
    Resource(#[from] ResourceError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
}

impl anna_types::CompileError for AssemblerError {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// A function placed into the arena: its entry address and the signature
/// `FunctionBuilder::fn_end` recorded for it. Callers transmute
/// [`Self::as_ptr`] to the `extern "C" fn(...)` matching `signature` and the
/// assembler's configured calling convention.
#[derive(Debug, Clone)]
pub struct CompiledFunction {
    address: usize,
    pub signature: FunctionDescriptor,
}

impl CompiledFunction {
    pub fn address(&self) -> usize {
        self.address
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.address as *const u8
    }
}

/// Owns one executable-memory arena and every function placed into it.
/// Single-threaded, matching spec §5's concurrency model: two independent
/// compilations each get their own `Assembler` and arena.
pub struct Assembler {
    config: CodeGenConfig,
    memory: ExecutableMemory,
    functions: Vec<CompiledFunction>,
}

impl Assembler {
    pub fn new(config: CodeGenConfig) -> Result<Assembler, AssemblerError> {
        Self::with_capacity(config, DEFAULT_ARENA_CAPACITY)
    }

    pub fn with_capacity(config: CodeGenConfig, capacity: usize) -> Result<Assembler, AssemblerError> {
        let memory = ExecutableMemory::new(capacity)?;
        Ok(Assembler { config, memory, functions: Vec::new() })
    }

    pub fn config(&self) -> &CodeGenConfig {
        &self.config
    }

    /// Copies `frozen`'s bytes to the end of the arena and resolves its
    /// RIP-relative patches against the address they just landed at. Must
    /// be called before [`Self::finalize`]; the returned handle stays valid
    /// for the lifetime of this `Assembler`.
    pub fn add_function(&mut self, frozen: FrozenFunction) -> Result<CompiledFunction, AssemblerError> {
        let region_base = self.memory.base_address();
        let function_base = self.memory.push(&frozen.buffer)?;

        for patch in &frozen.global_patches {
            let anchor_address = function_base as u64 + patch.anchor_offset as u64;
            let displacement = patch.target_address as i64 - anchor_address as i64;
            let displacement = i32::try_from(displacement)
                .map_err(|_| EncodingError::DisplacementOverflow(displacement))?;
            let region_offset = (function_base - region_base) + patch.patch_offset;
            self.memory.patch(region_offset, &displacement.to_le_bytes());
        }

        let compiled = CompiledFunction { address: function_base, signature: frozen.signature };
        self.functions.push(compiled.clone());
        Ok(compiled)
    }

    /// Flips the arena read-execute. No further [`Self::add_function`] call
    /// is possible afterward (spec §5: "once a function is frozen, its byte
    /// range is immutable" — this is that guarantee applied to the whole
    /// arena at once, matching the teacher's own two-phase
    /// `define`/`finalize_definitions` JIT lifecycle).
    pub fn finalize(&mut self) -> Result<(), AssemblerError> {
        self.memory.make_executable()?;
        Ok(())
    }

    pub fn functions(&self) -> &[CompiledFunction] {
        &self.functions
    }
}

#[cfg(test)]
mod tests {
    use std::rc::Rc;

    use anna_builder_x86_64::{CallingConvention, Descriptor, FunctionBuilder, Value};
    use anna_encoding_x86_64::{Operand, OperandSize};

    use super::*;

    #[test]
    fn a_function_returning_a_constant_runs_and_yields_that_constant() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let result = builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        builder
            .move_value(&result, &Value::new(result.descriptor.clone(), Operand::immediate(42, OperandSize::Qword)))
            .unwrap();
        builder.fn_return(&result).unwrap();
        let frozen = builder.fn_end().unwrap();

        let mut assembler = Assembler::new(CodeGenConfig::new(CallingConvention::SystemV)).unwrap();
        let compiled = assembler.add_function(frozen).unwrap();
        assembler.finalize().unwrap();

        let function: extern "C" fn() -> i64 = unsafe { std::mem::transmute(compiled.as_ptr()) };
        assert_eq!(function(), 42);
    }

    #[test]
    fn add_function_after_finalize_is_an_error() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let result = builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        builder.fn_return(&result).unwrap();
        let frozen = builder.fn_end().unwrap();

        let mut second_builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let second_result = second_builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        second_builder.fn_return(&second_result).unwrap();
        let second_frozen = second_builder.fn_end().unwrap();

        let mut assembler = Assembler::new(CodeGenConfig::default()).unwrap();
        assembler.add_function(frozen).unwrap();
        assembler.finalize().unwrap();
        assert!(assembler.add_function(second_frozen).is_err());
    }
}
