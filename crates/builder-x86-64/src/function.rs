// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in `fn_begin`/`fn_arg`/`stack_reserve`/`move_value`/`rns_add`/
// `rns_sub`/`rns_multiply_signed`/`rns_signed_div`/`compare`/`if_begin`/
// `if_end`/`loop_start`/`loop_continue`/`loop_break`/`loop_end`/
// `call_function_value`/`fn_return`/`fn_end` in `x86_64.cpp` (roughly lines
// 1700-2700). The instruction list stays append-only until `fn_end`, exactly
// as the original's deferred-instruction-array design requires, since the
// stack frame size (and therefore every local's final displacement) isn't
// known until every instruction has been queued.

use std::rc::Rc;

use anna_encoder_x86_64::{encode_instruction, GlobalPatch, Instruction, LabelManager, StackPatch};
use anna_encoding_x86_64::{
    ConditionCode, ConditionCodeKey, LabelId, Mnemonic, Operand, OperandSize, Register,
};
use anna_types::{BuilderMisuseError, EncodingError, ResourceError, TypeError};

use crate::abi::CallingConvention;
use crate::descriptor::{align_up, descriptor_size, require_typecheck, typecheck, Descriptor, FunctionDescriptor, Value};

/// Composition of the three error classes a function-builder operation can
/// fail with. Callers downcast through [`anna_types::CompileError::as_any`]
/// the same way they would for any single error enum.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Type(#[from] TypeError),
    #[error(transparent)]
    Builder(#[from] BuilderMisuseError),
    #[error(transparent)]
    Encoding(#[from] EncodingError),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

impl anna_types::CompileError for BuildError {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

pub(crate) fn operand_size_of(size: i64) -> Result<OperandSize, TypeError> {
    match size {
        1 => Ok(OperandSize::Byte),
        2 => Ok(OperandSize::Word),
        4 => Ok(OperandSize::Dword),
        8 => Ok(OperandSize::Qword),
        other => Err(TypeError::SizeMismatch { expected: 8, found: other }),
    }
}

/// The comparison performed by [`FunctionBuilder::compare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Equal,
    Less,
    Greater,
}

impl CompareOp {
    fn condition_code(self) -> ConditionCode {
        match self {
            CompareOp::Equal => ConditionCode::Equal,
            CompareOp::Less => ConditionCode::Less,
            CompareOp::Greater => ConditionCode::Greater,
        }
    }
}

/// A pair of labels bracketing a loop body, returned by
/// [`FunctionBuilder::loop_start`]. Nesting is the caller's responsibility —
/// the builder keeps no control-flow stack of its own, matching the
/// original's "handle scoping by the caller" design.
#[derive(Debug, Clone, Copy)]
pub struct LoopHandle {
    start: LabelId,
    end: LabelId,
}

enum DeferredItem {
    Instruction(Instruction),
    BindLabel(LabelId),
}

/// The output of [`FunctionBuilder::fn_end`]: the function's fully-encoded
/// bytes plus the RIP-relative patches that still need the function's final
/// load address to resolve (see `anna_assembler`, which places the buffer
/// into the executable arena and performs that last fix-up).
pub struct FrozenFunction {
    pub buffer: Vec<u8>,
    pub global_patches: Vec<GlobalPatch>,
    pub signature: FunctionDescriptor,
}

/// Per-function builder state (spec §3's function-builder-state, §4.5's
/// operations). `stack_offset` and `max_call_parameter_stack_size` only
/// settle once every operation for this function has been queued, so actual
/// byte emission — and therefore stack-displacement patching — is deferred
/// entirely to [`Self::fn_end`].
pub struct FunctionBuilder {
    convention: CallingConvention,
    deferred: Vec<DeferredItem>,
    labels: LabelManager,
    entry_label: LabelId,
    epilogue_label: LabelId,
    stack_offset: i64,
    max_call_parameter_stack_size: i64,
    next_arg: usize,
    arg_descriptors: Vec<Rc<Descriptor>>,
    return_descriptor: Option<Rc<Descriptor>>,
    frozen: bool,
}

const MAX_ARGS: usize = 32;

impl FunctionBuilder {
    pub fn fn_begin(convention: CallingConvention) -> FunctionBuilder {
        let mut labels = LabelManager::new();
        let entry_label = labels.create_label();
        let epilogue_label = labels.create_label();
        FunctionBuilder {
            convention,
            deferred: Vec::new(),
            labels,
            entry_label,
            epilogue_label,
            stack_offset: 0,
            max_call_parameter_stack_size: 0,
            next_arg: 0,
            arg_descriptors: Vec::new(),
            return_descriptor: None,
            frozen: false,
        }
    }

    /// The label naming this function's own entry point, usable as a
    /// `RelativeToLabel` callee operand for self-recursive calls built
    /// before `fn_end` (fibonacci's own pattern).
    pub fn entry_label(&self) -> LabelId {
        self.entry_label
    }

    fn require_unfrozen(&self) -> Result<(), BuilderMisuseError> {
        if self.frozen {
            Err(BuilderMisuseError::UseAfterFreeze)
        } else {
            Ok(())
        }
    }

    fn emit(&mut self, instruction: Instruction) {
        self.deferred.push(DeferredItem::Instruction(instruction));
    }

    fn bind_label(&mut self, label: LabelId) {
        self.deferred.push(DeferredItem::BindLabel(label));
    }

    fn require_not_register_a(operand: &Operand) -> Result<(), BuildError> {
        if matches!(operand, Operand::Register(Register::A, _)) {
            Err(BuilderMisuseError::OperandInRegisterA.into())
        } else {
            Ok(())
        }
    }

    pub fn fn_arg(&mut self, descriptor: Rc<Descriptor>) -> Result<Value, BuildError> {
        self.require_unfrozen()?;
        if self.next_arg >= MAX_ARGS {
            return Err(ResourceError::Exhausted { resource: "function arguments", capacity: MAX_ARGS }.into());
        }
        let index = self.next_arg;
        self.next_arg += 1;
        self.arg_descriptors.push(descriptor.clone());

        let size = operand_size_of(descriptor_size(&descriptor))?;
        let param_registers = self.convention.parameter_registers();

        if index < param_registers.len() {
            // This backend keeps no live values in registers between
            // builder operations ("everything lives on the stack"), so the
            // incoming register argument is copied out immediately.
            let register = param_registers[index];
            let slot = self.stack_reserve(descriptor.clone())?;
            let incoming = Value::new(descriptor, Operand::register(register, size));
            self.move_value(&slot, &incoming)?;
            Ok(slot)
        } else {
            // Beyond the register window: a fixed offset from the incoming
            // frame pointer. Only exact under a frame-pointer prologue
            // (System V here, see `abi.rs`); none of this workspace's
            // concrete scenarios pass more than two integer arguments, so
            // this path is unexercised but kept for completeness.
            let overflow_index = (index - param_registers.len()) as i32;
            let displacement = 16 + 8 * overflow_index;
            Ok(Value::new(descriptor, Operand::memory_indirect(Register::Bp, displacement, size)))
        }
    }

    pub fn stack_reserve(&mut self, descriptor: Rc<Descriptor>) -> Result<Value, BuildError> {
        self.require_unfrozen()?;
        let size_bytes = descriptor_size(&descriptor);
        if size_bytes <= 0 {
            return Err(BuilderMisuseError::ZeroSizedReservation.into());
        }
        let size = operand_size_of(size_bytes)?;
        self.stack_offset += size_bytes;
        let displacement = i32::try_from(-self.stack_offset)
            .map_err(|_| EncodingError::DisplacementOverflow(-self.stack_offset))?;
        Ok(Value::new(descriptor, Operand::stack(displacement, size)))
    }

    /// Emits one or two `mov`s per the rules in spec §4.5: memory-to-memory
    /// and a 64-bit immediate into memory both go through register A;
    /// everything else is a single `mov`. A 32-bit immediate into a 64-bit
    /// destination is allowed (the destination-size `mov r/m64, imm32` form
    /// sign-extends); any other size mismatch is an error.
    pub fn move_value(&mut self, dst: &Value, src: &Value) -> Result<(), BuildError> {
        self.require_unfrozen()?;
        let dst_size = descriptor_size(&dst.descriptor);
        let src_size = descriptor_size(&src.descriptor);
        let widen_imm32_to_64 = dst_size == 8 && matches!(src.operand, Operand::Immediate32(_));
        if dst_size != src_size && !widen_imm32_to_64 {
            return Err(TypeError::SizeMismatch { expected: dst_size, found: src_size }.into());
        }

        let both_memory = dst.operand.is_memory() && src.operand.is_memory();
        let imm64_into_memory = dst.operand.is_memory() && matches!(src.operand, Operand::Immediate64(_));

        if both_memory || imm64_into_memory {
            let scratch_size = operand_size_of(src_size)?;
            let scratch = Operand::register(Register::A, scratch_size);
            self.emit(Instruction::with_operands(Mnemonic::Mov, &[scratch, src.operand]));
            let scratch_dst_size = operand_size_of(dst_size)?;
            self.emit(Instruction::with_operands(
                Mnemonic::Mov,
                &[dst.operand, Operand::register(Register::A, scratch_dst_size)],
            ));
        } else {
            self.emit(Instruction::with_operands(Mnemonic::Mov, &[dst.operand, src.operand]));
        }
        Ok(())
    }

    /// Common shape of `rns_add`/`rns_sub`/`rns_multiply_signed`: load the
    /// right operand into a stack slot, the left operand into A, emit the
    /// opcode over `(A, right-slot)`, store A into a fresh stack slot.
    fn binary_arithmetic(&mut self, mnemonic: Mnemonic, a: &Value, b: &Value) -> Result<Value, BuildError> {
        self.require_unfrozen()?;
        Self::require_not_register_a(&a.operand)?;
        Self::require_not_register_a(&b.operand)?;
        self.typecheck_arithmetic_operands(mnemonic, a, b)?;

        let size = operand_size_of(descriptor_size(&a.descriptor))?;

        let right_slot = self.stack_reserve(b.descriptor.clone())?;
        self.move_value(&right_slot, b)?;

        let a_register = Value::new(a.descriptor.clone(), Operand::register(Register::A, size));
        self.move_value(&a_register, a)?;

        self.emit(Instruction::with_operands(mnemonic, &[a_register.operand, right_slot.operand]));

        let result = self.stack_reserve(a.descriptor.clone())?;
        self.move_value(&result, &a_register)?;
        Ok(result)
    }

    /// `add` alone accepts `pointer + s64` in addition to matching
    /// descriptors, per spec §4.5.
    fn typecheck_arithmetic_operands(&self, mnemonic: Mnemonic, a: &Value, b: &Value) -> Result<(), TypeError> {
        if typecheck(&a.descriptor, &b.descriptor) {
            return Ok(());
        }
        if matches!(mnemonic, Mnemonic::Add) {
            if let (Descriptor::Pointer(_), Descriptor::Integer { size: 8, signed: true }) =
                (a.descriptor.as_ref(), b.descriptor.as_ref())
            {
                return Ok(());
            }
        }
        Err(TypeError::Mismatch {
            left: format!("{:?}", a.descriptor),
            right: format!("{:?}", b.descriptor),
        })
    }

    pub fn rns_add(&mut self, a: &Value, b: &Value) -> Result<Value, BuildError> {
        self.binary_arithmetic(Mnemonic::Add, a, b)
    }

    pub fn rns_sub(&mut self, a: &Value, b: &Value) -> Result<Value, BuildError> {
        self.binary_arithmetic(Mnemonic::Sub, a, b)
    }

    pub fn rns_multiply_signed(&mut self, a: &Value, b: &Value) -> Result<Value, BuildError> {
        self.binary_arithmetic(Mnemonic::Imul, a, b)
    }

    /// Unlike the other arithmetic ops, `idiv` takes its dividend implicitly
    /// from the A:D register pair and clobbers D, so D is saved/restored
    /// around it and the correct sign-extension instruction
    /// (`cwd`/`cdq`/`cqo`) is emitted to widen A into A:D beforehand.
    pub fn rns_signed_div(&mut self, a: &Value, b: &Value) -> Result<Value, BuildError> {
        self.require_unfrozen()?;
        Self::require_not_register_a(&a.operand)?;
        Self::require_not_register_a(&b.operand)?;
        require_typecheck(a, b)?;

        let size_bytes = descriptor_size(&a.descriptor);
        let size = operand_size_of(size_bytes)?;

        let right_slot = self.stack_reserve(b.descriptor.clone())?;
        self.move_value(&right_slot, b)?;

        let d_descriptor = Rc::new(Descriptor::integer(8, true));
        let d_value = Value::new(d_descriptor.clone(), Operand::register(Register::D, OperandSize::Qword));
        let d_save = self.stack_reserve(d_descriptor)?;
        self.move_value(&d_save, &d_value)?;

        let a_register = Value::new(a.descriptor.clone(), Operand::register(Register::A, size));
        self.move_value(&a_register, a)?;

        let sign_extend = match size {
            OperandSize::Word => Mnemonic::Cwd,
            OperandSize::Dword => Mnemonic::Cdq,
            OperandSize::Qword => Mnemonic::Cqo,
            OperandSize::Byte => return Err(TypeError::SizeMismatch { expected: 2, found: 1 }.into()),
        };
        self.emit(Instruction::new(sign_extend));
        self.emit(Instruction::with_operands(Mnemonic::Idiv, &[right_slot.operand]));

        let result = self.stack_reserve(a.descriptor.clone())?;
        self.move_value(&result, &a_register)?;

        self.move_value(&d_value, &d_save)?;
        Ok(result)
    }

    /// `cmp a, b`; zero A; `setcc al`; store A into a fresh `s64` slot
    /// (spec §4.5's "bool-like s64" result descriptor).
    pub fn compare(&mut self, op: CompareOp, a: &Value, b: &Value) -> Result<Value, BuildError> {
        self.require_unfrozen()?;
        require_typecheck(a, b)?;

        self.emit(Instruction::with_operands(Mnemonic::Cmp, &[a.operand, b.operand]));
        self.emit(Instruction::with_operands(
            Mnemonic::Xor,
            &[Operand::register(Register::A, OperandSize::Dword), Operand::register(Register::A, OperandSize::Dword)],
        ));
        let code: ConditionCodeKey = op.condition_code().into();
        self.emit(Instruction::with_operands(Mnemonic::Setcc(code), &[Operand::register(Register::A, OperandSize::Byte)]));

        let result_descriptor = Rc::new(Descriptor::integer(8, true));
        let result = self.stack_reserve(result_descriptor.clone())?;
        let a_as_result = Value::new(result_descriptor, Operand::register(Register::A, OperandSize::Qword));
        self.move_value(&result, &a_as_result)?;
        Ok(result)
    }

    /// `cmp condition, 0`; `jz L`; returns `L`. The taken branch is the code
    /// between this call and the matching [`Self::if_end`].
    pub fn if_begin(&mut self, condition: &Value) -> Result<LabelId, BuildError> {
        self.require_unfrozen()?;
        let size = operand_size_of(descriptor_size(&condition.descriptor))?;
        self.emit(Instruction::with_operands(Mnemonic::Cmp, &[condition.operand, Operand::immediate(0, size)]));
        let label = self.labels.create_label();
        let equal: ConditionCodeKey = ConditionCode::Equal.into();
        self.emit(Instruction::with_operands(
            Mnemonic::Jcc(equal),
            &[Operand::RelativeToLabel(label, OperandSize::Dword)],
        ));
        Ok(label)
    }

    pub fn if_end(&mut self, label: LabelId) -> Result<(), BuildError> {
        self.require_unfrozen()?;
        self.bind_label(label);
        Ok(())
    }

    /// Binds a start label at the current position and allocates (but does
    /// not yet bind) an end label; the returned handle is threaded back into
    /// `loop_continue`/`loop_break`/`loop_end` by the caller.
    pub fn loop_start(&mut self) -> Result<LoopHandle, BuildError> {
        self.require_unfrozen()?;
        let start = self.labels.create_label();
        self.bind_label(start);
        let end = self.labels.create_label();
        Ok(LoopHandle { start, end })
    }

    pub fn loop_continue(&mut self, handle: &LoopHandle) -> Result<(), BuildError> {
        self.require_unfrozen()?;
        self.emit(Instruction::with_operands(
            Mnemonic::Jmp,
            &[Operand::RelativeToLabel(handle.start, OperandSize::Dword)],
        ));
        Ok(())
    }

    pub fn loop_break(&mut self, handle: &LoopHandle) -> Result<(), BuildError> {
        self.require_unfrozen()?;
        self.emit(Instruction::with_operands(
            Mnemonic::Jmp,
            &[Operand::RelativeToLabel(handle.end, OperandSize::Dword)],
        ));
        Ok(())
    }

    pub fn loop_end(&mut self, handle: LoopHandle) -> Result<(), BuildError> {
        self.require_unfrozen()?;
        self.bind_label(handle.end);
        Ok(())
    }

    /// Typechecks `args` against `callee`'s signature, places each argument
    /// in its convention-mandated register or stack slot, emits the `call`,
    /// and returns a fresh stack slot holding the result. A return wider
    /// than 8 bytes instead reserves the slot up front and passes its
    /// address in the convention's first parameter register before the call
    /// (the "hidden return pointer" form).
    pub fn call_function_value(&mut self, callee: &Value, args: &[Value]) -> Result<Value, BuildError> {
        self.require_unfrozen()?;
        let signature = match callee.descriptor.as_ref() {
            Descriptor::Function(function) => function.clone(),
            other => {
                return Err(TypeError::Mismatch { left: "function".to_string(), right: format!("{:?}", other) }.into())
            }
        };
        if signature.arg_list.len() != args.len() {
            return Err(BuilderMisuseError::NoMatchingOverload(format!(
                "expected {} argument(s), got {}",
                signature.arg_list.len(),
                args.len()
            ))
            .into());
        }
        for (expected, actual) in signature.arg_list.iter().zip(args.iter()) {
            if !typecheck(expected, &actual.descriptor) {
                return Err(TypeError::Mismatch { left: format!("{:?}", expected), right: format!("{:?}", actual.descriptor) }.into());
            }
        }

        let return_size = descriptor_size(&signature.return_value);
        let hidden_return_pointer = return_size > 8;

        let param_registers = self.convention.parameter_registers();
        let shadow_space_slots = self.convention.shadow_space_size() / 8;
        self.max_call_parameter_stack_size = self
            .max_call_parameter_stack_size
            .max((args.len() as i64).max(shadow_space_slots) * 8);

        let return_slot = if hidden_return_pointer {
            let slot = self.stack_reserve(signature.return_value.clone())?;
            let hidden_register = *param_registers
                .first()
                .expect("every calling convention has at least one parameter register");
            self.emit(Instruction::with_operands(
                Mnemonic::Lea,
                &[Operand::register(hidden_register, OperandSize::Qword), slot.operand],
            ));
            Some(slot)
        } else {
            None
        };

        for (index, arg) in args.iter().enumerate() {
            let size = operand_size_of(descriptor_size(&arg.descriptor))?;
            let destination = if index < param_registers.len() {
                Value::new(arg.descriptor.clone(), Operand::register(param_registers[index], size))
            } else {
                let overflow_index = (index - param_registers.len()) as i32;
                Value::new(arg.descriptor.clone(), Operand::stack(overflow_index * 8, size))
            };
            self.move_value(&destination, arg)?;
        }

        // `call` has no encoding that takes a bare immediate — an address
        // known only as a 64-bit constant (as `declare_c_function` produces)
        // is loaded into register A first, since A is never a parameter
        // register under either calling convention and so can't collide
        // with the argument moves just above.
        let call_operand = match callee.operand {
            Operand::Immediate64(_) => {
                let scratch = Operand::register(Register::A, OperandSize::Qword);
                self.emit(Instruction::with_operands(Mnemonic::Mov, &[scratch, callee.operand]));
                scratch
            }
            other => other,
        };
        self.emit(Instruction::with_operands(Mnemonic::Call, &[call_operand]));

        if let Some(slot) = return_slot {
            return Ok(slot);
        }
        if matches!(signature.return_value.as_ref(), Descriptor::Void) {
            return Ok(Value::new(signature.return_value, Operand::None));
        }

        let result = self.stack_reserve(signature.return_value.clone())?;
        let return_register = *self
            .convention
            .return_registers()
            .first()
            .expect("every calling convention has at least one return register");
        let return_operand_size = operand_size_of(return_size)?;
        let from_register = Value::new(signature.return_value, Operand::register(return_register, return_operand_size));
        self.move_value(&result, &from_register)?;
        Ok(result)
    }

    /// Picks the first of `candidates` whose signature accepts `args` and
    /// dispatches through [`Self::call_function_value`]. A flatter stand-in
    /// for the original's `next_overload` linked list — see DESIGN.md.
    pub fn call_function_overload(&mut self, name: &str, candidates: &[Value], args: &[Value]) -> Result<Value, BuildError> {
        let chosen = candidates.iter().find(|candidate| match candidate.descriptor.as_ref() {
            Descriptor::Function(function) => {
                function.arg_list.len() == args.len()
                    && function.arg_list.iter().zip(args.iter()).all(|(expected, actual)| typecheck(expected, &actual.descriptor))
            }
            _ => false,
        });
        match chosen {
            Some(candidate) => self.call_function_value(candidate, args),
            None => Err(BuilderMisuseError::NoMatchingOverload(name.to_string()).into()),
        }
    }

    /// Sets the return descriptor on first use (or typechecks against it on
    /// subsequent calls), moves `value` into the return register, and jumps
    /// to the epilogue label.
    pub fn fn_return(&mut self, value: &Value) -> Result<(), BuildError> {
        self.require_unfrozen()?;
        match &self.return_descriptor {
            None => self.return_descriptor = Some(value.descriptor.clone()),
            Some(existing) => {
                if !typecheck(existing, &value.descriptor) {
                    return Err(TypeError::Mismatch { left: format!("{:?}", existing), right: format!("{:?}", value.descriptor) }.into());
                }
            }
        }

        let return_size = descriptor_size(&value.descriptor);
        if return_size > 0 {
            let size = operand_size_of(return_size)?;
            let return_register = *self
                .convention
                .return_registers()
                .first()
                .expect("every calling convention has at least one return register");
            let destination = Value::new(value.descriptor.clone(), Operand::register(return_register, size));
            self.move_value(&destination, value)?;
        }
        self.emit(Instruction::with_operands(
            Mnemonic::Jmp,
            &[Operand::RelativeToLabel(self.epilogue_label, OperandSize::Dword)],
        ));
        Ok(())
    }

    fn compute_frame_size(&self) -> i64 {
        align_up(self.stack_offset + self.max_call_parameter_stack_size, 16) + 8
    }

    /// Emits the prologue, encodes every deferred instruction, rewrites each
    /// recorded stack displacement now that the frame size is final, binds
    /// the epilogue label, emits the epilogue, and freezes the builder.
    pub fn fn_end(&mut self) -> Result<FrozenFunction, BuildError> {
        if self.frozen {
            return Err(BuilderMisuseError::AlreadyFrozen.into());
        }
        self.deferred.push(DeferredItem::BindLabel(self.epilogue_label));

        let mut buffer = Vec::new();
        let mut stack_patches: Vec<StackPatch> = Vec::new();
        let mut global_patches: Vec<GlobalPatch> = Vec::new();

        self.labels.bind(self.entry_label, &mut buffer, 0)?;

        let frame_size = self.compute_frame_size();
        let frame_size_i32 =
            i32::try_from(frame_size).map_err(|_| EncodingError::DisplacementOverflow(frame_size))?;

        if self.convention.uses_frame_pointer_prologue() {
            encode_instruction(
                &Instruction::with_operands(Mnemonic::Push, &[Operand::register(Register::Bp, OperandSize::Qword)]),
                &mut buffer,
                &mut self.labels,
                &mut stack_patches,
                &mut global_patches,
            )?;
            encode_instruction(
                &Instruction::with_operands(
                    Mnemonic::Mov,
                    &[Operand::register(Register::Bp, OperandSize::Qword), Operand::register(Register::Sp, OperandSize::Qword)],
                ),
                &mut buffer,
                &mut self.labels,
                &mut stack_patches,
                &mut global_patches,
            )?;
        }
        encode_instruction(
            &Instruction::with_operands(
                Mnemonic::Sub,
                &[Operand::register(Register::Sp, OperandSize::Qword), Operand::immediate(frame_size_i32 as i64, OperandSize::Dword)],
            ),
            &mut buffer,
            &mut self.labels,
            &mut stack_patches,
            &mut global_patches,
        )?;

        for item in std::mem::take(&mut self.deferred) {
            match item {
                DeferredItem::Instruction(instruction) => {
                    encode_instruction(&instruction, &mut buffer, &mut self.labels, &mut stack_patches, &mut global_patches)?;
                }
                DeferredItem::BindLabel(label) => {
                    let offset = buffer.len();
                    self.labels.bind(label, &mut buffer, offset)?;
                }
            }
        }

        for patch in &stack_patches {
            let rewritten = if patch.original_displacement < 0 {
                frame_size_i32 + patch.original_displacement
            } else {
                frame_size_i32 + patch.original_displacement + 8
            };
            buffer[patch.patch_offset..patch.patch_offset + 4].copy_from_slice(&rewritten.to_le_bytes());
        }

        encode_instruction(
            &Instruction::with_operands(
                Mnemonic::Add,
                &[Operand::register(Register::Sp, OperandSize::Qword), Operand::immediate(frame_size_i32 as i64, OperandSize::Dword)],
            ),
            &mut buffer,
            &mut self.labels,
            &mut stack_patches,
            &mut global_patches,
        )?;
        if self.convention.uses_frame_pointer_prologue() {
            encode_instruction(
                &Instruction::with_operands(Mnemonic::Pop, &[Operand::register(Register::Bp, OperandSize::Qword)]),
                &mut buffer,
                &mut self.labels,
                &mut stack_patches,
                &mut global_patches,
            )?;
        }
        encode_instruction(&Instruction::new(Mnemonic::Ret), &mut buffer, &mut self.labels, &mut stack_patches, &mut global_patches)?;

        self.frozen = true;

        Ok(FrozenFunction {
            buffer,
            global_patches,
            signature: FunctionDescriptor {
                arg_list: self.arg_descriptors.clone(),
                return_value: self.return_descriptor.clone().unwrap_or_else(|| Rc::new(Descriptor::Void)),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_function_returning_constant_has_expected_prologue_and_epilogue() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let result = builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        builder
            .move_value(&result, &Value::new(result.descriptor.clone(), Operand::immediate(42, OperandSize::Dword)))
            .unwrap();
        builder.fn_return(&result).unwrap();
        let frozen = builder.fn_end().unwrap();

        // push rbp; mov rbp, rsp; sub rsp, imm32(frame_size)
        assert_eq!(&frozen.buffer[0..1], &[0x55]);
        assert_eq!(&frozen.buffer[1..4], &[0x48, 0x89, 0xE5]);
        assert_eq!(&frozen.buffer[4..7], &[0x48, 0x81, 0xEC]);
        // frame_size = align_up(8 + 0, 16) + 8 = 24
        assert_eq!(&frozen.buffer[7..11], &24i32.to_le_bytes());

        // epilogue: add rsp, imm32; pop rbp; ret
        let tail = &frozen.buffer[frozen.buffer.len() - 6..];
        assert_eq!(&tail[0..3], &[0x48, 0x81, 0xC4]);
        assert_eq!(&tail[3..4], &[0x5D]);
        assert_eq!(&tail[4..5], &[0xC3]);
    }

    #[test]
    fn rns_add_rejects_operand_already_in_register_a() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let a = Value::new(Rc::new(Descriptor::integer(8, true)), Operand::register(Register::A, OperandSize::Qword));
        let b = builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        let err = builder.rns_add(&a, &b).unwrap_err();
        assert!(matches!(err, BuildError::Builder(BuilderMisuseError::OperandInRegisterA)));
    }

    #[test]
    fn if_begin_if_end_round_trip_binds_without_error() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let condition = builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        let label = builder.if_begin(&condition).unwrap();
        builder.if_end(label).unwrap();
        builder.fn_return(&condition).unwrap();
        assert!(builder.fn_end().is_ok());
    }

    #[test]
    fn fn_end_twice_is_rejected() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let result = builder.stack_reserve(Rc::new(Descriptor::integer(8, true))).unwrap();
        builder.fn_return(&result).unwrap();
        builder.fn_end().unwrap();
        let err = builder.fn_end().unwrap_err();
        assert!(matches!(err, BuildError::Builder(BuilderMisuseError::AlreadyFrozen)));
    }
}
