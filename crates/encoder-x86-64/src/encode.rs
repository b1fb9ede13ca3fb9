// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded directly in `encode_instruction` in `x86_64.cpp`: select the
// first matching (encoding, combination) pair, assemble REX from the
// operand registers and the instruction option, merge opcode-plus-register
// forms, then emit ModRM/SIB/displacement/immediate/relative bytes in that
// order.

use anna_encoding_x86_64::{
    encodings_for, Combination, Encoding, InstructionOption, Operand, OperandKind, OperandSize,
    Register,
};
use anna_types::EncodingError;

use crate::instruction::Instruction;
use crate::label::{LabelManager, RelativeWidth};

/// A stack-relative memory operand was encoded before the enclosing
/// function's frame size is known. `patch_offset` is where its
/// displacement bytes live in the buffer; `original_displacement` is the
/// value that was written (relative to the function's entry `rsp`), which
/// the function builder rewrites once `fn_end` computes the final frame
/// size (see `anna_builder_x86_64::function`).
#[derive(Debug, Clone, Copy)]
pub struct StackPatch {
    pub patch_offset: usize,
    pub original_displacement: i32,
}

/// A RIP-relative operand was encoded before the function's final load
/// address in the executable arena is known. `anchor_offset` is the
/// function-relative offset of the byte right after the instruction (what
/// RIP itself will point at once loaded); the loader computes
/// `target_address - (function_base + anchor_offset)` and writes it at
/// `patch_offset` once `function_base` is known.
#[derive(Debug, Clone, Copy)]
pub struct GlobalPatch {
    pub patch_offset: usize,
    pub anchor_offset: usize,
    pub target_address: u64,
}

const REX_BASE: u8 = 0b0100_0000;
const REX_W: u8 = 0b0000_1000;
const REX_R: u8 = 0b0000_0100;
const REX_X: u8 = 0b0000_0010;
const REX_B: u8 = 0b0000_0001;

fn operand_matches(operand: &Operand, slot_kind: OperandKind, slot_size: OperandSize) -> bool {
    match (operand, slot_kind) {
        (Operand::None, OperandKind::None) => true,
        (Operand::Register(_, size), OperandKind::Register) => *size == slot_size,
        (Operand::Register(Register::A, size), OperandKind::RegisterA) => *size == slot_size,
        (Operand::Register(_, size), OperandKind::RegisterOrMemory) => *size == slot_size,
        (Operand::Memory(memory), OperandKind::RegisterOrMemory) => memory.size == slot_size,
        (Operand::Memory(memory), OperandKind::Memory) => memory.size == slot_size,
        (Operand::RipRelative(rip), OperandKind::RegisterOrMemory) => rip.size == slot_size,
        (Operand::RipRelative(rip), OperandKind::Memory) => rip.size == slot_size,
        (Operand::Immediate8(_), OperandKind::Immediate) => slot_size == OperandSize::Byte,
        (Operand::Immediate16(_), OperandKind::Immediate) => slot_size == OperandSize::Word,
        (Operand::Immediate32(_), OperandKind::Immediate) => slot_size == OperandSize::Dword,
        (Operand::Immediate64(_), OperandKind::Immediate) => slot_size == OperandSize::Qword,
        (Operand::RelativeToLabel(_, size), OperandKind::Relative) => *size == slot_size,
        _ => false,
    }
}

fn combination_matches(operands: &[Operand; 4], combination: &Combination) -> bool {
    operands
        .iter()
        .zip(combination.operands.iter())
        .all(|(operand, slot)| operand_matches(operand, slot.kind, slot.size))
}

/// Grounded in `find_encoding`: scans every encoding's combinations in
/// order and returns the first whole match.
fn find_encoding(instruction: &Instruction) -> Result<(Encoding, Combination), EncodingError> {
    let encodings = encodings_for(&instruction.mnemonic);
    for encoding in encodings {
        for combination in &encoding.combinations {
            if combination_matches(&instruction.operands, combination) {
                return Ok((encoding.clone(), *combination));
            }
        }
    }
    Err(EncodingError::NoMatchingCombination {
        mnemonic: mnemonic_name(&instruction.mnemonic),
    })
}

fn mnemonic_name(mnemonic: &anna_encoding_x86_64::Mnemonic) -> &'static str {
    use anna_encoding_x86_64::Mnemonic::*;
    match mnemonic {
        Mov => "mov",
        Add => "add",
        Sub => "sub",
        Imul => "imul",
        Idiv => "idiv",
        Inc => "inc",
        Cmp => "cmp",
        Xor => "xor",
        Lea => "lea",
        Push => "push",
        Pop => "pop",
        Call => "call",
        Ret => "ret",
        Jmp => "jmp",
        Jcc(_) => "jcc",
        Setcc(_) => "setcc",
        Cwd => "cwd",
        Cdq => "cdq",
        Cqo => "cqo",
        Int3 => "int3",
    }
}

/// Encodes `instruction` and appends the resulting bytes to `buffer`.
/// Label references are resolved (or queued) through `labels`; any
/// stack-relative memory operand's displacement is additionally recorded
/// into `stack_patches` for the function builder to fix up at `fn_end`.
pub fn encode_instruction(
    instruction: &Instruction,
    buffer: &mut Vec<u8>,
    labels: &mut LabelManager,
    stack_patches: &mut Vec<StackPatch>,
    global_patches: &mut Vec<GlobalPatch>,
) -> Result<(), EncodingError> {
    let (encoding, combination) = find_encoding(instruction)?;

    // RIP-relative displacement is measured from the address of the byte
    // right after the whole instruction. ModRM/SIB/displacement widths are
    // fixed once a combination is matched, so the only unknown at this
    // point is how many trailing immediate bytes follow; that's fixed too,
    // since immediates are emitted from the matched combination rather than
    // the operand itself.
    let trailing_immediate_len: i64 = combination
        .operands
        .iter()
        .filter(|slot| slot.kind == OperandKind::Immediate)
        .map(|slot| slot.size.bytes() as i64)
        .sum();

    let register_operand = |index: usize| -> Option<Register> {
        match instruction.operands.get(index) {
            Some(Operand::Register(register, _)) => Some(*register),
            _ => None,
        }
    };
    let memory_operand_base = instruction.operands.iter().find_map(|operand| match operand {
        Operand::Memory(memory) => Some(memory.base),
        _ => None,
    });

    // Locate which operand slot (if any) carries the ModRM.reg-position
    // register, and which carries the ModRM.r_m-position register/memory,
    // so REX.R / REX.B are set correctly regardless of operand order.
    let (reg_position, rm_position) = match encoding.option {
        InstructionOption::Reg => find_reg_and_rm_positions(&combination),
        InstructionOption::Digit(_) => (None, find_rm_position(&combination)),
        InstructionOption::OpCodePlusReg | InstructionOption::None | InstructionOption::ExplicitSize(_) => {
            (None, None)
        }
    };

    let reg_field_register = reg_position.and_then(register_operand);
    let rm_field_register = rm_position.and_then(register_operand).or(memory_operand_base);

    let operand_size = combination
        .operands
        .iter()
        .zip(instruction.operands.iter())
        .find_map(|(slot, operand)| match slot.kind {
            OperandKind::Register | OperandKind::RegisterOrMemory | OperandKind::Memory => {
                operand.size()
            }
            _ => None,
        });

    // `push`/`pop`/near `call r/m64` default to a 64-bit operand in long
    // mode with no REX.W involved at all (unlike `mov`/`add`/etc., which use
    // REX.W to pick the 64-bit form over 32-bit); forcing REX.W onto them
    // produces a byte sequence the reference hex in spec.md §8 doesn't
    // expect (`push rbp` must be the single byte `55`, not `48 55`).
    let defaults_to_64_bit = matches!(
        instruction.mnemonic,
        anna_encoding_x86_64::Mnemonic::Push
            | anna_encoding_x86_64::Mnemonic::Pop
            | anna_encoding_x86_64::Mnemonic::Call
    );
    let needs_rex_w = if defaults_to_64_bit {
        false
    } else {
        match encoding.option {
            InstructionOption::ExplicitSize(size) => size.needs_rex_w(),
            _ => operand_size.map(|size| size.needs_rex_w()).unwrap_or(false),
        }
    };
    let needs_operand_size_prefix = match encoding.option {
        InstructionOption::ExplicitSize(size) => size.needs_operand_size_prefix(),
        _ => operand_size
            .map(|size| size.needs_operand_size_prefix())
            .unwrap_or(false),
    };

    let opcode_plus_reg_register = if matches!(encoding.option, InstructionOption::OpCodePlusReg) {
        register_operand(0)
    } else {
        None
    };

    let rex_r = reg_field_register.map(Register::needs_rex_extension).unwrap_or(false);
    let rex_b = rm_field_register
        .map(Register::needs_rex_extension)
        .unwrap_or(false)
        || opcode_plus_reg_register
            .map(Register::needs_rex_extension)
            .unwrap_or(false);

    let rex = REX_BASE
        | if needs_rex_w { REX_W } else { 0 }
        | if rex_r { REX_R } else { 0 }
        | if rex_b { REX_B } else { 0 };
    let needs_rex = rex != REX_BASE;

    if needs_operand_size_prefix {
        buffer.push(0x66);
    }
    if needs_rex {
        buffer.push(rex);
    }

    // Opcode bytes, merging the register into the last byte for
    // opcode-plus-register forms.
    let mut opcode = encoding.opcode.clone();
    if let Some(register) = opcode_plus_reg_register {
        let last = opcode.last_mut().expect("encoding always has >=1 opcode byte");
        *last += register.low_bits();
    }
    buffer.extend_from_slice(&opcode);

    // ModRM (+ SIB + displacement), only for encodings that use it.
    match encoding.option {
        InstructionOption::Reg | InstructionOption::Digit(_) => {
            let reg_field = match encoding.option {
                InstructionOption::Digit(digit) => digit,
                _ => reg_field_register.map(Register::low_bits).unwrap_or(0),
            };
            emit_modrm_and_operand(
                buffer,
                reg_field,
                rm_position.and_then(|index| instruction.operands.get(index)),
                instruction
                    .operands
                    .iter()
                    .find(|operand| operand.is_memory()),
                rm_field_register,
                stack_patches,
                global_patches,
                trailing_immediate_len,
            )?;
        }
        _ => {}
    }

    // Immediate operand, if the matched combination names one.
    for (slot, operand) in combination.operands.iter().zip(instruction.operands.iter()) {
        if slot.kind == OperandKind::Immediate {
            emit_immediate(buffer, operand);
        }
    }

    // Relative-to-label operand (jmp/jcc/call).
    for (slot, operand) in combination.operands.iter().zip(instruction.operands.iter()) {
        if slot.kind == OperandKind::Relative {
            if let Operand::RelativeToLabel(label, _) = operand {
                let width = match slot.size {
                    OperandSize::Byte => RelativeWidth::Rel8,
                    _ => RelativeWidth::Rel32,
                };
                labels.reference(*label, buffer, width)?;
            }
        }
    }

    Ok(())
}

/// `Reg`-option combinations always carry exactly one `Register` slot (the
/// ModRM.reg operand) and one `RegisterOrMemory`/`Memory` slot (the
/// ModRM.r_m operand), in either order depending on the mnemonic's
/// direction (`mov r/m, r` vs `mov r, r/m`).
fn find_reg_and_rm_positions(combination: &Combination) -> (Option<usize>, Option<usize>) {
    let reg = combination
        .operands
        .iter()
        .position(|slot| slot.kind == OperandKind::Register);
    let rm = find_rm_position(combination);
    (reg, rm)
}

fn find_rm_position(combination: &Combination) -> Option<usize> {
    combination
        .operands
        .iter()
        .position(|slot| matches!(slot.kind, OperandKind::RegisterOrMemory | OperandKind::Memory))
}

/// Emits ModRM, an optional SIB byte, and any displacement, then records a
/// stack patch site if the memory operand was built relative to the
/// (not-yet-known) frame size.
fn emit_modrm_and_operand(
    buffer: &mut Vec<u8>,
    reg_field: u8,
    rm_operand: Option<&Operand>,
    memory_operand: Option<&Operand>,
    rm_register: Option<Register>,
    stack_patches: &mut Vec<StackPatch>,
    global_patches: &mut Vec<GlobalPatch>,
    trailing_immediate_len: i64,
) -> Result<(), EncodingError> {
    let operand = rm_operand.or(memory_operand).unwrap_or(&Operand::None);
    match operand {
        Operand::Register(register, _) => {
            let modrm = (0b11 << 6) | (reg_field << 3) | register.low_bits();
            buffer.push(modrm);
        }
        Operand::Memory(memory) => {
            // Stack-relative operands always reserve a 4-byte displacement
            // field, even when the current (pre-patch) displacement would
            // fit in a byte or even be zero: `fn_end` rewrites this value
            // to `frame_size + original` once the frame size is known, and
            // that rewritten value may not fit in 8 bits even if the
            // original did.
            let mode = if memory.is_stack_relative {
                0b10
            } else if memory.displacement == 0 && !memory.base.needs_explicit_zero_displacement() {
                0b00
            } else if i8::try_from(memory.displacement).is_ok() {
                0b01
            } else {
                0b10
            };
            let modrm = (mode << 6) | (reg_field << 3) | memory.base.low_bits();
            buffer.push(modrm);

            if memory.base.needs_sib_escape() {
                // SIB required; no index, base carried in SIB.base.
                let sib = (0b00 << 6) | (0b100 << 3) | memory.base.low_bits();
                buffer.push(sib);
            }

            if mode == 0b01 {
                stack_patch_if_needed(memory, buffer.len(), stack_patches);
                buffer.push(memory.displacement as i8 as u8);
            } else if mode == 0b10 {
                stack_patch_if_needed(memory, buffer.len(), stack_patches);
                buffer.extend_from_slice(&memory.displacement.to_le_bytes());
            }
        }
        Operand::RipRelative(rip) => {
            let modrm = (0b00 << 6) | (reg_field << 3) | 0b101;
            buffer.push(modrm);
            let patch_offset = buffer.len();
            let anchor_offset = patch_offset + 4 + trailing_immediate_len as usize;
            buffer.extend_from_slice(&0i32.to_le_bytes());
            global_patches.push(GlobalPatch {
                patch_offset,
                anchor_offset,
                target_address: rip.target_address,
            });
        }
        Operand::None => {
            let modrm = (0b11 << 6) | (reg_field << 3) | (rm_register.map(Register::low_bits).unwrap_or(0));
            buffer.push(modrm);
        }
        _ => {}
    }
    Ok(())
}

/// Records a stack patch site. Must be called with `patch_offset` equal to
/// the buffer length right before the displacement field's bytes are
/// pushed, so the function builder can later overwrite exactly those bytes
/// once the frame size is known.
fn stack_patch_if_needed(memory: &anna_encoding_x86_64::Memory, patch_offset: usize, stack_patches: &mut Vec<StackPatch>) {
    if memory.is_stack_relative {
        stack_patches.push(StackPatch {
            patch_offset,
            original_displacement: memory.displacement,
        });
    }
}

fn emit_immediate(buffer: &mut Vec<u8>, operand: &Operand) {
    match operand {
        Operand::Immediate8(value) => buffer.push(*value as u8),
        Operand::Immediate16(value) => buffer.extend_from_slice(&value.to_le_bytes()),
        Operand::Immediate32(value) => buffer.extend_from_slice(&value.to_le_bytes()),
        Operand::Immediate64(value) => buffer.extend_from_slice(&value.to_le_bytes()),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anna_encoding_x86_64::{Mnemonic, Operand, OperandSize, Register};
    use pretty_assertions::assert_eq;

    fn encode(instruction: &Instruction) -> Vec<u8> {
        let mut buffer = Vec::new();
        let mut labels = LabelManager::new();
        let mut patches = Vec::new();
        let mut globals = Vec::new();
        encode_instruction(instruction, &mut buffer, &mut labels, &mut patches, &mut globals).unwrap();
        buffer
    }

    #[test]
    fn mov_eax_imm32() {
        let instruction = Instruction::with_operands(
            Mnemonic::Mov,
            &[
                Operand::register(Register::A, OperandSize::Dword),
                Operand::immediate(0xffff_ffffu32 as i32 as i64, OperandSize::Dword),
            ],
        );
        assert_eq!(encode(&instruction), vec![0xB8, 0xFF, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn mov_rax_rbx() {
        let instruction = Instruction::with_operands(
            Mnemonic::Mov,
            &[
                Operand::register(Register::A, OperandSize::Qword),
                Operand::register(Register::B, OperandSize::Qword),
            ],
        );
        // REX.W (48), opcode 89 /r, ModRM 11 011 000 (mov r/m64, r64: dst=rax, src=rbx)
        assert_eq!(encode(&instruction), vec![0x48, 0x89, 0xD8]);
    }

    #[test]
    fn mov_rax_r8() {
        let instruction = Instruction::with_operands(
            Mnemonic::Mov,
            &[
                Operand::register(Register::A, OperandSize::Qword),
                Operand::register(Register::R8, OperandSize::Qword),
            ],
        );
        // REX.WB (4C), opcode 89 /r, ModRM 11 000 000
        assert_eq!(encode(&instruction), vec![0x4C, 0x89, 0xC0]);
    }

    #[test]
    fn add_rax_imm8_sign_extended() {
        let instruction = Instruction::with_operands(
            Mnemonic::Add,
            &[
                Operand::register(Register::A, OperandSize::Qword),
                Operand::immediate(5, OperandSize::Byte),
            ],
        );
        // REX.W (48), opcode 83 /0, ModRM 11 000 000, imm8 05
        assert_eq!(encode(&instruction), vec![0x48, 0x83, 0xC0, 0x05]);
    }

    #[test]
    fn push_r15() {
        let instruction = Instruction::with_operands(
            Mnemonic::Push,
            &[Operand::register(Register::R15, OperandSize::Qword)],
        );
        // REX.B (41), opcode 50+r (57)
        assert_eq!(encode(&instruction), vec![0x41, 0x57]);
    }

    #[test]
    fn ret_no_operands() {
        let instruction = Instruction::new(Mnemonic::Ret);
        assert_eq!(encode(&instruction), vec![0xC3]);
    }

    #[test]
    fn cqo_forces_rex_w_with_no_operands() {
        let instruction = Instruction::new(Mnemonic::Cqo);
        assert_eq!(encode(&instruction), vec![0x48, 0x99]);
    }

    #[test]
    fn int3_encodes_as_a_single_breakpoint_byte() {
        let instruction = Instruction::new(Mnemonic::Int3);
        assert_eq!(encode(&instruction), vec![0xCC]);
    }

    #[test]
    fn label_reference_before_bind_then_bound() {
        let mut buffer = Vec::new();
        let mut labels = LabelManager::new();
        let mut patches = Vec::new();
        let label = labels.create_label();

        let jump = Instruction::with_operands(
            Mnemonic::Jmp,
            &[Operand::RelativeToLabel(label, OperandSize::Dword)],
        );
        let mut globals = Vec::new();
        encode_instruction(&jump, &mut buffer, &mut labels, &mut patches, &mut globals).unwrap();
        assert_eq!(&buffer[0..1], &[0xE9]);
        assert_eq!(&buffer[1..5], &[0, 0, 0, 0]);

        labels.bind(label, &mut buffer, buffer.len()).unwrap();
        // Displacement from the anchor (right after the 4-byte field) to
        // itself is 0.
        assert_eq!(&buffer[1..5], &0i32.to_le_bytes());
    }
}
