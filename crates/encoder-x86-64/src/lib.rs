// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.

/* *
 * The limitations of this encoder:
 * - Only support a subset of x86-64 instructions
 * - Only support 64-bit (long) mode
 * - PIE (RIP-relative addressing) code only
 * - Only support a subset of addressing modes:
 *   - base (required) + displacement (optional)
 *   - displacement only (RIP-relative addressing)
 *   - FS/GS segment override is not supported (unlike the sibling encoder
 *     crate this one was forked from); thread-local addressing is out of
 *     scope for this backend.
 */

pub mod encode;
pub mod instruction;
pub mod label;

pub use encode::{encode_instruction, GlobalPatch, StackPatch};
pub use instruction::Instruction;
pub use label::{Label, LabelManager, PatchSite};
