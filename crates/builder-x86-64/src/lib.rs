// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// The builder layer sits above `anna_encoding_x86_64`/`anna_encoder_x86_64`:
// it never emits a byte directly, only `Instruction`s and `Operand`s, which
// `FunctionBuilder::fn_end` replays through the encoder once the function's
// stack frame size is known.

pub mod abi;
pub mod descriptor;
pub mod ffi;
pub mod function;
pub mod struct_builder;
pub mod tagged_union;

pub use abi::CallingConvention;
pub use descriptor::{
    align_up, descriptor_size, descriptor_struct_size, typecheck, typecheck_values, Descriptor,
    FunctionDescriptor, StructDescriptor, StructField, TaggedUnionDescriptor, Value,
    POINTER_SIZE,
};
pub use ffi::declare_c_function;
pub use function::{BuildError, CompareOp, FrozenFunction, FunctionBuilder, LoopHandle};
pub use struct_builder::{ensure_memory, struct_add_field, struct_begin, struct_end, struct_get_field, StructBuilder};
pub use tagged_union::cast_to_tag;
