// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in `cast_to_tag` in `x86_64.cpp` (lines 3182-3242): load the tag
// word, compare it against the requested variant's index, and produce a
// pointer that's either the payload address (tag matches) or null
// (otherwise) — the caller is expected to branch on the pointer's nullness
// afterwards, exactly as the original's own `test_tagged_unions` does.

use std::rc::Rc;

use anna_encoding_x86_64::{Operand, OperandSize, Register};
use anna_types::TypeError;

use crate::descriptor::{Descriptor, Value};
use crate::function::{BuildError, CompareOp, FunctionBuilder};

const TAG_SIZE: i64 = 8;

/// Reads `value`'s tag word and returns a pointer to the named variant's
/// payload if the tag matches, or a null pointer of the same type
/// otherwise. `value` must be a register holding a pointer to a tagged
/// union (the original's one supported operand shape for this operation —
/// see the `@TODO` beside the matching assert in the original).
pub fn cast_to_tag(builder: &mut FunctionBuilder, value: &Value, variant_name: &str) -> Result<Value, BuildError> {
    let tagged_union = match value.descriptor.as_ref() {
        Descriptor::Pointer(pointee) => match pointee.as_ref() {
            Descriptor::TaggedUnion(tagged_union) => tagged_union,
            other => {
                return Err(TypeError::Mismatch { left: "tagged union".to_string(), right: format!("{other:?}") }.into())
            }
        },
        other => return Err(TypeError::Mismatch { left: "pointer".to_string(), right: format!("{other:?}") }.into()),
    };
    let register = match value.operand {
        Operand::Register(register, _) => register,
        other => return Err(TypeError::Mismatch { left: "register".to_string(), right: format!("{other:?}") }.into()),
    };

    let variant_index = tagged_union
        .variants
        .iter()
        .position(|variant| variant.name == variant_name)
        .ok_or_else(|| TypeError::NoSuchVariant(tagged_union.name.clone(), variant_name.to_string()))?;
    let variant = tagged_union.variants[variant_index].clone();

    let tag_descriptor = Rc::new(Descriptor::integer(TAG_SIZE, true));
    let tag_value = Value::new(tag_descriptor.clone(), Operand::memory_indirect(register, 0, OperandSize::Qword));

    let pointer_descriptor = Rc::new(Descriptor::pointer_to(Rc::new(Descriptor::Struct(variant))));
    let result = builder.stack_reserve(pointer_descriptor.clone())?;
    let null = Value::new(pointer_descriptor.clone(), Operand::immediate(0, OperandSize::Qword));
    builder.move_value(&result, &null)?;

    let expected_tag = Value::new(tag_descriptor, Operand::immediate(variant_index as i64, OperandSize::Qword));
    let condition = builder.compare(CompareOp::Equal, &tag_value, &expected_tag)?;

    let label = builder.if_begin(&condition)?;
    builder.move_value(&result, value)?;
    let offset_descriptor = Rc::new(Descriptor::integer(8, true));
    let offset = Value::new(offset_descriptor, Operand::immediate(TAG_SIZE, OperandSize::Qword));
    let shifted = builder.rns_add(&result, &offset)?;
    builder.move_value(&result, &shifted)?;
    builder.if_end(label)?;

    Ok(Value::new(pointer_descriptor, result.operand))
}

/// Returns an operand referring to register A's dummy value, kept for
/// symmetry with the original's `reg.rbx` spelling — unused by this
/// workspace's own call sites but documents which register the original
/// reserved for the cast result.
#[allow(dead_code)]
const RESULT_REGISTER: Register = Register::B;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abi::CallingConvention;
    use crate::descriptor::{StructDescriptor, StructField};

    fn option_s64() -> Rc<Descriptor> {
        Rc::new(Descriptor::TaggedUnion(crate::descriptor::TaggedUnionDescriptor {
            name: "OptionS64".to_string(),
            variants: vec![
                StructDescriptor { name: "None".to_string(), fields: vec![] },
                StructDescriptor {
                    name: "Some".to_string(),
                    fields: vec![StructField {
                        name: "value".to_string(),
                        descriptor: Rc::new(Descriptor::integer(8, true)),
                        offset: 0,
                    }],
                },
            ],
        }))
    }

    #[test]
    fn cast_to_known_variant_succeeds() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let pointer = Value::new(
            Rc::new(Descriptor::pointer_to(option_s64())),
            Operand::register(Register::Di, OperandSize::Qword),
        );
        assert!(cast_to_tag(&mut builder, &pointer, "Some").is_ok());
    }

    #[test]
    fn cast_to_unknown_variant_is_an_error() {
        let mut builder = FunctionBuilder::fn_begin(CallingConvention::SystemV);
        let pointer = Value::new(
            Rc::new(Descriptor::pointer_to(option_s64())),
            Operand::register(Register::Di, OperandSize::Qword),
        );
        assert!(cast_to_tag(&mut builder, &pointer, "Neither").is_err());
    }
}
