// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in `struct_begin`/`struct_add_field`/`struct_end`/`ensure_memory`/
// `struct_get_field` in `x86_64.cpp` (lines 2347-2450). The original threads
// fields through a singly-linked list built in reverse and flips it back to
// declaration order in `struct_end`; a plain growable `Vec` does the same
// job here without the extra reversal step.

use std::rc::Rc;

use anna_encoding_x86_64::Operand;
use anna_types::TypeError;

use crate::descriptor::{align_up, descriptor_size, Descriptor, StructDescriptor, StructField, Value};

/// Accumulates fields for a struct under construction. Dropping it without
/// calling [`struct_end`] simply discards the fields — there's no separate
/// allocator arena to leak here, unlike the original's bump-allocated field
/// buffer.
#[derive(Debug, Default)]
pub struct StructBuilder {
    name: String,
    offset: i64,
    fields: Vec<StructField>,
}

pub fn struct_begin(name: impl Into<String>) -> StructBuilder {
    StructBuilder {
        name: name.into(),
        offset: 0,
        fields: Vec::new(),
    }
}

/// Appends a field, aligning its offset up to its own size first (the
/// original's `align(struct_builder->offset, size)`).
pub fn struct_add_field(builder: &mut StructBuilder, descriptor: Rc<Descriptor>, name: impl Into<String>) {
    let size = descriptor_size(&descriptor);
    builder.offset = align_up(builder.offset, size);
    builder.fields.push(StructField {
        name: name.into(),
        descriptor,
        offset: builder.offset,
    });
    builder.offset += size;
}

pub fn struct_end(builder: StructBuilder) -> Rc<Descriptor> {
    assert!(!builder.fields.is_empty(), "a struct must have at least one field");
    Rc::new(Descriptor::Struct(StructDescriptor {
        name: builder.name,
        fields: builder.fields,
    }))
}

/// Turns a pointer-in-register value into the memory operand it points at,
/// so [`struct_get_field`] always has a base to add a field's displacement
/// to. A value that's already a memory operand (a struct living directly on
/// the stack, say) is returned unchanged.
pub fn ensure_memory(value: &Value) -> Result<Value, TypeError> {
    if value.operand.is_memory() {
        return Ok(value.clone());
    }
    let pointee = match value.descriptor.as_ref() {
        Descriptor::Pointer(pointee) => pointee.clone(),
        other => {
            return Err(TypeError::Mismatch {
                left: "pointer".to_string(),
                right: format!("{:?}", other),
            })
        }
    };
    let register = match value.operand {
        Operand::Register(register, _) => register,
        _ => {
            return Err(TypeError::Mismatch {
                left: "register".to_string(),
                right: format!("{:?}", value.operand),
            })
        }
    };
    let size = crate::function::operand_size_of(descriptor_size(&pointee))?;
    Ok(Value::new(pointee, Operand::memory_indirect(register, 0, size)))
}

/// Looks up `name` in `raw_value`'s struct descriptor and returns a value
/// referring to that field in place (same base register, displacement
/// shifted by the field's offset).
pub fn struct_get_field(raw_value: &Value, name: &str) -> Result<Value, TypeError> {
    let struct_value = ensure_memory(raw_value)?;
    let struct_descriptor = match struct_value.descriptor.as_ref() {
        Descriptor::Struct(struct_descriptor) => struct_descriptor,
        other => {
            return Err(TypeError::Mismatch {
                left: "struct".to_string(),
                right: format!("{:?}", other),
            })
        }
    };
    let field = struct_descriptor
        .fields
        .iter()
        .find(|field| field.name == name)
        .ok_or_else(|| TypeError::NoSuchField(struct_descriptor.name.clone(), name.to_string()))?;

    let memory = match struct_value.operand {
        Operand::Memory(memory) => memory,
        _ => unreachable!("ensure_memory always returns a memory operand"),
    };
    let field_size = crate::function::operand_size_of(descriptor_size(&field.descriptor))?;
    let operand = Operand::Memory(anna_encoding_x86_64::Memory {
        base: memory.base,
        displacement: memory.displacement + field.offset as i32,
        size: field_size,
        is_stack_relative: memory.is_stack_relative,
    });
    Ok(Value::new(field.descriptor.clone(), operand))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::Descriptor;

    #[test]
    fn two_s32_fields_pack_without_padding() {
        let mut builder = struct_begin("Point");
        struct_add_field(&mut builder, Rc::new(Descriptor::integer(4, true)), "x");
        struct_add_field(&mut builder, Rc::new(Descriptor::integer(4, true)), "y");
        let descriptor = struct_end(builder);
        assert_eq!(descriptor_size(&descriptor), 8);
    }

    #[test]
    fn struct_get_field_offsets_into_the_base_operand() {
        let mut builder = struct_begin("Point");
        struct_add_field(&mut builder, Rc::new(Descriptor::integer(4, true)), "x");
        struct_add_field(&mut builder, Rc::new(Descriptor::integer(4, true)), "y");
        let descriptor = struct_end(builder);

        let base = Value::new(descriptor, Operand::stack(-16, anna_encoding_x86_64::OperandSize::Dword));
        let y = struct_get_field(&base, "y").unwrap();
        match y.operand {
            Operand::Memory(memory) => assert_eq!(memory.displacement, -12),
            other => panic!("expected a memory operand, got {other:?}"),
        }
    }

    #[test]
    fn missing_field_is_an_error() {
        let mut builder = struct_begin("Point");
        struct_add_field(&mut builder, Rc::new(Descriptor::integer(4, true)), "x");
        let descriptor = struct_end(builder);
        let base = Value::new(descriptor, Operand::stack(-4, anna_encoding_x86_64::OperandSize::Dword));
        assert!(struct_get_field(&base, "z").is_err());
    }
}
