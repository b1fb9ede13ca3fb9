// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in `Descriptor`/`Value` and the free functions `descriptor_size`,
// `descriptor_struct_size`, `typecheck`, `typecheck_values` in `x86_64.cpp`.
// The original's `Descriptor` is a tagged union allocated out of a bump
// allocator and linked by raw pointers; here it's an owned tree of `Rc`s,
// which gives the same "many values share one descriptor" sharing the
// original relied on without needing an external allocator type.

use std::rc::Rc;

use anna_encoding_x86_64::Operand;
use anna_types::TypeError;

pub const POINTER_SIZE: i64 = 8;

#[derive(Debug, Clone, PartialEq)]
pub struct StructField {
    pub name: String,
    pub descriptor: Rc<Descriptor>,
    pub offset: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructDescriptor {
    pub name: String,
    pub fields: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaggedUnionDescriptor {
    pub name: String,
    pub variants: Vec<StructDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDescriptor {
    pub arg_list: Vec<Rc<Descriptor>>,
    pub return_value: Rc<Descriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Descriptor {
    Void,
    Integer { size: i64, signed: bool },
    Pointer(Rc<Descriptor>),
    FixedSizeArray { element: Rc<Descriptor>, len: i64 },
    Function(FunctionDescriptor),
    Struct(StructDescriptor),
    TaggedUnion(TaggedUnionDescriptor),
}

impl Descriptor {
    pub fn pointer_to(target: Rc<Descriptor>) -> Descriptor {
        Descriptor::Pointer(target)
    }

    pub fn array_of(element: Rc<Descriptor>, len: i64) -> Descriptor {
        Descriptor::FixedSizeArray { element, len }
    }

    pub fn integer(size: i64, signed: bool) -> Descriptor {
        Descriptor::Integer { size, signed }
    }
}

/// Grounded in `descriptor_struct_size`: a struct's size is its last field's
/// offset plus that field's size, rounded up to the alignment of its
/// widest field.
pub fn descriptor_struct_size(descriptor: &StructDescriptor) -> i64 {
    // A zero-field struct is valid as a tagged union's unit variant (e.g.
    // `None` in an `Option<s64>`-like union) — it contributes nothing
    // beyond the union's own tag.
    let Some(last) = descriptor.fields.last() else {
        return 0;
    };
    let alignment = descriptor
        .fields
        .iter()
        .map(|field| descriptor_size(&field.descriptor))
        .max()
        .unwrap_or(1);
    let raw_size = last.offset + descriptor_size(&last.descriptor);
    align_up(raw_size, alignment)
}

/// Grounded in `descriptor_size`.
pub fn descriptor_size(descriptor: &Descriptor) -> i64 {
    match descriptor {
        Descriptor::Void => 0,
        Descriptor::Integer { size, .. } => *size,
        Descriptor::Pointer(_) => POINTER_SIZE,
        Descriptor::FixedSizeArray { element, len } => descriptor_size(element) * len,
        Descriptor::Function(_) => POINTER_SIZE,
        Descriptor::Struct(struct_) => descriptor_struct_size(struct_),
        Descriptor::TaggedUnion(tagged_union) => {
            let tag_size = 8;
            let body_size = tagged_union
                .variants
                .iter()
                .map(descriptor_struct_size)
                .max()
                .unwrap_or(0);
            tag_size + body_size
        }
    }
}

pub fn align_up(value: i64, alignment: i64) -> i64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) / alignment * alignment
}

/// Grounded in `typecheck`: structural equality, with one original wrinkle
/// preserved — a pointer-to-array is interchangeable with a pointer to the
/// array's element type (array-to-pointer decay), in either direction.
pub fn typecheck(a: &Descriptor, b: &Descriptor) -> bool {
    match (a, b) {
        (Descriptor::Void, Descriptor::Void) => true,
        (Descriptor::Integer { size: sa, signed: ga }, Descriptor::Integer { size: sb, signed: gb }) => {
            sa == sb && ga == gb
        }
        (Descriptor::Function(fa), Descriptor::Function(fb)) => {
            fa.arg_list.len() == fb.arg_list.len()
                && typecheck(&fa.return_value, &fb.return_value)
                && fa
                    .arg_list
                    .iter()
                    .zip(fb.arg_list.iter())
                    .all(|(x, y)| typecheck(x, y))
        }
        (Descriptor::FixedSizeArray { element: ea, len: la }, Descriptor::FixedSizeArray { element: eb, len: lb }) => {
            typecheck(ea, eb) && la == lb
        }
        (Descriptor::Pointer(pa), Descriptor::Pointer(pb)) => {
            if let Descriptor::FixedSizeArray { element, .. } = pa.as_ref() {
                if typecheck(element, pb) {
                    return true;
                }
            }
            if let Descriptor::FixedSizeArray { element, .. } = pb.as_ref() {
                if typecheck(element, pa) {
                    return true;
                }
            }
            typecheck(pa, pb)
        }
        (Descriptor::Struct(_), Descriptor::Struct(_))
        | (Descriptor::TaggedUnion(_), Descriptor::TaggedUnion(_)) => {
            descriptor_size(a) == descriptor_size(b)
        }
        _ => false,
    }
}

#[derive(Debug, Clone)]
pub struct Value {
    pub descriptor: Rc<Descriptor>,
    pub operand: Operand,
}

impl Value {
    pub fn new(descriptor: Rc<Descriptor>, operand: Operand) -> Value {
        Value { descriptor, operand }
    }
}

pub fn typecheck_values(a: &Value, b: &Value) -> bool {
    typecheck(&a.descriptor, &b.descriptor)
}

pub fn require_typecheck(a: &Value, b: &Value) -> Result<(), TypeError> {
    if typecheck_values(a, b) {
        Ok(())
    } else {
        Err(TypeError::Mismatch {
            left: format!("{:?}", a.descriptor),
            right: format!("{:?}", b.descriptor),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn s32() -> Rc<Descriptor> {
        Rc::new(Descriptor::integer(4, true))
    }
    fn s16() -> Rc<Descriptor> {
        Rc::new(Descriptor::integer(2, true))
    }

    #[test]
    fn integers_typecheck_by_size_and_sign() {
        assert!(typecheck(&s32(), &s32()));
        assert!(!typecheck(&s32(), &s16()));
    }

    #[test]
    fn pointer_to_different_base_does_not_typecheck() {
        let pointer_to_s32 = Descriptor::pointer_to(s32());
        assert!(!typecheck(&s32(), &pointer_to_s32));
    }

    #[test]
    fn array_decays_to_pointer_to_element() {
        let array = Rc::new(Descriptor::array_of(s32(), 4));
        let pointer_to_array_element = Descriptor::pointer_to(s32());
        let pointer_to_array = Descriptor::pointer_to(array);
        assert!(typecheck(&pointer_to_array, &pointer_to_array_element));
    }

    #[test]
    fn struct_size_respects_alignment_of_widest_field() {
        let struct_ = StructDescriptor {
            name: "Point".to_string(),
            fields: vec![
                StructField { name: "x".to_string(), descriptor: s32(), offset: 0 },
                StructField { name: "y".to_string(), descriptor: s32(), offset: 4 },
            ],
        };
        assert_eq!(descriptor_struct_size(&struct_), 8);
    }
}
