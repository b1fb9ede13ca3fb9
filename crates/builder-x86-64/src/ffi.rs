// Copyright (c) 2025 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions.
// For more details, see the LICENSE, LICENSE.additional, and CONTRIBUTING files.
//
// Grounded in `C_function_value`/`C_function_return_value`/`C_parse_type` in
// `x86_64.cpp` (lines 1067-1184): a deliberately tiny forward-declaration
// parser, not a C parser — it only needs to recognize the handful of type
// spellings the workspace's own FFI test scenarios use (`int`, `char`,
// `void`, pointers, `const`).
//
// Unlike the original, which only ever records a single hardcoded-`rcx`
// argument (see the `FIXME should not use a hardcoded register here` beside
// it), every parsed argument here is kept and assigned a parameter slot at
// call time through the active `CallingConvention` — `FunctionDescriptor`
// already stores a `Vec`, so there was no reason to keep that limitation.

use std::rc::Rc;

use anna_encoding_x86_64::{Operand, OperandSize};
use anna_types::TypeError;

use crate::descriptor::{Descriptor, FunctionDescriptor, Value};

enum Token<'a> {
    Word(&'a str),
    Star,
}

fn tokenize(text: &str) -> Vec<Token<'_>> {
    let mut tokens = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();
    for (i, &b) in bytes.iter().enumerate() {
        if b == b' ' || b == b'*' {
            if start != i {
                tokens.push(Token::Word(&text[start..i]));
            }
            if b == b'*' {
                tokens.push(Token::Star);
            }
            start = i + 1;
        }
    }
    if start != text.len() {
        tokens.push(Token::Word(&text[start..]));
    }
    tokens
}

/// Parses a single C type spelling (`"const char *"`, `"int"`, `"void"`)
/// into a [`Descriptor`].
fn parse_c_type(text: &str) -> Result<Rc<Descriptor>, TypeError> {
    let mut descriptor: Option<Rc<Descriptor>> = None;
    for token in tokenize(text) {
        match token {
            Token::Word("const") => continue,
            Token::Word("char") => descriptor = Some(Rc::new(Descriptor::integer(1, true))),
            Token::Word("int") => descriptor = Some(Rc::new(Descriptor::integer(4, true))),
            Token::Word("void") => descriptor = Some(Rc::new(Descriptor::Void)),
            Token::Word(other) => {
                return Err(TypeError::Mismatch {
                    left: "a supported C type".to_string(),
                    right: other.to_string(),
                })
            }
            Token::Star => {
                let previous = descriptor.take().ok_or_else(|| TypeError::Mismatch {
                    left: "a base type before `*`".to_string(),
                    right: text.to_string(),
                })?;
                descriptor = Some(Rc::new(Descriptor::pointer_to(previous)));
            }
        }
    }
    descriptor.ok_or_else(|| TypeError::Mismatch {
        left: "a C type".to_string(),
        right: text.to_string(),
    })
}

/// Builds a callable [`Value`] for a foreign function, given its forward
/// declaration (e.g. `"int puts(const char*)"`) and its absolute address.
/// The resulting value's operand is the address itself as a 64-bit
/// immediate — [`crate::function::FunctionBuilder::call_function_value`]
/// emits an indirect `call` through it exactly as it would for a function
/// built in this workspace.
pub fn declare_c_function(forward_declaration: &str, address: usize) -> Result<Value, TypeError> {
    let paren = forward_declaration
        .find('(')
        .ok_or_else(|| TypeError::Mismatch { left: "a `(`".to_string(), right: forward_declaration.to_string() })?;
    let closing = forward_declaration
        .rfind(')')
        .ok_or_else(|| TypeError::Mismatch { left: "a `)`".to_string(), right: forward_declaration.to_string() })?;

    let return_text = forward_declaration[..paren].trim();
    let name_start = return_text
        .rfind(|c: char| c == ' ' || c == '*')
        .map(|i| i + 1)
        .unwrap_or(0);
    let return_value = parse_c_type(return_text[..name_start].trim_end_matches(' '))?;

    let args_text = &forward_declaration[paren + 1..closing];
    let mut arg_list = Vec::new();
    for raw_arg in args_text.split(',') {
        let trimmed = raw_arg.trim();
        if trimmed.is_empty() || trimmed == "void" {
            continue;
        }
        arg_list.push(parse_c_type(trimmed)?);
    }

    let descriptor = Rc::new(Descriptor::Function(FunctionDescriptor { arg_list, return_value }));
    Ok(Value::new(descriptor, Operand::immediate(address as i64, OperandSize::Qword)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn puts_declaration_has_one_pointer_argument_and_int_return() {
        let value = declare_c_function("int puts(const char*)", 0x1000).unwrap();
        match value.descriptor.as_ref() {
            Descriptor::Function(function) => {
                assert_eq!(function.arg_list.len(), 1);
                assert!(matches!(function.arg_list[0].as_ref(), Descriptor::Pointer(_)));
                assert!(matches!(function.return_value.as_ref(), Descriptor::Integer { size: 4, signed: true }));
            }
            other => panic!("expected a function descriptor, got {other:?}"),
        }
    }

    #[test]
    fn void_only_parameter_list_has_no_arguments() {
        let value = declare_c_function("void abort(void)", 0x2000).unwrap();
        match value.descriptor.as_ref() {
            Descriptor::Function(function) => assert!(function.arg_list.is_empty()),
            other => panic!("expected a function descriptor, got {other:?}"),
        }
    }

    #[test]
    fn unsupported_type_is_an_error() {
        assert!(declare_c_function("float sinf(float)", 0x3000).is_err());
    }
}
