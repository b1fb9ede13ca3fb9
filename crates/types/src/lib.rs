// Copyright (c) 2023 Hemashushu <hippospark@gmail.com>, All rights reserved.
//
// This Source Code Form is subject to the terms of
// the Mozilla Public License version 2.0 and additional exceptions,
// more details in file LICENSE, LICENSE.additional and CONTRIBUTING.

use std::any::Any;
use std::fmt::{Debug, Display};

/// Common trait for every error type in the workspace, kept from the
/// original design so callers can downcast a boxed error without the
/// crates depending on each other's concrete error enums.
pub trait CompileError: Debug + Display + Send + Sync + 'static {
    fn as_any(&self) -> &dyn Any;
}

macro_rules! impl_compile_error {
    ($($ty:ty),* $(,)?) => {
        $(
            impl CompileError for $ty {
                fn as_any(&self) -> &dyn Any {
                    self
                }
            }
        )*
    };
}

/// Failure producing an [`Instruction`](../anna_encoder_x86_64/struct.Instruction.html)'s
/// byte encoding: no row in the table matches the operands given.
#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("no encoding of `{mnemonic}` matches the given operands")]
    NoMatchingCombination { mnemonic: &'static str },

    #[error("label {0:?} was never bound to an address")]
    UnboundLabel(usize),

    #[error("exceeded the maximum of {max} pending patch sites for a single label")]
    PatchSiteOverflow { max: usize },

    #[error("relative displacement {0} does not fit in 32 bits")]
    DisplacementOverflow(i64),
}

/// Failure in the descriptor/value type system (§3 of the design).
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("value of size {found} cannot be used where size {expected} was expected")]
    SizeMismatch { expected: i64, found: i64 },

    #[error("descriptors are not structurally equal: {left} vs {right}")]
    Mismatch { left: String, right: String },

    #[error("struct `{0}` has no field named `{1}`")]
    NoSuchField(String, String),

    #[error("tagged union `{0}` has no variant named `{1}`")]
    NoSuchVariant(String, String),
}

/// Failure allocating a fixed-capacity workspace resource (the original's
/// bump allocators and label tables all have compile-time bounds).
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("{resource} is exhausted (capacity {capacity})")]
    Exhausted {
        resource: &'static str,
        capacity: usize,
    },
}

/// Misuse of the function/struct builder API by the caller (not an
/// encoding failure): the spec calls these programmer errors, not data
/// errors, because they can only be triggered by calling the builder API
/// out of order.
#[derive(Debug, thiserror::Error)]
pub enum BuilderMisuseError {
    #[error("fn_end called on a function that is already frozen")]
    AlreadyFrozen,

    #[error("builder operation used after the function was frozen")]
    UseAfterFreeze,

    #[error("if_end/loop_end called without a matching if_begin/loop_start")]
    UnbalancedControlFlow,

    #[error("no overload of `{0}` accepts the given argument types")]
    NoMatchingOverload(String),

    #[error("operand held in register A is not allowed as an input to this operation")]
    OperandInRegisterA,

    #[error("cannot reserve a zero-sized stack slot")]
    ZeroSizedReservation,
}

impl_compile_error!(EncodingError, TypeError, ResourceError, BuilderMisuseError);
