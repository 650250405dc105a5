use serde::{Deserialize, Serialize};

use crate::lang::node::Span;
use crate::lang::value::{Value, format_number};

// =============================================================================
// OP - Template bytecode instructions
// =============================================================================

/// A literal operand: pushed as-is, never forces a temporary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Literal {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Literal {
    pub fn to_value(&self) -> Value {
        match self {
            Literal::Undefined => Value::Undefined,
            Literal::Null => Value::Null,
            Literal::Bool(b) => Value::Bool(*b),
            Literal::Number(n) => Value::Number(*n),
            Literal::String(s) => Value::String(s.clone()),
        }
    }
}

impl std::fmt::Display for Literal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Literal::Undefined => write!(f, "undefined"),
            Literal::Null => write!(f, "null"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Number(n) => write!(f, "{}", format_number(*n)),
            Literal::String(s) => write!(f, "{:?}", s),
        }
    }
}

/// The instruction set. Stack effects are listed as `( before -- after )`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    // output
    /// Literal template text, coalesced with adjacent content. `( -- )`
    AppendContent(String),
    /// `( value -- )`, nullish appends nothing.
    Append,
    /// `( value -- )` through the escaping routine.
    AppendEscaped,

    // context and lookups
    /// Select the context `depth` levels up for the next `PushContext`. `( -- )`
    GetContext(usize),
    /// `( -- context )`
    PushContext,
    /// `( -- value )` walking `parts` from the selected context.
    LookupOnContext {
        parts: Vec<String>,
        falsy: bool,
        strict: bool,
        scoped: bool,
    },
    /// `( -- value )` from the block-parameter array.
    LookupBlockParam {
        depth: usize,
        index: usize,
        parts: Vec<String>,
    },
    /// `( -- value )` walking `parts` from `@data`, `depth` frames up.
    LookupData {
        depth: usize,
        parts: Vec<String>,
        strict: bool,
    },
    /// Call the value if it is a function. `( value -- result )`
    ResolvePossibleLambda,

    // literals
    /// `( -- program )`; `None` pushes the absent-program marker.
    PushProgram(Option<usize>),
    /// `( -- hash )`; with `omit` pushes `undefined` instead of `{}`.
    EmptyHash { omit: bool },
    /// Open a hash literal under construction. `( -- )`
    PushHash,
    /// `( value -- )` into the open hash.
    AssignToHash(String),
    /// `( -- hash )` closing the open hash.
    PopHash,
    PushString(String),
    PushLiteral(Literal),

    // invocation
    /// `( params.. program inverse hash helper -- result )`
    InvokeHelper {
        params: usize,
        name: String,
        simple: bool,
    },
    /// `( params.. program inverse hash -- result )`
    InvokeKnownHelper { params: usize, name: String },
    /// `( program inverse value -- result )`, helper table first.
    InvokeAmbiguous { name: String, helper_call: bool },
    /// `( value program inverse hash -- result )` via `blockHelperMissing`.
    BlockValue(String),
    /// Like `BlockValue`, but only when the preceding `InvokeAmbiguous`
    /// found no helper.
    AmbiguousBlockValue,
    /// `( [name] context program inverse hash -- output )`
    InvokePartial {
        dynamic: bool,
        name: String,
        indent: String,
    },
    /// `( params.. program inverse hash -- )` into the decorator list.
    RegisterDecorator { params: usize, name: String },
}

/// An instruction with the source position it was lowered from.
///
/// Equality ignores the position: two bodies that differ only in where they
/// appear in the template are the same program.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Opcode {
    pub op: Op,
    pub span: Span,
}

impl PartialEq for Opcode {
    fn eq(&self, other: &Self) -> bool {
        self.op == other.op
    }
}

impl Op {
    pub fn name(&self) -> &'static str {
        match self {
            Op::AppendContent(_) => "append_content",
            Op::Append => "append",
            Op::AppendEscaped => "append_escaped",
            Op::GetContext(_) => "get_context",
            Op::PushContext => "push_context",
            Op::LookupOnContext { .. } => "lookup_on_context",
            Op::LookupBlockParam { .. } => "lookup_block_param",
            Op::LookupData { .. } => "lookup_data",
            Op::ResolvePossibleLambda => "resolve_possible_lambda",
            Op::PushProgram(_) => "push_program",
            Op::EmptyHash { .. } => "empty_hash",
            Op::PushHash => "push_hash",
            Op::AssignToHash(_) => "assign_to_hash",
            Op::PopHash => "pop_hash",
            Op::PushString(_) => "push_string",
            Op::PushLiteral(_) => "push_literal",
            Op::InvokeHelper { .. } => "invoke_helper",
            Op::InvokeKnownHelper { .. } => "invoke_known_helper",
            Op::InvokeAmbiguous { .. } => "invoke_ambiguous",
            Op::BlockValue(_) => "block_value",
            Op::AmbiguousBlockValue => "ambiguous_block_value",
            Op::InvokePartial { .. } => "invoke_partial",
            Op::RegisterDecorator { .. } => "register_decorator",
        }
    }
}
