use serde::{Deserialize, Serialize};

use crate::bytecode::Literal;

// =============================================================================
// OUTPUT IR - What the code generator produces for each template function
// =============================================================================

/// Revision stamped into every generated manifest.
pub const COMPILER_REVISION: u32 = 8;

/// Runtime versions able to execute the current revision.
pub const REVISION_VERSIONS: &str = ">= 4.3.0";

/// Parameters every generated function receives, besides the current
/// context (`depth0`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Param {
    Helpers,
    Partials,
    Data,
    BlockParams,
    Depths,
}

/// Function-scoped locals with a fixed role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Register {
    Helper,
    Options,
}

/// Support routines provided by the runtime container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RuntimeFn {
    EscapeExpression,
    Lambda,
    Strict,
    Lookup,
    InvokePartial,
    Noop,
    NullContext,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Target {
    /// Temporary `stackN`, numbered from 1.
    Slot(usize),
    Register(Register),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Lit(Literal),
    /// `depth0` for 0, otherwise `depths[n]`.
    Context(usize),
    Param(Param),
    /// The data frame `n` levels above the current one.
    DataFrame(usize),
    /// `blockParams[depth][index]`
    BlockParam(usize, usize),
    Slot(usize),
    Register(Register),
    /// Entry in the owning function's alias table.
    Alias(usize),
    Runtime(RuntimeFn),
    Member(Box<Expr>, String),
    Assign(Target, Box<Expr>),
    /// Comma sequence: every element is evaluated, the last one is the value.
    Seq(Vec<Expr>),
    Cond {
        test: Box<Expr>,
        then: Box<Expr>,
        otherwise: Box<Expr>,
    },
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    /// `x != null`
    NotNull(Box<Expr>),
    Not(Box<Expr>),
    IsFunction(Box<Expr>),
    Call {
        callee: Box<Expr>,
        this: Option<Box<Expr>>,
        args: Vec<Expr>,
    },
    Object(Vec<(String, Expr)>),
    Array(Vec<Expr>),
    /// A child program wrapped by the runtime.
    Program {
        index: usize,
        block_params: usize,
        pass_block_params: bool,
        pass_depths: bool,
    },
    Buffer,
    Concat(Vec<Expr>),
}

impl Expr {
    pub fn string(s: impl Into<String>) -> Expr {
        Expr::Lit(Literal::String(s.into()))
    }

    pub fn member(self, name: impl Into<String>) -> Expr {
        Expr::Member(Box::new(self), name.into())
    }

    pub fn call(callee: Expr, this: Option<Expr>, args: Vec<Expr>) -> Expr {
        Expr::Call {
            callee: Box::new(callee),
            this: this.map(Box::new),
            args,
        }
    }

    pub fn cond(test: Expr, then: Expr, otherwise: Expr) -> Expr {
        Expr::Cond {
            test: Box::new(test),
            then: Box::new(then),
            otherwise: Box::new(otherwise),
        }
    }

    pub fn assign(target: Target, value: Expr) -> Expr {
        Expr::Assign(target, Box::new(value))
    }

    pub fn or(self, other: Expr) -> Expr {
        Expr::Or(Box::new(self), Box::new(other))
    }

    pub fn and(self, other: Expr) -> Expr {
        Expr::And(Box::new(self), Box::new(other))
    }

    pub fn not_null(self) -> Expr {
        Expr::NotNull(Box::new(self))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Stmt {
    Assign(Target, Expr),
    If {
        cond: Expr,
        then: Vec<Stmt>,
        otherwise: Vec<Stmt>,
    },
    Return(Expr),
    BufferAppend(Expr),
    /// `fn = decorators[name](fn, props, container, options) || fn`
    Decorate { name: String, options: Expr },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AliasEntry {
    pub expr: Expr,
    pub refs: usize,
}

/// One generated function.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgramSpec {
    /// Receives the `blockParams` parameter.
    pub block_params: bool,
    /// Receives the `depths` parameter.
    pub depths: bool,
    /// Number of temporaries (`stack1..=slots`).
    pub slots: usize,
    pub registers: Vec<Register>,
    pub aliases: Vec<AliasEntry>,
    /// Initial buffer contents when the function builds its result
    /// incrementally; `None` for append-only functions.
    pub buffer: Option<Expr>,
    pub body: Vec<Stmt>,
    /// Decorator calls applied when the function is wrapped.
    pub decorators: Vec<Stmt>,
}

impl ProgramSpec {
    pub fn is_append_only(&self) -> bool {
        self.buffer.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecFlags {
    pub use_partial: bool,
    pub use_data: bool,
    pub use_depths: bool,
    pub use_block_params: bool,
    pub use_decorators: bool,
    pub compat: bool,
}

/// The manifest describing a whole compiled template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemplateSpec {
    pub compiler: (u32, String),
    pub main: ProgramSpec,
    /// Child functions by index. Unused indices hold `None`.
    pub programs: Vec<Option<ProgramSpec>>,
    pub flags: SpecFlags,
}

impl TemplateSpec {
    pub fn program(&self, index: usize) -> Option<&ProgramSpec> {
        self.programs.get(index).and_then(Option::as_ref)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, LoadError> {
        postcard::to_allocvec(self).map_err(|e| LoadError::Encode(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<TemplateSpec, LoadError> {
        postcard::from_bytes(bytes).map_err(|e| LoadError::Decode(e.to_string()))
    }

    /// Refuse manifests produced for another revision.
    pub fn check_revision(&self) -> Result<(), LoadError> {
        let (found, _) = &self.compiler;
        if *found != COMPILER_REVISION {
            return Err(LoadError::RevisionMismatch {
                found: *found,
                expected: COMPILER_REVISION,
                versions: REVISION_VERSIONS.to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoadError {
    #[error("cannot encode template: {0}")]
    Encode(String),

    #[error("invalid precompiled template: {0}")]
    Decode(String),

    #[error(
        "template was precompiled with compiler revision {found}; this runtime expects {expected} ({versions})"
    )]
    RevisionMismatch {
        found: u32,
        expected: u32,
        versions: String,
    },
}

/// What a generator run hands back.
pub enum Generated {
    Spec(TemplateSpec),
    Live(crate::runtime::template::Template),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TemplateSpec {
        TemplateSpec {
            compiler: (COMPILER_REVISION, REVISION_VERSIONS.to_string()),
            main: ProgramSpec {
                body: vec![Stmt::Return(Expr::Concat(vec![
                    Expr::string("Hello "),
                    Expr::Context(0).member("name"),
                ]))],
                ..ProgramSpec::default()
            },
            programs: vec![None, Some(ProgramSpec::default())],
            flags: SpecFlags::default(),
        }
    }

    #[test]
    fn test_bytes_round_trip() {
        let spec = sample();
        let bytes = spec.to_bytes().unwrap();
        assert_eq!(TemplateSpec::from_bytes(&bytes).unwrap(), spec);
    }

    #[test]
    fn test_garbage_bytes_rejected() {
        let err = TemplateSpec::from_bytes(&[0xff, 0xff, 0xff]).unwrap_err();
        assert!(matches!(err, LoadError::Decode(_)));
    }

    #[test]
    fn test_revision_mismatch() {
        let mut spec = sample();
        assert!(spec.check_revision().is_ok());
        spec.compiler.0 = 7;
        let err = spec.check_revision().unwrap_err();
        assert!(err.to_string().contains("revision 7"));
    }

    #[test]
    fn test_program_lookup_skips_placeholders() {
        let spec = sample();
        assert!(spec.program(0).is_none());
        assert!(spec.program(1).is_some());
        assert!(spec.program(9).is_none());
    }
}
