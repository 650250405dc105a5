use crate::lang::node::Span;

/// Errors raised while lowering a template or generating code for it.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CompileError {
    /// A partial was given more than one positional argument.
    #[error("compile error at {span}: unsupported number of partial arguments: {count}")]
    UnsupportedPartialArity { count: usize, span: Span },

    /// `known_helpers_only` is set and a helper call names an unknown helper.
    #[error(
        "compile error at {span}: you specified knownHelpersOnly, but used the unknown helper {name}"
    )]
    UnknownHelperRequested { name: String, span: Span },

    /// Input that cannot be compiled at all.
    #[error("compile error: invalid input: {reason}")]
    InvalidInput { reason: String },

    /// A broken invariant between the two compiler passes. Never caused by
    /// template content.
    #[error("compile error: internal error: {0}")]
    Internal(#[from] InternalError),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InternalError {
    #[error(
        "compile completed with content left on stack ({inline} inline, {materialized} materialized, {slots} slots)"
    )]
    StackImbalance {
        inline: usize,
        materialized: usize,
        slots: usize,
    },

    #[error("invalid stack pop")]
    InvalidStackPop,

    #[error("replace_stack on non-inline value")]
    ReplaceStackOnNonInline,

    #[error("ambiguous block value without a preceding ambiguous invocation")]
    MissingAmbiguousHelper,

    #[error("cannot assign to a literal stack value")]
    NotAssignable,

    #[error("push_program refers to missing child {0}")]
    UnknownProgram(usize),

    #[error("stack check failed: {0}")]
    StackCheck(String),
}

impl CompileError {
    pub fn partial_arity(count: usize, span: Span) -> Self {
        CompileError::UnsupportedPartialArity { count, span }
    }

    pub fn unknown_helper(name: &str, span: Span) -> Self {
        CompileError::UnknownHelperRequested {
            name: name.to_string(),
            span,
        }
    }

    pub fn invalid_input(reason: impl Into<String>) -> Self {
        CompileError::InvalidInput {
            reason: reason.into(),
        }
    }

    pub fn hint(&self) -> Option<&'static str> {
        match self {
            CompileError::UnsupportedPartialArity { .. } => {
                Some("pass a single context and use hash arguments for the rest: {{> name ctx key=value}}")
            }
            CompileError::UnknownHelperRequested { .. } => {
                Some("add the helper to known_helpers or disable known_helpers_only")
            }
            CompileError::InvalidInput { .. } => None,
            CompileError::Internal(_) => Some("this is a compiler bug, not a template error"),
        }
    }

    pub fn span(&self) -> Option<Span> {
        match self {
            CompileError::UnsupportedPartialArity { span, .. }
            | CompileError::UnknownHelperRequested { span, .. } => Some(*span),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_helper_display() {
        let err = CompileError::unknown_helper("shout", Span::new(2, 5));
        let msg = err.to_string();
        assert!(msg.contains("knownHelpersOnly"));
        assert!(msg.contains("shout"));
        assert!(msg.contains("2:5"));
        assert!(err.hint().is_some());
    }

    #[test]
    fn test_partial_arity_display() {
        let err = CompileError::partial_arity(3, Span::new(1, 1));
        assert!(err.to_string().contains("partial arguments: 3"));
        assert_eq!(err.span(), Some(Span::new(1, 1)));
    }

    #[test]
    fn test_internal_from() {
        let err: CompileError = InternalError::StackImbalance {
            inline: 1,
            materialized: 0,
            slots: 0,
        }
        .into();
        assert!(matches!(err, CompileError::Internal(_)));
        assert!(err.to_string().contains("left on stack"));
    }

    #[test]
    fn test_error_implements_std_error() {
        let err = CompileError::invalid_input("empty");
        let _: &dyn std::error::Error = &err;
    }
}
