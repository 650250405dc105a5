use serde::{Deserialize, Serialize};

use super::value::format_number;

/// Source position of a node, 1-based.
///
/// Positions come from the lexer and are carried through every node so that
/// compile errors can point at the offending construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub line: usize,
    pub col: usize,
}

impl Span {
    pub fn new(line: usize, col: usize) -> Self {
        Span { line, col }
    }
}

impl std::fmt::Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.line, self.col)
    }
}

/// Whitespace-control flags of a tag: `{{~` sets `open`, `~}}` sets `close`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StripFlags {
    pub open: bool,
    pub close: bool,
}

/// A sequence of statements: the template body, a block's main branch or a
/// block's inverse (`{{else}}`) branch.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Program {
    pub body: Vec<Statement>,
    /// Names introduced by `as |a b|` on the owning block.
    pub block_params: Vec<String>,
    /// Set on the synthetic inverse program of an `{{else if ...}}` chain.
    pub chained: bool,
    pub span: Span,
}

impl Program {
    pub fn new(body: Vec<Statement>, span: Span) -> Self {
        Program {
            body,
            block_params: Vec::new(),
            chained: false,
            span,
        }
    }
}

/// Abstract Syntax Tree node for a template statement.
///
/// The set of statement kinds is closed; the lowering compiler matches on it
/// exhaustively.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// `{{expr}}`, `{{{expr}}}` or `{{& expr}}`.
    Mustache(MustacheStatement),

    /// `{{#expr}}...{{else}}...{{/expr}}` and the inverted `{{^expr}}` form.
    Block(BlockStatement),

    /// `{{> name context key=value}}`.
    Partial(PartialStatement),

    /// `{{#> name}}default{{/name}}`.
    PartialBlock(PartialBlockStatement),

    /// `{{* decorator}}`.
    Decorator(MustacheStatement),

    /// `{{#* decorator}}...{{/decorator}}`.
    DecoratorBlock(BlockStatement),

    /// Literal template text.
    Content(ContentStatement),

    /// `{{! comment }}` / `{{!-- comment --}}`.
    Comment(CommentStatement),
}

impl Statement {
    pub fn span(&self) -> Span {
        match self {
            Statement::Mustache(m) | Statement::Decorator(m) => m.span,
            Statement::Block(b) | Statement::DecoratorBlock(b) => b.span,
            Statement::Partial(p) => p.span,
            Statement::PartialBlock(p) => p.span,
            Statement::Content(c) => c.span,
            Statement::Comment(c) => c.span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MustacheStatement {
    pub path: Expression,
    pub params: Vec<Expression>,
    pub hash: Option<Hash>,
    pub escaped: bool,
    pub strip: StripFlags,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockStatement {
    pub path: Expression,
    pub params: Vec<Expression>,
    pub hash: Option<Hash>,
    pub program: Option<Program>,
    pub inverse: Option<Program>,
    pub open_strip: StripFlags,
    pub inverse_strip: StripFlags,
    pub close_strip: StripFlags,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialStatement {
    pub name: Expression,
    pub params: Vec<Expression>,
    pub hash: Option<Hash>,
    /// Leading whitespace of a standalone partial line.
    pub indent: String,
    pub strip: StripFlags,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartialBlockStatement {
    pub name: Expression,
    pub params: Vec<Expression>,
    pub hash: Option<Hash>,
    pub program: Program,
    pub open_strip: StripFlags,
    pub close_strip: StripFlags,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentStatement {
    /// Text after whitespace control has been applied.
    pub value: String,
    /// Text exactly as it appeared in the source.
    pub original: String,
    pub left_stripped: bool,
    pub right_stripped: bool,
    pub span: Span,
}

impl ContentStatement {
    pub fn new(text: String, span: Span) -> Self {
        ContentStatement {
            original: text.clone(),
            value: text,
            left_stripped: false,
            right_stripped: false,
            span,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommentStatement {
    pub value: String,
    pub strip: StripFlags,
    pub span: Span,
}

/// An expression in callee, parameter or hash-value position.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expression {
    Path(PathExpression),
    SubExpression(Box<SubExpression>),
    String { value: String, span: Span },
    Number { value: f64, span: Span },
    Boolean { value: bool, span: Span },
    Undefined { span: Span },
    Null { span: Span },
}

impl Expression {
    pub fn span(&self) -> Span {
        match self {
            Expression::Path(p) => p.span,
            Expression::SubExpression(s) => s.span,
            Expression::String { span, .. }
            | Expression::Number { span, .. }
            | Expression::Boolean { span, .. }
            | Expression::Undefined { span }
            | Expression::Null { span } => *span,
        }
    }

    /// Source-level spelling of the expression, as used for helper and
    /// partial names. Sub-expressions have none.
    pub fn original(&self) -> String {
        match self {
            Expression::Path(p) => p.original.clone(),
            Expression::SubExpression(_) => String::new(),
            Expression::String { value, .. } => value.clone(),
            Expression::Number { value, .. } => format_number(*value),
            Expression::Boolean { value, .. } => value.to_string(),
            Expression::Undefined { .. } => "undefined".to_string(),
            Expression::Null { .. } => "null".to_string(),
        }
    }

    /// The callee of a mustache, block or sub-expression as a path.
    ///
    /// A literal head such as `{{#true}}` or `{{"foo" bar}}` is coerced into a
    /// synthetic single-segment path carrying the literal's string form, so
    /// classification always sees a path.
    pub fn as_callee_path(&self) -> PathExpression {
        match self {
            Expression::Path(p) => p.clone(),
            other => {
                let original = other.original();
                PathExpression {
                    data: false,
                    depth: 0,
                    parts: vec![original.clone()],
                    original,
                    span: other.span(),
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubExpression {
    pub path: Expression,
    pub params: Vec<Expression>,
    pub hash: Option<Hash>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hash {
    pub pairs: Vec<HashPair>,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HashPair {
    pub key: String,
    pub value: Expression,
    pub span: Span,
}

/// A data lookup such as `foo.bar`, `../foo`, `this.foo` or `@index`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathExpression {
    /// `@`-prefixed private data path.
    pub data: bool,
    /// Number of `../` segments.
    pub depth: usize,
    /// Segments after `this`, `.` and `..` have been removed.
    pub parts: Vec<String>,
    pub original: String,
    pub span: Span,
}

impl PathExpression {
    /// The implicit `this` used by partials without an explicit context.
    pub fn this(span: Span) -> Self {
        PathExpression {
            data: false,
            depth: 0,
            parts: Vec::new(),
            original: "this".to_string(),
            span,
        }
    }

    /// True for paths that can never name a helper: those starting with `.`
    /// or mentioning `this` as a whole word.
    pub fn is_scoped(&self) -> bool {
        if self.original.starts_with('.') {
            return true;
        }
        let bytes = self.original.as_bytes();
        self.original.match_indices("this").any(|(at, _)| {
            bytes
                .get(at + 4)
                .map_or(true, |b| !(b.is_ascii_alphanumeric() || *b == b'_'))
        })
    }

    /// A single bare identifier: one segment, no `this`, no `../`.
    pub fn is_simple_id(&self) -> bool {
        self.parts.len() == 1 && !self.is_scoped() && self.depth == 0
    }

    pub fn head(&self) -> Option<&str> {
        self.parts.first().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(original: &str, parts: &[&str], depth: usize) -> PathExpression {
        PathExpression {
            data: false,
            depth,
            parts: parts.iter().map(|p| p.to_string()).collect(),
            original: original.to_string(),
            span: Span::default(),
        }
    }

    #[test]
    fn test_simple_id() {
        assert!(path("foo", &["foo"], 0).is_simple_id());
        assert!(!path("foo.bar", &["foo", "bar"], 0).is_simple_id());
        assert!(!path("../foo", &["foo"], 1).is_simple_id());
        assert!(!path("this.foo", &["foo"], 0).is_simple_id());
        assert!(!path("./foo", &["foo"], 0).is_simple_id());
    }

    #[test]
    fn test_scoped_requires_whole_word_this() {
        assert!(path("this", &[], 0).is_scoped());
        assert!(path("this/foo", &["foo"], 0).is_scoped());
        assert!(!path("thistle", &["thistle"], 0).is_scoped());
    }

    #[test]
    fn test_literal_callee_becomes_path() {
        let lit = Expression::Number {
            value: 1.0,
            span: Span::new(1, 3),
        };
        let p = lit.as_callee_path();
        assert_eq!(p.parts, vec!["1".to_string()]);
        assert_eq!(p.original, "1");
        assert_eq!(p.depth, 0);
        assert!(!p.data);

        let b = Expression::Boolean {
            value: false,
            span: Span::default(),
        };
        assert_eq!(b.as_callee_path().original, "false");
    }
}
