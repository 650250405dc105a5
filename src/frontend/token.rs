use crate::lang::node::Span;

/// Which opening delimiter started a tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenKind {
    /// `{{`, `{{&` and the decorator form `{{*`.
    Mustache,
    /// `{{{`
    Unescaped,
    /// `{{#` and the decorator block form `{{#*`.
    Block,
    /// `{{^`
    Inverse,
    /// `{{else` followed by a helper name.
    InverseChain,
    /// `{{/`
    EndBlock,
    /// `{{>`
    Partial,
    /// `{{#>`
    PartialBlock,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    /// Literal template text.
    Content(String),

    /// Whole comment tag including delimiters.
    Comment(String),

    /// Opening delimiter; `text` keeps the raw spelling (`{{~#*`) so strip
    /// and escape flags can be read off it.
    Open { kind: OpenKind, text: String },

    /// `}}` or `~}}`.
    Close(String),

    /// `}}}` or `}~}}`.
    CloseUnescaped(String),

    /// A standalone `{{else}}` or `{{^}}`, raw text.
    Inverse(String),

    /// Path segment. `text` is the segment name, `original` its source
    /// spelling (`[foo bar]` for literal segments).
    Id { text: String, original: String },

    /// `.` or `/` between path segments.
    Sep(char),

    /// `@`
    Data,

    String(String),
    Number(f64),
    Boolean(bool),
    Undefined,
    Null,

    /// `=`
    Equals,

    /// `(`
    OpenSexpr,
    /// `)`
    CloseSexpr,

    /// `as |`
    OpenBlockParams,
    /// `|`
    CloseBlockParams,

    Eof,
}

impl Token {
    /// Short description for parse errors.
    pub fn describe(&self) -> String {
        match self {
            Token::Content(_) => "content".to_string(),
            Token::Comment(_) => "comment".to_string(),
            Token::Open { text, .. } => format!("'{}'", text),
            Token::Close(t) | Token::CloseUnescaped(t) | Token::Inverse(t) => format!("'{}'", t),
            Token::Id { original, .. } => format!("'{}'", original),
            Token::Sep(c) => format!("'{}'", c),
            Token::Data => "'@'".to_string(),
            Token::String(s) => format!("string {:?}", s),
            Token::Number(n) => format!("number {}", n),
            Token::Boolean(b) => format!("'{}'", b),
            Token::Undefined => "'undefined'".to_string(),
            Token::Null => "'null'".to_string(),
            Token::Equals => "'='".to_string(),
            Token::OpenSexpr => "'('".to_string(),
            Token::CloseSexpr => "')'".to_string(),
            Token::OpenBlockParams => "'as |'".to_string(),
            Token::CloseBlockParams => "'|'".to_string(),
            Token::Eof => "end of input".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Spanned {
    pub token: Token,
    pub span: Span,
}
