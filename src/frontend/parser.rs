use crate::frontend::parser_error::ParseError;
use crate::frontend::token::{OpenKind, Spanned, Token};
use crate::lang::node::{
    BlockStatement, CommentStatement, ContentStatement, Expression, Hash, HashPair,
    MustacheStatement, PartialBlockStatement, PartialStatement, PathExpression, Program, Span,
    Statement, StripFlags, SubExpression,
};

/// Recursive-descent parser producing the template AST.
pub struct Parser {
    tokens: Vec<Spanned>,
    pos: usize,
}

/// The `{{#name params hash as |x|}}` part of a block.
struct OpenBlock {
    text: String,
    path: Expression,
    params: Vec<Expression>,
    hash: Option<Hash>,
    block_params: Vec<String>,
    strip: StripFlags,
}

/// An `{{else}}` branch, or an `{{else if ...}}` chain folded into a
/// synthetic program holding one nested block.
struct InverseAndProgram {
    strip: StripFlags,
    program: Program,
    chain: bool,
}

struct CloseBlock {
    path: Expression,
    strip: StripFlags,
}

/// Strip flags of a tag: `~` right after the opening braces, `~` right before
/// the closing braces.
fn strip_flags(open: &str, close: &str) -> StripFlags {
    let close: Vec<char> = close.chars().collect();
    StripFlags {
        open: open.chars().nth(2) == Some('~'),
        close: close.len() >= 3 && close[close.len() - 3] == '~',
    }
}

fn strip_comment(text: &str) -> String {
    let mut s = text.strip_prefix("{{").unwrap_or(text);
    s = s.strip_prefix('~').unwrap_or(s);
    s = s.strip_prefix('!').unwrap_or(s);
    s = s.strip_prefix('-').unwrap_or(s);
    s = s.strip_prefix('-').unwrap_or(s);
    s = s.strip_suffix("}}").unwrap_or(s);
    s = s.strip_suffix('~').unwrap_or(s);
    s = s.strip_suffix('-').unwrap_or(s);
    s = s.strip_suffix('-').unwrap_or(s);
    s.to_string()
}

impl Parser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Parser { tokens, pos: 0 }
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.pos)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.pos + offset)
            .map(|t| &t.token)
            .unwrap_or(&Token::Eof)
    }

    fn span(&self) -> Span {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map(|t| t.span)
            .unwrap_or_default()
    }

    fn advance(&mut self) -> Spanned {
        let spanned = self.tokens.get(self.pos).cloned().unwrap_or(Spanned {
            token: Token::Eof,
            span: self.span(),
        });
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
        spanned
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.span())
    }

    fn unexpected(&self, expected: &str) -> ParseError {
        self.error(format!(
            "expected {}, found {}",
            expected,
            self.peek().describe()
        ))
    }

    pub fn parse(&mut self) -> Result<Program, ParseError> {
        let program = self.parse_program()?;
        match self.peek() {
            Token::Eof => Ok(program),
            other => Err(self.error(format!("unexpected {}", other.describe()))),
        }
    }

    /// Statements up to the end of input or a token that closes/splits the
    /// enclosing block.
    fn parse_program(&mut self) -> Result<Program, ParseError> {
        let span = self.span();
        let mut body = Vec::new();
        loop {
            match self.peek() {
                Token::Eof | Token::Inverse(_) => break,
                Token::Open {
                    kind: OpenKind::InverseChain | OpenKind::EndBlock,
                    ..
                } => break,
                _ => body.push(self.parse_statement()?),
            }
        }
        Ok(Program::new(body, span))
    }

    fn parse_statement(&mut self) -> Result<Statement, ParseError> {
        let Spanned { token, span } = self.advance();
        match token {
            Token::Content(text) => Ok(Statement::Content(ContentStatement::new(text, span))),
            Token::Comment(text) => Ok(Statement::Comment(CommentStatement {
                value: strip_comment(&text),
                strip: strip_flags(&text, &text),
                span,
            })),
            Token::Open { kind, text } => match kind {
                OpenKind::Mustache | OpenKind::Unescaped => self.parse_mustache(kind, text, span),
                OpenKind::Block => self.parse_block(text, span, false),
                OpenKind::Inverse => self.parse_block(text, span, true),
                OpenKind::Partial => self.parse_partial(text, span),
                OpenKind::PartialBlock => self.parse_partial_block(text, span),
                OpenKind::InverseChain | OpenKind::EndBlock => {
                    Err(ParseError::new(format!("unexpected '{}'", text), span))
                }
            },
            other => Err(ParseError::new(
                format!("unexpected {}", other.describe()),
                span,
            )),
        }
    }

    // Statements

    fn parse_mustache(
        &mut self,
        kind: OpenKind,
        open: String,
        span: Span,
    ) -> Result<Statement, ParseError> {
        let path = self.parse_helper_name()?;
        let (params, hash) = self.parse_params_and_hash()?;
        let close = match (kind, self.advance()) {
            (OpenKind::Unescaped, Spanned { token: Token::CloseUnescaped(t), .. }) => t,
            (OpenKind::Mustache, Spanned { token: Token::Close(t), .. }) => t,
            (_, other) => {
                let expected = if kind == OpenKind::Unescaped { "'}}}'" } else { "'}}'" };
                return Err(ParseError::new(
                    format!("expected {}, found {}", expected, other.token.describe()),
                    other.span,
                ));
            }
        };

        let flag = open.chars().nth(3).or_else(|| open.chars().nth(2));
        let mustache = MustacheStatement {
            path,
            params,
            hash,
            escaped: flag != Some('{') && flag != Some('&'),
            strip: strip_flags(&open, &close),
            span,
        };
        if open.contains('*') {
            Ok(Statement::Decorator(mustache))
        } else {
            Ok(Statement::Mustache(mustache))
        }
    }

    fn parse_partial(&mut self, open: String, span: Span) -> Result<Statement, ParseError> {
        let name = self.parse_partial_name()?;
        let (params, hash) = self.parse_params_and_hash()?;
        let close = self.expect_close()?;
        Ok(Statement::Partial(PartialStatement {
            name,
            params,
            hash,
            indent: String::new(),
            strip: strip_flags(&open, &close),
            span,
        }))
    }

    fn parse_partial_block(&mut self, open: String, span: Span) -> Result<Statement, ParseError> {
        let name = self.parse_partial_name()?;
        let (params, hash) = self.parse_params_and_hash()?;
        let close = self.expect_close()?;
        let open_strip = strip_flags(&open, &close);

        let program = self.parse_program()?;
        let close_block = self.parse_close_block(&name)?;

        Ok(Statement::PartialBlock(PartialBlockStatement {
            name,
            params,
            hash,
            program,
            open_strip,
            close_strip: close_block.strip,
            span,
        }))
    }

    fn parse_block(
        &mut self,
        open: String,
        span: Span,
        inverted: bool,
    ) -> Result<Statement, ParseError> {
        let open_block = self.parse_open_block(open)?;
        let program = self.parse_program()?;

        let inverse = match self.peek() {
            Token::Inverse(_) => Some(self.parse_inverse_and_program()?),
            Token::Open {
                kind: OpenKind::InverseChain,
                ..
            } => Some(self.parse_inverse_chain()?),
            _ => None,
        };

        let close = self.parse_close_block(&open_block.path)?;
        prepare_block(open_block, program, inverse, Some(close.strip), inverted, span)
    }

    fn parse_open_block(&mut self, text: String) -> Result<OpenBlock, ParseError> {
        let path = self.parse_helper_name()?;
        let (params, hash) = self.parse_params_and_hash()?;
        let block_params = self.parse_block_params()?;
        let close = self.expect_close()?;
        Ok(OpenBlock {
            strip: strip_flags(&text, &close),
            text,
            path,
            params,
            hash,
            block_params,
        })
    }

    fn parse_inverse_and_program(&mut self) -> Result<InverseAndProgram, ParseError> {
        let text = match self.advance().token {
            Token::Inverse(text) => text,
            other => return Err(self.error(format!("unexpected {}", other.describe()))),
        };
        let program = self.parse_program()?;
        Ok(InverseAndProgram {
            strip: strip_flags(&text, &text),
            program,
            chain: false,
        })
    }

    /// `{{else if cond}}...` becomes an inverse program whose only statement
    /// is the nested `if` block; further `else` branches nest inside it.
    fn parse_inverse_chain(&mut self) -> Result<InverseAndProgram, ParseError> {
        let Spanned { token, span } = self.advance();
        let Token::Open { text, .. } = token else {
            return Err(ParseError::new(
                format!("unexpected {}", token.describe()),
                span,
            ));
        };

        let open_block = self.parse_open_block(text)?;
        let strip = open_block.strip;
        let program = self.parse_program()?;
        let program_span = program.span;

        let nested = match self.peek() {
            Token::Inverse(_) => Some(self.parse_inverse_and_program()?),
            Token::Open {
                kind: OpenKind::InverseChain,
                ..
            } => Some(self.parse_inverse_chain()?),
            _ => None,
        };
        let nested_strip = nested.as_ref().map(|n| n.strip);

        let block = prepare_block(open_block, program, nested, nested_strip, false, span)?;
        let mut chained = Program::new(vec![block], program_span);
        chained.chained = true;

        Ok(InverseAndProgram {
            strip,
            program: chained,
            chain: true,
        })
    }

    fn parse_close_block(&mut self, open_path: &Expression) -> Result<CloseBlock, ParseError> {
        let Spanned { token, span } = self.advance();
        let open_text = match token {
            Token::Open {
                kind: OpenKind::EndBlock,
                text,
            } => text,
            other => {
                return Err(ParseError::new(
                    format!(
                        "expected '{{{{/{}}}}}', found {}",
                        open_path.original(),
                        other.describe()
                    ),
                    span,
                ));
            }
        };
        let path = self.parse_helper_name()?;
        let close = self.expect_close()?;

        if open_path.original() != path.original() {
            return Err(ParseError::new(
                format!("{} doesn't match {}", open_path.original(), path.original()),
                span,
            ));
        }
        Ok(CloseBlock {
            path,
            strip: strip_flags(&open_text, &close),
        })
    }

    fn expect_close(&mut self) -> Result<String, ParseError> {
        match self.peek() {
            Token::Close(_) => match self.advance().token {
                Token::Close(t) => Ok(t),
                _ => Err(self.unexpected("'}}'")),
            },
            _ => Err(self.unexpected("'}}'")),
        }
    }

    // Expressions

    fn parse_params_and_hash(&mut self) -> Result<(Vec<Expression>, Option<Hash>), ParseError> {
        let mut params = Vec::new();
        loop {
            match (self.peek(), self.peek_at(1)) {
                (Token::Id { .. }, Token::Equals) => break,
                (Token::OpenSexpr, _) => params.push(self.parse_sexpr()?),
                (
                    Token::Id { .. }
                    | Token::Data
                    | Token::String(_)
                    | Token::Number(_)
                    | Token::Boolean(_)
                    | Token::Undefined
                    | Token::Null,
                    _,
                ) => params.push(self.parse_helper_name()?),
                _ => break,
            }
        }
        let hash = self.parse_hash()?;
        Ok((params, hash))
    }

    fn parse_hash(&mut self) -> Result<Option<Hash>, ParseError> {
        let span = self.span();
        let mut pairs = Vec::new();
        while let (Token::Id { .. }, Token::Equals) = (self.peek(), self.peek_at(1)) {
            let Spanned { token, span } = self.advance();
            let Token::Id { text: key, .. } = token else {
                return Err(ParseError::new("expected hash key", span));
            };
            self.advance();
            let value = match self.peek() {
                Token::OpenSexpr => self.parse_sexpr()?,
                _ => self.parse_helper_name()?,
            };
            pairs.push(HashPair { key, value, span });
        }
        if pairs.is_empty() {
            Ok(None)
        } else {
            Ok(Some(Hash { pairs, span }))
        }
    }

    fn parse_block_params(&mut self) -> Result<Vec<String>, ParseError> {
        if self.peek() != &Token::OpenBlockParams {
            return Ok(Vec::new());
        }
        self.advance();
        let mut names = Vec::new();
        while let Token::Id { text, .. } = self.peek() {
            names.push(text.clone());
            self.advance();
        }
        if names.is_empty() {
            return Err(self.unexpected("block parameter name"));
        }
        match self.peek() {
            Token::CloseBlockParams => {
                self.advance();
                Ok(names)
            }
            _ => Err(self.unexpected("'|'")),
        }
    }

    fn parse_sexpr(&mut self) -> Result<Expression, ParseError> {
        let span = self.span();
        self.advance();
        let path = self.parse_helper_name()?;
        let (params, hash) = self.parse_params_and_hash()?;
        match self.peek() {
            Token::CloseSexpr => {
                self.advance();
            }
            _ => return Err(self.unexpected("')'")),
        }
        Ok(Expression::SubExpression(Box::new(SubExpression {
            path,
            params,
            hash,
            span,
        })))
    }

    fn parse_partial_name(&mut self) -> Result<Expression, ParseError> {
        match self.peek() {
            Token::OpenSexpr => self.parse_sexpr(),
            _ => self.parse_helper_name(),
        }
    }

    fn parse_helper_name(&mut self) -> Result<Expression, ParseError> {
        let span = self.span();
        match self.peek().clone() {
            Token::Id { .. } => self.parse_path(false, span),
            Token::Data => {
                self.advance();
                self.parse_path(true, span)
            }
            Token::String(value) => {
                self.advance();
                Ok(Expression::String { value, span })
            }
            Token::Number(value) => {
                self.advance();
                Ok(Expression::Number { value, span })
            }
            Token::Boolean(value) => {
                self.advance();
                Ok(Expression::Boolean { value, span })
            }
            Token::Undefined => {
                self.advance();
                Ok(Expression::Undefined { span })
            }
            Token::Null => {
                self.advance();
                Ok(Expression::Null { span })
            }
            _ => Err(self.unexpected("a path or literal")),
        }
    }

    /// `segment ((. | /) segment)*`, folded into a `PathExpression`.
    fn parse_path(&mut self, data: bool, span: Span) -> Result<Expression, ParseError> {
        let mut segments: Vec<(Option<char>, String, String)> = Vec::new();
        let mut separator = None;
        loop {
            match self.advance().token {
                Token::Id { text, original } => segments.push((separator, text, original)),
                other => {
                    return Err(ParseError::new(
                        format!("expected path segment, found {}", other.describe()),
                        span,
                    ));
                }
            }
            match self.peek() {
                Token::Sep(c) => {
                    separator = Some(*c);
                    self.advance();
                }
                _ => break,
            }
        }
        prepare_path(data, segments, span).map(Expression::Path)
    }
}

fn prepare_path(
    data: bool,
    segments: Vec<(Option<char>, String, String)>,
    span: Span,
) -> Result<PathExpression, ParseError> {
    let mut original = if data { "@".to_string() } else { String::new() };
    let mut parts = Vec::new();
    let mut depth = 0;

    for (separator, part, source) in segments {
        let is_literal = source != part;
        if let Some(sep) = separator {
            original.push(sep);
        }
        original.push_str(&part);

        if !is_literal && (part == ".." || part == "." || part == "this") {
            if !parts.is_empty() {
                return Err(ParseError::new(format!("Invalid path: {}", original), span));
            } else if part == ".." {
                depth += 1;
            }
        } else {
            parts.push(part);
        }
    }

    Ok(PathExpression {
        data,
        depth,
        parts,
        original,
        span,
    })
}

fn prepare_block(
    open: OpenBlock,
    mut program: Program,
    inverse_and_program: Option<InverseAndProgram>,
    close_strip: Option<StripFlags>,
    inverted: bool,
    span: Span,
) -> Result<Statement, ParseError> {
    let decorator = open.text.contains('*');
    program.block_params = open.block_params;

    let mut inverse = None;
    let mut inverse_strip = StripFlags::default();
    if let Some(iap) = inverse_and_program {
        if decorator {
            return Err(ParseError::new(
                "Unexpected inverse block on decorator",
                iap.program.span,
            ));
        }
        let mut inverse_program = iap.program;
        if iap.chain {
            if let Some(Statement::Block(first)) = inverse_program.body.first_mut() {
                first.close_strip = close_strip.unwrap_or_default();
            }
        }
        inverse_strip = iap.strip;
        inverse = Some(inverse_program);
    }

    let (program, inverse) = if inverted {
        (inverse, Some(program))
    } else {
        (Some(program), inverse)
    };

    let block = BlockStatement {
        path: open.path,
        params: open.params,
        hash: open.hash,
        program,
        inverse,
        open_strip: open.strip,
        inverse_strip,
        close_strip: close_strip.unwrap_or_default(),
        span,
    };
    if decorator {
        Ok(Statement::DecoratorBlock(block))
    } else {
        Ok(Statement::Block(block))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;

    fn parse(src: &str) -> Result<Program, ParseError> {
        let tokens = Lexer::new(src).tokenize()?;
        Parser::new(tokens).parse()
    }

    fn path_of(expr: &Expression) -> &PathExpression {
        match expr {
            Expression::Path(p) => p,
            other => panic!("expected path, got {:?}", other),
        }
    }

    #[test]
    fn test_mustache_with_params_and_hash() {
        let program = parse("{{foo bar 1 key=\"v\"}}").unwrap();
        let Statement::Mustache(m) = &program.body[0] else {
            panic!("expected mustache");
        };
        assert_eq!(path_of(&m.path).original, "foo");
        assert_eq!(m.params.len(), 2);
        let hash = m.hash.as_ref().unwrap();
        assert_eq!(hash.pairs[0].key, "key");
        assert!(m.escaped);
    }

    #[test]
    fn test_unescaped_forms() {
        let program = parse("{{{a}}}{{& b}}").unwrap();
        for stmt in &program.body {
            let Statement::Mustache(m) = stmt else {
                panic!("expected mustache");
            };
            assert!(!m.escaped);
        }
    }

    #[test]
    fn test_path_depth_and_parts() {
        let program = parse("{{../../foo.bar}}{{this.baz}}{{@index}}").unwrap();
        let Statement::Mustache(m) = &program.body[0] else {
            panic!()
        };
        let p = path_of(&m.path);
        assert_eq!(p.depth, 2);
        assert_eq!(p.parts, vec!["foo".to_string(), "bar".to_string()]);
        assert_eq!(p.original, "../../foo.bar");

        let Statement::Mustache(m) = &program.body[1] else {
            panic!()
        };
        assert_eq!(path_of(&m.path).parts, vec!["baz".to_string()]);

        let Statement::Mustache(m) = &program.body[2] else {
            panic!()
        };
        let p = path_of(&m.path);
        assert!(p.data);
        assert_eq!(p.original, "@index");
    }

    #[test]
    fn test_invalid_path() {
        let err = parse("{{foo/../bar}}").unwrap_err();
        assert!(err.message.contains("Invalid path"));
    }

    #[test]
    fn test_block_with_else_and_params() {
        let program = parse("{{#each items as |item i|}}a{{else}}b{{/each}}").unwrap();
        let Statement::Block(b) = &program.body[0] else {
            panic!()
        };
        let main = b.program.as_ref().unwrap();
        assert_eq!(main.block_params, vec!["item".to_string(), "i".to_string()]);
        assert!(b.inverse.is_some());
    }

    #[test]
    fn test_inverted_block_swaps_programs() {
        let program = parse("{{^foo}}x{{/foo}}").unwrap();
        let Statement::Block(b) = &program.body[0] else {
            panic!()
        };
        assert!(b.program.is_none());
        assert_eq!(b.inverse.as_ref().unwrap().body.len(), 1);
    }

    #[test]
    fn test_else_if_chain() {
        let program = parse("{{#if a}}x{{else if b}}y{{else}}z{{/if}}").unwrap();
        let Statement::Block(b) = &program.body[0] else {
            panic!()
        };
        let inverse = b.inverse.as_ref().unwrap();
        assert!(inverse.chained);
        let Statement::Block(nested) = &inverse.body[0] else {
            panic!()
        };
        assert_eq!(path_of(&nested.path).original, "if");
        assert!(nested.inverse.is_some());
    }

    #[test]
    fn test_mismatched_close() {
        let err = parse("{{#foo}}{{/bar}}").unwrap_err();
        assert_eq!(err.message, "foo doesn't match bar");
    }

    #[test]
    fn test_partials() {
        let program = parse("{{> header title=\"x\"}}{{> (dyn) ctx}}{{#> layout}}d{{/layout}}").unwrap();
        assert!(matches!(program.body[0], Statement::Partial(_)));
        let Statement::Partial(p) = &program.body[1] else {
            panic!()
        };
        assert!(matches!(p.name, Expression::SubExpression(_)));
        assert_eq!(p.params.len(), 1);
        assert!(matches!(program.body[2], Statement::PartialBlock(_)));
    }

    #[test]
    fn test_decorators() {
        let program = parse("{{* deco}}{{#* inline \"p\"}}x{{/inline}}").unwrap();
        assert!(matches!(program.body[0], Statement::Decorator(_)));
        assert!(matches!(program.body[1], Statement::DecoratorBlock(_)));
    }

    #[test]
    fn test_inverse_on_decorator_rejected() {
        let err = parse("{{#* inline \"p\"}}x{{else}}y{{/inline}}").unwrap_err();
        assert!(err.message.contains("decorator"));
    }

    #[test]
    fn test_strip_flags_and_comment() {
        let program = parse("{{~foo~}}{{!-- note --}}").unwrap();
        let Statement::Mustache(m) = &program.body[0] else {
            panic!()
        };
        assert!(m.strip.open && m.strip.close);
        let Statement::Comment(c) = &program.body[1] else {
            panic!()
        };
        assert_eq!(c.value, " note ");
    }

    #[test]
    fn test_unclosed_block_reports_location() {
        let err = parse("line1\n{{#foo}}").unwrap_err();
        assert_eq!(err.line, 2);
    }
}
