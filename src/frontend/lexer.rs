use crate::frontend::parser_error::ParseError;
use crate::frontend::token::{OpenKind, Spanned, Token};
use crate::lang::node::Span;

/// Tokenizer for template source.
///
/// The lexer alternates between two modes: content mode collects literal text
/// up to the next `{{`, tag mode splits the inside of a tag into expression
/// tokens until the closing `}}`.
pub struct Lexer {
    source: Vec<char>,
    pos: usize,
    line: usize,
    col: usize,
    tokens: Vec<Spanned>,
}

fn is_id_char(ch: char) -> bool {
    !ch.is_whitespace() && !"!\"#%&'()*+,./;<=>@[\\]^`{|}~".contains(ch)
}

/// Characters that may follow a literal (`true`, `12`, `null`, ...).
fn is_literal_lookahead(ch: Option<char>) -> bool {
    match ch {
        None => true,
        Some(c) => c == '~' || c == '}' || c == ')' || c.is_whitespace(),
    }
}

/// Characters that may follow an id.
fn is_id_lookahead(ch: Option<char>) -> bool {
    match ch {
        None => true,
        Some(c) => "=~}/.)|".contains(c) || c.is_whitespace(),
    }
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Lexer {
            source: source.chars().collect(),
            pos: 0,
            line: 1,
            col: 1,
            tokens: Vec::new(),
        }
    }

    fn current(&self) -> Option<char> {
        self.source.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.source.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn advance(&mut self) -> Option<char> {
        let ch = self.current();
        if ch == Some('\n') {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        self.pos += 1;
        ch
    }

    fn advance_by(&mut self, n: usize) -> String {
        (0..n).filter_map(|_| self.advance()).collect()
    }

    fn span(&self) -> Span {
        Span::new(self.line, self.col)
    }

    fn save(&self) -> (usize, usize, usize) {
        (self.pos, self.line, self.col)
    }

    fn restore(&mut self, saved: (usize, usize, usize)) {
        (self.pos, self.line, self.col) = saved;
    }

    fn push(&mut self, token: Token, span: Span) {
        self.tokens.push(Spanned { token, span });
    }

    fn error(&self, message: impl Into<String>) -> ParseError {
        ParseError::new(message, self.span())
    }

    pub fn tokenize(mut self) -> Result<Vec<Spanned>, ParseError> {
        while self.current().is_some() {
            self.lex_content();
            if self.current().is_some() {
                self.lex_tag()?;
            }
        }
        let end = self.span();
        self.push(Token::Eof, end);
        Ok(self.tokens)
    }

    // Content mode

    /// Collect text up to the next unescaped `{{`.
    ///
    /// `\{{` emits the braces as literal content (up to the next tag), `\\{{`
    /// emits a single backslash followed by a real tag.
    fn lex_content(&mut self) {
        let mut span = self.span();
        let mut text = String::new();

        loop {
            if self.current().is_none() {
                break;
            }
            if self.starts_with("{{") {
                if text.ends_with("\\\\") {
                    text.pop();
                    break;
                } else if text.ends_with('\\') {
                    text.pop();
                    if !text.is_empty() {
                        self.push(Token::Content(std::mem::take(&mut text)), span);
                    }
                    let escaped_span = self.span();
                    let mut escaped = self.advance_by(2);
                    while self.current().is_some()
                        && !self.starts_with("{{")
                        && !self.starts_with("\\{{")
                        && !self.starts_with("\\\\{{")
                    {
                        if let Some(ch) = self.advance() {
                            escaped.push(ch);
                        }
                    }
                    self.push(Token::Content(escaped), escaped_span);
                    span = self.span();
                    continue;
                } else {
                    break;
                }
            }
            if let Some(ch) = self.advance() {
                text.push(ch);
            }
        }

        if !text.is_empty() {
            self.push(Token::Content(text), span);
        }
    }

    // Tag mode

    fn lex_tag(&mut self) -> Result<(), ParseError> {
        let span = self.span();
        let mut text = self.advance_by(2);
        if self.current() == Some('~') {
            self.advance();
            text.push('~');
        }

        let kind = match self.current() {
            Some('!') => return self.lex_comment(text, span),
            Some('>') => {
                text.push_str(&self.advance_by(1));
                OpenKind::Partial
            }
            Some('#') => {
                text.push_str(&self.advance_by(1));
                match self.current() {
                    Some('>') => {
                        text.push_str(&self.advance_by(1));
                        OpenKind::PartialBlock
                    }
                    Some('*') => {
                        text.push_str(&self.advance_by(1));
                        OpenKind::Block
                    }
                    _ => OpenKind::Block,
                }
            }
            Some('/') => {
                text.push_str(&self.advance_by(1));
                OpenKind::EndBlock
            }
            Some('^') => {
                text.push_str(&self.advance_by(1));
                if let Some(close) = self.try_standalone_close() {
                    text.push_str(&close);
                    self.push(Token::Inverse(text), span);
                    return Ok(());
                }
                OpenKind::Inverse
            }
            Some('{') => {
                text.push_str(&self.advance_by(1));
                OpenKind::Unescaped
            }
            Some('&') | Some('*') => {
                text.push_str(&self.advance_by(1));
                OpenKind::Mustache
            }
            _ => match self.try_else(&mut text) {
                Some(true) => {
                    self.push(Token::Inverse(text), span);
                    return Ok(());
                }
                Some(false) => OpenKind::InverseChain,
                None => OpenKind::Mustache,
            },
        };

        self.push(Token::Open { kind, text }, span);
        self.lex_expression_tokens()
    }

    /// After `{{^`, accept optional whitespace and a close, as in `{{^}}`.
    fn try_standalone_close(&mut self) -> Option<String> {
        let saved = self.save();
        let mut text = String::new();
        while self.current().is_some_and(char::is_whitespace) {
            text.push_str(&self.advance_by(1));
        }
        if self.current() == Some('~') {
            text.push_str(&self.advance_by(1));
        }
        if self.starts_with("}}") && !self.starts_with("}}}") {
            text.push_str(&self.advance_by(2));
            return Some(text);
        }
        self.restore(saved);
        None
    }

    /// Recognize `{{else}}` (returns `Some(true)`) and `{{else helper ...`
    /// (returns `Some(false)`); anything else leaves the position untouched.
    fn try_else(&mut self, text: &mut String) -> Option<bool> {
        let saved = self.save();
        let mut consumed = String::new();
        while self.current().is_some_and(char::is_whitespace) {
            consumed.push_str(&self.advance_by(1));
        }
        let after = self.peek_at(4);
        let keyword_ends = after.is_none_or(|c| c.is_whitespace() || c == '~' || c == '}');
        if !(self.starts_with("else") && keyword_ends) {
            self.restore(saved);
            return None;
        }
        consumed.push_str(&self.advance_by(4));
        text.push_str(&consumed);

        if let Some(close) = self.try_standalone_close() {
            text.push_str(&close);
            return Some(true);
        }
        Some(false)
    }

    fn lex_comment(&mut self, mut text: String, span: Span) -> Result<(), ParseError> {
        let long = self.starts_with("!--");
        loop {
            if self.current().is_none() {
                return Err(ParseError::new("unterminated comment", span));
            }
            if long {
                if self.starts_with("--}}") || self.starts_with("--~}}") {
                    let n = if self.starts_with("--}}") { 4 } else { 5 };
                    text.push_str(&self.advance_by(n));
                    break;
                }
            } else if self.starts_with("}}") {
                text.push_str(&self.advance_by(2));
                break;
            }
            text.push_str(&self.advance_by(1));
        }
        self.push(Token::Comment(text), span);
        Ok(())
    }

    fn lex_expression_tokens(&mut self) -> Result<(), ParseError> {
        loop {
            while self.current().is_some_and(char::is_whitespace) {
                self.advance();
            }

            let span = self.span();
            let Some(ch) = self.current() else {
                return Err(self.error("unterminated tag: expected '}}'"));
            };

            if self.starts_with("}}}") || self.starts_with("}~}}") {
                let n = if self.starts_with("}}}") { 3 } else { 4 };
                let text = self.advance_by(n);
                self.push(Token::CloseUnescaped(text), span);
                return Ok(());
            }
            if self.starts_with("}}") || self.starts_with("~}}") {
                let n = if ch == '~' { 3 } else { 2 };
                let text = self.advance_by(n);
                self.push(Token::Close(text), span);
                return Ok(());
            }

            let token = match ch {
                '(' => {
                    self.advance();
                    Token::OpenSexpr
                }
                ')' => {
                    self.advance();
                    Token::CloseSexpr
                }
                '=' => {
                    self.advance();
                    Token::Equals
                }
                '@' => {
                    self.advance();
                    Token::Data
                }
                '|' => {
                    self.advance();
                    Token::CloseBlockParams
                }
                '"' | '\'' => self.read_string(ch)?,
                '[' => self.read_literal_segment()?,
                '.' => {
                    if self.starts_with("..") {
                        self.advance_by(2);
                        Token::Id {
                            text: "..".to_string(),
                            original: "..".to_string(),
                        }
                    } else if is_id_lookahead(self.peek_at(1)) {
                        self.advance();
                        Token::Id {
                            text: ".".to_string(),
                            original: ".".to_string(),
                        }
                    } else {
                        self.advance();
                        Token::Sep('.')
                    }
                }
                '/' => {
                    self.advance();
                    Token::Sep('/')
                }
                c if c.is_ascii_digit() || c == '-' => self.read_number_or_id()?,
                c if is_id_char(c) => self.read_word()?,
                other => {
                    return Err(self.error(format!("unexpected character '{}' in tag", other)));
                }
            };
            self.push(token, span);
        }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, ParseError> {
        let start = self.span();
        self.advance();
        let mut string = String::new();
        loop {
            match self.current() {
                None => return Err(ParseError::new("unterminated string literal", start)),
                Some('\\') if self.peek_at(1) == Some(quote) => {
                    self.advance();
                    self.advance();
                    string.push(quote);
                }
                Some(c) if c == quote => {
                    self.advance();
                    return Ok(Token::String(string));
                }
                Some(c) => {
                    self.advance();
                    string.push(c);
                }
            }
        }
    }

    /// `[any text]` path segment; `\]` and `\\` are unescaped.
    fn read_literal_segment(&mut self) -> Result<Token, ParseError> {
        let start = self.span();
        let mut original = self.advance_by(1);
        let mut text = String::new();
        loop {
            match self.current() {
                None => return Err(ParseError::new("unterminated '[' path segment", start)),
                Some('\\') if matches!(self.peek_at(1), Some(']') | Some('\\')) => {
                    original.push_str(&self.advance_by(1));
                    if let Some(c) = self.advance() {
                        original.push(c);
                        text.push(c);
                    }
                }
                Some(']') => {
                    original.push_str(&self.advance_by(1));
                    return Ok(Token::Id { text, original });
                }
                Some(c) => {
                    self.advance();
                    original.push(c);
                    text.push(c);
                }
            }
        }
    }

    fn read_number_or_id(&mut self) -> Result<Token, ParseError> {
        let after_sep = matches!(
            self.tokens.last().map(|t| &t.token),
            Some(Token::Sep(_))
        );
        if !after_sep {
            let mut len = 0;
            if self.peek_at(0) == Some('-') {
                len += 1;
            }
            let int_start = len;
            while self.peek_at(len).is_some_and(|c| c.is_ascii_digit()) {
                len += 1;
            }
            if len > int_start {
                if self.peek_at(len) == Some('.')
                    && self.peek_at(len + 1).is_some_and(|c| c.is_ascii_digit())
                {
                    len += 1;
                    while self.peek_at(len).is_some_and(|c| c.is_ascii_digit()) {
                        len += 1;
                    }
                }
                if is_literal_lookahead(self.peek_at(len)) {
                    let text = self.advance_by(len);
                    let value = text
                        .parse::<f64>()
                        .map_err(|_| self.error(format!("invalid number '{}'", text)))?;
                    return Ok(Token::Number(value));
                }
            }
        }
        self.read_word()
    }

    fn read_word(&mut self) -> Result<Token, ParseError> {
        let mut len = 0;
        while self.peek_at(len).is_some_and(is_id_char) {
            len += 1;
        }
        let word: String = (0..len).filter_map(|i| self.peek_at(i)).collect();
        let next = self.peek_at(len);

        if word == "as" && next.is_some_and(char::is_whitespace) {
            let mut look = len;
            while self.peek_at(look).is_some_and(char::is_whitespace) {
                look += 1;
            }
            if self.peek_at(look) == Some('|') {
                self.advance_by(look + 1);
                return Ok(Token::OpenBlockParams);
            }
        }

        if is_literal_lookahead(next) {
            let literal = match word.as_str() {
                "true" => Some(Token::Boolean(true)),
                "false" => Some(Token::Boolean(false)),
                "undefined" => Some(Token::Undefined),
                "null" => Some(Token::Null),
                _ => None,
            };
            if let Some(token) = literal {
                self.advance_by(len);
                return Ok(token);
            }
        }

        if !is_id_lookahead(next) {
            return Err(ParseError::new(
                format!("invalid character after '{}'", word),
                Span::new(self.line, self.col + len),
            ));
        }
        self.advance_by(len);
        Ok(Token::Id {
            original: word.clone(),
            text: word,
        })
    }
}
