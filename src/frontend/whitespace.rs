use crate::lang::node::{BlockStatement, Program, Statement, StripFlags};

/// Applies `~` strip markers and standalone-line removal to a parsed tree.
///
/// A tag is standalone when it is the only thing on its line apart from
/// whitespace; the line's leading indentation and trailing newline are then
/// dropped from the neighbouring content. Standalone partials remember the
/// removed indentation so every line they render can be re-indented.
pub struct WhitespaceControl {
    standalone: bool,
    root_seen: bool,
}

/// What a statement reports to its enclosing program.
#[derive(Debug, Clone, Copy, Default)]
struct Strip {
    open: bool,
    close: bool,
    open_standalone: bool,
    close_standalone: bool,
    inline_standalone: bool,
}

impl WhitespaceControl {
    pub fn new(ignore_standalone: bool) -> Self {
        WhitespaceControl {
            standalone: !ignore_standalone,
            root_seen: false,
        }
    }

    pub fn apply(&mut self, program: &mut Program) {
        self.program(program);
    }

    fn program(&mut self, program: &mut Program) {
        let is_root = !self.root_seen;
        self.root_seen = true;

        let body = &mut program.body;
        for i in 0..body.len() {
            let Some(strip) = self.accept(&mut body[i]) else {
                continue;
            };

            let prev_whitespace = is_prev_whitespace(body, Some(i), is_root);
            let next_whitespace = is_next_whitespace(body, Some(i), is_root);
            let open_standalone = strip.open_standalone && prev_whitespace;
            let close_standalone = strip.close_standalone && next_whitespace;
            let inline_standalone = strip.inline_standalone && prev_whitespace && next_whitespace;

            if strip.close {
                omit_right(body, Some(i), true);
            }
            if strip.open {
                omit_left(body, Some(i), true);
            }

            if self.standalone && inline_standalone {
                omit_right(body, Some(i), false);
                if omit_left(body, Some(i), false) {
                    let indent = match &body[i - 1] {
                        Statement::Content(c) => trailing_blanks(&c.original).to_string(),
                        _ => String::new(),
                    };
                    if let Statement::Partial(partial) = &mut body[i] {
                        partial.indent = indent;
                    }
                }
            }
            if self.standalone && open_standalone {
                if let Some(inner) = opening_program(&mut body[i]) {
                    omit_right(&mut inner.body, None, false);
                }
                omit_left(body, Some(i), false);
            }
            if self.standalone && close_standalone {
                omit_right(body, Some(i), false);
                if let Some(inner) = closing_program(&mut body[i]) {
                    omit_left(&mut inner.body, None, false);
                }
            }
        }
    }

    fn accept(&mut self, statement: &mut Statement) -> Option<Strip> {
        match statement {
            Statement::Content(_) => None,
            Statement::Mustache(m) | Statement::Decorator(m) => Some(Strip {
                open: m.strip.open,
                close: m.strip.close,
                ..Strip::default()
            }),
            Statement::Partial(p) => Some(inline(p.strip)),
            Statement::Comment(c) => Some(inline(c.strip)),
            Statement::Block(b) | Statement::DecoratorBlock(b) => Some(self.block(
                b.program.as_mut(),
                b.inverse.as_mut(),
                b.open_strip,
                b.inverse_strip,
                b.close_strip,
            )),
            Statement::PartialBlock(p) => Some(self.block(
                Some(&mut p.program),
                None,
                p.open_strip,
                StripFlags::default(),
                p.close_strip,
            )),
        }
    }

    fn block(
        &mut self,
        mut program: Option<&mut Program>,
        mut inverse: Option<&mut Program>,
        open_strip: StripFlags,
        inverse_strip: StripFlags,
        close_strip: StripFlags,
    ) -> Strip {
        if let Some(p) = program.as_deref_mut() {
            self.program(p);
        }
        if let Some(p) = inverse.as_deref_mut() {
            self.program(p);
        }

        // An inverted block only has an inverse; it plays the main role here.
        let (program, mut inverse) = match (program, inverse) {
            (Some(p), inverse) => (p, inverse),
            (None, Some(i)) => (i, None),
            (None, None) => {
                return Strip {
                    open: open_strip.open,
                    close: close_strip.close,
                    ..Strip::default()
                };
            }
        };

        let close_standalone = match inverse.as_deref_mut() {
            Some(inv) => with_first_inverse(inv, |p| is_prev_whitespace(&p.body, None, false)),
            None => is_prev_whitespace(&program.body, None, false),
        };
        let strip = Strip {
            open: open_strip.open,
            close: close_strip.close,
            open_standalone: is_next_whitespace(&program.body, None, false),
            close_standalone,
            inline_standalone: false,
        };

        if open_strip.close {
            omit_right(&mut program.body, None, true);
        }

        if let Some(inverse) = inverse {
            if inverse_strip.open {
                omit_left(&mut program.body, None, true);
            }
            if inverse_strip.close {
                with_first_inverse(inverse, |p| omit_right(&mut p.body, None, true));
            }
            if close_strip.open {
                with_last_inverse(inverse, |p| omit_left(&mut p.body, None, true));
            }

            // Standalone {{else}}.
            if self.standalone
                && is_prev_whitespace(&program.body, None, false)
                && with_first_inverse(inverse, |p| is_next_whitespace(&p.body, None, false))
            {
                omit_left(&mut program.body, None, false);
                with_first_inverse(inverse, |p| omit_right(&mut p.body, None, false));
            }
        } else if close_strip.open {
            omit_left(&mut program.body, None, true);
        }

        strip
    }
}

fn inline(strip: StripFlags) -> Strip {
    Strip {
        open: strip.open,
        close: strip.close,
        inline_standalone: true,
        ..Strip::default()
    }
}

fn opening_program(statement: &mut Statement) -> Option<&mut Program> {
    match statement {
        Statement::Block(b) | Statement::DecoratorBlock(b) => match b {
            BlockStatement {
                program: Some(p), ..
            } => Some(p),
            BlockStatement { inverse, .. } => inverse.as_mut(),
        },
        Statement::PartialBlock(p) => Some(&mut p.program),
        _ => None,
    }
}

fn closing_program(statement: &mut Statement) -> Option<&mut Program> {
    match statement {
        Statement::Block(b) | Statement::DecoratorBlock(b) => match b {
            BlockStatement {
                inverse: Some(i), ..
            } => Some(i),
            BlockStatement { program, .. } => program.as_mut(),
        },
        Statement::PartialBlock(p) => Some(&mut p.program),
        _ => None,
    }
}

/// Runs `f` on the first branch of an inverse: the nested block's program
/// for an `{{else if}}` chain, the inverse itself otherwise.
fn with_first_inverse<R>(inverse: &mut Program, f: impl FnOnce(&mut Program) -> R) -> R {
    if inverse.chained {
        if let Some(Statement::Block(BlockStatement {
            program: Some(p), ..
        })) = inverse.body.first_mut()
        {
            return f(p);
        }
    }
    f(inverse)
}

fn with_last_inverse<R>(inverse: &mut Program, f: impl FnOnce(&mut Program) -> R) -> R {
    if inverse.chained {
        if let Some(Statement::Block(BlockStatement {
            program: Some(p), ..
        })) = inverse.body.last_mut()
        {
            return with_last_inverse(p, f);
        }
    }
    f(inverse)
}

/// Whether the content before position `i` (end of body when `None`) ends
/// a line. Outside any sibling context at the root, start of input counts.
fn is_prev_whitespace(body: &[Statement], i: Option<usize>, is_root: bool) -> bool {
    let i = i.unwrap_or(body.len());
    let Some(prev) = i.checked_sub(1).and_then(|j| body.get(j)) else {
        return is_root;
    };
    let has_sibling = i >= 2;
    match prev {
        Statement::Content(c) => ends_with_blank_line(&c.original, !has_sibling && is_root),
        _ => false,
    }
}

fn is_next_whitespace(body: &[Statement], i: Option<usize>, is_root: bool) -> bool {
    let next = i.map_or(0, |i| i + 1);
    let Some(stmt) = body.get(next) else {
        return is_root;
    };
    let has_sibling = body.len() > next + 1;
    match stmt {
        Statement::Content(c) => starts_with_blank_line(&c.original, !has_sibling && is_root),
        _ => false,
    }
}

fn ends_with_blank_line(text: &str, or_all_blank: bool) -> bool {
    let trimmed = text.trim_end();
    text[trimmed.len()..].contains('\n') || (or_all_blank && trimmed.is_empty())
}

fn starts_with_blank_line(text: &str, or_all_blank: bool) -> bool {
    let trimmed = text.trim_start();
    text[..text.len() - trimmed.len()].contains('\n') || (or_all_blank && trimmed.is_empty())
}

fn trailing_blanks(text: &str) -> &str {
    let kept = text.trim_end_matches([' ', '\t']);
    &text[kept.len()..]
}

/// Strip leading whitespace of the content after `i` (or of the first
/// statement when `None`). Without `multiple` only one line's worth of
/// blanks and its newline go.
fn omit_right(body: &mut [Statement], i: Option<usize>, multiple: bool) {
    let idx = i.map_or(0, |i| i + 1);
    let Some(Statement::Content(current)) = body.get_mut(idx) else {
        return;
    };
    if !multiple && current.right_stripped {
        return;
    }
    let stripped = if multiple {
        current.value.trim_start()
    } else {
        let rest = current.value.trim_start_matches([' ', '\t']);
        let rest = rest.strip_prefix('\r').unwrap_or(rest);
        rest.strip_prefix('\n').unwrap_or(rest)
    };
    let stripped = stripped.to_string();
    current.right_stripped = stripped != current.value;
    current.value = stripped;
}

/// Strip trailing whitespace of the content before `i` (or of the last
/// statement when `None`). Returns whether anything was removed.
fn omit_left(body: &mut [Statement], i: Option<usize>, multiple: bool) -> bool {
    let idx = match i {
        Some(i) => i.checked_sub(1),
        None => body.len().checked_sub(1),
    };
    let Some(Statement::Content(current)) = idx.and_then(|idx| body.get_mut(idx)) else {
        return false;
    };
    if !multiple && current.left_stripped {
        return false;
    }
    let stripped = if multiple {
        current.value.trim_end()
    } else {
        current.value.trim_end_matches([' ', '\t'])
    };
    let stripped = stripped.to_string();
    current.left_stripped = stripped != current.value;
    current.value = stripped;
    current.left_stripped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::lexer::Lexer;
    use crate::frontend::parser::Parser;

    fn parse(src: &str) -> Program {
        let tokens = Lexer::new(src).tokenize().unwrap();
        let mut program = Parser::new(tokens).parse().unwrap();
        WhitespaceControl::new(false).apply(&mut program);
        program
    }

    /// Concatenate every content value in document order.
    fn text(program: &Program) -> String {
        let mut out = String::new();
        collect(program, &mut out);
        out
    }

    fn collect(program: &Program, out: &mut String) {
        for stmt in &program.body {
            match stmt {
                Statement::Content(c) => out.push_str(&c.value),
                Statement::Block(b) => {
                    if let Some(p) = &b.program {
                        collect(p, out);
                    }
                    out.push('|');
                    if let Some(p) = &b.inverse {
                        collect(p, out);
                    }
                }
                _ => out.push('#'),
            }
        }
    }

    #[test]
    fn test_tilde_strips_surrounding_whitespace() {
        let program = parse("a  \n {{~foo~}} \n b");
        assert_eq!(text(&program), "a#b");
    }

    #[test]
    fn test_standalone_block_lines_removed() {
        let program = parse("{{#if a}}\n  x\n{{/if}}\n");
        assert_eq!(text(&program), "  x\n|");
    }

    #[test]
    fn test_standalone_else() {
        let program = parse("{{#if a}}\nx\n{{else}}\ny\n{{/if}}\n");
        assert_eq!(text(&program), "x\n|y\n");
    }

    #[test]
    fn test_inline_mustache_not_standalone() {
        let program = parse("a\n{{foo}}\nb");
        assert_eq!(text(&program), "a\n#\nb");
    }

    #[test]
    fn test_standalone_partial_records_indent() {
        let program = parse("a\n  {{> p}}\nb");
        let Statement::Partial(p) = &program.body[1] else {
            panic!("expected partial");
        };
        assert_eq!(p.indent, "  ");
        assert_eq!(text(&program), "a\n#b");
    }

    #[test]
    fn test_standalone_comment() {
        let program = parse("a\n{{! note }}\nb");
        assert_eq!(text(&program), "a\n#b");
    }

    #[test]
    fn test_ignore_standalone() {
        let tokens = Lexer::new("{{#if a}}\nx\n{{/if}}").tokenize().unwrap();
        let mut program = Parser::new(tokens).parse().unwrap();
        WhitespaceControl::new(true).apply(&mut program);
        assert_eq!(text(&program), "\nx\n|");
    }
}
