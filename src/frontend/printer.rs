use std::fmt::Write;

use crate::lang::node::{Expression, Hash, PathExpression, Program, Statement};
use crate::lang::value::format_number;

/// Print a parsed template tree
pub fn print_program(program: &Program) {
    print!("{}", print(program));
}

/// Render a parsed template as an indented outline, one statement per line.
///
/// ```text
/// BLOCK:
///   PATH:each [PATH:items]
///   PROGRAM:
///     {{ PATH:name [] }}
/// ```
pub fn print(program: &Program) -> String {
    let mut out = String::new();
    write_program(&mut out, program, 0);
    out
}

fn pad(out: &mut String, depth: usize, line: &str) {
    let _ = writeln!(out, "{}{}", "  ".repeat(depth), line);
}

fn write_program(out: &mut String, program: &Program, depth: usize) {
    if !program.block_params.is_empty() {
        let mut params = String::from("BLOCK PARAMS: [");
        for name in &program.block_params {
            params.push(' ');
            params.push_str(name);
        }
        params.push_str(" ]");
        pad(out, depth, &params);
    }
    for statement in &program.body {
        write_statement(out, statement, depth);
    }
}

fn write_statement(out: &mut String, statement: &Statement, depth: usize) {
    match statement {
        Statement::Mustache(m) => {
            let call = call(&m.path, &m.params, m.hash.as_ref());
            pad(out, depth, &format!("{{{{ {} }}}}", call));
        }
        Statement::Decorator(m) => {
            let call = call(&m.path, &m.params, m.hash.as_ref());
            pad(out, depth, &format!("{{{{ DIRECTIVE {} }}}}", call));
        }
        Statement::Block(b) | Statement::DecoratorBlock(b) => {
            let label = match statement {
                Statement::DecoratorBlock(_) => "DIRECTIVE BLOCK:",
                _ => "BLOCK:",
            };
            pad(out, depth, label);
            pad(out, depth + 1, &call(&b.path, &b.params, b.hash.as_ref()));
            if let Some(program) = &b.program {
                pad(out, depth + 1, "PROGRAM:");
                write_program(out, program, depth + 2);
            }
            if let Some(inverse) = &b.inverse {
                pad(out, depth + 1, "{{^}}");
                write_program(out, inverse, depth + 2);
            }
        }
        Statement::Partial(p) => {
            let head = partial_head("PARTIAL", &p.name, &p.params, p.hash.as_ref());
            pad(out, depth, &format!("{{{{> {} }}}}", head));
        }
        Statement::PartialBlock(p) => {
            let mut content = partial_head("PARTIAL BLOCK", &p.name, &p.params, p.hash.as_ref());
            content.push(' ');
            pad(&mut content, depth, "PROGRAM:");
            write_program(&mut content, &p.program, depth + 1);
            pad(out, depth, &format!("{{{{> {} }}}}", content));
        }
        Statement::Content(c) => pad(out, depth, &format!("CONTENT[ '{}' ]", c.value)),
        Statement::Comment(c) => pad(out, depth, &format!("{{{{! '{}' }}}}", c.value)),
    }
}

fn partial_head(
    label: &str,
    name: &Expression,
    params: &[Expression],
    hash: Option<&Hash>,
) -> String {
    let mut head = format!("{}:{}", label, name.original());
    if let Some(context) = params.first() {
        head.push(' ');
        head.push_str(&expression(context));
    }
    if let Some(hash) = hash {
        head.push(' ');
        head.push_str(&print_hash(hash));
    }
    head
}

fn call(path: &Expression, params: &[Expression], hash: Option<&Hash>) -> String {
    let params: Vec<String> = params.iter().map(expression).collect();
    let mut out = format!("{} [{}]", expression(path), params.join(", "));
    if let Some(hash) = hash {
        out.push(' ');
        out.push_str(&print_hash(hash));
    }
    out
}

fn expression(expr: &Expression) -> String {
    match expr {
        Expression::Path(p) => path(p),
        Expression::SubExpression(s) => call(&s.path, &s.params, s.hash.as_ref()),
        Expression::String { value, .. } => format!("\"{}\"", value),
        Expression::Number { value, .. } => format!("NUMBER{{{}}}", format_number(*value)),
        Expression::Boolean { value, .. } => format!("BOOLEAN{{{}}}", value),
        Expression::Undefined { .. } => "UNDEFINED".to_string(),
        Expression::Null { .. } => "NULL".to_string(),
    }
}

fn path(p: &PathExpression) -> String {
    format!("{}PATH:{}", if p.data { "@" } else { "" }, p.parts.join("/"))
}

fn print_hash(hash: &Hash) -> String {
    let pairs: Vec<String> = hash
        .pairs
        .iter()
        .map(|pair| format!("{}={}", pair.key, expression(&pair.value)))
        .collect();
    format!("HASH{{{}}}", pairs.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::parse;
    use crate::options::CompileOptions;

    fn outline(source: &str) -> String {
        print(&parse(source, &CompileOptions::default()).unwrap())
    }

    #[test]
    fn test_mustache_with_params_and_hash() {
        assert_eq!(
            outline(r#"{{foo bar "baz" 1 true key=@index}}"#),
            "{{ PATH:foo [PATH:bar, \"baz\", NUMBER{1}, BOOLEAN{true}] HASH{key=@PATH:index} }}\n"
        );
    }

    #[test]
    fn test_block_with_inverse() {
        assert_eq!(
            outline("{{#if a}}x{{else}}y{{/if}}"),
            "BLOCK:\n  PATH:if [PATH:a]\n  PROGRAM:\n    CONTENT[ 'x' ]\n  {{^}}\n    CONTENT[ 'y' ]\n"
        );
    }

    #[test]
    fn test_block_params_and_nested_path() {
        assert_eq!(
            outline("{{#each xs as |x|}}{{../y.z}}{{/each}}"),
            "BLOCK:\n  PATH:each [PATH:xs]\n  PROGRAM:\n    BLOCK PARAMS: [ x ]\n    {{ PATH:y/z [] }}\n"
        );
    }

    #[test]
    fn test_partial_sub_expression_and_comment() {
        assert_eq!(
            outline(r#"{{> card (lookup . "k") n=null}}{{! hi }}"#),
            "{{> PARTIAL:card PATH:lookup [PATH:, \"k\"] HASH{n=NULL} }}\n{{! ' hi ' }}\n"
        );
    }
}
