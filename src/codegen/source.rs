use std::fmt::Write;

use crate::bytecode::Literal;
use crate::codegen::ir::{
    AliasEntry, Expr, Param, ProgramSpec, Register, RuntimeFn, Stmt, Target, TemplateSpec,
};
use crate::lang::value::format_number;

// =============================================================================
// SOURCE - Print a manifest as JavaScript-like source text
// =============================================================================

impl TemplateSpec {
    /// Textual form of the manifest, as produced by precompilation.
    pub fn to_source(&self) -> String {
        let mut entries = vec![
            (
                "compiler".to_string(),
                format!("[{},{}]", self.compiler.0, quote(&self.compiler.1)),
            ),
            ("main".to_string(), function(&self.main)),
        ];
        if !self.main.decorators.is_empty() {
            entries.push(("main_d".to_string(), decorator_function(&self.main)));
        }
        for (i, program) in self.programs.iter().enumerate() {
            if let Some(program) = program {
                entries.push((i.to_string(), function(program)));
                if !program.decorators.is_empty() {
                    entries.push((format!("{}_d", i), decorator_function(program)));
                }
            }
        }
        for (set, name) in [
            (self.flags.use_decorators, "useDecorators"),
            (self.flags.use_partial, "usePartial"),
            (self.flags.use_data, "useData"),
            (self.flags.use_depths, "useDepths"),
            (self.flags.use_block_params, "useBlockParams"),
            (self.flags.compat, "compat"),
        ] {
            if set {
                entries.push((name.to_string(), "true".to_string()));
            }
        }

        let body: Vec<String> = entries
            .into_iter()
            .map(|(k, v)| format!("{}:{}", quote(&k), v))
            .collect();
        format!("{{{}}}", body.join(","))
    }
}

fn quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("{:?}", s))
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_' || c == '$')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
}

fn function(program: &ProgramSpec) -> String {
    let printer = Printer::new(&program.aliases, true);
    let mut params = vec!["container", "depth0", "helpers", "partials", "data"];
    if program.block_params {
        params.push("blockParams");
    }
    if program.depths {
        params.push("depths");
    }

    let mut locals: Vec<String> = (1..=program.slots).map(|n| format!("stack{}", n)).collect();
    locals.extend(program.registers.iter().map(|r| register(*r).to_string()));
    for (i, entry) in program.aliases.iter().enumerate() {
        if let Some(name) = printer.alias_name(i) {
            locals.push(format!("{}={}", name, printer.expr(&entry.expr)));
        }
    }
    if let Some(init) = &program.buffer {
        locals.push(format!("buffer = {}", printer.expr(init)));
    }

    let mut out = format!("function({}) {{\n", params.join(","));
    if !locals.is_empty() {
        let _ = writeln!(out, "    var {};\n", locals.join(", "));
    }
    for stmt in &program.body {
        printer.stmt(&mut out, stmt, 1);
    }
    out.push('}');
    out
}

fn decorator_function(program: &ProgramSpec) -> String {
    // Decorators run outside the program body, so aliases are spelled out.
    let printer = Printer::new(&program.aliases, false);
    let mut out = String::from(
        "function(fn, props, container, depth0, data, blockParams, depths) {\n    var decorators = container.decorators;\n\n",
    );
    for stmt in &program.decorators {
        printer.stmt(&mut out, stmt, 1);
    }
    out.push_str("  return fn;\n}");
    out
}

fn register(register: Register) -> &'static str {
    match register {
        Register::Helper => "helper",
        Register::Options => "options",
    }
}

fn target(t: &Target) -> String {
    match t {
        Target::Slot(n) => format!("stack{}", n),
        Target::Register(r) => register(*r).to_string(),
    }
}

struct Printer<'a> {
    aliases: &'a [AliasEntry],
    /// Alias number per table entry, for entries printed by name.
    names: Vec<Option<usize>>,
}

impl<'a> Printer<'a> {
    fn new(aliases: &'a [AliasEntry], use_names: bool) -> Self {
        let mut next = 0;
        let names = aliases
            .iter()
            .map(|a| {
                if use_names && a.refs > 1 {
                    next += 1;
                    Some(next)
                } else {
                    None
                }
            })
            .collect();
        Printer { aliases, names }
    }

    fn alias_name(&self, i: usize) -> Option<String> {
        self.names
            .get(i)
            .copied()
            .flatten()
            .map(|n| format!("alias{}", n))
    }

    fn stmt(&self, out: &mut String, stmt: &Stmt, depth: usize) {
        let pad = "  ".repeat(depth);
        match stmt {
            Stmt::Assign(t, e) => {
                let _ = writeln!(out, "{}{} = {};", pad, target(t), self.expr(e));
            }
            Stmt::Return(e) => {
                let _ = writeln!(out, "{}return {};", pad, self.expr(e));
            }
            Stmt::BufferAppend(e) => {
                let _ = writeln!(out, "{}buffer += {};", pad, self.expr(e));
            }
            Stmt::Decorate { name, options } => {
                let _ = writeln!(
                    out,
                    "{}fn = {}(fn,props,container,{}) || fn;",
                    pad,
                    member("decorators", name),
                    self.expr(options)
                );
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let _ = writeln!(out, "{}if ({}) {{", pad, self.expr(cond));
                for s in then {
                    self.stmt(out, s, depth + 1);
                }
                if otherwise.is_empty() {
                    let _ = writeln!(out, "{}}}", pad);
                } else {
                    let _ = writeln!(out, "{}}} else {{", pad);
                    for s in otherwise {
                        self.stmt(out, s, depth + 1);
                    }
                    let _ = writeln!(out, "{}}}", pad);
                }
            }
        }
    }

    fn is_atomic(&self, e: &Expr) -> bool {
        match e {
            Expr::Alias(i) => match (self.alias_name(*i), self.aliases.get(*i)) {
                (Some(_), _) | (None, None) => true,
                (None, Some(entry)) => self.is_atomic(&entry.expr),
            },
            Expr::Assign(..)
            | Expr::Cond { .. }
            | Expr::And(..)
            | Expr::Or(..)
            | Expr::NotNull(_)
            | Expr::Not(_)
            | Expr::IsFunction(_)
            | Expr::Concat(_) => false,
            _ => true,
        }
    }

    fn operand(&self, e: &Expr) -> String {
        if self.is_atomic(e) {
            self.expr(e)
        } else {
            format!("({})", self.expr(e))
        }
    }

    fn list(&self, items: &[Expr]) -> String {
        items
            .iter()
            .map(|e| self.expr(e))
            .collect::<Vec<_>>()
            .join(",")
    }

    fn expr(&self, e: &Expr) -> String {
        match e {
            Expr::Lit(lit) => literal(lit),
            Expr::Context(0) => "depth0".to_string(),
            Expr::Context(n) => format!("depths[{}]", n),
            Expr::Param(p) => match p {
                Param::Helpers => "helpers",
                Param::Partials => "partials",
                Param::Data => "data",
                Param::BlockParams => "blockParams",
                Param::Depths => "depths",
            }
            .to_string(),
            Expr::DataFrame(n) => format!("container.data(data, {})", n),
            Expr::BlockParam(d, i) => format!("blockParams[{}][{}]", d, i),
            Expr::Slot(n) => format!("stack{}", n),
            Expr::Register(r) => register(*r).to_string(),
            Expr::Alias(i) => match (self.alias_name(*i), self.aliases.get(*i)) {
                (Some(name), _) => name,
                (None, Some(entry)) => self.expr(&entry.expr),
                (None, None) => "undefined".to_string(),
            },
            Expr::Runtime(f) => runtime(*f).to_string(),
            Expr::Member(obj, name) => member(&self.operand(obj), name),
            Expr::Assign(t, value) => format!("{} = {}", target(t), self.expr(value)),
            Expr::Seq(items) => format!("({})", self.list(items)),
            Expr::Cond {
                test,
                then,
                otherwise,
            } => format!(
                "{} ? {} : {}",
                self.operand(test),
                self.operand(then),
                self.operand(otherwise)
            ),
            Expr::And(a, b) => format!("{} && {}", self.operand(a), self.operand(b)),
            Expr::Or(a, b) => format!("{} || {}", self.operand(a), self.operand(b)),
            Expr::NotNull(x) => format!("{} != null", self.operand(x)),
            Expr::Not(x) => format!("!{}", self.operand(x)),
            Expr::IsFunction(x) => format!("typeof {} === \"function\"", self.operand(x)),
            Expr::Call { callee, this, args } => match this {
                Some(this) => {
                    let mut all = vec![self.expr(this)];
                    all.extend(args.iter().map(|a| self.expr(a)));
                    format!("{}.call({})", self.operand(callee), all.join(","))
                }
                None => format!("{}({})", self.operand(callee), self.list(args)),
            },
            Expr::Object(pairs) => {
                let body: Vec<String> = pairs
                    .iter()
                    .map(|(k, v)| format!("{}:{}", quote(k), self.expr(v)))
                    .collect();
                format!("{{{}}}", body.join(","))
            }
            Expr::Array(items) => format!("[{}]", self.list(items)),
            Expr::Program {
                index,
                block_params,
                pass_block_params,
                pass_depths,
            } => {
                let mut args = vec![index.to_string(), "data".to_string(), block_params.to_string()];
                if *pass_block_params {
                    args.push("blockParams".to_string());
                }
                if *pass_depths {
                    args.push("depths".to_string());
                }
                format!("container.program({})", args.join(", "))
            }
            Expr::Buffer => "buffer".to_string(),
            Expr::Concat(parts) => parts
                .iter()
                .map(|p| self.operand(p))
                .collect::<Vec<_>>()
                .join(" + "),
        }
    }
}

fn member(object: &str, name: &str) -> String {
    if is_identifier(name) {
        format!("{}.{}", object, name)
    } else {
        format!("{}[{}]", object, quote(name))
    }
}

fn literal(lit: &Literal) -> String {
    match lit {
        Literal::Undefined => "undefined".to_string(),
        Literal::Null => "null".to_string(),
        Literal::Bool(b) => b.to_string(),
        Literal::Number(n) => format_number(*n),
        Literal::String(s) => quote(s),
    }
}

fn runtime(f: RuntimeFn) -> &'static str {
    match f {
        RuntimeFn::EscapeExpression => "container.escapeExpression",
        RuntimeFn::Lambda => "container.lambda",
        RuntimeFn::Strict => "container.strict",
        RuntimeFn::Lookup => "container.lookup",
        RuntimeFn::InvokePartial => "container.invokePartial",
        RuntimeFn::Noop => "container.noop",
        RuntimeFn::NullContext => "container.nullContext",
    }
}

#[cfg(test)]
mod tests {
    use crate::bytecode::compile::compile_environment;
    use crate::codegen::generate::CodeGenerator;
    use crate::frontend;
    use crate::options::CompileOptions;

    fn source(src: &str) -> String {
        let options = CompileOptions::default();
        let program = frontend::parse(src, &options).unwrap();
        let config = options.resolve();
        let env = compile_environment(&program, &config).unwrap();
        CodeGenerator::generate(&env, &config).unwrap().to_source()
    }

    #[test]
    fn test_manifest_header() {
        let text = source("Hello");
        assert!(text.starts_with("{\"compiler\":[8,\">= 4.3.0\"],\"main\":function(container,depth0,helpers,partials,data) {"));
        assert!(text.contains("return \"Hello\";"));
        assert!(text.ends_with("\"useData\":true}"));
    }

    #[test]
    fn test_append_only_concatenation() {
        let text = source("Hello {{name}}!");
        assert!(text.contains("return \"Hello \" + container.escapeExpression("));
        assert!(text.contains("helpers.name"));
        assert!(text.contains(" + \"!\";"));
        assert!(text.contains("var helper;"));
    }

    #[test]
    fn test_shared_aliases_are_named() {
        let text = source("{{a}} {{b}}");
        assert!(text.contains("alias1=(depth0 != null) ? depth0 : "));
        assert!(text.contains("alias2=helpers.helperMissing"));
        assert!(text.contains("alias3=container.escapeExpression"));
        assert!(text.contains("alias3((helper = "));
    }

    #[test]
    fn test_buffer_and_child_program() {
        let text = source("{{#foo}}x{{/foo}} tail");
        assert!(text.contains("buffer = \"\""));
        assert!(text.contains("return buffer + \" tail\";"));
        assert!(text.contains("container.program(1, data, 0)"));
        assert!(text.contains("\"1\":function(container,depth0,helpers,partials,data) {"));
        assert!(text.contains("if (!helpers.foo) {"));
    }

    #[test]
    fn test_content_is_escaped_as_string_literal() {
        let text = source("say \"hi\"\nnow");
        assert!(text.contains(r#"return "say \"hi\"\nnow";"#));
    }

    #[test]
    fn test_decorator_function_printed() {
        let text = source("{{#*inline \"row\"}}x{{/inline}}");
        assert!(text.contains("\"main_d\":function(fn, props, container, depth0, data, blockParams, depths) {"));
        assert!(text.contains("fn = decorators.inline(fn,props,container,{\"name\":\"inline\""));
        assert!(text.contains("\"useDecorators\":true"));
    }
}
