use std::collections::BTreeMap;
use std::fmt::Write;

use crate::bytecode::{Environment, Op, Opcode};

/// Print disassembly of an environment tree
pub fn print_environment(env: &Environment) {
    print!("{}", disassemble(env));
}

/// Disassemble an environment and its children into a string
pub fn disassemble(env: &Environment) -> String {
    let mut out = String::new();
    write_environment(&mut out, "main", env, 0);
    out
}

fn write_environment(out: &mut String, label: &str, env: &Environment, indent: usize) {
    let prefix = "  ".repeat(indent);

    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);
    let _ = writeln!(out, "{} {}", prefix, label);
    let _ = writeln!(
        out,
        "{} {} instructions{}",
        prefix,
        env.opcodes.len(),
        flags(env)
    );
    let _ = writeln!(out, "{}════════════════════════════════════════", prefix);

    for (ip, opcode) in env.opcodes.iter().enumerate() {
        let _ = writeln!(out, "{}{:04}  {}", prefix, ip, format_opcode(opcode));
    }
    let _ = writeln!(out);

    for (i, child) in env.children.iter().enumerate() {
        write_environment(out, &format!("{}/program[{}]", label, i), child, indent + 1);
    }
}

fn flags(env: &Environment) -> String {
    let mut flags = Vec::new();
    if env.is_simple {
        flags.push("simple".to_string());
    }
    if env.block_params > 0 {
        flags.push(format!("block_params={}", env.block_params));
    }
    for (set, name) in [
        (env.uses_partial, "partials"),
        (env.uses_depths, "depths"),
        (env.uses_decorators, "decorators"),
        (env.uses_block_params, "uses_block_params"),
        (env.uses_data, "data"),
    ] {
        if set {
            flags.push(name.to_string());
        }
    }
    if flags.is_empty() {
        String::new()
    } else {
        format!(" [{}]", flags.join(", "))
    }
}

fn format_parts(parts: &[String]) -> String {
    parts.join(".")
}

/// One-line rendering of an opcode with its operands and source position.
pub fn format_opcode(opcode: &Opcode) -> String {
    let name = opcode.op.name();
    let operands = match &opcode.op {
        Op::AppendContent(s) | Op::PushString(s) => format!("{:?}", s),
        Op::GetContext(depth) => depth.to_string(),
        Op::LookupOnContext {
            parts,
            falsy,
            strict,
            scoped,
        } => {
            let mut s = format_parts(parts);
            for (set, flag) in [(*falsy, " falsy"), (*strict, " strict"), (*scoped, " scoped")] {
                if set {
                    s.push_str(flag);
                }
            }
            s
        }
        Op::LookupBlockParam {
            depth,
            index,
            parts,
        } => format!("[{}][{}] {}", depth, index, format_parts(parts)),
        Op::LookupData {
            depth,
            parts,
            strict,
        } => format!(
            "@{} depth={}{}",
            format_parts(parts),
            depth,
            if *strict { " strict" } else { "" }
        ),
        Op::PushProgram(Some(i)) => format!("program[{}]", i),
        Op::PushProgram(None) => "-".to_string(),
        Op::EmptyHash { omit } => if *omit { "omit" } else { "{}" }.to_string(),
        Op::AssignToHash(key) => key.clone(),
        Op::PushLiteral(lit) => lit.to_string(),
        Op::InvokeHelper {
            params,
            name,
            simple,
        } => format!(
            "{} argc={}{}",
            name,
            params,
            if *simple { " simple" } else { "" }
        ),
        Op::InvokeKnownHelper { params, name } => format!("{} argc={}", name, params),
        Op::InvokeAmbiguous { name, helper_call } => format!(
            "{}{}",
            name,
            if *helper_call { " block" } else { "" }
        ),
        Op::BlockValue(name) => name.clone(),
        Op::InvokePartial {
            dynamic,
            name,
            indent,
        } => {
            let mut s = if *dynamic {
                "(dynamic)".to_string()
            } else {
                name.clone()
            };
            if !indent.is_empty() {
                s.push_str(&format!(" indent={:?}", indent));
            }
            s
        }
        Op::RegisterDecorator { params, name } => format!("{} argc={}", name, params),
        Op::Append
        | Op::AppendEscaped
        | Op::PushContext
        | Op::ResolvePossibleLambda
        | Op::PushHash
        | Op::PopHash
        | Op::AmbiguousBlockValue => String::new(),
    };

    let mut line = format!("{:<24}", name);
    if !operands.is_empty() {
        line.push(' ');
        line.push_str(&operands);
    }
    format!("{:<56} ; {}", line, opcode.span)
}

/// Opcode histogram over the whole tree, sorted by name.
pub fn op_counts(env: &Environment) -> BTreeMap<&'static str, usize> {
    let mut counts = BTreeMap::new();
    count_ops(env, &mut counts);
    counts
}

fn count_ops(env: &Environment, counts: &mut BTreeMap<&'static str, usize>) {
    for opcode in &env.opcodes {
        *counts.entry(opcode.op.name()).or_insert(0) += 1;
    }
    for child in &env.children {
        count_ops(child, counts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile::compile_environment;
    use crate::frontend;
    use crate::options::CompileOptions;

    fn lower(src: &str) -> Environment {
        let options = CompileOptions::default();
        let program = frontend::parse(src, &options).unwrap();
        compile_environment(&program, &options.resolve()).unwrap()
    }

    #[test]
    fn test_disassemble_lists_children() {
        let text = disassemble(&lower("{{#each items}}{{this}}{{/each}}"));
        assert!(text.contains("main"));
        assert!(text.contains("main/program[0]"));
        assert!(text.contains("invoke_known_helper"));
        assert!(text.contains("each argc=1"));
    }

    #[test]
    fn test_format_lookup() {
        let env = lower("{{a.b}}");
        let line = format_opcode(&env.opcodes[1]);
        assert!(line.starts_with("lookup_on_context"));
        assert!(line.contains("a.b strict"));
        assert!(line.contains("; 1:"));
    }

    #[test]
    fn test_op_counts() {
        let counts = op_counts(&lower("{{a}}{{b}}"));
        assert_eq!(counts.get("invoke_ambiguous"), Some(&2));
        assert_eq!(counts.get("append_escaped"), Some(&2));
    }
}
