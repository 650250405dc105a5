use crate::bytecode::{Environment, Op, Opcode};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("stack-check error: {message}")]
pub struct StackCheckError {
    pub message: String,
}

impl StackCheckError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Returns (pops, pushes) for an op.
///
/// Hash construction is modelled as ordinary pushes: `PushHash` only opens a
/// side table, each `AssignToHash` consumes one value and `PopHash` yields the
/// finished hash.
pub fn effect(op: &Op) -> (usize, usize) {
    use Op::*;
    match op {
        AppendContent(_) | GetContext(_) | PushHash => (0, 0),
        Append | AppendEscaped | AssignToHash(_) => (1, 0),

        PushContext
        | LookupOnContext { .. }
        | LookupBlockParam { .. }
        | LookupData { .. }
        | PushProgram(_)
        | EmptyHash { .. }
        | PopHash
        | PushString(_)
        | PushLiteral(_) => (0, 1),

        ResolvePossibleLambda => (1, 1),

        // params, program, inverse, hash and the resolved helper value
        InvokeHelper { params, .. } => (params + 4, 1),
        InvokeKnownHelper { params, .. } => (params + 3, 1),
        // program, inverse, value
        InvokeAmbiguous { .. } => (3, 1),
        // value, program, inverse, hash
        BlockValue(_) | AmbiguousBlockValue => (4, 1),
        InvokePartial { dynamic, .. } => (if *dynamic { 5 } else { 4 }, 1),
        RegisterDecorator { params, .. } => (params + 3, 0),
    }
}

/// Check that an opcode stream never underflows and leaves nothing behind.
pub fn check_ops(ops: &[Opcode]) -> Result<(), StackCheckError> {
    let mut h: usize = 0;
    let mut open_hashes: usize = 0;

    for (ip, opcode) in ops.iter().enumerate() {
        let (pops, pushes) = effect(&opcode.op);
        if h < pops {
            return Err(StackCheckError::new(format!(
                "stack underflow at ip={}, op={}, needed {} items, had {}",
                ip,
                opcode.op.name(),
                pops,
                h
            )));
        }
        h = h - pops + pushes;

        match opcode.op {
            Op::PushHash => open_hashes += 1,
            Op::PopHash | Op::AssignToHash(_) if open_hashes == 0 => {
                return Err(StackCheckError::new(format!(
                    "{} without open hash at ip={}",
                    opcode.op.name(),
                    ip
                )));
            }
            Op::PopHash => open_hashes -= 1,
            _ => {}
        }
    }

    if h != 0 || open_hashes != 0 {
        return Err(StackCheckError::new(format!(
            "{} values and {} hashes left at end of program",
            h, open_hashes
        )));
    }
    Ok(())
}

/// Check an environment and all of its children.
pub fn check_environment(env: &Environment) -> Result<(), StackCheckError> {
    check_ops(&env.opcodes)?;
    for (i, child) in env.children.iter().enumerate() {
        check_environment(child)
            .map_err(|e| StackCheckError::new(format!("in child {}: {}", i, e.message)))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lang::node::Span;

    fn ops(ops: Vec<Op>) -> Vec<Opcode> {
        ops.into_iter()
            .map(|op| Opcode {
                op,
                span: Span::default(),
            })
            .collect()
    }

    #[test]
    fn test_simple_mustache_balances() {
        let stream = ops(vec![
            Op::GetContext(0),
            Op::LookupOnContext {
                parts: vec!["name".to_string()],
                falsy: false,
                strict: true,
                scoped: false,
            },
            Op::ResolvePossibleLambda,
            Op::AppendEscaped,
        ]);
        assert!(check_ops(&stream).is_ok());
    }

    #[test]
    fn test_underflow() {
        let result = check_ops(&ops(vec![Op::Append]));
        assert!(result.unwrap_err().message.contains("underflow"));
    }

    #[test]
    fn test_leftover_value() {
        let result = check_ops(&ops(vec![Op::PushString("x".to_string())]));
        assert!(result.unwrap_err().message.contains("left"));
    }

    #[test]
    fn test_hash_assignments() {
        let stream = ops(vec![
            Op::PushHash,
            Op::PushString("a".to_string()),
            Op::PushString("b".to_string()),
            Op::AssignToHash("y".to_string()),
            Op::AssignToHash("x".to_string()),
            Op::PopHash,
            Op::PushProgram(None),
            Op::PushProgram(None),
            Op::RegisterDecorator {
                params: 0,
                name: "d".to_string(),
            },
        ]);
        assert!(check_ops(&stream).is_ok());
    }

    #[test]
    fn test_assign_without_hash() {
        let stream = ops(vec![
            Op::PushString("a".to_string()),
            Op::AssignToHash("x".to_string()),
        ]);
        assert!(check_ops(&stream).is_err());
    }

    #[test]
    fn test_helper_call_effect() {
        let stream = ops(vec![
            Op::PushString("p".to_string()),
            Op::PushProgram(None),
            Op::PushProgram(None),
            Op::EmptyHash { omit: false },
            Op::InvokeKnownHelper {
                params: 1,
                name: "if".to_string(),
            },
            Op::Append,
        ]);
        assert!(check_ops(&stream).is_ok());
    }
}
