use serde::{Deserialize, Serialize};

use crate::bytecode::Opcode;

/// One lowered program body and the bodies of the blocks nested in it.
///
/// `PushProgram(Some(i))` refers to `children[i]`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Environment {
    pub opcodes: Vec<Opcode>,
    pub children: Vec<Environment>,

    /// Exactly one top-level statement.
    pub is_simple: bool,
    /// Number of `as |..|` names the program declares.
    pub block_params: usize,

    pub uses_partial: bool,
    pub uses_depths: bool,
    pub uses_decorators: bool,
    pub uses_block_params: bool,
    pub uses_data: bool,
}

impl Environment {
    /// Total number of environments in this tree, including `self`.
    pub fn count(&self) -> usize {
        1 + self.children.iter().map(Environment::count).sum::<usize>()
    }
}

/// Structural equality: same opcodes with the same operands, and pairwise
/// equal children. Flags are derived from the opcodes and not compared.
impl PartialEq for Environment {
    fn eq(&self, other: &Self) -> bool {
        self.opcodes == other.opcodes && self.children == other.children
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Op;
    use crate::lang::node::Span;

    fn env(ops: Vec<Op>) -> Environment {
        Environment {
            opcodes: ops
                .into_iter()
                .map(|op| Opcode {
                    op,
                    span: Span::default(),
                })
                .collect(),
            ..Environment::default()
        }
    }

    #[test]
    fn test_equal_bodies() {
        let a = env(vec![Op::AppendContent("X".to_string())]);
        let mut b = env(vec![Op::AppendContent("X".to_string())]);
        b.block_params = 2;
        assert_eq!(a, b);
    }

    #[test]
    fn test_children_compared() {
        let mut a = env(vec![Op::PushProgram(Some(0))]);
        let mut b = a.clone();
        a.children.push(env(vec![Op::AppendContent("X".to_string())]));
        b.children.push(env(vec![Op::AppendContent("Y".to_string())]));
        assert_ne!(a, b);
        assert_eq!(a.count(), 2);
    }
}
