pub mod compile;
pub mod compile_error;
pub mod disasm;
pub mod ir;
pub mod op;
pub mod stack_check;

pub use ir::Environment;
pub use op::{Literal, Op, Opcode};
