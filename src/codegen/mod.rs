pub mod generate;
pub mod ir;
pub mod source;
pub mod stack;

pub use generate::{CodeGenerator, Mode};
pub use ir::{Generated, LoadError, ProgramSpec, TemplateSpec};
