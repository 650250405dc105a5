//! # Template language data
//!
//! `node` is the syntax tree the parser produces and the lowering compiler
//! consumes. `value` is the dynamic data model templates render against.

pub mod node;
pub mod value;
