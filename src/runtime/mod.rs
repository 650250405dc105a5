//! # Runtime
//!
//! Executes generated templates. Every function of a `TemplateSpec` is
//! closure-compiled once (`eval`); rendering walks those closures against a
//! per-call `Container` holding the helper and partial tables.

pub mod container;
pub mod decorators;
pub mod eval;
pub mod helpers;
pub mod partial;
pub mod runtime_error;
pub mod template;
