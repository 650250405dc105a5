//! # Stencil
//!
//! A logic-less template compiler in two passes. Parsed templates are first
//! lowered to a tree of opcode environments (`bytecode`), then turned into
//! output functions by a code generator that models the operand stack at
//! compile time (`codegen`). The output is either a serializable
//! `TemplateSpec` or a live `Template` ready to render.
//!
//! ```text
//! source --parse--> Program --lower--> Environment --generate--> TemplateSpec
//!                                                                   |
//!                                                     closure compile v
//!                                                                Template
//! ```

pub mod bytecode;
pub mod codegen;
pub mod frontend;
pub mod lang;
pub mod options;
pub mod runtime;

use std::cell::OnceCell;
use std::rc::Rc;

use log::debug;

pub use crate::bytecode::compile::compile_environment;
pub use crate::bytecode::compile_error::{CompileError, InternalError};
pub use crate::bytecode::Environment;
pub use crate::codegen::{CodeGenerator, Generated, LoadError, Mode, TemplateSpec};
pub use crate::frontend::parser_error::ParseError;
pub use crate::lang::node::Program;
pub use crate::lang::value::{Function, Object, Value};
pub use crate::options::{CompileOptions, CompilerConfig};
pub use crate::runtime::container::{Container, Registry, RuntimeConfig};
pub use crate::runtime::decorators::{DecoratorFn, DecoratorProps, Props};
pub use crate::runtime::helpers::HelperOptions;
pub use crate::runtime::runtime_error::RuntimeError;
pub use crate::runtime::template::{RenderOptions, Template};

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Compile(#[from] CompileError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// What the compiler accepts: template text or an already parsed tree.
#[derive(Debug, Clone)]
pub enum TemplateInput {
    Source(String),
    Ast(Program),
}

impl From<&str> for TemplateInput {
    fn from(source: &str) -> Self {
        TemplateInput::Source(source.to_string())
    }
}

impl From<String> for TemplateInput {
    fn from(source: String) -> Self {
        TemplateInput::Source(source)
    }
}

impl From<Program> for TemplateInput {
    fn from(program: Program) -> Self {
        TemplateInput::Ast(program)
    }
}

impl TemplateInput {
    fn into_program(self, options: &CompileOptions) -> Result<Program, Error> {
        match self {
            TemplateInput::Source(source) => Ok(frontend::parse(&source, options)?),
            TemplateInput::Ast(program) => {
                if !program.block_params.is_empty() {
                    return Err(CompileError::invalid_input(
                        "a root program cannot declare block parameters",
                    )
                    .into());
                }
                Ok(program)
            }
        }
    }
}

/// Parse, lower and generate in one go.
pub(crate) fn precompile_source(
    source: &str,
    options: &CompileOptions,
) -> Result<TemplateSpec, Error> {
    let program = frontend::parse(source, options)?;
    generate_spec(&program, options)
}

fn generate_spec(program: &Program, options: &CompileOptions) -> Result<TemplateSpec, Error> {
    let config = options.resolve();
    let environment = compile_environment(program, &config)?;
    Ok(CodeGenerator::generate(&environment, &config)?)
}

// =============================================================================
// STENCIL - Registry-bound compiler front door
// =============================================================================

/// An environment of helpers, partials and decorators that templates compile
/// against.
pub struct Stencil {
    registry: Rc<Registry>,
}

impl Stencil {
    pub fn new() -> Self {
        Stencil {
            registry: Rc::new(Registry::new()),
        }
    }

    pub fn with_runtime_config(config: RuntimeConfig) -> Self {
        Stencil {
            registry: Rc::new(Registry::with_config(config)),
        }
    }

    pub fn registry(&self) -> &Rc<Registry> {
        &self.registry
    }

    pub fn register_helper(
        &self,
        name: &str,
        helper: impl Fn(&Value, &[Value]) -> Result<Value, RuntimeError> + 'static,
    ) {
        self.registry.register_helper(name, Function::new(helper));
    }

    /// Register partial source, compiled on first use.
    pub fn register_partial(&self, name: &str, source: &str) {
        self.registry.register_partial(name, Value::string(source));
    }

    pub fn register_partial_template(&self, name: &str, template: &Template) {
        self.registry
            .register_partial(name, Value::Function(template.as_function()));
    }

    pub fn register_decorator(
        &self,
        name: &str,
        decorator: impl Fn(Function, &Props, &Rc<Container>, &Value) -> Result<Option<Function>, RuntimeError>
        + 'static,
    ) {
        self.registry.register_decorator(name, Rc::new(decorator));
    }

    pub fn parse(&self, source: &str, options: &CompileOptions) -> Result<Program, Error> {
        Ok(frontend::parse(source, options)?)
    }

    /// Compile to a serializable manifest.
    pub fn precompile(
        &self,
        input: impl Into<TemplateInput>,
        options: &CompileOptions,
    ) -> Result<TemplateSpec, Error> {
        let program = input.into().into_program(options)?;
        generate_spec(&program, options)
    }

    /// Compile for rendering. The input is parsed now; lowering and code
    /// generation happen on the first render.
    pub fn compile(
        &self,
        input: impl Into<TemplateInput>,
        options: &CompileOptions,
    ) -> Result<CompiledTemplate, Error> {
        let program = input.into().into_program(options)?;
        Ok(CompiledTemplate {
            program,
            options: options.clone(),
            registry: Rc::clone(&self.registry),
            template: OnceCell::new(),
        })
    }

    /// Load a precompiled manifest.
    pub fn template(&self, spec: TemplateSpec) -> Result<Template, Error> {
        Ok(Template::load(
            spec,
            Rc::clone(&self.registry),
            CompileOptions::default(),
        )?)
    }

    /// Load a manifest produced with `options`, which are reused for
    /// compiling string partials at render time.
    pub fn template_with(
        &self,
        spec: TemplateSpec,
        options: &CompileOptions,
    ) -> Result<Template, Error> {
        Ok(Template::load(spec, Rc::clone(&self.registry), options.clone())?)
    }
}

impl Default for Stencil {
    fn default() -> Self {
        Self::new()
    }
}

/// A parsed template whose code is generated on first use.
pub struct CompiledTemplate {
    program: Program,
    options: CompileOptions,
    registry: Rc<Registry>,
    template: OnceCell<Template>,
}

impl CompiledTemplate {
    /// The live template, generating it if needed.
    pub fn template(&self) -> Result<&Template, Error> {
        if let Some(template) = self.template.get() {
            return Ok(template);
        }
        debug!("generating deferred template");
        let config = self.options.resolve();
        let environment = compile_environment(&self.program, &config)?;
        let generated = CodeGenerator::compile(
            &environment,
            &config,
            Mode::Live(Rc::clone(&self.registry)),
        )?;
        let template = match generated {
            Generated::Live(template) => template,
            Generated::Spec(spec) => {
                Template::new(spec, Rc::clone(&self.registry), self.options.clone())
            }
        };
        Ok(self.template.get_or_init(|| template))
    }

    pub fn render(&self, context: &Value) -> Result<String, Error> {
        Ok(self.template()?.render(context)?)
    }

    pub fn render_with(&self, context: &Value, options: RenderOptions) -> Result<String, Error> {
        Ok(self.template()?.render_with(context, options)?)
    }
}
