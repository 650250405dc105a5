use std::rc::{Rc, Weak};

use log::debug;

use crate::codegen::ir::{SpecFlags, TemplateSpec};
use crate::codegen::LoadError;
use crate::lang::value::{Function, Object, Value};
use crate::options::CompileOptions;
use crate::runtime::container::{create_frame, extend, Container, Registry};
use crate::runtime::eval::{CompiledProgram, Frame};
use crate::runtime::runtime_error::RuntimeError;

/// Closure-compiled form of a `TemplateSpec`.
#[derive(Default)]
pub(crate) struct Compiled {
    pub flags: SpecFlags,
    pub main: Option<CompiledProgram>,
    pub programs: Vec<Option<CompiledProgram>>,
}

impl Compiled {
    pub fn new(spec: &TemplateSpec) -> Self {
        Compiled {
            flags: spec.flags.clone(),
            main: Some(CompiledProgram::compile(&spec.main)),
            programs: spec
                .programs
                .iter()
                .map(|p| p.as_ref().map(CompiledProgram::compile))
                .collect(),
        }
    }

    pub fn program(&self, index: usize) -> Option<&CompiledProgram> {
        self.programs.get(index).and_then(Option::as_ref)
    }
}

/// Per-call overrides for `Template::render_with`.
#[derive(Debug, Clone, Default)]
pub struct RenderOptions {
    /// Initial `@data`. `@root` is added when missing.
    pub data: Option<Value>,
    /// Helpers layered over the registry's for this call.
    pub helpers: Object,
    /// Partials layered over the registry's for this call.
    pub partials: Object,
}

/// A template ready to render.
#[derive(Clone)]
pub struct Template {
    compiled: Rc<Compiled>,
    registry: Rc<Registry>,
    options: CompileOptions,
}

impl Template {
    pub fn new(spec: TemplateSpec, registry: Rc<Registry>, options: CompileOptions) -> Self {
        debug!(
            "loading template with {} child programs",
            spec.programs.iter().flatten().count()
        );
        Self::from_compiled(Rc::new(Compiled::new(&spec)), registry, options)
    }

    /// Load a precompiled manifest, refusing other compiler revisions.
    pub fn load(
        spec: TemplateSpec,
        registry: Rc<Registry>,
        options: CompileOptions,
    ) -> Result<Self, LoadError> {
        spec.check_revision()?;
        Ok(Self::new(spec, registry, options))
    }

    pub(crate) fn from_compiled(
        compiled: Rc<Compiled>,
        registry: Rc<Registry>,
        options: CompileOptions,
    ) -> Self {
        Template {
            compiled,
            registry,
            options,
        }
    }

    pub fn flags(&self) -> &SpecFlags {
        &self.compiled.flags
    }

    pub fn render(&self, context: &Value) -> Result<String, RuntimeError> {
        self.render_with(context, RenderOptions::default())
    }

    pub fn render_with(
        &self,
        context: &Value,
        options: RenderOptions,
    ) -> Result<String, RuntimeError> {
        let options = Value::object([
            ("data", options.data.unwrap_or_default()),
            ("helpers", Value::Object(Rc::new(options.helpers))),
            ("partials", Value::Object(Rc::new(options.partials))),
        ]);
        self.call(context.clone(), &options)
    }

    /// The template as a `(context, options)` function, usable as a partial
    /// or helper. It does not keep the registry alive.
    pub fn as_function(&self) -> Function {
        let compiled = Rc::clone(&self.compiled);
        let registry: Weak<Registry> = Rc::downgrade(&self.registry);
        let options = self.options.clone();
        Function::new(move |_this, args| {
            let registry = registry
                .upgrade()
                .ok_or_else(|| RuntimeError::new("template registry was dropped"))?;
            let template = Template::from_compiled(Rc::clone(&compiled), registry, options.clone());
            let context = args.first().cloned().unwrap_or_default();
            let call_options = args.get(1).cloned().unwrap_or_default();
            template.call(context, &call_options).map(Value::String)
        })
    }

    /// Run the main program. Outside of partial calls the registry's helpers
    /// and partials are merged under the per-call ones and `@root` is set.
    pub(crate) fn call(&self, context: Value, options: &Value) -> Result<String, RuntimeError> {
        let flags = &self.compiled.flags;
        let is_partial = options.get("partial").is_truthy();

        let (helpers, partials) = if is_partial {
            (options.get("helpers"), options.get("partials"))
        } else {
            (
                extend(&self.registry.helpers_value(), &options.get("helpers")),
                extend(&self.registry.partials_value(), &options.get("partials")),
            )
        };
        let container = Container::new(
            Rc::clone(&self.compiled),
            Rc::clone(&self.registry),
            self.options.clone(),
            helpers,
            partials,
        );

        let mut data = options.get("data");
        if !is_partial && flags.use_data {
            data = init_data(&context, data);
        }
        let block_params = if flags.use_block_params {
            Value::array(Vec::new())
        } else {
            Value::Undefined
        };
        let outer_depths = options.get("depths");
        let depths = if flags.use_depths {
            match &outer_depths {
                Value::Array(list) if !list.first().is_some_and(|d| context.loose_eq(d)) => {
                    let mut items = vec![context.clone()];
                    items.extend(list.iter().cloned());
                    Value::array(items)
                }
                Value::Array(_) => outer_depths.clone(),
                _ => Value::array(vec![context.clone()]),
            }
        } else {
            Value::Undefined
        };

        let result = self.run_main(&container, context, options, data, block_params, depths, outer_depths);
        container.release();
        Ok(result?.to_js_string())
    }

    #[allow(clippy::too_many_arguments)]
    fn run_main(
        &self,
        container: &Rc<Container>,
        context: Value,
        options: &Value,
        data: Value,
        block_params: Value,
        depths: Value,
        outer_depths: Value,
    ) -> Result<Value, RuntimeError> {
        let main = self
            .compiled
            .main
            .as_ref()
            .ok_or_else(|| RuntimeError::new("template has no main program"))?;

        if !main.has_decorators() {
            let mut frame = Frame::new(
                Rc::clone(container),
                context,
                container.helpers(),
                container.partials(),
                data,
                block_params,
                depths,
            );
            return main.run(&mut frame);
        }

        let entry = {
            let container = Rc::clone(container);
            let (data, block_params, depths) = (data.clone(), block_params.clone(), depths);
            Function::new(move |_this, args| {
                let main = container
                    .compiled
                    .main
                    .as_ref()
                    .ok_or_else(|| RuntimeError::new("template has no main program"))?;
                let mut frame = Frame::new(
                    Rc::clone(&container),
                    args.first().cloned().unwrap_or_default(),
                    container.helpers(),
                    container.partials(),
                    data.clone(),
                    block_params.clone(),
                    depths.clone(),
                );
                main.run(&mut frame)
            })
        };
        let decorator_depths = match outer_depths {
            depths @ Value::Array(_) => depths,
            _ => Value::array(Vec::new()),
        };
        let (decorated, _) =
            container.execute_decorators(main, entry, decorator_depths, data, block_params)?;
        decorated.call(&Value::Undefined, &[context, options.clone()])
    }
}

/// `@root` for a top-level call: keep caller data that already has one,
/// otherwise derive a frame from it and point `root` at the context.
fn init_data(context: &Value, data: Value) -> Value {
    if data.is_truthy() && data.has("root") {
        return data;
    }
    let mut frame = if data.is_truthy() {
        create_frame(&data)
    } else {
        Object::new()
    };
    frame.insert("root".into(), context.clone());
    Value::Object(Rc::new(frame))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Literal;
    use crate::codegen::ir::{
        Expr, ProgramSpec, Stmt, COMPILER_REVISION, REVISION_VERSIONS,
    };

    fn spec(main: ProgramSpec) -> TemplateSpec {
        TemplateSpec {
            compiler: (COMPILER_REVISION, REVISION_VERSIONS.to_string()),
            main,
            programs: Vec::new(),
            flags: SpecFlags::default(),
        }
    }

    #[test]
    fn test_render_simple_spec() {
        let main = ProgramSpec {
            body: vec![Stmt::Return(Expr::Concat(vec![
                Expr::string("Hi "),
                Expr::Context(0).member("who"),
            ]))],
            ..ProgramSpec::default()
        };
        let template = Template::new(spec(main), Rc::new(Registry::new()), CompileOptions::default());
        let out = template
            .render(&Value::object([("who", Value::string("there"))]))
            .unwrap();
        assert_eq!(out, "Hi there");
    }

    #[test]
    fn test_empty_main_renders_undefined_as_text() {
        let template = Template::new(
            spec(ProgramSpec::default()),
            Rc::new(Registry::new()),
            CompileOptions::default(),
        );
        assert_eq!(template.render(&Value::Null).unwrap(), "undefined");
    }

    #[test]
    fn test_load_rejects_old_revision() {
        let mut old = spec(ProgramSpec::default());
        old.compiler.0 = 7;
        let err = Template::load(old, Rc::new(Registry::new()), CompileOptions::default())
            .err()
            .unwrap();
        assert!(matches!(err, LoadError::RevisionMismatch { found: 7, .. }));
    }

    #[test]
    fn test_init_data_sets_root_once() {
        let ctx = Value::string("ctx");
        let data = init_data(&ctx, Value::Undefined);
        assert_eq!(data.get("root").to_js_string(), "ctx");

        let with_root = Value::object([("root", Value::string("kept"))]);
        let data = init_data(&ctx, with_root);
        assert_eq!(data.get("root").to_js_string(), "kept");

        let caller = Value::object([("user", Value::string("ann"))]);
        let data = init_data(&ctx, caller.clone());
        assert_eq!(data.get("user").to_js_string(), "ann");
        assert!(data.get("_parent").loose_eq(&caller));
    }

    #[test]
    fn test_render_options_override_helpers() {
        let main = ProgramSpec {
            body: vec![Stmt::Return(Expr::call(
                Expr::Param(crate::codegen::ir::Param::Helpers).member("shout"),
                None,
                vec![Expr::Lit(Literal::String("x".into()))],
            ))],
            ..ProgramSpec::default()
        };
        let template = Template::new(spec(main), Rc::new(Registry::new()), CompileOptions::default());
        let mut helpers = Object::new();
        helpers.insert(
            "shout".into(),
            Value::function(|_, args| Ok(Value::string(args[0].to_js_string().to_uppercase()))),
        );
        let out = template
            .render_with(
                &Value::Null,
                RenderOptions {
                    helpers,
                    ..RenderOptions::default()
                },
            )
            .unwrap();
        assert_eq!(out, "X");
    }
}
