use std::cell::{Cell, RefCell};
use std::rc::Rc;

use log::{debug, warn};
use rustc_hash::FxHashMap;

use crate::lang::value::{Function, FunctionMeta, Object, Value};
use crate::options::CompileOptions;
use crate::runtime::decorators::{self, DecoratorFn, Props};
use crate::runtime::eval::{CompiledProgram, Frame};
use crate::runtime::helpers;
use crate::runtime::partial;
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::template::Compiled;

// =============================================================================
// REGISTRY - Helpers, partials and decorators shared by templates
// =============================================================================

/// Limits applied while rendering.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Deepest allowed nesting of partial invocations.
    pub max_partial_depth: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_partial_depth: 64,
        }
    }
}

pub struct Registry {
    helpers: RefCell<Object>,
    partials: RefCell<Object>,
    decorators: RefCell<FxHashMap<String, Rc<DecoratorFn>>>,
    /// Partials given as source text, compiled on first use per set of
    /// compile options.
    compiled_partials: RefCell<FxHashMap<(String, CompileOptions), Rc<Compiled>>>,
    config: RuntimeConfig,
    partial_depth: Cell<usize>,
}

impl Registry {
    /// A registry holding the built-in helpers and decorators.
    pub fn new() -> Self {
        Self::with_config(RuntimeConfig::default())
    }

    pub fn with_config(config: RuntimeConfig) -> Self {
        let registry = Registry {
            helpers: RefCell::new(Object::new()),
            partials: RefCell::new(Object::new()),
            decorators: RefCell::new(FxHashMap::default()),
            compiled_partials: RefCell::new(FxHashMap::default()),
            config,
            partial_depth: Cell::new(0),
        };
        helpers::register_builtins(&registry);
        decorators::register_builtins(&registry);
        registry
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn register_helper(&self, name: &str, helper: Function) {
        if self
            .helpers
            .borrow_mut()
            .insert(name.to_string(), Value::Function(helper))
            .is_some()
        {
            debug!("helper '{}' replaced", name);
        }
    }

    pub fn unregister_helper(&self, name: &str) {
        self.helpers.borrow_mut().shift_remove(name);
    }

    /// Register a partial: either template source (a string) or a function
    /// called with `(context, options)`.
    pub fn register_partial(&self, name: &str, partial: Value) {
        if self
            .partials
            .borrow_mut()
            .insert(name.to_string(), partial)
            .is_some()
        {
            warn!("partial '{}' registered twice, keeping the latest", name);
        }
    }

    pub fn unregister_partial(&self, name: &str) {
        self.partials.borrow_mut().shift_remove(name);
    }

    pub fn register_decorator(&self, name: &str, decorator: Rc<DecoratorFn>) {
        self.decorators
            .borrow_mut()
            .insert(name.to_string(), decorator);
    }

    pub fn decorator(&self, name: &str) -> Option<Rc<DecoratorFn>> {
        self.decorators.borrow().get(name).cloned()
    }

    pub fn has_helper(&self, name: &str) -> bool {
        self.helpers.borrow().contains_key(name)
    }

    pub fn has_partial(&self, name: &str) -> bool {
        self.partials.borrow().contains_key(name)
    }

    pub(crate) fn helpers_value(&self) -> Value {
        Value::Object(Rc::new(self.helpers.borrow().clone()))
    }

    pub(crate) fn partials_value(&self) -> Value {
        Value::Object(Rc::new(self.partials.borrow().clone()))
    }

    /// Compile partial source once per distinct text and options.
    pub(crate) fn compile_partial(
        &self,
        source: &str,
        options: &CompileOptions,
    ) -> Result<Rc<Compiled>, RuntimeError> {
        let key = (source.to_string(), options.clone());
        if let Some(compiled) = self.compiled_partials.borrow().get(&key) {
            return Ok(Rc::clone(compiled));
        }
        debug!("compiling partial source ({} bytes)", source.len());
        let spec = crate::precompile_source(source, options)
            .map_err(|e| RuntimeError::new(e.to_string()))?;
        let compiled = Rc::new(Compiled::new(&spec));
        self.compiled_partials
            .borrow_mut()
            .insert(key, Rc::clone(&compiled));
        Ok(compiled)
    }

    /// Track one level of partial nesting for as long as the guard lives.
    pub(crate) fn enter_partial(&self, name: &str) -> Result<DepthGuard<'_>, RuntimeError> {
        let depth = self.partial_depth.get() + 1;
        if depth > self.config.max_partial_depth {
            return Err(RuntimeError::new(format!(
                "maximum partial depth ({}) exceeded while invoking {}",
                self.config.max_partial_depth, name
            )));
        }
        self.partial_depth.set(depth);
        Ok(DepthGuard(&self.partial_depth))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct DepthGuard<'a>(&'a Cell<usize>);

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.0.set(self.0.get().saturating_sub(1));
    }
}

// =============================================================================
// CONTAINER - Per-render state handed to generated code
// =============================================================================

pub struct Container {
    pub(crate) compiled: Rc<Compiled>,
    pub(crate) registry: Rc<Registry>,
    pub(crate) options: CompileOptions,
    helpers: RefCell<Value>,
    partials: RefCell<Value>,
}

impl Container {
    pub(crate) fn new(
        compiled: Rc<Compiled>,
        registry: Rc<Registry>,
        options: CompileOptions,
        helpers: Value,
        partials: Value,
    ) -> Rc<Self> {
        Rc::new(Container {
            compiled,
            registry,
            options,
            helpers: RefCell::new(helpers),
            partials: RefCell::new(partials),
        })
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Rc<Self> {
        Container::new(
            Rc::new(Compiled::default()),
            Rc::new(Registry::new()),
            CompileOptions::default(),
            Value::Undefined,
            Value::Undefined,
        )
    }

    pub fn helpers(&self) -> Value {
        self.helpers.borrow().clone()
    }

    pub fn partials(&self) -> Value {
        self.partials.borrow().clone()
    }

    /// Swap the partial table, returning the previous one.
    pub fn replace_partials(&self, partials: Value) -> Value {
        self.partials.replace(partials)
    }

    /// Drop the tables so functions stored in them stop keeping this
    /// container alive.
    pub(crate) fn release(&self) {
        self.helpers.replace(Value::Undefined);
        self.partials.replace(Value::Undefined);
    }

    /// Wrap child program `index` into a callable `(context, options)`.
    pub fn program(
        self: &Rc<Self>,
        index: usize,
        data: Value,
        declared: usize,
        block_params: Value,
        depths: Value,
    ) -> Result<Function, RuntimeError> {
        let program = self
            .compiled
            .program(index)
            .ok_or_else(|| RuntimeError::new(format!("unknown program {}", index)))?;

        let container = Rc::clone(self);
        let (outer_data, outer_params, outer_depths) =
            (data.clone(), block_params.clone(), depths.clone());
        let prog = Function::new(move |_this, args| {
            let context = args.first().cloned().unwrap_or_default();
            let options = args.get(1).cloned().unwrap_or_default();

            let depths = match &outer_depths {
                Value::Array(list) if !list.first().is_some_and(|d| context.loose_eq(d)) => {
                    prepend(context.clone(), list)
                }
                other => other.clone(),
            };
            let data = match options.get("data") {
                d if d.is_truthy() => d,
                _ => outer_data.clone(),
            };
            let block_params = match &outer_params {
                Value::Array(list) => prepend(options.get("blockParams"), list),
                _ => Value::Undefined,
            };

            let program = container
                .compiled
                .program(index)
                .ok_or_else(|| RuntimeError::new(format!("unknown program {}", index)))?;
            let mut frame = Frame::new(
                Rc::clone(&container),
                context,
                container.helpers(),
                container.partials(),
                data,
                block_params,
                depths,
            );
            program.run(&mut frame)
        });

        let (prog, partials) = if program.has_decorators() {
            self.execute_decorators(program, prog, depths, data, block_params)?
        } else {
            (prog, None)
        };
        Ok(prog.with_meta(FunctionMeta {
            program: Some(index),
            block_params: declared,
            partials,
        }))
    }

    /// Run a function's decorators over `prog`. Returns the decorated
    /// function and the inline partials the decorators registered.
    pub(crate) fn execute_decorators(
        self: &Rc<Self>,
        program: &CompiledProgram,
        prog: Function,
        depths: Value,
        data: Value,
        block_params: Value,
    ) -> Result<(Function, Option<Rc<Object>>), RuntimeError> {
        let props = Props::default();
        let depth0 = depths.get("0");
        let mut frame = Frame::new(
            Rc::clone(self),
            depth0,
            Value::Undefined,
            Value::Undefined,
            data,
            block_params,
            depths,
        );
        let decorated = program.run_decorators(&mut frame, prog, &props)?;
        let partials = props.borrow().partials.clone().map(Rc::new);
        Ok((decorated, partials))
    }

    pub fn invoke_partial(
        self: &Rc<Self>,
        partial: Value,
        context: Value,
        options: Value,
    ) -> Result<Value, RuntimeError> {
        partial::invoke_partial(self, partial, context, options)
    }
}

// =============================================================================
// SUPPORT ROUTINES
// =============================================================================

thread_local! {
    static NOOP: Function = Function::new(|_, _| Ok(Value::string("")));
}

/// The shared empty program used when a block has no inverse or body.
pub fn noop() -> Function {
    NOOP.with(Function::clone)
}

pub fn is_noop(f: &Function) -> bool {
    NOOP.with(|noop| noop.ptr_eq(f))
}

/// HTML-escape a value for output. Safe strings pass through untouched,
/// `null` and `undefined` print nothing and other falsy values print as-is.
pub fn escape_expression(value: &Value) -> Value {
    match value {
        Value::SafeString(s) => Value::String(s.clone()),
        Value::String(s) => Value::String(escape_html(s)),
        v if v.is_nullish() => Value::string(""),
        v if !v.is_truthy() => Value::String(v.to_js_string()),
        v => Value::String(escape_html(&v.to_js_string())),
    }
}

pub fn escape_html(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#x27;"),
            '`' => out.push_str("&#x60;"),
            '=' => out.push_str("&#x3D;"),
            c => out.push(c),
        }
    }
    out
}

/// Call `value` with `context` as receiver when it is a function.
pub fn lambda(value: &Value, context: &Value) -> Result<Value, RuntimeError> {
    match value {
        Value::Function(f) => f.call(context, &[]),
        other => Ok(other.clone()),
    }
}

/// Property read that fails when the property is absent.
pub fn strict(object: &Value, name: &str) -> Result<Value, RuntimeError> {
    if !object.has(name) {
        return Err(RuntimeError::not_defined(name, &object.to_js_string()));
    }
    Ok(object.get(name))
}

/// First non-null `name` found walking the context stack outward.
pub fn lookup(depths: &Value, name: &str) -> Value {
    let Value::Array(list) = depths else {
        return Value::Undefined;
    };
    list.iter()
        .filter(|depth| depth.is_truthy())
        .map(|depth| depth.get(name))
        .find(|v| !v.is_nullish())
        .unwrap_or_default()
}

/// The data frame `depth` levels up the `_parent` chain.
pub fn data_frame(data: &Value, depth: usize) -> Value {
    let mut value = data.clone();
    for _ in 0..depth {
        if !value.is_truthy() {
            break;
        }
        value = value.get("_parent");
    }
    value
}

/// A child data frame inheriting every field of `parent`.
pub fn create_frame(parent: &Value) -> Object {
    let mut frame = parent.as_object().cloned().unwrap_or_default();
    frame.insert("_parent".to_string(), parent.clone());
    frame
}

/// Shallow merge: own properties of `base`, then those of `extra`.
pub fn extend(base: &Value, extra: &Value) -> Value {
    let mut merged = base.as_object().cloned().unwrap_or_default();
    if let Some(extra) = extra.as_object() {
        for (key, value) in extra {
            merged.insert(key.clone(), value.clone());
        }
    }
    Value::Object(Rc::new(merged))
}

fn prepend(first: Value, rest: &[Value]) -> Value {
    let mut items = Vec::with_capacity(rest.len() + 1);
    items.push(first);
    items.extend(rest.iter().cloned());
    Value::array(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_expression() {
        let escaped = escape_expression(&Value::string("<a href=\"x\">'&`</a>"));
        assert_eq!(
            escaped.to_js_string(),
            "&lt;a href&#x3D;&quot;x&quot;&gt;&#x27;&amp;&#x60;&lt;/a&gt;"
        );
        assert_eq!(escape_expression(&Value::Null).to_js_string(), "");
        assert_eq!(escape_expression(&Value::Undefined).to_js_string(), "");
        assert_eq!(escape_expression(&Value::Bool(false)).to_js_string(), "false");
        assert_eq!(escape_expression(&Value::Number(0.0)).to_js_string(), "0");
        assert_eq!(
            escape_expression(&Value::SafeString("<b>".into())).to_js_string(),
            "<b>"
        );
    }

    #[test]
    fn test_strict_reports_missing_name() {
        let obj = Value::object([("a", Value::Null)]);
        assert!(strict(&obj, "a").unwrap().is_nullish());
        let err = strict(&obj, "b").unwrap_err();
        assert_eq!(err.message, "\"b\" not defined in [object Object]");
    }

    #[test]
    fn test_lookup_walks_depths() {
        let depths = Value::array(vec![
            Value::object([("a", Value::Null)]),
            Value::Undefined,
            Value::object([("a", Value::string("outer"))]),
        ]);
        assert_eq!(lookup(&depths, "a").to_js_string(), "outer");
        assert!(lookup(&depths, "zzz").is_nullish());
    }

    #[test]
    fn test_data_frame_walks_parents() {
        let root = Value::object([("level", Value::string("root"))]);
        let child = Value::Object(Rc::new(create_frame(&root)));
        assert_eq!(data_frame(&child, 1).get("level").to_js_string(), "root");
        assert!(data_frame(&child, 3).is_nullish());
    }

    #[test]
    fn test_lambda_calls_functions_only() {
        let f = Value::function(|this, _| Ok(this.get("x")));
        let ctx = Value::object([("x", Value::Number(3.0))]);
        assert_eq!(lambda(&f, &ctx).unwrap().to_js_string(), "3");
        assert_eq!(lambda(&Value::Number(1.0), &ctx).unwrap().to_js_string(), "1");
    }

    #[test]
    fn test_noop_identity() {
        assert!(is_noop(&noop()));
        assert!(!is_noop(&Function::new(|_, _| Ok(Value::Undefined))));
    }

    #[test]
    fn test_partial_depth_guard() {
        let registry = Registry::with_config(RuntimeConfig {
            max_partial_depth: 1,
        });
        let outer = registry.enter_partial("a").unwrap();
        assert!(registry.enter_partial("b").is_err());
        drop(outer);
        assert!(registry.enter_partial("c").is_ok());
    }

    #[test]
    fn test_partial_cache_keyed_by_options() {
        let registry = Registry::new();
        let raw = CompileOptions {
            no_escape: true,
            ..CompileOptions::default()
        };
        let a = registry.compile_partial("{{s}}", &raw).unwrap();
        let b = registry.compile_partial("{{s}}", &CompileOptions::default()).unwrap();
        let c = registry.compile_partial("{{s}}", &raw).unwrap();
        assert!(!Rc::ptr_eq(&a, &b));
        assert!(Rc::ptr_eq(&a, &c));
    }

    #[test]
    fn test_builtins_registered() {
        let registry = Registry::new();
        for name in ["helperMissing", "blockHelperMissing", "each", "if", "unless", "with", "log", "lookup"] {
            assert!(registry.has_helper(name), "{} missing", name);
        }
        assert!(registry.decorator("inline").is_some());
    }
}
