use std::rc::Rc;

use log::Level;

use crate::lang::value::{Function, Object, Value};
use crate::runtime::container::{create_frame, Registry};
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// HELPERS - Options view and built-in helpers
// =============================================================================

/// Read-only view of the options object passed as a helper's last argument.
#[derive(Debug, Clone)]
pub struct HelperOptions {
    value: Value,
}

impl HelperOptions {
    pub fn new(value: &Value) -> Self {
        HelperOptions {
            value: value.clone(),
        }
    }

    /// Split helper arguments into positional parameters and options.
    pub fn split(args: &[Value]) -> (&[Value], HelperOptions) {
        match args.split_last() {
            Some((options, params)) => (params, HelperOptions::new(options)),
            None => (&[], HelperOptions::new(&Value::Undefined)),
        }
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn name(&self) -> String {
        self.value.get("name").to_js_string()
    }

    pub fn hash(&self) -> Value {
        self.value.get("hash")
    }

    pub fn hash_value(&self, key: &str) -> Value {
        self.hash().get(key)
    }

    pub fn data(&self) -> Value {
        self.value.get("data")
    }

    /// Positional arguments, present on decorator options only.
    pub fn args(&self) -> Vec<Value> {
        match self.value.get("args") {
            Value::Array(items) => items.as_ref().clone(),
            _ => Vec::new(),
        }
    }

    pub fn block_fn(&self) -> Option<Function> {
        self.value.get("fn").as_function().cloned()
    }

    pub fn inverse(&self) -> Option<Function> {
        self.value.get("inverse").as_function().cloned()
    }

    /// Render the block body against `context`.
    pub fn render_fn(&self, context: &Value) -> Result<Value, RuntimeError> {
        self.render_fn_with(context, None)
    }

    pub fn render_fn_with(
        &self,
        context: &Value,
        options: Option<Value>,
    ) -> Result<Value, RuntimeError> {
        let block = self
            .block_fn()
            .ok_or_else(|| RuntimeError::not_callable("options.fn"))?;
        call_block(&block, context, options)
    }

    /// Render the `{{else}}` section against `context`.
    pub fn render_inverse(&self, context: &Value) -> Result<Value, RuntimeError> {
        let inverse = self
            .inverse()
            .ok_or_else(|| RuntimeError::not_callable("options.inverse"))?;
        call_block(&inverse, context, None)
    }
}

fn call_block(block: &Function, context: &Value, options: Option<Value>) -> Result<Value, RuntimeError> {
    match options {
        Some(options) => block.call(&Value::Undefined, &[context.clone(), options]),
        None => block.call(&Value::Undefined, std::slice::from_ref(context)),
    }
}

pub(crate) fn register_builtins(registry: &Registry) {
    registry.register_helper("helperMissing", Function::new(helper_missing));
    registry.register_helper("blockHelperMissing", Function::new(block_helper_missing));
    registry.register_helper("each", Function::new(each));
    registry.register_helper("if", Function::new(if_helper));
    registry.register_helper("unless", Function::new(unless));
    registry.register_helper("with", Function::new(with));
    registry.register_helper("log", Function::new(log_helper));
    registry.register_helper("lookup", Function::new(lookup));
}

// =============================================================================
// FALLBACKS
// =============================================================================

/// Called for unknown helper names. Without parameters the mustache was a
/// plain lookup that found nothing, which renders empty.
fn helper_missing(_this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() <= 1 {
        return Ok(Value::Undefined);
    }
    let (_, options) = HelperOptions::split(args);
    Err(RuntimeError::missing_helper(&options.name()))
}

/// Block whose name resolved to data rather than a helper.
fn block_helper_missing(this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (params, options) = HelperOptions::split(args);
    let context = params.first().cloned().unwrap_or_default();
    match &context {
        Value::Bool(true) => options.render_fn(this),
        Value::Bool(false) | Value::Undefined | Value::Null => options.render_inverse(this),
        Value::Array(items) => {
            if items.is_empty() {
                options.render_inverse(this)
            } else {
                each(this, args)
            }
        }
        _ => options.render_fn_with(&context, Some(options.as_value().clone())),
    }
}

// =============================================================================
// ITERATION
// =============================================================================

fn each(this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() < 2 {
        return Err(RuntimeError::new("Must pass iterator to #each"));
    }
    let (params, options) = HelperOptions::split(args);
    let block = options
        .block_fn()
        .ok_or_else(|| RuntimeError::not_callable("options.fn"))?;

    let mut context = params[0].clone();
    if let Value::Function(f) = &context {
        context = f.call(this, &[])?;
    }

    let base = options.data();
    let frame = base.is_truthy().then(|| create_frame(&base));

    let entries: Vec<(Value, Value)> = match &context {
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, v)| (Value::Number(i as f64), v.clone()))
            .collect(),
        Value::Object(map) => map
            .iter()
            .map(|(k, v)| (Value::string(k.clone()), v.clone()))
            .collect(),
        _ => Vec::new(),
    };

    let count = entries.len();
    let mut out = String::new();
    for (index, (key, value)) in entries.into_iter().enumerate() {
        let data = match &frame {
            Some(frame) => {
                let mut data: Object = frame.clone();
                data.insert("key".into(), key.clone());
                data.insert("index".into(), Value::Number(index as f64));
                data.insert("first".into(), Value::Bool(index == 0));
                data.insert("last".into(), Value::Bool(index + 1 == count));
                Value::Object(Rc::new(data))
            }
            None => Value::Undefined,
        };
        let iteration = Value::object([
            ("data", data),
            ("blockParams", Value::array(vec![value.clone(), key])),
        ]);
        out.push_str(&call_block(&block, &value, Some(iteration))?.to_js_string());
    }

    if count == 0 {
        return options.render_inverse(this);
    }
    Ok(Value::String(out))
}

// =============================================================================
// CONDITIONALS
// =============================================================================

fn if_helper(this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new("#if requires exactly one argument"));
    }
    let (params, options) = HelperOptions::split(args);
    conditional(this, &params[0], options, false)
}

fn unless(this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new("#unless requires exactly one argument"));
    }
    let (params, options) = HelperOptions::split(args);
    conditional(this, &params[0], options, true)
}

fn conditional(
    this: &Value,
    condition: &Value,
    options: HelperOptions,
    negate: bool,
) -> Result<Value, RuntimeError> {
    let condition = match condition {
        Value::Function(f) => f.call(this, &[])?,
        other => other.clone(),
    };
    let include_zero = options.hash_value("includeZero").is_truthy();
    let falsy = (!include_zero && !condition.is_truthy()) || condition.is_empty();
    if falsy != negate {
        options.render_inverse(this)
    } else {
        options.render_fn(this)
    }
}

fn with(this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    if args.len() != 2 {
        return Err(RuntimeError::new("#with requires exactly one argument"));
    }
    let (params, options) = HelperOptions::split(args);
    let context = match &params[0] {
        Value::Function(f) => f.call(this, &[])?,
        other => other.clone(),
    };
    if context.is_empty() {
        return options.render_inverse(this);
    }
    let block_options = Value::object([
        ("data", options.data()),
        ("blockParams", Value::array(vec![context.clone()])),
    ]);
    options.render_fn_with(&context, Some(block_options))
}

// =============================================================================
// UTILITIES
// =============================================================================

/// `{{log a b level="warn"}}` forwards its parameters to the `log` facade.
fn log_helper(_this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (params, options) = HelperOptions::split(args);
    let mut level = options.hash_value("level");
    if level.is_nullish() {
        level = options.data().get("level");
    }
    let level = log_level(&level);
    let message = params
        .iter()
        .map(Value::to_js_string)
        .collect::<Vec<_>>()
        .join(" ");
    log::log!(target: "stencil::template", level, "{}", message);
    Ok(Value::Undefined)
}

fn log_level(level: &Value) -> Level {
    let index = match level {
        Value::Number(n) => *n as i64,
        Value::String(s) => match s.to_ascii_lowercase().as_str() {
            "debug" => 0,
            "info" => 1,
            "warn" => 2,
            "error" => 3,
            other => other.parse().unwrap_or(1),
        },
        _ => 1,
    };
    match index {
        i if i <= 0 => Level::Debug,
        1 => Level::Info,
        2 => Level::Warn,
        _ => Level::Error,
    }
}

fn lookup(_this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
    let (params, _) = HelperOptions::split(args);
    let object = params.first().cloned().unwrap_or_default();
    if !object.is_truthy() {
        return Ok(object);
    }
    let field = params.get(1).cloned().unwrap_or_default();
    Ok(object.get(&field.to_js_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(render: impl Fn(&Value, &[Value]) -> String + 'static) -> Value {
        Value::function(move |this, args| Ok(Value::String(render(this, args))))
    }

    fn block_options() -> Value {
        Value::object([
            ("name", Value::string("test")),
            ("hash", Value::object::<&str>([])),
            ("fn", block(|_, args| format!("fn({})", args[0].to_js_string()))),
            ("inverse", block(|_, args| format!("inverse({})", args[0].to_js_string()))),
            ("data", Value::object([("root", Value::Null)])),
        ])
    }

    #[test]
    fn test_helper_missing() {
        assert!(helper_missing(&Value::Undefined, &[block_options()])
            .unwrap()
            .is_nullish());
        let err = helper_missing(&Value::Undefined, &[Value::Number(1.0), block_options()]).unwrap_err();
        assert_eq!(err.message, "Missing helper: \"test\"");
    }

    #[test]
    fn test_if_and_unless() {
        let this = Value::string("ctx");
        let r = if_helper(&this, &[Value::Number(0.0), block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "inverse(ctx)");
        let r = if_helper(&this, &[Value::string("yes"), block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "fn(ctx)");
        let r = unless(&this, &[Value::array(vec![]), block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "fn(ctx)");
        assert!(if_helper(&this, &[block_options()]).is_err());
    }

    #[test]
    fn test_if_include_zero() {
        let options = Value::object([
            ("hash", Value::object([("includeZero", Value::Bool(true))])),
            ("fn", block(|_, _| "fn".to_string())),
            ("inverse", block(|_, _| "inverse".to_string())),
        ]);
        let r = if_helper(&Value::Undefined, &[Value::Number(0.0), options]).unwrap();
        assert_eq!(r.to_js_string(), "fn");
    }

    #[test]
    fn test_each_array_sets_data_and_block_params() {
        let options = Value::object([
            (
                "fn",
                block(|_, args| {
                    let opts = &args[1];
                    format!(
                        "{}:{}:{}:{}|",
                        args[0].to_js_string(),
                        opts.get("data").get("index").to_js_string(),
                        opts.get("data").get("last").to_js_string(),
                        opts.get("blockParams").get("1").to_js_string(),
                    )
                }),
            ),
            ("inverse", block(|_, _| "empty".to_string())),
            ("data", Value::object::<&str>([])),
        ]);
        let list = Value::array(vec![Value::string("a"), Value::string("b")]);
        let r = each(&Value::Undefined, &[list, options.clone()]).unwrap();
        assert_eq!(r.to_js_string(), "a:0:false:0|b:1:true:1|");

        let r = each(&Value::Undefined, &[Value::array(vec![]), options]).unwrap();
        assert_eq!(r.to_js_string(), "empty");
    }

    #[test]
    fn test_each_object_keys() {
        let options = Value::object([
            ("fn", block(|_, args| format!("{}={};", args[1].get("data").get("key").to_js_string(), args[0].to_js_string()))),
            ("inverse", block(|_, _| String::new())),
            ("data", Value::object::<&str>([])),
        ]);
        let obj = Value::object([("x", Value::Number(1.0)), ("y", Value::Number(2.0))]);
        assert_eq!(each(&Value::Undefined, &[obj, options]).unwrap().to_js_string(), "x=1;y=2;");
    }

    #[test]
    fn test_each_requires_iterator() {
        let err = each(&Value::Undefined, &[block_options()]).unwrap_err();
        assert_eq!(err.message, "Must pass iterator to #each");
    }

    #[test]
    fn test_with_switches_context() {
        let ctx = Value::object([("a", Value::Number(1.0))]);
        let r = with(&Value::Undefined, &[ctx, block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "fn([object Object])");
        let r = with(&Value::string("this"), &[Value::Null, block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "inverse(this)");
    }

    #[test]
    fn test_block_helper_missing_dispatch() {
        let this = Value::string("t");
        let r = block_helper_missing(&this, &[Value::Bool(true), block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "fn(t)");
        let r = block_helper_missing(&this, &[Value::Null, block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "inverse(t)");
        let r = block_helper_missing(&this, &[Value::string("v"), block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "fn(v)");
    }

    #[test]
    fn test_lookup_helper() {
        let obj = Value::object([("k", Value::string("v"))]);
        let r = lookup(&Value::Undefined, &[obj, Value::string("k"), block_options()]).unwrap();
        assert_eq!(r.to_js_string(), "v");
        let r = lookup(&Value::Undefined, &[Value::Null, Value::string("k"), block_options()]).unwrap();
        assert!(r.is_nullish());
    }

    #[test]
    fn test_log_levels() {
        assert_eq!(log_level(&Value::string("WARN")), Level::Warn);
        assert_eq!(log_level(&Value::Number(3.0)), Level::Error);
        assert_eq!(log_level(&Value::Undefined), Level::Info);
    }
}
