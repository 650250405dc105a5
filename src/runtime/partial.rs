use std::rc::Rc;

use log::trace;

use crate::lang::value::{Function, Object, Value};
use crate::runtime::container::{create_frame, extend, is_noop, Container};
use crate::runtime::runtime_error::RuntimeError;
use crate::runtime::template::Template;

// =============================================================================
// PARTIALS - Resolution and invocation of `{{> name}}`
// =============================================================================

/// Entry point used by generated code: `invokePartial(partial, context, options)`.
pub(crate) fn invoke_partial(
    container: &Rc<Container>,
    partial: Value,
    context: Value,
    options: Value,
) -> Result<Value, RuntimeError> {
    let mut options: Object = options.as_object().cloned().unwrap_or_default();

    let hash = options.get("hash").cloned().unwrap_or_default();
    let context = if hash.is_truthy() {
        extend(&context, &hash)
    } else {
        context
    };

    let partial = resolve(partial, &mut options);
    let name = options
        .get("name")
        .map(Value::to_js_string)
        .unwrap_or_else(|| "(dynamic)".to_string());
    let _depth = container.registry.enter_partial(&name)?;
    trace!("invoking partial {}", name);

    let result = match invoke(partial, &context, &mut options, &name)? {
        Invoked::Rendered(result) => result,
        Invoked::Source(source) => {
            let compiled = container
                .registry
                .compile_partial(&source, &container.options)
                .map_err(|e| e.with_context(format!("compiling partial {}", name)))?;
            let template = Template::from_compiled(
                compiled,
                Rc::clone(&container.registry),
                container.options.clone(),
            );
            Value::String(template.call(context, &Value::Object(Rc::new(options.clone())))?)
        }
    }
    .to_js_string();

    let result = match options.get("indent").and_then(Value::as_str) {
        Some(indent) if !indent.is_empty() => indent_lines(&result, indent),
        _ => result,
    };
    Ok(Value::String(result))
}

/// Find the partial to run when the generated code could not: a missing
/// static partial falls back to the options' table (or the current partial
/// block for `@partial-block`), and a dynamic partial given as a string is a
/// name to look up.
fn resolve(partial: Value, options: &mut Object) -> Value {
    let name = options.get("name").cloned().unwrap_or_default();
    if !partial.is_truthy() {
        let name = name.to_js_string();
        if name == "@partial-block" {
            return field(options, "data").get("partial-block");
        }
        return field(options, "partials").get(&name);
    }
    if !matches!(partial, Value::Function(_)) && !name.is_truthy() {
        let name = partial.to_js_string();
        let found = field(options, "partials").get(&name);
        options.insert("name".into(), Value::String(name));
        return found;
    }
    partial
}

enum Invoked {
    Rendered(Value),
    /// Partial given as template text; compiled by the caller.
    Source(String),
}

fn invoke(
    partial: Value,
    context: &Value,
    options: &mut Object,
    name: &str,
) -> Result<Invoked, RuntimeError> {
    let current_block = field(options, "data").get("partial-block");
    options.insert("partial".into(), Value::Bool(true));

    let mut partial_block = None;
    if let Some(block) = field(options, "fn").as_function().filter(|f| !is_noop(f)) {
        let mut data = create_frame(&field(options, "data"));
        let wrapper = block_wrapper(block.clone(), current_block);
        data.insert("partial-block".into(), Value::Function(wrapper.clone()));
        options.insert("data".into(), Value::Object(Rc::new(data)));

        if let Some(inline) = &block.meta().partials {
            let merged = extend(&field(options, "partials"), &Value::Object(Rc::clone(inline)));
            options.insert("partials".into(), merged);
        }
        partial_block = Some(wrapper);
    }

    let partial = match (partial, partial_block) {
        (Value::Undefined, Some(block)) => Value::Function(block),
        (partial, _) => partial,
    };

    let options_value = Value::Object(Rc::new(options.clone()));
    match partial {
        Value::Function(f) => f
            .call(&Value::Undefined, &[context.clone(), options_value])
            .map(Invoked::Rendered)
            .map_err(|e| e.with_context(format!("partial {}", name))),
        Value::String(source) | Value::SafeString(source) => Ok(Invoked::Source(source)),
        Value::Undefined | Value::Null => Err(RuntimeError::missing_partial(name)),
        other => Err(RuntimeError::new(format!(
            "The partial {} is not a template: got {}",
            name,
            other.type_name()
        ))),
    }
}

/// `@partial-block` for the partial being entered. While the block runs the
/// enclosing partial block is restored, so nested partials see their own.
fn block_wrapper(block: Function, enclosing: Value) -> Function {
    Function::new(move |_this, args| {
        let context = args.first().cloned().unwrap_or_default();
        let mut options = args
            .get(1)
            .and_then(Value::as_object)
            .cloned()
            .unwrap_or_default();
        let mut data = create_frame(&field(&options, "data"));
        data.insert("partial-block".into(), enclosing.clone());
        options.insert("data".into(), Value::Object(Rc::new(data)));
        block.call(&Value::Undefined, &[context, Value::Object(Rc::new(options))])
    })
}

fn field(options: &Object, key: &str) -> Value {
    options.get(key).cloned().unwrap_or_default()
}

/// Prefix every line with `indent`, leaving a trailing empty line alone.
fn indent_lines(text: &str, indent: &str) -> String {
    let lines: Vec<&str> = text.split('\n').collect();
    let last = lines.len() - 1;
    lines
        .iter()
        .enumerate()
        .map(|(i, line)| {
            if i == last && line.is_empty() {
                String::new()
            } else {
                format!("{}{}", indent, line)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
