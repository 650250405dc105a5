use std::cell::RefCell;
use std::rc::Rc;

use crate::lang::value::{Function, Object, Value};
use crate::runtime::container::{extend, Container, Registry};
use crate::runtime::helpers::HelperOptions;
use crate::runtime::runtime_error::RuntimeError;

/// State shared by the decorators of one wrapped function.
#[derive(Debug, Default)]
pub struct DecoratorProps {
    /// Inline partials declared inside the decorated program.
    pub partials: Option<Object>,
}

pub type Props = Rc<RefCell<DecoratorProps>>;

/// `(fn, props, container, options) -> replacement`. Returning `None` keeps
/// `fn` as it is.
pub type DecoratorFn =
    dyn Fn(Function, &Props, &Rc<Container>, &Value) -> Result<Option<Function>, RuntimeError>;

pub(crate) fn register_builtins(registry: &Registry) {
    registry.register_decorator("inline", Rc::new(inline));
}

/// `{{#*inline "name"}}...{{/inline}}`: record the block as a partial visible
/// to the decorated program.
///
/// The first inline decorator on a function installs a wrapper that overlays
/// the recorded partials on the container's table for the duration of each
/// call.
fn inline(
    prog: Function,
    props: &Props,
    container: &Rc<Container>,
    options: &Value,
) -> Result<Option<Function>, RuntimeError> {
    let options = HelperOptions::new(options);
    let name = options
        .args()
        .first()
        .map(Value::to_js_string)
        .ok_or_else(|| RuntimeError::new("inline decorator requires a partial name"))?;
    let block = options.block_fn().unwrap_or_else(crate::runtime::container::noop);

    let mut replacement = None;
    let mut state = props.borrow_mut();
    if state.partials.is_none() {
        state.partials = Some(Object::new());
        let props = Rc::clone(props);
        let container = Rc::clone(container);
        replacement = Some(Function::new(move |this, args| {
            let declared = Value::Object(Rc::new(
                props.borrow().partials.clone().unwrap_or_default(),
            ));
            let original = container.replace_partials(extend(&container.partials(), &declared));
            let result = prog.call(this, args);
            container.replace_partials(original);
            result
        }));
    }
    if let Some(partials) = state.partials.as_mut() {
        partials.insert(name, Value::Function(block));
    }
    Ok(replacement)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(name: &str, block: Function) -> Value {
        Value::object([
            ("args", Value::array(vec![Value::string(name)])),
            ("fn", Value::Function(block)),
        ])
    }

    #[test]
    fn test_first_inline_wraps_later_ones_extend() {
        let container = Container::detached();
        let props = Props::default();
        let prog = Function::new(|_, _| Ok(Value::string("body")));
        let block = Function::new(|_, _| Ok(Value::string("inline")));

        let first = inline(prog, &props, &container, &options("a", block.clone())).unwrap();
        assert!(first.is_some());
        let second = inline(
            first.clone().unwrap(),
            &props,
            &container,
            &options("b", block),
        )
        .unwrap();
        assert!(second.is_none());

        let recorded = props.borrow().partials.clone().unwrap();
        assert_eq!(recorded.keys().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    fn test_wrapper_overlays_partials_during_call() {
        let container = Container::detached();
        container.replace_partials(Value::object([("base", Value::string("x"))]));
        let props = Props::default();
        let seen = Rc::new(RefCell::new(Value::Undefined));
        let probe = {
            let container = Rc::clone(&container);
            let seen = Rc::clone(&seen);
            Function::new(move |_, _| {
                *seen.borrow_mut() = container.partials();
                Ok(Value::Undefined)
            })
        };
        let block = Function::new(|_, _| Ok(Value::string("inline")));
        let wrapped = inline(probe, &props, &container, &options("p", block))
            .unwrap()
            .unwrap();
        wrapped.call(&Value::Undefined, &[]).unwrap();

        let during = seen.borrow().clone();
        assert!(during.has("base") && during.has("p"));
        assert!(!container.partials().has("p"));
    }
}
