use std::rc::Rc;

use crate::codegen::ir::{
    AliasEntry, Expr, Param, ProgramSpec, Register, RuntimeFn, Stmt, Target,
};
use crate::lang::value::{Function, Object, Value};
use crate::runtime::container::{self, Container};
use crate::runtime::decorators::Props;
use crate::runtime::runtime_error::RuntimeError;

// =============================================================================
// EVAL - Closure compilation of generated functions
// =============================================================================
//
// Every expression and statement is turned into a boxed closure once, when a
// template is loaded. Rendering then only walks closures over a `Frame`.

pub(crate) type ExprFn = Box<dyn Fn(&mut Frame) -> Result<Value, RuntimeError>>;
type StmtFn = Box<dyn Fn(&mut Frame) -> Result<Flow, RuntimeError>>;

pub(crate) enum Flow {
    Next,
    Return(Value),
}

/// Activation record of one generated function.
pub(crate) struct Frame {
    pub container: Rc<Container>,
    pub depth0: Value,
    pub helpers: Value,
    pub partials: Value,
    pub data: Value,
    pub block_params: Value,
    pub depths: Value,
    slots: Vec<Value>,
    helper: Value,
    options: Value,
    buffer: String,
}

impl Frame {
    pub fn new(
        container: Rc<Container>,
        depth0: Value,
        helpers: Value,
        partials: Value,
        data: Value,
        block_params: Value,
        depths: Value,
    ) -> Self {
        Frame {
            container,
            depth0,
            helpers,
            partials,
            data,
            block_params,
            depths,
            slots: Vec::new(),
            helper: Value::Undefined,
            options: Value::Undefined,
            buffer: String::new(),
        }
    }

    fn store(&mut self, target: Target, value: Value) {
        match target {
            Target::Slot(n) => {
                if self.slots.len() < n {
                    self.slots.resize(n, Value::Undefined);
                }
                self.slots[n - 1] = value;
            }
            Target::Register(Register::Helper) => self.helper = value,
            Target::Register(Register::Options) => self.options = value,
        }
    }
}

/// A generated function ready to run.
pub(crate) struct CompiledProgram {
    slots: usize,
    buffer: Option<ExprFn>,
    body: Vec<StmtFn>,
    decorators: Vec<(String, ExprFn)>,
}

impl CompiledProgram {
    pub fn compile(spec: &ProgramSpec) -> Self {
        let compiler = Compiler {
            aliases: &spec.aliases,
        };
        let decorators = spec
            .decorators
            .iter()
            .filter_map(|stmt| match stmt {
                Stmt::Decorate { name, options } => Some((name.clone(), compiler.expr(options))),
                _ => None,
            })
            .collect();
        CompiledProgram {
            slots: spec.slots,
            buffer: spec.buffer.as_ref().map(|e| compiler.expr(e)),
            body: spec.body.iter().map(|s| compiler.stmt(s)).collect(),
            decorators,
        }
    }

    pub fn has_decorators(&self) -> bool {
        !self.decorators.is_empty()
    }

    pub fn run(&self, frame: &mut Frame) -> Result<Value, RuntimeError> {
        frame.slots = vec![Value::Undefined; self.slots];
        if let Some(init) = &self.buffer {
            frame.buffer = init(frame)?.to_js_string();
        }
        for stmt in &self.body {
            if let Flow::Return(value) = stmt(frame)? {
                return Ok(value);
            }
        }
        Ok(Value::Undefined)
    }

    /// Thread `prog` through each decorator in order. A decorator returning
    /// nothing keeps the current function.
    pub fn run_decorators(
        &self,
        frame: &mut Frame,
        mut prog: Function,
        props: &Props,
    ) -> Result<Function, RuntimeError> {
        for (name, options) in &self.decorators {
            let options = options(frame)?;
            let decorator = frame
                .container
                .registry
                .decorator(name)
                .ok_or_else(|| RuntimeError::new(format!("Missing decorator: \"{}\"", name)))?;
            if let Some(replaced) = decorator(prog.clone(), props, &frame.container, &options)
                .map_err(|e| e.with_context(format!("decorator '{}'", name)))?
            {
                prog = replaced;
            }
        }
        Ok(prog)
    }
}

struct Compiler<'s> {
    aliases: &'s [AliasEntry],
}

impl Compiler<'_> {
    fn resolve<'a>(&'a self, expr: &'a Expr) -> &'a Expr {
        match expr {
            Expr::Alias(i) => match self.aliases.get(*i) {
                Some(entry) => self.resolve(&entry.expr),
                None => expr,
            },
            _ => expr,
        }
    }

    fn stmts(&self, stmts: &[Stmt]) -> Vec<StmtFn> {
        stmts.iter().map(|s| self.stmt(s)).collect()
    }

    fn stmt(&self, stmt: &Stmt) -> StmtFn {
        match stmt {
            Stmt::Assign(target, value) => {
                let target = *target;
                let value = self.expr(value);
                Box::new(move |f| {
                    let v = value(f)?;
                    f.store(target, v);
                    Ok(Flow::Next)
                })
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.expr(cond);
                let then = self.stmts(then);
                let otherwise = self.stmts(otherwise);
                Box::new(move |f| {
                    let branch = if cond(f)?.is_truthy() {
                        &then
                    } else {
                        &otherwise
                    };
                    for stmt in branch {
                        if let Flow::Return(v) = stmt(f)? {
                            return Ok(Flow::Return(v));
                        }
                    }
                    Ok(Flow::Next)
                })
            }
            Stmt::Return(value) => {
                let value = self.expr(value);
                Box::new(move |f| Ok(Flow::Return(value(f)?)))
            }
            Stmt::BufferAppend(value) => {
                let value = self.expr(value);
                Box::new(move |f| {
                    let text = value(f)?.to_js_string();
                    f.buffer.push_str(&text);
                    Ok(Flow::Next)
                })
            }
            // only meaningful in a decorator list
            Stmt::Decorate { .. } => Box::new(|_| Ok(Flow::Next)),
        }
    }

    fn exprs(&self, exprs: &[Expr]) -> Vec<ExprFn> {
        exprs.iter().map(|e| self.expr(e)).collect()
    }

    fn expr(&self, expr: &Expr) -> ExprFn {
        match expr {
            Expr::Lit(lit) => {
                let value = lit.to_value();
                Box::new(move |_| Ok(value.clone()))
            }
            Expr::Context(0) => Box::new(|f| Ok(f.depth0.clone())),
            Expr::Context(n) => {
                let key = n.to_string();
                Box::new(move |f| Ok(f.depths.get(&key)))
            }
            Expr::Param(param) => {
                let param = *param;
                Box::new(move |f| {
                    Ok(match param {
                        Param::Helpers => f.helpers.clone(),
                        Param::Partials => f.partials.clone(),
                        Param::Data => f.data.clone(),
                        Param::BlockParams => f.block_params.clone(),
                        Param::Depths => f.depths.clone(),
                    })
                })
            }
            Expr::DataFrame(depth) => {
                let depth = *depth;
                Box::new(move |f| Ok(container::data_frame(&f.data, depth)))
            }
            Expr::BlockParam(depth, index) => {
                let (depth, index) = (depth.to_string(), index.to_string());
                Box::new(move |f| Ok(f.block_params.get(&depth).get(&index)))
            }
            Expr::Slot(n) => {
                let n = *n;
                Box::new(move |f| Ok(f.slots.get(n - 1).cloned().unwrap_or_default()))
            }
            Expr::Register(Register::Helper) => Box::new(|f| Ok(f.helper.clone())),
            Expr::Register(Register::Options) => Box::new(|f| Ok(f.options.clone())),
            Expr::Alias(i) => match self.aliases.get(*i) {
                Some(entry) => self.expr(&entry.expr),
                None => {
                    let i = *i;
                    Box::new(move |_| Err(RuntimeError::new(format!("unknown alias {}", i))))
                }
            },
            Expr::Runtime(RuntimeFn::Noop) => Box::new(|_| Ok(Value::Function(container::noop()))),
            Expr::Runtime(RuntimeFn::NullContext) => Box::new(|_| Ok(Value::Object(Rc::default()))),
            Expr::Runtime(other) => {
                let other = *other;
                Box::new(move |_| {
                    Err(RuntimeError::new(format!(
                        "{:?} cannot be used as a value",
                        other
                    )))
                })
            }
            Expr::Member(object, name) => {
                let object = self.expr(object);
                let name = name.clone();
                Box::new(move |f| member(&object(f)?, &name))
            }
            Expr::Assign(target, value) => {
                let target = *target;
                let value = self.expr(value);
                Box::new(move |f| {
                    let v = value(f)?;
                    f.store(target, v.clone());
                    Ok(v)
                })
            }
            Expr::Seq(items) => {
                let items = self.exprs(items);
                Box::new(move |f| {
                    let mut last = Value::Undefined;
                    for item in &items {
                        last = item(f)?;
                    }
                    Ok(last)
                })
            }
            Expr::Cond {
                test,
                then,
                otherwise,
            } => {
                let test = self.expr(test);
                let then = self.expr(then);
                let otherwise = self.expr(otherwise);
                Box::new(move |f| {
                    if test(f)?.is_truthy() {
                        then(f)
                    } else {
                        otherwise(f)
                    }
                })
            }
            Expr::And(a, b) => {
                let (a, b) = (self.expr(a), self.expr(b));
                Box::new(move |f| {
                    let left = a(f)?;
                    if left.is_truthy() { b(f) } else { Ok(left) }
                })
            }
            Expr::Or(a, b) => {
                let (a, b) = (self.expr(a), self.expr(b));
                Box::new(move |f| {
                    let left = a(f)?;
                    if left.is_truthy() { Ok(left) } else { b(f) }
                })
            }
            Expr::NotNull(x) => {
                let x = self.expr(x);
                Box::new(move |f| Ok(Value::Bool(!x(f)?.is_nullish())))
            }
            Expr::Not(x) => {
                let x = self.expr(x);
                Box::new(move |f| Ok(Value::Bool(!x(f)?.is_truthy())))
            }
            Expr::IsFunction(x) => {
                let x = self.expr(x);
                Box::new(move |f| Ok(Value::Bool(matches!(x(f)?, Value::Function(_)))))
            }
            Expr::Call { callee, this, args } => self.call(callee, this.as_deref(), args),
            Expr::Object(pairs) => {
                let pairs: Vec<(String, ExprFn)> = pairs
                    .iter()
                    .map(|(k, v)| (k.clone(), self.expr(v)))
                    .collect();
                Box::new(move |f| {
                    let mut object = Object::with_capacity(pairs.len());
                    for (key, value) in &pairs {
                        object.insert(key.clone(), value(f)?);
                    }
                    Ok(Value::Object(Rc::new(object)))
                })
            }
            Expr::Array(items) => {
                let items = self.exprs(items);
                Box::new(move |f| {
                    let values = items.iter().map(|i| i(f)).collect::<Result<Vec<_>, _>>()?;
                    Ok(Value::array(values))
                })
            }
            Expr::Program {
                index,
                block_params,
                pass_block_params,
                pass_depths,
            } => {
                let (index, declared) = (*index, *block_params);
                let (pass_block_params, pass_depths) = (*pass_block_params, *pass_depths);
                Box::new(move |f| {
                    let block_params = if pass_block_params {
                        f.block_params.clone()
                    } else {
                        Value::Undefined
                    };
                    let depths = if pass_depths {
                        f.depths.clone()
                    } else {
                        Value::Undefined
                    };
                    f.container
                        .program(index, f.data.clone(), declared, block_params, depths)
                        .map(Value::Function)
                })
            }
            Expr::Buffer => Box::new(|f| Ok(Value::String(f.buffer.clone()))),
            Expr::Concat(parts) => {
                let parts = self.exprs(parts);
                Box::new(move |f| {
                    let mut out = String::new();
                    for part in &parts {
                        out.push_str(&part(f)?.to_js_string());
                    }
                    Ok(Value::String(out))
                })
            }
        }
    }

    fn call(&self, callee: &Expr, this: Option<&Expr>, args: &[Expr]) -> ExprFn {
        let args = self.exprs(args);
        if let Expr::Runtime(routine) = self.resolve(callee)
            && !matches!(routine, RuntimeFn::Noop | RuntimeFn::NullContext)
        {
            return runtime_call(*routine, args);
        }

        let label = describe(self.resolve(callee));
        let helper = helper_name(self.resolve(callee));
        let callee = self.expr(callee);
        let this = this.map(|t| self.expr(t));
        Box::new(move |f| {
            let target = callee(f)?;
            let this = match &this {
                Some(this) => this(f)?,
                None => Value::Undefined,
            };
            let values = args.iter().map(|a| a(f)).collect::<Result<Vec<_>, _>>()?;
            let Value::Function(function) = target else {
                return Err(RuntimeError::not_callable(&label));
            };
            function.call(&this, &values).map_err(|e| match &helper {
                Some(name) => e.with_context(format!("helper '{}'", name)),
                None => e,
            })
        })
    }
}

fn runtime_call(routine: RuntimeFn, args: Vec<ExprFn>) -> ExprFn {
    Box::new(move |f| {
        let values = args.iter().map(|a| a(f)).collect::<Result<Vec<_>, _>>()?;
        let arg = |i: usize| values.get(i).cloned().unwrap_or_default();
        match routine {
            RuntimeFn::EscapeExpression => Ok(container::escape_expression(&arg(0))),
            RuntimeFn::Lambda => container::lambda(&arg(0), &arg(1)),
            RuntimeFn::Strict => container::strict(&arg(0), &arg(1).to_js_string()),
            RuntimeFn::Lookup => Ok(container::lookup(&arg(0), &arg(1).to_js_string())),
            RuntimeFn::InvokePartial => {
                let container = Rc::clone(&f.container);
                container.invoke_partial(arg(0), arg(1), arg(2))
            }
            RuntimeFn::Noop | RuntimeFn::NullContext => Err(RuntimeError::not_callable(&format!(
                "{:?}",
                routine
            ))),
        }
    })
}

/// Property read as generated code performs it: reading from `null` or
/// `undefined` is an error, primitives answer `undefined`.
fn member(object: &Value, name: &str) -> Result<Value, RuntimeError> {
    if object.is_nullish() {
        return Err(RuntimeError::new(format!(
            "Cannot read property \"{}\" of {}",
            name,
            object.type_name()
        )));
    }
    Ok(object.get(name))
}

fn describe(expr: &Expr) -> String {
    match expr {
        Expr::Member(object, name) => format!("{}.{}", describe(object), name),
        Expr::Param(Param::Helpers) => "helpers".to_string(),
        Expr::Param(Param::Partials) => "partials".to_string(),
        Expr::Context(0) => "depth0".to_string(),
        Expr::Register(Register::Helper) => "helper".to_string(),
        Expr::Or(first, _) => describe(first),
        Expr::Cond { then, .. } => describe(then),
        _ => "expression".to_string(),
    }
}

fn helper_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Member(object, name) if **object == Expr::Param(Param::Helpers) => {
            Some(name.clone())
        }
        Expr::Or(first, _) => helper_name(first),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Literal;

    fn eval(expr: Expr) -> Result<Value, RuntimeError> {
        let compiled = Compiler { aliases: &[] }.expr(&expr);
        let mut frame = Frame::new(
            Container::detached(),
            Value::object([("name", Value::string("Ann"))]),
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
        );
        compiled(&mut frame)
    }

    #[test]
    fn test_guarded_member() {
        let e = Expr::cond(
            Expr::Context(0).not_null(),
            Expr::Context(0).member("name"),
            Expr::Context(0),
        );
        assert_eq!(eval(e).unwrap().to_js_string(), "Ann");
    }

    #[test]
    fn test_member_of_undefined_is_error() {
        let err = eval(Expr::Context(0).member("missing").member("x")).unwrap_err();
        assert!(err.message.contains("Cannot read property \"x\""));
    }

    #[test]
    fn test_or_and_short_circuit() {
        let missing = Expr::Context(0).member("missing");
        let e = missing.clone().or(Expr::string("fallback"));
        assert_eq!(eval(e).unwrap().to_js_string(), "fallback");
        let e = missing.and(Expr::Context(0).member("nope").member("deeper"));
        assert!(eval(e).unwrap().is_nullish());
    }

    #[test]
    fn test_concat_coerces_to_string() {
        let e = Expr::Concat(vec![
            Expr::Lit(Literal::Number(1.0)),
            Expr::Lit(Literal::Number(2.0)),
        ]);
        assert_eq!(eval(e).unwrap().to_js_string(), "12");
    }

    #[test]
    fn test_seq_assigns_registers() {
        let e = Expr::Seq(vec![
            Expr::assign(Target::Register(Register::Helper), Expr::string("h")),
            Expr::Register(Register::Helper),
        ]);
        assert_eq!(eval(e).unwrap().to_js_string(), "h");
    }

    #[test]
    fn test_escape_runtime_call() {
        let e = Expr::call(
            Expr::Runtime(RuntimeFn::EscapeExpression),
            None,
            vec![Expr::string("<b>")],
        );
        assert_eq!(eval(e).unwrap().to_js_string(), "&lt;b&gt;");
    }

    #[test]
    fn test_calling_non_function_names_callee() {
        let e = Expr::call(
            Expr::Param(Param::Helpers).member("shout").or(Expr::Context(0).member("shout")),
            None,
            vec![],
        );
        let err = eval(e);
        // helpers is undefined here, so the read itself fails
        assert!(err.is_err());

        let e = Expr::call(Expr::Context(0).member("name"), None, vec![]);
        let err = eval(e).unwrap_err();
        assert_eq!(err.message, "depth0.name is not a function");
    }

    #[test]
    fn test_program_body_returns() {
        let spec = ProgramSpec {
            buffer: Some(Expr::string("a")),
            body: vec![
                Stmt::BufferAppend(Expr::string("b")),
                Stmt::If {
                    cond: Expr::Lit(Literal::Bool(false)),
                    then: vec![Stmt::Return(Expr::string("never"))],
                    otherwise: vec![Stmt::BufferAppend(Expr::string("c"))],
                },
                Stmt::Return(Expr::Buffer),
            ],
            ..ProgramSpec::default()
        };
        let program = CompiledProgram::compile(&spec);
        let mut frame = Frame::new(
            Container::detached(),
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
            Value::Undefined,
        );
        assert_eq!(program.run(&mut frame).unwrap().to_js_string(), "abc");
    }
}
