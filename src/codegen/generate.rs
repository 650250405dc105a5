use std::rc::Rc;

use indexmap::IndexMap;
use log::{debug, trace};

use crate::bytecode::compile_error::{CompileError, InternalError};
use crate::bytecode::{Environment, Literal, Op};
use crate::codegen::ir::{
    AliasEntry, COMPILER_REVISION, Expr, Generated, Param, ProgramSpec, REVISION_VERSIONS,
    Register, RuntimeFn, SpecFlags, Stmt, Target, TemplateSpec,
};
use crate::codegen::stack::SimStack;
use crate::options::CompilerConfig;
use crate::runtime::container::Registry;
use crate::runtime::template::Template;

// =============================================================================
// CODE GENERATOR - Opcode environments to output functions
// =============================================================================

/// Output requested from a generator run.
pub enum Mode {
    /// Serializable manifest.
    Spec,
    /// Closure-compiled template bound to a registry.
    Live(Rc<Registry>),
}

pub struct CodeGenerator;

impl CodeGenerator {
    pub fn compile(
        environment: &Environment,
        config: &CompilerConfig,
        mode: Mode,
    ) -> Result<Generated, CompileError> {
        let spec = Self::generate(environment, config)?;
        Ok(match mode {
            Mode::Spec => Generated::Spec(spec),
            Mode::Live(registry) => {
                Generated::Live(Template::new(spec, registry, config.options.clone()))
            }
        })
    }

    /// Build the manifest for an environment tree.
    pub fn generate(
        environment: &Environment,
        config: &CompilerConfig,
    ) -> Result<TemplateSpec, CompileError> {
        let mut shared = Shared {
            programs: Vec::new(),
            records: Vec::new(),
            data: config.data || uses_data(environment),
        };
        let main = generate_function(config, environment, &mut shared)?;

        let use_decorators = !main.spec.decorators.is_empty()
            || shared
                .programs
                .iter()
                .flatten()
                .any(|p| !p.decorators.is_empty());
        let flags = SpecFlags {
            use_partial: environment.uses_partial,
            use_data: shared.data,
            use_depths: main.use_depths,
            use_block_params: main.use_block_params,
            use_decorators,
            compat: config.compat,
        };

        debug!(
            "generated template: {} child programs, {:?}",
            shared.programs.iter().flatten().count(),
            flags
        );

        Ok(TemplateSpec {
            compiler: (COMPILER_REVISION, REVISION_VERSIONS.to_string()),
            main: main.spec,
            programs: shared.programs,
            flags,
        })
    }
}

fn uses_data(env: &Environment) -> bool {
    env.uses_data || env.children.iter().any(uses_data)
}

// =============================================================================
// SHARED STATE - Child programs and dedup across the tree
// =============================================================================

/// A generated child, kept so identical environments share one program.
struct ChildRecord<'e> {
    env: &'e Environment,
    uses_depths: bool,
    uses_block_params: bool,
}

struct Shared<'e> {
    programs: Vec<Option<ProgramSpec>>,
    records: Vec<Option<ChildRecord<'e>>>,
    data: bool,
}

fn store<T>(slots: &mut Vec<Option<T>>, index: usize, value: T) {
    if slots.len() <= index {
        slots.resize_with(index + 1, || None);
    }
    slots[index] = Some(value);
}

struct FunctionOutput {
    spec: ProgramSpec,
    use_depths: bool,
    use_block_params: bool,
}

fn generate_function<'e>(
    config: &CompilerConfig,
    env: &'e Environment,
    shared: &mut Shared<'e>,
) -> Result<FunctionOutput, CompileError> {
    let mut generator = FunctionGen::new(config, env, shared.data);
    generator.compile_children(shared)?;

    generator.use_depths |= env.uses_depths || env.uses_decorators || config.compat;
    generator.use_block_params |= env.uses_block_params;

    for opcode in &env.opcodes {
        generator.opcode(&opcode.op)?;
    }
    generator.flush_pending();

    if !generator.stack.is_empty() {
        return Err(generator.stack.imbalance().into());
    }

    let use_depths = generator.use_depths;
    let use_block_params = generator.use_block_params;
    let spec = generator.finish();
    debug!(
        "generated function: {} statements, {} slots, {}",
        spec.body.len(),
        spec.slots,
        if spec.is_append_only() {
            "append-only"
        } else {
            "buffered"
        }
    );
    Ok(FunctionOutput {
        spec,
        use_depths,
        use_block_params,
    })
}

// =============================================================================
// FUNCTION GENERATOR - One output function per environment
// =============================================================================

enum Line {
    /// Output joined with neighbouring appends into one concatenation.
    Append(Expr),
    Stmt(Stmt),
}

/// Pieces of a helper invocation.
struct HelperCall {
    name: Expr,
    context: Expr,
    params: Vec<Expr>,
    /// Assignment of the `options` register, when the call uses it.
    init: Option<Expr>,
}

struct FunctionGen<'e, 'c> {
    config: &'c CompilerConfig,
    env: &'e Environment,
    data: bool,

    stack: SimStack,
    hashes: Vec<IndexMap<String, Expr>>,
    registers: Vec<Register>,
    aliases: Vec<AliasEntry>,

    lines: Vec<Line>,
    decorators: Vec<Stmt>,
    pending_content: Option<String>,

    last_context: usize,
    last_helper: Option<Expr>,
    use_depths: bool,
    use_block_params: bool,

    /// Program index assigned to each local child, by position.
    children: Vec<usize>,
}

impl<'e, 'c> FunctionGen<'e, 'c> {
    fn new(config: &'c CompilerConfig, env: &'e Environment, data: bool) -> Self {
        FunctionGen {
            config,
            env,
            data,
            stack: SimStack::new(),
            hashes: Vec::new(),
            registers: Vec::new(),
            aliases: Vec::new(),
            lines: Vec::new(),
            decorators: Vec::new(),
            pending_content: None,
            last_context: 0,
            last_helper: None,
            use_depths: false,
            use_block_params: false,
            children: Vec::new(),
        }
    }

    fn compile_children(&mut self, shared: &mut Shared<'e>) -> Result<(), CompileError> {
        let env = self.env;
        for child in &env.children {
            let existing = shared
                .records
                .iter()
                .position(|r| r.as_ref().is_some_and(|r| r.env == child));

            match existing.and_then(|i| shared.records[i].as_ref().map(|r| (i, r))) {
                Some((index, record)) => {
                    trace!("reusing program {} for identical child", index);
                    self.use_depths |= record.uses_depths;
                    self.use_block_params |= record.uses_block_params;
                    self.children.push(index);
                }
                None => {
                    // Reserve a slot so nested children cannot take this index.
                    shared.programs.push(None);
                    let index = shared.programs.len();
                    trace!("generating program {}", index);

                    let output = generate_function(self.config, child, shared)?;
                    self.use_depths |= output.use_depths;
                    self.use_block_params |= output.use_block_params;

                    store(&mut shared.programs, index, output.spec);
                    store(
                        &mut shared.records,
                        index,
                        ChildRecord {
                            env: child,
                            uses_depths: self.use_depths,
                            uses_block_params: self.use_block_params,
                        },
                    );
                    self.children.push(index);
                }
            }
        }
        Ok(())
    }

    fn opcode(&mut self, op: &Op) -> Result<(), CompileError> {
        match op {
            Op::AppendContent(content) => self.append_content(content),
            Op::Append => self.append()?,
            Op::AppendEscaped => {
                let value = self.stack.pop()?;
                let escape = self.alias(Expr::Runtime(RuntimeFn::EscapeExpression));
                let line = self.append_to_buffer(Expr::call(escape, None, vec![value]));
                self.push_line(line);
            }
            Op::GetContext(depth) => self.last_context = *depth,
            Op::PushContext => self.stack.push_literal(Expr::Context(self.last_context)),
            Op::LookupOnContext {
                parts,
                falsy,
                strict,
                scoped,
            } => self.lookup_on_context(parts, *falsy, *strict, *scoped)?,
            Op::LookupBlockParam {
                depth,
                index,
                parts,
            } => {
                self.use_block_params = true;
                self.stack.push(Expr::BlockParam(*depth, *index));
                self.resolve_path(parts, 1, false, false)?;
            }
            Op::LookupData {
                depth,
                parts,
                strict,
            } => {
                let frame = if *depth == 0 {
                    Expr::Param(Param::Data)
                } else {
                    Expr::DataFrame(*depth)
                };
                self.stack.push_literal(frame);
                self.resolve_path(parts, 0, true, *strict)?;
            }
            Op::ResolvePossibleLambda => {
                let value = self.stack.pop()?;
                let lambda = self.alias(Expr::Runtime(RuntimeFn::Lambda));
                self.stack
                    .push(Expr::call(lambda, None, vec![value, Expr::Context(0)]));
            }
            Op::PushProgram(Some(guid)) => {
                let index = *self
                    .children
                    .get(*guid)
                    .ok_or(InternalError::UnknownProgram(*guid))?;
                let block_params = self.env.children[*guid].block_params;
                self.stack.push_literal(Expr::Program {
                    index,
                    block_params,
                    pass_block_params: self.use_block_params || self.use_depths,
                    pass_depths: self.use_depths,
                });
            }
            Op::PushProgram(None) => self.stack.push_literal(Expr::Lit(Literal::Null)),
            Op::EmptyHash { omit } => self.stack.push_literal(if *omit {
                Expr::Lit(Literal::Undefined)
            } else {
                Expr::Object(Vec::new())
            }),
            Op::PushHash => self.hashes.push(IndexMap::new()),
            Op::AssignToHash(key) => {
                let value = self.stack.pop()?;
                let hash = self.hashes.last_mut().ok_or_else(|| {
                    InternalError::StackCheck("assign_to_hash without open hash".to_string())
                })?;
                hash.insert(key.clone(), value);
            }
            Op::PopHash => {
                let hash = self.hashes.pop().ok_or_else(|| {
                    InternalError::StackCheck("pop_hash without open hash".to_string())
                })?;
                self.stack.push(Expr::Object(hash.into_iter().collect()));
            }
            Op::PushString(s) => self.stack.push_literal(Expr::string(s.as_str())),
            Op::PushLiteral(lit) => self.stack.push_literal(Expr::Lit(lit.clone())),
            Op::InvokeHelper {
                params,
                name,
                simple,
            } => self.invoke_helper(*params, name, *simple)?,
            Op::InvokeKnownHelper { params, name } => {
                let call = self.setup_helper(*params, name, false)?;
                self.stack
                    .push(Expr::call(call.name, Some(call.context), call.params));
            }
            Op::InvokeAmbiguous { name, helper_call } => {
                self.invoke_ambiguous(name, *helper_call)?
            }
            Op::BlockValue(name) => self.block_value(name)?,
            Op::AmbiguousBlockValue => self.ambiguous_block_value()?,
            Op::InvokePartial {
                dynamic,
                name,
                indent,
            } => self.invoke_partial(*dynamic, name, indent)?,
            Op::RegisterDecorator { params, name } => {
                let (options, _) = self.setup_params(name, *params, true)?;
                self.decorators.push(Stmt::Decorate {
                    name: name.clone(),
                    options: Expr::Object(options),
                });
            }
        }
        Ok(())
    }

    // Output

    fn append_content(&mut self, content: &str) {
        match &mut self.pending_content {
            Some(pending) => pending.push_str(content),
            None => self.pending_content = Some(content.to_string()),
        }
    }

    /// Single-statement functions return their output directly.
    fn append_to_buffer(&self, expr: Expr) -> Line {
        if self.env.is_simple {
            Line::Stmt(Stmt::Return(expr))
        } else {
            Line::Append(expr)
        }
    }

    fn explicit_append(&self, expr: Expr) -> Stmt {
        if self.env.is_simple {
            Stmt::Return(expr)
        } else {
            Stmt::BufferAppend(expr)
        }
    }

    fn flush_pending(&mut self) {
        if let Some(content) = self.pending_content.take() {
            let line = self.append_to_buffer(Expr::string(content));
            self.lines.push(line);
        }
    }

    fn push_line(&mut self, line: Line) {
        self.flush_pending();
        self.lines.push(line);
    }

    fn push_stmt(&mut self, stmt: Stmt) {
        self.push_line(Line::Stmt(stmt));
    }

    fn flush_inline(&mut self) {
        for stmt in self.stack.flush_inline() {
            self.push_stmt(stmt);
        }
    }

    fn append(&mut self) -> Result<(), CompileError> {
        if self.stack.is_inline() {
            self.stack.replace(|head, current| {
                Expr::cond(head.not_null(), current, Expr::string(""))
            })?;
            let value = self.stack.pop()?;
            let line = self.append_to_buffer(value);
            self.push_line(line);
        } else {
            let local = self.stack.pop()?;
            let then = vec![self.explicit_append(local.clone())];
            let otherwise = if self.env.is_simple {
                vec![Stmt::Return(Expr::string(""))]
            } else {
                Vec::new()
            };
            self.push_stmt(Stmt::If {
                cond: local.not_null(),
                then,
                otherwise,
            });
        }
        Ok(())
    }

    // Lookups

    fn lookup_on_context(
        &mut self,
        parts: &[String],
        falsy: bool,
        strict: bool,
        scoped: bool,
    ) -> Result<(), CompileError> {
        let mut start = 0;
        match parts.first() {
            Some(first) if !scoped && self.config.compat && self.last_context == 0 => {
                let lookup = self.alias(Expr::Runtime(RuntimeFn::Lookup));
                self.stack.push(Expr::call(
                    lookup,
                    None,
                    vec![Expr::Param(Param::Depths), Expr::string(first.as_str())],
                ));
                start = 1;
            }
            _ => self.stack.push_literal(Expr::Context(self.last_context)),
        }
        self.resolve_path(parts, start, falsy, strict)
    }

    fn resolve_path(
        &mut self,
        parts: &[String],
        start: usize,
        falsy: bool,
        strict: bool,
    ) -> Result<(), CompileError> {
        if self.config.strict || self.config.assume_objects {
            let require_terminal = self.config.strict && strict && parts.len() > start;
            let end = if require_terminal {
                parts.len() - 1
            } else {
                parts.len()
            };
            let mut chain = self.stack.pop()?;
            for part in parts.iter().take(end).skip(start) {
                chain = chain.member(part.as_str());
            }
            if require_terminal {
                let strict_fn = self.alias(Expr::Runtime(RuntimeFn::Strict));
                chain = Expr::call(strict_fn, None, vec![chain, Expr::string(&*parts[end])]);
            }
            self.stack.push(chain);
            return Ok(());
        }

        for part in parts.iter().skip(start) {
            self.stack.replace(|head, current| {
                let lookup = current.clone().member(part.as_str());
                if falsy {
                    head.and(lookup)
                } else {
                    Expr::cond(head.not_null(), lookup, current)
                }
            })?;
        }
        Ok(())
    }

    // Helpers

    fn use_register(&mut self, register: Register) {
        if !self.registers.contains(&register) {
            self.registers.push(register);
        }
    }

    /// Shared sub-expression; referenced through the function's alias table.
    fn alias(&mut self, expr: Expr) -> Expr {
        if let Some(i) = self.aliases.iter().position(|a| a.expr == expr) {
            self.aliases[i].refs += 1;
            return Expr::Alias(i);
        }
        self.aliases.push(AliasEntry { expr, refs: 1 });
        Expr::Alias(self.aliases.len() - 1)
    }

    fn helpers(name: &str) -> Expr {
        Expr::Param(Param::Helpers).member(name)
    }

    fn call_context(&mut self) -> Expr {
        self.alias(Expr::cond(
            Expr::Context(0).not_null(),
            Expr::Context(0),
            Expr::Runtime(RuntimeFn::NullContext).or(Expr::Object(Vec::new())),
        ))
    }

    /// Pop hash, inverse, program and `param_size` arguments and build the
    /// options object handed to helpers.
    fn setup_params(
        &mut self,
        name: &str,
        param_size: usize,
        object_args: bool,
    ) -> Result<(Vec<(String, Expr)>, Vec<Expr>), CompileError> {
        let mut options = vec![
            ("name".to_string(), Expr::string(name)),
            ("hash".to_string(), self.stack.pop()?),
        ];

        let inverse = self.stack.pop()?;
        let program = self.stack.pop()?;
        let present = |e: &Expr| !matches!(e, Expr::Lit(Literal::Null));
        if present(&program) || present(&inverse) {
            let noop = Expr::Runtime(RuntimeFn::Noop);
            let program = if present(&program) { program } else { noop.clone() };
            let inverse = if present(&inverse) { inverse } else { noop };
            options.push(("fn".to_string(), program));
            options.push(("inverse".to_string(), inverse));
        }

        let mut params = Vec::with_capacity(param_size);
        for _ in 0..param_size {
            params.push(self.stack.pop()?);
        }
        params.reverse();

        if object_args {
            options.push(("args".to_string(), Expr::Array(params.clone())));
        }
        if self.data {
            options.push(("data".to_string(), Expr::Param(Param::Data)));
        }
        if self.use_block_params {
            options.push(("blockParams".to_string(), Expr::Param(Param::BlockParams)));
        }
        Ok((options, params))
    }

    fn setup_helper_args(
        &mut self,
        name: &str,
        param_size: usize,
        use_register: bool,
    ) -> Result<(Vec<Expr>, Option<Expr>), CompileError> {
        let (options, mut params) = self.setup_params(name, param_size, false)?;
        let options = Expr::Object(options);
        if use_register {
            self.use_register(Register::Options);
            params.push(Expr::Register(Register::Options));
            let init = Expr::assign(Target::Register(Register::Options), options);
            Ok((params, Some(init)))
        } else {
            params.push(options);
            Ok((params, None))
        }
    }

    fn setup_helper(
        &mut self,
        param_size: usize,
        name: &str,
        block_helper: bool,
    ) -> Result<HelperCall, CompileError> {
        let (params, init) = self.setup_helper_args(name, param_size, block_helper)?;
        Ok(HelperCall {
            name: Self::helpers(name),
            context: self.call_context(),
            params,
            init,
        })
    }

    fn invoke_helper(
        &mut self,
        param_size: usize,
        name: &str,
        simple: bool,
    ) -> Result<(), CompileError> {
        let non_helper = self.stack.pop()?;
        let call = self.setup_helper(param_size, name, false)?;

        let mut callee = if simple {
            call.name.or(non_helper)
        } else {
            non_helper
        };
        if !self.config.strict {
            callee = callee.or(self.alias(Self::helpers("helperMissing")));
        }
        self.stack
            .push(Expr::call(callee, Some(call.context), call.params));
        Ok(())
    }

    /// `{{name}}` that may be a helper or a value: decided at render time.
    fn invoke_ambiguous(&mut self, name: &str, helper_call: bool) -> Result<(), CompileError> {
        self.use_register(Register::Helper);
        let non_helper = self.stack.pop()?;
        self.stack.push_literal(Expr::Object(Vec::new()));
        let call = self.setup_helper(0, name, helper_call)?;

        let helper_name = Self::helpers(name);
        self.last_helper = Some(helper_name.clone());

        let helper = Expr::Register(Register::Helper);
        let found = Expr::assign(
            Target::Register(Register::Helper),
            helper_name.or(non_helper),
        );
        let lookup = if self.config.strict {
            found
        } else {
            let missing = self.alias(Self::helpers("helperMissing"));
            Expr::assign(
                Target::Register(Register::Helper),
                Expr::cond(found.not_null(), helper.clone(), missing),
            )
        };

        let mut seq = vec![lookup];
        seq.extend(call.init);
        seq.push(Expr::cond(
            Expr::IsFunction(Box::new(helper.clone())),
            Expr::call(helper.clone(), Some(call.context), call.params),
            helper,
        ));
        self.stack.push(Expr::Seq(seq));
        Ok(())
    }

    fn block_value(&mut self, name: &str) -> Result<(), CompileError> {
        let (mut params, _) = self.setup_helper_args(name, 0, false)?;
        let value = self.stack.pop()?;
        params.insert(0, value);
        let missing = self.alias(Self::helpers("blockHelperMissing"));
        self.stack
            .push(Expr::call(missing, Some(Expr::Context(0)), params));
        Ok(())
    }

    /// Route the ambiguous value through `blockHelperMissing` when no helper
    /// was found, reusing the options the ambiguous call assigned.
    fn ambiguous_block_value(&mut self) -> Result<(), CompileError> {
        self.setup_helper_args("", 0, true)?;
        self.flush_inline();

        let slot = self.stack.top_slot()?;
        let last_helper = self
            .last_helper
            .clone()
            .ok_or(InternalError::MissingAmbiguousHelper)?;
        let missing = self.alias(Self::helpers("blockHelperMissing"));
        let call = Expr::call(
            missing,
            Some(Expr::Context(0)),
            vec![Expr::Slot(slot), Expr::Register(Register::Options)],
        );
        self.push_stmt(Stmt::If {
            cond: Expr::Not(Box::new(last_helper)),
            then: vec![Stmt::Assign(Target::Slot(slot), call)],
            otherwise: Vec::new(),
        });
        Ok(())
    }

    fn invoke_partial(&mut self, dynamic: bool, name: &str, indent: &str) -> Result<(), CompileError> {
        let (mut options, mut params) = self.setup_params(name, 1, false)?;
        let partial = if dynamic {
            options.retain(|(key, _)| key != "name");
            self.stack.pop()?
        } else {
            Expr::Param(Param::Partials).member(name)
        };
        if !indent.is_empty() {
            options.push(("indent".to_string(), Expr::string(indent)));
        }
        options.push(("helpers".to_string(), Expr::Param(Param::Helpers)));
        options.push(("partials".to_string(), Expr::Param(Param::Partials)));
        if self.config.compat {
            options.push(("depths".to_string(), Expr::Param(Param::Depths)));
        }

        params.insert(0, partial);
        params.push(Expr::Object(options));
        self.stack.push(Expr::call(
            Expr::Runtime(RuntimeFn::InvokePartial),
            None,
            params,
        ));
        Ok(())
    }

    // Assembly

    /// Join runs of appends: the run before any statement seeds the buffer,
    /// later runs become buffer appends, and the trailing run is returned.
    fn finish(self) -> ProgramSpec {
        let mut body = Vec::new();
        let mut run: Vec<Expr> = Vec::new();
        let mut append_first = None;
        let mut source_seen = false;
        let mut append_only = true;

        for line in self.lines {
            match line {
                Line::Append(expr) => run.push(expr),
                Line::Stmt(stmt) => {
                    if !run.is_empty() {
                        let joined = concat(std::mem::take(&mut run));
                        if source_seen {
                            body.push(Stmt::BufferAppend(joined));
                        } else {
                            append_first = Some(joined);
                        }
                    }
                    source_seen = true;
                    if !self.env.is_simple {
                        append_only = false;
                    }
                    body.push(stmt);
                }
            }
        }

        let buffer = if append_only && append_first.is_none() {
            if !run.is_empty() {
                body.push(Stmt::Return(concat(run)));
            } else if !source_seen {
                body.push(Stmt::Return(Expr::string("")));
            }
            None
        } else {
            if run.is_empty() {
                body.push(Stmt::Return(Expr::Buffer));
            } else {
                let mut parts = vec![Expr::Buffer];
                parts.extend(run);
                body.push(Stmt::Return(Expr::Concat(parts)));
            }
            Some(append_first.unwrap_or_else(|| Expr::string("")))
        };

        ProgramSpec {
            block_params: self.use_block_params || self.use_depths,
            depths: self.use_depths,
            slots: self.stack.slots(),
            registers: self.registers,
            aliases: self.aliases,
            buffer,
            body,
            decorators: self.decorators,
        }
    }
}

fn concat(mut parts: Vec<Expr>) -> Expr {
    if parts.len() == 1 {
        parts.remove(0)
    } else {
        Expr::Concat(parts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::Opcode;
    use crate::bytecode::compile::compile_environment;
    use crate::frontend;
    use crate::lang::node::Span;
    use crate::options::CompileOptions;

    fn generate_with(src: &str, options: CompileOptions) -> TemplateSpec {
        let program = frontend::parse(src, &options).unwrap();
        let config = options.resolve();
        let env = compile_environment(&program, &config).unwrap();
        CodeGenerator::generate(&env, &config).unwrap()
    }

    fn generate(src: &str) -> TemplateSpec {
        generate_with(src, CompileOptions::default())
    }

    fn raw(ops: Vec<Op>) -> Environment {
        Environment {
            opcodes: ops
                .into_iter()
                .map(|op| Opcode {
                    op,
                    span: Span::default(),
                })
                .collect(),
            ..Environment::default()
        }
    }

    fn aliased(spec: &ProgramSpec, expr: &Expr) -> Option<usize> {
        spec.aliases.iter().find(|a| &a.expr == expr).map(|a| a.refs)
    }

    #[test]
    fn test_content_and_mustache_are_append_only() {
        let spec = generate("Hello {{name}}!");
        let main = &spec.main;
        assert!(main.is_append_only());
        assert_eq!(main.body.len(), 1);
        let Stmt::Return(Expr::Concat(parts)) = &main.body[0] else {
            panic!("expected a single concatenated return, got {:?}", main.body);
        };
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], Expr::string("Hello "));
        assert_eq!(parts[2], Expr::string("!"));
        assert_eq!(main.registers, vec![Register::Helper]);
    }

    #[test]
    fn test_plain_text_returns_literal() {
        let spec = generate("Hello");
        assert_eq!(spec.main.body, vec![Stmt::Return(Expr::string("Hello"))]);
    }

    #[test]
    fn test_empty_template_returns_empty_string() {
        let spec = generate("");
        assert_eq!(spec.main.body, vec![Stmt::Return(Expr::string(""))]);
        assert!(spec.programs.is_empty());
    }

    #[test]
    fn test_sibling_programs_get_odd_indices() {
        let spec = generate("{{#if a}}x{{/if}}{{#if b}}y{{/if}}");
        assert_eq!(spec.programs.len(), 4);
        assert!(spec.program(0).is_none());
        assert!(spec.program(1).is_some());
        assert!(spec.program(2).is_none());
        assert!(spec.program(3).is_some());
    }

    #[test]
    fn test_nested_program_indices() {
        let spec = generate("{{#if a}}{{#if b}}x{{/if}}{{/if}}");
        assert!(spec.program(1).is_some());
        assert!(spec.program(2).is_some());
        assert_eq!(spec.programs.iter().flatten().count(), 2);
    }

    #[test]
    fn test_identical_children_share_one_program() {
        let spec = generate("{{#if a}}x{{/if}}{{#if b}}x{{/if}}");
        assert_eq!(spec.programs.iter().flatten().count(), 1);
        let text = format!("{:?}", spec.main.body);
        assert_eq!(text.matches("Program { index: 1").count(), 2);
    }

    #[test]
    fn test_ambiguous_block_checks_helper_at_runtime() {
        let spec = generate("{{#foo}}x{{/foo}}");
        let main = &spec.main;
        assert_eq!(main.registers, vec![Register::Helper, Register::Options]);
        assert!(matches!(main.body[0], Stmt::Assign(Target::Slot(1), Expr::Seq(_))));
        assert!(matches!(
            &main.body[1],
            Stmt::If { cond: Expr::Not(_), .. }
        ));
        // single statement: the append returns directly
        assert!(matches!(
            &main.body[2],
            Stmt::If { then, otherwise, .. }
                if matches!(then[..], [Stmt::Return(_)]) && otherwise.len() == 1
        ));
        assert!(main.is_append_only());
    }

    #[test]
    fn test_statement_before_content_switches_to_buffer() {
        let spec = generate("{{#foo}}x{{/foo}} tail");
        let main = &spec.main;
        assert_eq!(main.buffer, Some(Expr::string("")));
        assert!(matches!(
            &main.body[2],
            Stmt::If { then, .. } if matches!(then[..], [Stmt::BufferAppend(_)])
        ));
        assert_eq!(
            main.body.last(),
            Some(&Stmt::Return(Expr::Concat(vec![
                Expr::Buffer,
                Expr::string(" tail")
            ])))
        );
    }

    #[test]
    fn test_repeated_runtime_calls_are_aliased() {
        let spec = generate("{{a}} {{b}}");
        let escape = Expr::Runtime(RuntimeFn::EscapeExpression);
        assert_eq!(aliased(&spec.main, &escape), Some(2));
    }

    #[test]
    fn test_strict_mode_guards_terminal_segment() {
        let spec = generate_with(
            "{{a.b}}",
            CompileOptions {
                strict: true,
                ..CompileOptions::default()
            },
        );
        assert!(aliased(&spec.main, &Expr::Runtime(RuntimeFn::Strict)).is_some());
        assert_eq!(spec.main.slots, 0);
    }

    #[test]
    fn test_compat_uses_recursive_lookup() {
        let spec = generate_with(
            "{{a.b}}",
            CompileOptions {
                compat: true,
                ..CompileOptions::default()
            },
        );
        assert!(aliased(&spec.main, &Expr::Runtime(RuntimeFn::Lookup)).is_some());
        assert!(spec.flags.compat);
        assert!(spec.flags.use_depths);
        assert!(spec.main.depths);
    }

    #[test]
    fn test_decorator_marks_manifest() {
        let spec = generate("{{#*inline \"row\"}}x{{/inline}}{{> row}}");
        assert_eq!(spec.main.decorators.len(), 1);
        let Stmt::Decorate { name, options } = &spec.main.decorators[0] else {
            panic!("expected a decorator call");
        };
        assert_eq!(name, "inline");
        let Expr::Object(pairs) = options else {
            panic!("expected an options object");
        };
        assert!(pairs.iter().any(|(k, v)| k == "args"
            && *v == Expr::Array(vec![Expr::string("row")])));
        assert!(spec.flags.use_decorators);
        assert!(spec.flags.use_depths);
        assert!(spec.flags.use_partial);
    }

    #[test]
    fn test_data_usage_forces_data_flag() {
        let spec = generate_with(
            "{{@index}}",
            CompileOptions {
                data: false,
                ..CompileOptions::default()
            },
        );
        assert!(spec.flags.use_data);
    }

    #[test]
    fn test_block_params_propagate_to_parent() {
        let spec = generate("{{#each items as |item|}}{{item}}{{/each}}");
        assert!(spec.flags.use_block_params);
        assert!(spec.main.block_params);
        let child = spec.program(1).unwrap();
        assert!(child.block_params);
    }

    #[test]
    fn test_leftover_value_is_stack_imbalance() {
        let env = raw(vec![Op::PushString("x".to_string())]);
        let err = CodeGenerator::generate(&env, &CompilerConfig::default()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::Internal(InternalError::StackImbalance { inline: 1, .. })
        ));
    }

    #[test]
    fn test_pop_from_empty_stack() {
        let env = raw(vec![Op::Append]);
        let err = CodeGenerator::generate(&env, &CompilerConfig::default()).unwrap_err();
        assert_eq!(err, CompileError::Internal(InternalError::InvalidStackPop));
    }

    #[test]
    fn test_ambiguous_block_value_without_invocation() {
        let env = raw(vec![
            Op::PushString("v".to_string()),
            Op::PushProgram(None),
            Op::PushProgram(None),
            Op::EmptyHash { omit: false },
            Op::AmbiguousBlockValue,
        ]);
        let err = CodeGenerator::generate(&env, &CompilerConfig::default()).unwrap_err();
        assert_eq!(err, CompileError::Internal(InternalError::NotAssignable));
    }

    #[test]
    fn test_generation_is_deterministic() {
        let src = "{{#each list as |x i|}}{{i}}: {{x.name}}{{else}}none{{/each}}{{> p a=1}}";
        assert_eq!(generate(src), generate(src));
    }
}
