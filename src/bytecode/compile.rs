use log::{debug, trace};

use crate::bytecode::{Environment, Literal, Op, Opcode, compile_error::CompileError};
use crate::lang::node::{
    BlockStatement, Expression, Hash, MustacheStatement, PartialBlockStatement, PartialStatement,
    PathExpression, Program, Span, Statement,
};
use crate::options::CompilerConfig;

/// Lower a parsed template into an opcode environment tree.
pub fn compile_environment(
    program: &Program,
    config: &CompilerConfig,
) -> Result<Environment, CompileError> {
    let mut scopes = Vec::new();
    let env = Compiler::new(config, &mut scopes).compile(program)?;
    debug!(
        "lowered template into {} environments ({} top-level opcodes)",
        env.count(),
        env.opcodes.len()
    );
    Ok(env)
}

/// How a mustache, block or sub-expression head is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Called as a helper.
    Helper,
    /// Plain data lookup.
    Simple,
    /// Helper if one is registered at render time, data lookup otherwise.
    Ambiguous,
}

/// The parts of a mustache, block or sub-expression that classification and
/// argument assembly look at. Literal heads are already coerced to paths.
struct Callee<'n> {
    path: PathExpression,
    params: &'n [Expression],
    hash: Option<&'n Hash>,
    span: Span,
    is_subexpression: bool,
}

impl<'n> Callee<'n> {
    fn new(
        path: &Expression,
        params: &'n [Expression],
        hash: Option<&'n Hash>,
        span: Span,
        is_subexpression: bool,
    ) -> Self {
        Callee {
            path: path.as_callee_path(),
            params,
            hash,
            span,
            is_subexpression,
        }
    }

    fn has_arguments(&self) -> bool {
        self.is_subexpression || !self.params.is_empty() || self.hash.is_some()
    }

    fn name(&self) -> &str {
        self.path.head().unwrap_or("")
    }
}

/// Lowers one program body. Nested programs get their own `Compiler` that
/// shares the block-parameter scope stack.
pub struct Compiler<'a> {
    config: &'a CompilerConfig,
    /// Declared block params of every enclosing program, innermost last.
    scopes: &'a mut Vec<Vec<String>>,
    env: Environment,
}

impl<'a> Compiler<'a> {
    fn new(config: &'a CompilerConfig, scopes: &'a mut Vec<Vec<String>>) -> Self {
        Self {
            config,
            scopes,
            env: Environment::default(),
        }
    }

    fn compile(mut self, program: &Program) -> Result<Environment, CompileError> {
        self.scopes.push(program.block_params.clone());
        let result = program.body.iter().try_for_each(|s| self.statement(s));
        self.scopes.pop();
        result?;

        self.env.is_simple = program.body.len() == 1;
        self.env.block_params = program.block_params.len();
        trace!(
            "lowered program at {}: {} opcodes, {} children",
            program.span,
            self.env.opcodes.len(),
            self.env.children.len()
        );
        Ok(self.env)
    }

    /// Lower a nested program and return its child index.
    fn compile_program(&mut self, program: &Program) -> Result<usize, CompileError> {
        let child = Compiler::new(self.config, &mut *self.scopes).compile(program)?;
        self.env.uses_partial |= child.uses_partial;
        self.env.uses_depths |= child.uses_depths;

        let index = self.env.children.len();
        self.env.children.push(child);
        Ok(index)
    }

    fn opcode(&mut self, op: Op, span: Span) {
        self.env.opcodes.push(Opcode { op, span });
    }

    /// `(scope depth, position)` of a block parameter, innermost scope first.
    fn block_param_index(&self, name: &str) -> Option<(usize, usize)> {
        self.scopes
            .iter()
            .rev()
            .enumerate()
            .find_map(|(depth, scope)| scope.iter().position(|p| p == name).map(|i| (depth, i)))
    }

    fn classify(&self, callee: &Callee) -> Classification {
        let is_simple = callee.path.is_simple_id();
        let is_block_param = is_simple && self.block_param_index(callee.name()).is_some();

        let mut is_helper = !is_block_param && callee.has_arguments();
        let mut is_eligible = !is_block_param && (is_helper || is_simple);

        if is_eligible && !is_helper {
            if self.config.is_known_helper(callee.name()) {
                is_helper = true;
            } else if self.config.known_helpers_only {
                is_eligible = false;
            }
        }

        if is_helper {
            Classification::Helper
        } else if is_eligible {
            Classification::Ambiguous
        } else {
            Classification::Simple
        }
    }

    // =========================================================================
    // Statements
    // =========================================================================

    fn statement(&mut self, statement: &Statement) -> Result<(), CompileError> {
        match statement {
            Statement::Mustache(m) => self.mustache(m),
            Statement::Block(b) => self.block(b),
            Statement::Partial(p) => self.partial(p),
            Statement::PartialBlock(p) => self.partial_block(p),
            Statement::Decorator(d) => self.decorator(&d.path, &d.params, d.hash.as_ref(), None, d.span),
            Statement::DecoratorBlock(d) => self.decorator(
                &d.path,
                &d.params,
                d.hash.as_ref(),
                d.program.as_ref(),
                d.span,
            ),
            Statement::Content(c) => {
                if !c.value.is_empty() {
                    self.opcode(Op::AppendContent(c.value.clone()), c.span);
                }
                Ok(())
            }
            Statement::Comment(_) => Ok(()),
        }
    }

    fn mustache(&mut self, mustache: &MustacheStatement) -> Result<(), CompileError> {
        let callee = Callee::new(
            &mustache.path,
            &mustache.params,
            mustache.hash.as_ref(),
            mustache.span,
            false,
        );
        self.sexpr(&callee)?;

        if mustache.escaped && !self.config.no_escape {
            self.opcode(Op::AppendEscaped, mustache.span);
        } else {
            self.opcode(Op::Append, mustache.span);
        }
        Ok(())
    }

    fn block(&mut self, block: &BlockStatement) -> Result<(), CompileError> {
        let callee = Callee::new(
            &block.path,
            &block.params,
            block.hash.as_ref(),
            block.span,
            false,
        );
        let span = block.span;

        let program = block
            .program
            .as_ref()
            .map(|p| self.compile_program(p))
            .transpose()?;
        let inverse = block
            .inverse
            .as_ref()
            .map(|p| self.compile_program(p))
            .transpose()?;

        match self.classify(&callee) {
            Classification::Helper => self.helper_sexpr(&callee, program, inverse)?,
            Classification::Simple => {
                self.simple_sexpr(&callee);
                // a plain value in block position still goes through
                // blockHelperMissing for iteration / conditional semantics
                self.opcode(Op::PushProgram(program), span);
                self.opcode(Op::PushProgram(inverse), span);
                self.opcode(Op::EmptyHash { omit: false }, span);
                self.opcode(Op::BlockValue(callee.path.original.clone()), span);
            }
            Classification::Ambiguous => {
                self.ambiguous_sexpr(&callee, program, inverse);
                self.opcode(Op::PushProgram(program), span);
                self.opcode(Op::PushProgram(inverse), span);
                self.opcode(Op::EmptyHash { omit: false }, span);
                self.opcode(Op::AmbiguousBlockValue, span);
            }
        }

        self.opcode(Op::Append, span);
        Ok(())
    }

    fn partial(&mut self, partial: &PartialStatement) -> Result<(), CompileError> {
        self.invoke_partial(
            &partial.name,
            &partial.params,
            partial.hash.as_ref(),
            &partial.indent,
            None,
            partial.span,
        )
    }

    fn partial_block(&mut self, partial: &PartialBlockStatement) -> Result<(), CompileError> {
        self.invoke_partial(
            &partial.name,
            &partial.params,
            partial.hash.as_ref(),
            "",
            Some(&partial.program),
            partial.span,
        )
    }

    fn invoke_partial(
        &mut self,
        name: &Expression,
        params: &[Expression],
        hash: Option<&Hash>,
        indent: &str,
        program: Option<&Program>,
        span: Span,
    ) -> Result<(), CompileError> {
        self.env.uses_partial = true;

        let program = program.map(|p| self.compile_program(p)).transpose()?;

        if params.len() > 1 {
            return Err(CompileError::partial_arity(params.len(), span));
        }

        let dynamic = matches!(name, Expression::SubExpression(_));
        if dynamic {
            self.expression(name)?;
        }

        let implicit_context;
        let params: &[Expression] = if !params.is_empty() {
            params
        } else if self.config.explicit_partial_context {
            self.opcode(Op::PushLiteral(Literal::Undefined), span);
            &[]
        } else {
            implicit_context = [Expression::Path(PathExpression::this(span))];
            &implicit_context
        };

        self.full_mustache_params(params, hash, program, None, true, span)?;

        let mut indent = indent.to_string();
        if self.config.prevent_indent && !indent.is_empty() {
            self.opcode(Op::AppendContent(std::mem::take(&mut indent)), span);
        }

        self.opcode(
            Op::InvokePartial {
                dynamic,
                name: name.original(),
                indent,
            },
            span,
        );
        self.opcode(Op::Append, span);
        Ok(())
    }

    fn decorator(
        &mut self,
        path: &Expression,
        params: &[Expression],
        hash: Option<&Hash>,
        program: Option<&Program>,
        span: Span,
    ) -> Result<(), CompileError> {
        let program = program.map(|p| self.compile_program(p)).transpose()?;
        let count = self.full_mustache_params(params, hash, program, None, false, span)?;

        self.env.uses_decorators = true;
        self.opcode(
            Op::RegisterDecorator {
                params: count,
                name: path.original(),
            },
            span,
        );
        Ok(())
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn sexpr(&mut self, callee: &Callee) -> Result<(), CompileError> {
        match self.classify(callee) {
            Classification::Simple => {
                self.simple_sexpr(callee);
                Ok(())
            }
            Classification::Helper => self.helper_sexpr(callee, None, None),
            Classification::Ambiguous => {
                self.ambiguous_sexpr(callee, None, None);
                Ok(())
            }
        }
    }

    fn simple_sexpr(&mut self, callee: &Callee) {
        self.path(&callee.path, false, true);
        self.opcode(Op::ResolvePossibleLambda, callee.span);
    }

    fn helper_sexpr(
        &mut self,
        callee: &Callee,
        program: Option<usize>,
        inverse: Option<usize>,
    ) -> Result<(), CompileError> {
        let params = self.full_mustache_params(
            callee.params,
            callee.hash,
            program,
            inverse,
            false,
            callee.span,
        )?;
        let name = callee.name().to_string();

        if self.config.is_known_helper(&name) {
            self.opcode(Op::InvokeKnownHelper { params, name }, callee.span);
        } else if self.config.known_helpers_only {
            return Err(CompileError::unknown_helper(&name, callee.span));
        } else {
            self.path(&callee.path, true, true);
            self.opcode(
                Op::InvokeHelper {
                    params,
                    name: callee.path.original.clone(),
                    simple: callee.path.is_simple_id(),
                },
                callee.span,
            );
        }
        Ok(())
    }

    fn ambiguous_sexpr(&mut self, callee: &Callee, program: Option<usize>, inverse: Option<usize>) {
        let span = callee.span;
        let helper_call = program.is_some() || inverse.is_some();

        self.opcode(Op::GetContext(callee.path.depth), span);
        self.opcode(Op::PushProgram(program), span);
        self.opcode(Op::PushProgram(inverse), span);
        self.path(&callee.path, false, true);
        self.opcode(
            Op::InvokeAmbiguous {
                name: callee.name().to_string(),
                helper_call,
            },
            span,
        );
    }

    fn full_mustache_params(
        &mut self,
        params: &[Expression],
        hash: Option<&Hash>,
        program: Option<usize>,
        inverse: Option<usize>,
        omit_empty: bool,
        span: Span,
    ) -> Result<usize, CompileError> {
        for param in params {
            self.expression(param)?;
        }
        self.opcode(Op::PushProgram(program), span);
        self.opcode(Op::PushProgram(inverse), span);
        match hash {
            Some(hash) => self.hash(hash)?,
            None => self.opcode(Op::EmptyHash { omit: omit_empty }, span),
        }
        Ok(params.len())
    }

    /// All values first, then the assignments last key first, so each
    /// assignment pops its own value.
    fn hash(&mut self, hash: &Hash) -> Result<(), CompileError> {
        self.opcode(Op::PushHash, hash.span);
        for pair in &hash.pairs {
            self.expression(&pair.value)?;
        }
        for pair in hash.pairs.iter().rev() {
            self.opcode(Op::AssignToHash(pair.key.clone()), pair.span);
        }
        self.opcode(Op::PopHash, hash.span);
        Ok(())
    }

    fn expression(&mut self, expr: &Expression) -> Result<(), CompileError> {
        match expr {
            Expression::Path(path) => self.path(path, false, false),
            Expression::SubExpression(sexpr) => {
                let callee = Callee::new(
                    &sexpr.path,
                    &sexpr.params,
                    sexpr.hash.as_ref(),
                    sexpr.span,
                    true,
                );
                self.sexpr(&callee)?;
            }
            Expression::String { value, span } => {
                self.opcode(Op::PushString(value.clone()), *span);
            }
            Expression::Number { value, span } => {
                self.opcode(Op::PushLiteral(Literal::Number(*value)), *span);
            }
            Expression::Boolean { value, span } => {
                self.opcode(Op::PushLiteral(Literal::Bool(*value)), *span);
            }
            Expression::Undefined { span } => {
                self.opcode(Op::PushLiteral(Literal::Undefined), *span);
            }
            Expression::Null { span } => {
                self.opcode(Op::PushLiteral(Literal::Null), *span);
            }
        }
        Ok(())
    }

    fn path(&mut self, path: &PathExpression, falsy: bool, strict: bool) {
        if path.depth > 0 {
            self.env.uses_depths = true;
        }
        self.opcode(Op::GetContext(path.depth), path.span);

        let scoped = path.is_scoped();
        let block_param = if path.depth == 0 && !scoped {
            path.head().and_then(|name| self.block_param_index(name))
        } else {
            None
        };

        let op = if let Some((depth, index)) = block_param {
            self.env.uses_block_params = true;
            Op::LookupBlockParam {
                depth,
                index,
                parts: path.parts.clone(),
            }
        } else if path.parts.is_empty() {
            Op::PushContext
        } else if path.data {
            self.env.uses_data = true;
            Op::LookupData {
                depth: path.depth,
                parts: path.parts.clone(),
                strict,
            }
        } else {
            Op::LookupOnContext {
                parts: path.parts.clone(),
                falsy,
                strict,
                scoped,
            }
        };
        self.opcode(op, path.span);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::compile_error::CompileError;
    use crate::bytecode::stack_check::check_environment;
    use crate::frontend;
    use crate::options::CompileOptions;

    fn lower_with(src: &str, options: CompileOptions) -> Result<Environment, CompileError> {
        let program = frontend::parse(src, &options).unwrap();
        compile_environment(&program, &options.resolve())
    }

    fn lower(src: &str) -> Environment {
        lower_with(src, CompileOptions::default()).unwrap()
    }

    fn ops(env: &Environment) -> Vec<Op> {
        env.opcodes.iter().map(|o| o.op.clone()).collect()
    }

    fn has(env: &Environment, pred: impl Fn(&Op) -> bool) -> bool {
        env.opcodes.iter().any(|o| pred(&o.op))
    }

    #[test]
    fn test_simple_path_lookup() {
        let env = lower("{{foo.bar}}");
        assert_eq!(
            ops(&env),
            vec![
                Op::GetContext(0),
                Op::LookupOnContext {
                    parts: vec!["foo".to_string(), "bar".to_string()],
                    falsy: false,
                    strict: true,
                    scoped: false,
                },
                Op::ResolvePossibleLambda,
                Op::AppendEscaped,
            ]
        );
        assert!(env.is_simple);
    }

    #[test]
    fn test_bare_name_is_ambiguous() {
        let env = lower("{{foo}}");
        assert!(has(&env, |op| matches!(
            op,
            Op::InvokeAmbiguous { name, helper_call: false } if name == "foo"
        )));
    }

    #[test]
    fn test_arguments_make_helper() {
        let env = lower("{{foo bar}}");
        assert!(has(&env, |op| matches!(
            op,
            Op::InvokeHelper { params: 1, name, simple: true } if name == "foo"
        )));
    }

    #[test]
    fn test_known_helper_without_arguments() {
        let env = lower("{{lookup}}");
        assert!(has(&env, |op| matches!(
            op,
            Op::InvokeKnownHelper { params: 0, name } if name == "lookup"
        )));
    }

    #[test]
    fn test_block_param_shadows_known_helper() {
        let env = lower("{{#each items as |if|}}{{if}}{{/each}}");
        let child = &env.children[0];
        assert!(has(child, |op| matches!(
            op,
            Op::LookupBlockParam { depth: 0, index: 0, .. }
        )));
        assert!(!has(child, |op| matches!(
            op,
            Op::InvokeKnownHelper { .. } | Op::InvokeAmbiguous { .. }
        )));
        assert!(child.uses_block_params);
    }

    #[test]
    fn test_known_helpers_only() {
        let options = CompileOptions {
            known_helpers_only: true,
            ..CompileOptions::default()
        };
        let err = lower_with("{{shout name}}", options.clone()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnknownHelperRequested { ref name, .. } if name == "shout"
        ));

        // without arguments the name degrades to a lookup
        let env = lower_with("{{shout}}", options).unwrap();
        assert!(has(&env, |op| matches!(op, Op::ResolvePossibleLambda)));
        assert!(!has(&env, |op| matches!(op, Op::InvokeAmbiguous { .. })));
    }

    #[test]
    fn test_hash_assigned_in_reverse() {
        let env = lower("{{foo a=1 b=2}}");
        let keys: Vec<String> = env
            .opcodes
            .iter()
            .filter_map(|o| match &o.op {
                Op::AssignToHash(k) => Some(k.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(keys, vec!["b".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_simple_block_goes_through_block_value() {
        let env = lower("{{#foo.bar}}x{{/foo.bar}}");
        assert!(has(&env, |op| matches!(op, Op::BlockValue(n) if n == "foo.bar")));
        assert_eq!(env.children.len(), 1);
    }

    #[test]
    fn test_ambiguous_block() {
        let env = lower("{{#foo}}x{{else}}y{{/foo}}");
        assert!(has(&env, |op| matches!(
            op,
            Op::InvokeAmbiguous { helper_call: true, .. }
        )));
        assert!(has(&env, |op| matches!(op, Op::AmbiguousBlockValue)));
        assert_eq!(env.children.len(), 2);
    }

    #[test]
    fn test_depth_bubbles_up() {
        let env = lower("{{#each items}}{{../title}}{{/each}}");
        assert!(env.children[0].uses_depths);
        assert!(env.uses_depths);
    }

    #[test]
    fn test_data_paths() {
        let env = lower("{{#each items}}{{@index}}{{/each}}");
        assert!(env.children[0].uses_data);
        assert!(has(&env.children[0], |op| matches!(
            op,
            Op::LookupData { depth: 0, .. }
        )));
    }

    #[test]
    fn test_partial_arity() {
        let err = lower_with("{{> p a b}}", CompileOptions::default()).unwrap_err();
        assert!(matches!(
            err,
            CompileError::UnsupportedPartialArity { count: 2, .. }
        ));
    }

    #[test]
    fn test_partial_implicit_context() {
        let env = lower("{{> header}}");
        assert!(env.uses_partial);
        assert!(has(&env, |op| matches!(op, Op::PushContext)));
        assert!(has(&env, |op| matches!(op, Op::EmptyHash { omit: true })));
    }

    #[test]
    fn test_partial_prevent_indent() {
        let options = CompileOptions {
            prevent_indent: true,
            ..CompileOptions::default()
        };
        let env = lower_with("a\n  {{> p}}\n", options).unwrap();
        assert!(has(&env, |op| matches!(op, Op::AppendContent(s) if s == "  ")));
        assert!(has(&env, |op| matches!(
            op,
            Op::InvokePartial { indent, .. } if indent.is_empty()
        )));
    }

    #[test]
    fn test_decorator_block() {
        let env = lower("{{#* inline \"p\"}}x{{/inline}}");
        assert!(env.uses_decorators);
        assert!(has(&env, |op| matches!(
            op,
            Op::RegisterDecorator { params: 1, name } if name == "inline"
        )));
    }

    #[test]
    fn test_identical_blocks_lower_equal() {
        let env = lower("{{#if a}}X{{/if}}{{#if a}}X{{/if}}");
        assert_eq!(env.children.len(), 2);
        assert_eq!(env.children[0], env.children[1]);

        let env = lower("{{#if a}}X{{/if}}{{#if a}}Y{{/if}}");
        assert_ne!(env.children[0], env.children[1]);
    }

    #[test]
    fn test_lowering_is_deterministic() {
        let src = "{{#each items as |item|}}{{item.name}} {{> p item}}{{/each}}";
        assert_eq!(lower(src), lower(src));
    }

    #[test]
    fn test_lowered_streams_balance() {
        let env = lower(
            "{{#each items as |x i|}}{{x}} {{foo (bar x) k=1}}{{else}}{{> p}}{{/each}}{{#a}}b{{/a}}",
        );
        assert!(check_environment(&env).is_ok());
    }

    #[test]
    fn test_literal_block_head() {
        let env = lower("{{#true}}x{{/true}}");
        assert!(has(&env, |op| matches!(op, Op::InvokeAmbiguous { name, .. } if name == "true")));
    }
}
