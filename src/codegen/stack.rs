use crate::bytecode::compile_error::InternalError;
use crate::codegen::ir::{Expr, Stmt, Target};

// =============================================================================
// SIMULATED STACK - Compile-time model of the operand stack
// =============================================================================
//
// Values live in one of two tiers. The inline tier holds expressions that
// have not been evaluated yet and can still be folded into their consumer.
// The materialized tier holds values already written to a temporary slot
// (or literals, which never need one). Flushing moves everything inline into
// the materialized tier, assigning non-literals to fresh slots in order.

#[derive(Debug, Clone, PartialEq)]
pub enum StackValue {
    /// Constant or parameter reference, safe to duplicate.
    Literal(Expr),
    /// Deferred expression, evaluated where it is consumed.
    Pending(Expr),
    /// Value stored in temporary `stackN`.
    Materialized(usize),
}

impl StackValue {
    fn into_expr(self) -> Expr {
        match self {
            StackValue::Literal(e) | StackValue::Pending(e) => e,
            StackValue::Materialized(slot) => Expr::Slot(slot),
        }
    }
}

#[derive(Debug, Default)]
pub struct SimStack {
    inline: Vec<StackValue>,
    materialized: Vec<StackValue>,
    slot: usize,
    max_slots: usize,
}

impl SimStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, expr: Expr) {
        self.inline.push(StackValue::Pending(expr));
    }

    pub fn push_literal(&mut self, expr: Expr) {
        self.inline.push(StackValue::Literal(expr));
    }

    pub fn is_inline(&self) -> bool {
        !self.inline.is_empty()
    }

    /// Highest slot number handed out so far.
    pub fn slots(&self) -> usize {
        self.max_slots
    }

    pub fn is_empty(&self) -> bool {
        self.inline.is_empty() && self.materialized.is_empty() && self.slot == 0
    }

    pub fn imbalance(&self) -> InternalError {
        InternalError::StackImbalance {
            inline: self.inline.len(),
            materialized: self.materialized.len(),
            slots: self.slot,
        }
    }

    fn alloc_slot(&mut self) -> usize {
        self.slot += 1;
        self.max_slots = self.max_slots.max(self.slot);
        self.slot
    }

    /// Promote a pending value into the next slot, returning the slot and the
    /// statement that fills it.
    pub fn force(&mut self, expr: Expr) -> (usize, Stmt) {
        let slot = self.alloc_slot();
        (slot, Stmt::Assign(Target::Slot(slot), expr))
    }

    /// Materialize every inline value, bottom first.
    pub fn flush_inline(&mut self) -> Vec<Stmt> {
        let mut stmts = Vec::new();
        for value in std::mem::take(&mut self.inline) {
            match value {
                StackValue::Pending(expr) => {
                    let (slot, stmt) = self.force(expr);
                    stmts.push(stmt);
                    self.materialized.push(StackValue::Materialized(slot));
                }
                other => self.materialized.push(other),
            }
        }
        stmts
    }

    pub fn pop(&mut self) -> Result<Expr, InternalError> {
        if let Some(value) = self.inline.pop() {
            return Ok(value.into_expr());
        }
        match self.materialized.pop() {
            Some(StackValue::Materialized(slot)) => {
                if self.slot == 0 {
                    return Err(InternalError::InvalidStackPop);
                }
                self.slot -= 1;
                Ok(Expr::Slot(slot))
            }
            Some(other) => Ok(other.into_expr()),
            None => Err(InternalError::InvalidStackPop),
        }
    }

    /// Current top without consuming it.
    pub fn top(&self) -> Result<Expr, InternalError> {
        self.inline
            .last()
            .or_else(|| self.materialized.last())
            .cloned()
            .map(StackValue::into_expr)
            .ok_or(InternalError::InvalidStackPop)
    }

    /// Slot holding the top of the materialized tier.
    pub fn top_slot(&self) -> Result<usize, InternalError> {
        if self.is_inline() {
            return Err(InternalError::NotAssignable);
        }
        match self.materialized.last() {
            Some(StackValue::Materialized(slot)) => Ok(*slot),
            Some(_) => Err(InternalError::NotAssignable),
            None => Err(InternalError::InvalidStackPop),
        }
    }

    /// Rewrite the inline top through `build(head, current)`.
    ///
    /// For a literal top `head` and `current` are the literal itself. Anything
    /// else is captured once: `head` assigns it to a scratch slot and
    /// `current` reads that slot back, so the value is evaluated exactly once.
    pub fn replace(&mut self, build: impl FnOnce(Expr, Expr) -> Expr) -> Result<(), InternalError> {
        let top = self
            .inline
            .pop()
            .ok_or(InternalError::ReplaceStackOnNonInline)?;
        let replaced = match top {
            StackValue::Literal(expr) => build(expr.clone(), expr),
            other => {
                let slot = self.alloc_slot();
                let head = Expr::assign(Target::Slot(slot), other.into_expr());
                let replaced = build(head, Expr::Slot(slot));
                self.slot -= 1;
                replaced
            }
        };
        self.inline.push(StackValue::Pending(replaced));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard(head: Expr, current: Expr) -> Expr {
        Expr::cond(head.not_null(), current.member("x"), Expr::string(""))
    }

    #[test]
    fn test_replace_literal_needs_no_slot() {
        let mut stack = SimStack::new();
        stack.push_literal(Expr::Context(0));
        stack.replace(guard).unwrap();
        assert_eq!(stack.slots(), 0);
        assert_eq!(
            stack.pop().unwrap(),
            Expr::cond(
                Expr::Context(0).not_null(),
                Expr::Context(0).member("x"),
                Expr::string("")
            )
        );
        assert!(stack.is_empty());
    }

    #[test]
    fn test_replace_pending_captures_once() {
        let mut stack = SimStack::new();
        stack.push(Expr::Context(0).member("a"));
        stack.replace(guard).unwrap();
        assert_eq!(stack.slots(), 1);
        let Expr::Cond { test, then, .. } = stack.pop().unwrap() else {
            panic!("expected a conditional");
        };
        assert!(matches!(*test, Expr::NotNull(ref inner) if matches!(**inner, Expr::Assign(Target::Slot(1), _))));
        assert_eq!(*then, Expr::Slot(1).member("x"));
        assert!(stack.is_empty());
    }

    #[test]
    fn test_replace_requires_inline_value() {
        let mut stack = SimStack::new();
        assert_eq!(
            stack.replace(guard).unwrap_err(),
            InternalError::ReplaceStackOnNonInline
        );
    }

    #[test]
    fn test_flush_assigns_pending_in_order() {
        let mut stack = SimStack::new();
        stack.push(Expr::Context(0).member("a"));
        stack.push_literal(Expr::string("lit"));
        stack.push(Expr::Context(0).member("b"));
        let stmts = stack.flush_inline();
        assert_eq!(stmts.len(), 2);
        assert!(matches!(stmts[0], Stmt::Assign(Target::Slot(1), _)));
        assert!(matches!(stmts[1], Stmt::Assign(Target::Slot(2), _)));
        assert!(!stack.is_inline());

        assert_eq!(stack.top_slot().unwrap(), 2);
        assert_eq!(stack.pop().unwrap(), Expr::Slot(2));
        assert_eq!(stack.pop().unwrap(), Expr::string("lit"));
        assert_eq!(stack.pop().unwrap(), Expr::Slot(1));
        assert!(stack.is_empty());
        assert_eq!(stack.slots(), 2);
    }

    #[test]
    fn test_literal_top_not_assignable() {
        let mut stack = SimStack::new();
        stack.push_literal(Expr::string("x"));
        stack.flush_inline();
        assert_eq!(stack.top_slot().unwrap_err(), InternalError::NotAssignable);
    }

    #[test]
    fn test_pop_empty_is_invalid() {
        let mut stack = SimStack::new();
        assert_eq!(stack.pop().unwrap_err(), InternalError::InvalidStackPop);
        assert!(stack.top().is_err());
    }

    #[test]
    fn test_leftover_reports_imbalance() {
        let mut stack = SimStack::new();
        stack.push(Expr::Buffer);
        assert!(!stack.is_empty());
        assert!(matches!(
            stack.imbalance(),
            InternalError::StackImbalance { inline: 1, .. }
        ));
    }
}
