/// Error raised while rendering a template.
///
/// `call_stack` collects the helpers, partials and programs the failure
/// passed through, innermost first.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{}", render(.message, .call_stack))]
pub struct RuntimeError {
    pub message: String,
    pub call_stack: Vec<String>,
}

fn render(message: &str, call_stack: &[String]) -> String {
    let mut out = format!("runtime error: {}", message);
    if !call_stack.is_empty() {
        out.push_str("\n  call stack:");
        for (i, frame) in call_stack.iter().rev().enumerate() {
            out.push_str(&format!("\n    {}: {}", i, frame));
        }
    }
    out
}

impl RuntimeError {
    pub fn new(msg: impl Into<String>) -> Self {
        RuntimeError {
            message: msg.into(),
            call_stack: Vec::new(),
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.call_stack.push(context.into());
        self
    }

    pub fn missing_helper(name: &str) -> Self {
        RuntimeError::new(format!("Missing helper: \"{}\"", name))
    }

    pub fn missing_partial(name: &str) -> Self {
        RuntimeError::new(format!("The partial {} could not be found", name))
    }

    pub fn not_defined(name: &str, on: &str) -> Self {
        RuntimeError::new(format!("\"{}\" not defined in {}", name, on))
    }

    pub fn not_callable(what: &str) -> Self {
        RuntimeError::new(format!("{} is not a function", what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_stack() {
        let err = RuntimeError::missing_helper("foo");
        assert_eq!(err.to_string(), "runtime error: Missing helper: \"foo\"");
    }

    #[test]
    fn test_call_stack_printed_outermost_first() {
        let err = RuntimeError::new("boom")
            .with_context("helper 'inner'")
            .with_context("partial 'outer'");
        let msg = err.to_string();
        assert!(msg.contains("call stack"));
        let outer = msg.find("partial 'outer'").unwrap();
        let inner = msg.find("helper 'inner'").unwrap();
        assert!(outer < inner);
    }
}
