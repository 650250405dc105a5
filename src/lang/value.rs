use std::{fmt, rc::Rc};

use indexmap::IndexMap;

use crate::runtime::runtime_error::RuntimeError;

/// Insertion-ordered property map backing object values.
pub type Object = IndexMap<String, Value>;

/// Signature shared by helpers, lambdas and compiled programs:
/// `(this, arguments) -> result`.
pub type NativeFn = dyn Fn(&Value, &[Value]) -> Result<Value, RuntimeError>;

/// Runtime value seen by templates.
///
/// Values follow the dynamic-language rules templates are written against:
/// missing data is `Undefined`, truthiness treats `0`, `""`, `null` and
/// `undefined` as false, and objects keep their key order.
#[derive(Clone, Default)]
pub enum Value {
    #[default]
    Undefined,

    Null,

    Bool(bool),

    /// All numbers are doubles.
    Number(f64),

    String(String),

    /// Text that has already been escaped and must be emitted verbatim.
    SafeString(String),

    Array(Rc<Vec<Value>>),

    Object(Rc<Object>),

    /// Helpers, lambdas and compiled block programs.
    Function(Function),
}

/// Extra properties attached to a callable.
///
/// Block programs carry the index of the program they were built from and the
/// number of block parameters the block declared; inline partials registered by
/// decorators ride along in `partials`.
#[derive(Debug, Clone, Default)]
pub struct FunctionMeta {
    pub program: Option<usize>,
    pub block_params: usize,
    pub partials: Option<Rc<Object>>,
}

#[derive(Clone)]
pub struct Function {
    call: Rc<NativeFn>,
    meta: FunctionMeta,
}

impl Function {
    pub fn new(f: impl Fn(&Value, &[Value]) -> Result<Value, RuntimeError> + 'static) -> Self {
        Function {
            call: Rc::new(f),
            meta: FunctionMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: FunctionMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta(&self) -> &FunctionMeta {
        &self.meta
    }

    pub fn call(&self, this: &Value, args: &[Value]) -> Result<Value, RuntimeError> {
        (self.call)(this, args)
    }

    pub fn ptr_eq(&self, other: &Function) -> bool {
        Rc::ptr_eq(&self.call, &other.call)
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.meta.program {
            Some(i) => write!(f, "<program {}>", i),
            None => write!(f, "<function>"),
        }
    }
}

impl Value {
    pub fn string(s: impl Into<String>) -> Self {
        Value::String(s.into())
    }

    pub fn array(items: Vec<Value>) -> Self {
        Value::Array(Rc::new(items))
    }

    pub fn object<K: Into<String>>(pairs: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Object(Rc::new(
            pairs.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        ))
    }

    pub fn function(
        f: impl Fn(&Value, &[Value]) -> Result<Value, RuntimeError> + 'static,
    ) -> Self {
        Value::Function(Function::new(f))
    }

    pub fn is_nullish(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Undefined | Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::SafeString(_) | Value::Array(_) | Value::Object(_) | Value::Function(_) => true,
        }
    }

    /// Emptiness as the block helpers see it: falsy values other than `0`,
    /// and empty arrays.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Number(n) if *n == 0.0 => false,
            Value::Array(items) => items.is_empty(),
            other => !other.is_truthy(),
        }
    }

    pub fn as_function(&self) -> Option<&Function> {
        match self {
            Value::Function(f) => Some(f),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&Object> {
        match self {
            Value::Object(o) => Some(o),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::SafeString(s) => Some(s),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) | Value::SafeString(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
            Value::Function(_) => "function",
        }
    }

    /// Property access. Missing properties and lookups on primitives yield
    /// `Undefined`; arrays and strings answer `length` and numeric indices.
    pub fn get(&self, key: &str) -> Value {
        match self {
            Value::Object(map) => map.get(key).cloned().unwrap_or_default(),
            Value::Array(items) => {
                if key == "length" {
                    return Value::Number(items.len() as f64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| items.get(i).cloned())
                    .unwrap_or_default()
            }
            Value::String(s) | Value::SafeString(s) => {
                if key == "length" {
                    return Value::Number(s.chars().count() as f64);
                }
                key.parse::<usize>()
                    .ok()
                    .and_then(|i| s.chars().nth(i))
                    .map(|c| Value::String(c.to_string()))
                    .unwrap_or_default()
            }
            _ => Value::Undefined,
        }
    }

    /// True when `key` names an own property (the `in` test used by strict
    /// lookups).
    pub fn has(&self, key: &str) -> bool {
        match self {
            Value::Object(map) => map.contains_key(key),
            Value::Array(items) => {
                key == "length" || key.parse::<usize>().is_ok_and(|i| i < items.len())
            }
            Value::String(s) | Value::SafeString(s) => {
                key == "length" || key.parse::<usize>().is_ok_and(|i| i < s.chars().count())
            }
            _ => false,
        }
    }

    /// Loose equality (`==`): `null` and `undefined` are equal to each other,
    /// primitives compare by value, containers and functions by identity.
    pub fn loose_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (a, b) if a.is_nullish() && b.is_nullish() => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::SafeString(a), Value::SafeString(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }

    /// String coercion as performed by `'' + value`.
    pub fn to_js_string(&self) -> String {
        match self {
            Value::Undefined => "undefined".to_string(),
            Value::Null => "null".to_string(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => format_number(*n),
            Value::String(s) | Value::SafeString(s) => s.clone(),
            Value::Array(items) => items
                .iter()
                .map(|v| {
                    if v.is_nullish() {
                        String::new()
                    } else {
                        v.to_js_string()
                    }
                })
                .collect::<Vec<_>>()
                .join(","),
            Value::Object(_) => "[object Object]".to_string(),
            Value::Function(_) => "function".to_string(),
        }
    }
}

/// Format a number the way templates print it: integral values without a
/// fractional part, `NaN` and `Infinity` spelled out.
pub fn format_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n.is_infinite() {
        let s = if n > 0.0 { "Infinity" } else { "-Infinity" };
        s.to_string()
    } else if n == n.trunc() && n.abs() < 1e21 {
        // -0 prints as 0
        format!("{:.0}", if n == 0.0 { 0.0 } else { n })
    } else {
        format!("{}", n)
    }
}

impl PartialEq for Value {
    /// Structural equality for data; functions compare by identity.
    fn eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::SafeString(a), Value::SafeString(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.ptr_eq(b),
            _ => false,
        }
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => write!(f, "undefined"),
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", format_number(*n)),
            Value::String(s) => write!(f, "{:?}", s),
            Value::SafeString(s) => write!(f, "safe({:?})", s),
            Value::Array(items) => f.debug_list().entries(items.iter()).finish(),
            Value::Object(map) => f.debug_map().entries(map.iter()).finish(),
            Value::Function(func) => write!(f, "{:?}", func),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_js_string())
    }
}

// =============================================================================
// CONVERSIONS
// =============================================================================

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::object(map.into_iter().map(|(k, v)| (k, Value::from(v))))
            }
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::array(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truthiness() {
        assert!(!Value::Undefined.is_truthy());
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Number(0.0).is_truthy());
        assert!(!Value::Number(f64::NAN).is_truthy());
        assert!(!Value::string("").is_truthy());
        assert!(Value::string("0").is_truthy());
        assert!(Value::array(vec![]).is_truthy());
        assert!(Value::object(Vec::<(String, Value)>::new()).is_truthy());
    }

    #[test]
    fn test_is_empty_keeps_zero() {
        assert!(!Value::Number(0.0).is_empty());
        assert!(Value::array(vec![]).is_empty());
        assert!(Value::Bool(false).is_empty());
        assert!(!Value::array(vec![Value::Null]).is_empty());
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(1.0), "1");
        assert_eq!(format_number(-0.0), "0");
        assert_eq!(format_number(2.5), "2.5");
        assert_eq!(format_number(f64::NAN), "NaN");
        assert_eq!(format_number(f64::NEG_INFINITY), "-Infinity");
    }

    #[test]
    fn test_property_lookup() {
        let v = Value::from(serde_json::json!({"a": {"b": [10, 20]}, "s": "abc"}));
        assert_eq!(v.get("a").get("b").get("1"), Value::Number(20.0));
        assert_eq!(v.get("a").get("b").get("length"), Value::Number(2.0));
        assert_eq!(v.get("s").get("length"), Value::Number(3.0));
        assert_eq!(v.get("missing"), Value::Undefined);
        assert_eq!(Value::Number(1.0).get("x"), Value::Undefined);
        assert!(v.has("a"));
        assert!(!v.has("b"));
    }

    #[test]
    fn test_json_object_order_preserved() {
        let v = Value::from(serde_json::json!({"z": 1, "a": 2}));
        let keys: Vec<_> = v.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["z".to_string(), "a".to_string()]);
    }

    #[test]
    fn test_string_coercion() {
        assert_eq!(Value::array(vec![1i64.into(), Value::Null, "x".into()]).to_js_string(), "1,,x");
        assert_eq!(Value::Bool(true).to_js_string(), "true");
        assert_eq!(Value::Undefined.to_js_string(), "undefined");
    }

    #[test]
    fn test_loose_eq_identity() {
        let a = Value::object([("k", Value::Null)]);
        let b = a.clone();
        let c = Value::object([("k", Value::Null)]);
        assert!(a.loose_eq(&b));
        assert!(!a.loose_eq(&c));
        assert!(Value::Null.loose_eq(&Value::Undefined));
        assert!(a == c);
    }
}
