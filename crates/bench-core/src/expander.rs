//! Recursive `{name}` expansion over a [`VariableSpace`].
//!
//! One call to [`Expander::expand`] is one expansion round: every unescaped
//! placeholder is replaced by its variable's (recursively expanded) value,
//! the result is evaluated when it is an arithmetic/comparison expression,
//! and finally one level of brace escaping is removed.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::ExpansionError;
use crate::expr::{Expr, ExprError, Value};
use crate::variables::{VarValue, VariableSpace};

pub const DEFAULT_MAX_DEPTH: usize = 100;

/// Resolves `{var in app.workload.experiment}` references against
/// experiments that were resolved earlier in the run.
pub trait ExperimentLookup {
    fn variable(&self, namespace: &str, name: &str) -> Option<String>;
}

impl ExperimentLookup for BTreeMap<String, BTreeMap<String, String>> {
    fn variable(&self, namespace: &str, name: &str) -> Option<String> {
        self.get(namespace).and_then(|vars| vars.get(name)).cloned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrossReference {
    pub variable: String,
    pub namespace: String,
}

fn cross_reference_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\s*([A-Za-z_][A-Za-z0-9_]*)\s+in\s+([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+){2,})\s*$")
            .expect("static regex")
    })
}

fn parse_cross_reference(contents: &str) -> Option<CrossReference> {
    cross_reference_re().captures(contents).map(|caps| CrossReference {
        variable: caps[1].to_string(),
        namespace: caps[2].to_string(),
    })
}

/// Every `{var in namespace}` placeholder in `text`, including nested ones.
pub fn find_cross_references(text: &str) -> Vec<CrossReference> {
    let mut out = Vec::new();
    for (start, end) in placeholder_spans(text) {
        let contents = &text[start + 1..end];
        if let Some(reference) = parse_cross_reference(contents) {
            out.push(reference);
        } else {
            out.extend(find_cross_references(contents));
        }
    }
    out
}

/// Byte spans `(open, close)` of the outermost unescaped placeholders.
fn placeholder_spans(text: &str) -> Vec<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut open = 0usize;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                let run_end = skip_backslashes(bytes, i);
                i = if run_end < bytes.len() && matches!(bytes[run_end], b'{' | b'}') {
                    run_end + 1
                } else {
                    run_end
                };
                continue;
            }
            b'{' => {
                if depth == 0 {
                    open = i;
                }
                depth += 1;
            }
            b'}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    spans.push((open, i));
                }
            }
            _ => {}
        }
        i += 1;
    }
    spans
}

fn skip_backslashes(bytes: &[u8], mut i: usize) -> usize {
    while i < bytes.len() && bytes[i] == b'\\' {
        i += 1;
    }
    i
}

/// Removes one backslash from every backslash run that escapes a brace.
pub fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending = 0usize;
    for ch in text.chars() {
        if ch == '\\' {
            pending += 1;
            continue;
        }
        let keep = if (ch == '{' || ch == '}') && pending > 0 {
            pending - 1
        } else {
            pending
        };
        out.extend(std::iter::repeat('\\').take(keep));
        pending = 0;
        out.push(ch);
    }
    out.extend(std::iter::repeat('\\').take(pending));
    out
}

struct Raw {
    text: String,
    /// Escaped braces or passed-through placeholders are present, so the
    /// text must not be treated as an expression.
    opaque: bool,
}

pub struct Expander<'a> {
    space: &'a VariableSpace,
    lookup: Option<&'a dyn ExperimentLookup>,
    strict: bool,
    max_depth: usize,
    cache: RefCell<HashMap<String, String>>,
}

impl<'a> Expander<'a> {
    pub fn new(space: &'a VariableSpace) -> Self {
        Self {
            space,
            lookup: None,
            strict: false,
            max_depth: DEFAULT_MAX_DEPTH,
            cache: RefCell::new(HashMap::new()),
        }
    }

    /// Undefined placeholders fail instead of passing through verbatim.
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth.max(1);
        self
    }

    pub fn with_lookup(mut self, lookup: &'a dyn ExperimentLookup) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn space(&self) -> &VariableSpace {
        self.space
    }

    pub fn expand(&self, text: &str) -> Result<String, ExpansionError> {
        let raw = self.expand_raw(text, &mut Vec::new(), 0)?;
        Ok(unescape(&raw.text))
    }

    /// Expands `{name}`.
    pub fn expand_var(&self, name: &str) -> Result<String, ExpansionError> {
        self.expand(&format!("{{{}}}", name))
    }

    /// Like [`Expander::expand`] but keeps the evaluated type.
    pub fn expand_typed(&self, text: &str) -> Result<Value, ExpansionError> {
        let raw = self.expand_raw(text, &mut Vec::new(), 0)?;
        if !raw.opaque {
            if let Ok(expr) = Expr::parse(&raw.text) {
                if let Ok(value) = expr.evaluate(&BTreeMap::new()) {
                    return Ok(value);
                }
            }
        }
        Ok(Value::Str(unescape(&raw.text)))
    }

    /// Expands `text` and evaluates it as a boolean expression; anything
    /// that does not evaluate to a boolean is a type error.
    pub fn evaluate_bool(&self, text: &str) -> Result<bool, ExpansionError> {
        match self.expand_typed(text)? {
            Value::Bool(b) => Ok(b),
            other => Err(ExpansionError::Type {
                expression: text.to_string(),
                message: format!("expected a boolean, got '{}'", other),
            }),
        }
    }

    /// Expands `text` and evaluates it with extra names bound, as success
    /// criteria do with `value`.
    pub fn evaluate_with(
        &self,
        text: &str,
        bindings: &BTreeMap<String, Value>,
    ) -> Result<Value, ExpansionError> {
        let raw = self.expand_raw(text, &mut Vec::new(), 0)?;
        let expression = unescape(&raw.text);
        Expr::parse(&expression)
            .and_then(|expr| expr.evaluate(bindings))
            .map_err(|err| expr_error(&expression, err))
    }

    fn expand_raw(
        &self,
        text: &str,
        stack: &mut Vec<String>,
        depth: usize,
    ) -> Result<Raw, ExpansionError> {
        let substituted = self.substitute(text, stack, depth)?;
        if substituted.opaque {
            return Ok(substituted);
        }
        match Expr::parse(&substituted.text) {
            Ok(expr) if !expr.is_literal() => match expr.evaluate(&BTreeMap::new()) {
                Ok(value) => Ok(Raw {
                    text: value.to_string(),
                    opaque: false,
                }),
                Err(ExprError::NotExpression(_)) => Ok(substituted),
                Err(err) => Err(expr_error(&substituted.text, err)),
            },
            _ => Ok(substituted),
        }
    }

    /// Replaces every unescaped placeholder in `text` once.
    fn substitute(
        &self,
        text: &str,
        stack: &mut Vec<String>,
        depth: usize,
    ) -> Result<Raw, ExpansionError> {
        if depth > self.max_depth {
            return Err(ExpansionError::RecursionLimit {
                expression: text.to_string(),
                limit: self.max_depth,
            });
        }
        let spans = placeholder_spans(text);
        let mut out = String::with_capacity(text.len());
        let mut opaque = text.contains("\\{") || text.contains("\\}");
        let mut cursor = 0;
        for (open, close) in spans {
            out.push_str(&text[cursor..open]);
            let inner = self.substitute(&text[open + 1..close], stack, depth + 1)?;
            match self.resolve_placeholder(&inner.text, text, stack, depth)? {
                Some(value) => out.push_str(&value),
                None => {
                    opaque = true;
                    out.push('{');
                    out.push_str(&inner.text);
                    out.push('}');
                }
            }
            cursor = close + 1;
        }
        out.push_str(&text[cursor..]);
        if self.strict && has_unbalanced_open(&out) && !opaque {
            return Err(ExpansionError::Syntax {
                expression: text.to_string(),
                message: "unbalanced '{'".to_string(),
            });
        }
        Ok(Raw { text: out, opaque })
    }

    fn resolve_placeholder(
        &self,
        contents: &str,
        expression: &str,
        stack: &mut Vec<String>,
        depth: usize,
    ) -> Result<Option<String>, ExpansionError> {
        let name = contents.trim();
        if let Some(value) = self.space.resolve(name) {
            return self.expand_variable(name, value, stack, depth).map(Some);
        }
        if let Some(reference) = parse_cross_reference(name) {
            if let Some(value) = self
                .lookup
                .and_then(|lookup| lookup.variable(&reference.namespace, &reference.variable))
            {
                return Ok(Some(value));
            }
            return self.undefined(name, expression);
        }
        match Expr::parse(name) {
            Ok(expr) if expr.is_literal() => Ok(Some(name.to_string())),
            Ok(expr) => match expr.evaluate(&BTreeMap::new()) {
                Ok(value) => Ok(Some(value.to_string())),
                Err(ExprError::NotExpression(_)) => self.undefined(name, expression),
                Err(err) => Err(expr_error(name, err)),
            },
            Err(_) => self.undefined(name, expression),
        }
    }

    fn undefined(&self, name: &str, expression: &str) -> Result<Option<String>, ExpansionError> {
        if self.strict {
            Err(ExpansionError::Undefined {
                name: name.to_string(),
                expression: expression.to_string(),
            })
        } else {
            Ok(None)
        }
    }

    fn expand_variable(
        &self,
        name: &str,
        value: &VarValue,
        stack: &mut Vec<String>,
        depth: usize,
    ) -> Result<String, ExpansionError> {
        if let Some(cached) = self.cache.borrow().get(name) {
            return Ok(cached.clone());
        }
        if let Some(pos) = stack.iter().position(|entry| entry == name) {
            let mut path = stack[pos..].to_vec();
            path.push(name.to_string());
            return Err(ExpansionError::Cycle { path });
        }
        let text = match value {
            VarValue::Scalar(text) => text,
            VarValue::List(_) => {
                return Err(ExpansionError::Type {
                    expression: name.to_string(),
                    message: format!("vector variable '{}' has no single value here", name),
                })
            }
        };
        stack.push(name.to_string());
        let expanded = self.expand_raw(text, stack, depth + 1);
        stack.pop();
        let expanded = expanded?.text;
        self.cache
            .borrow_mut()
            .insert(name.to_string(), expanded.clone());
        Ok(expanded)
    }
}

fn has_unbalanced_open(text: &str) -> bool {
    let bytes = text.as_bytes();
    let mut depth = 0i64;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => {
                i = skip_backslashes(bytes, i) + 1;
                continue;
            }
            b'{' => depth += 1,
            b'}' if depth > 0 => depth -= 1,
            _ => {}
        }
        i += 1;
    }
    depth > 0
}

fn expr_error(expression: &str, err: ExprError) -> ExpansionError {
    match err {
        ExprError::Arithmetic(message) => ExpansionError::Arithmetic {
            expression: expression.to_string(),
            message,
        },
        ExprError::Type(message) => ExpansionError::Type {
            expression: expression.to_string(),
            message,
        },
        ExprError::NotExpression(message) => ExpansionError::Syntax {
            expression: expression.to_string(),
            message,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::variables::Scope;

    fn space(vars: &[(&str, &str)]) -> VariableSpace {
        let mut space = VariableSpace::new();
        for (name, value) in vars {
            space.define(Scope::Experiment, *name, VarValue::scalar(*value));
        }
        space
    }

    #[test]
    fn references_expand_recursively() {
        let vars = space(&[("a", "{b}"), ("b", "5")]);
        assert_eq!(Expander::new(&vars).expand("{a}").expect("expand"), "5");
    }

    #[test]
    fn arithmetic_is_evaluated_after_substitution() {
        let vars = space(&[("a", "2"), ("b", "3")]);
        let expander = Expander::new(&vars);
        assert_eq!(expander.expand("{a}*{b}").expect("expand"), "6");
        assert_eq!(expander.expand_typed("{a}*{b}").expect("expand"), Value::Int(6));
        assert_eq!(expander.expand("{a}/{b}x").expect("expand"), "2/3x");
        assert_eq!(expander.expand("n={a*b}").expect("expand"), "n={a*b}");
        assert_eq!(expander.expand("n={2*3}").expect("expand"), "n=6");
    }

    #[test]
    fn overflowing_values_fail_the_expansion() {
        for value in [
            "(-9223372036854775807-1)//-1",
            "(-9223372036854775807-1)%-1",
            "'ab'*9223372036854775807",
        ] {
            let vars = space(&[("x", value)]);
            let err = Expander::new(&vars).expand("{x}").expect_err(value);
            assert!(matches!(err, ExpansionError::Arithmetic { .. }), "{}: {:?}", value, err);
        }
    }

    #[test]
    fn self_reference_is_a_cycle() {
        let vars = space(&[("a", "{a}")]);
        let err = Expander::new(&vars).expand("{a}").expect_err("cycle");
        assert!(matches!(err, ExpansionError::Cycle { .. }), "{:?}", err);

        let vars = space(&[("a", "{b}"), ("b", "x{c}"), ("c", "{a}")]);
        match Expander::new(&vars).expand("{a}").expect_err("cycle") {
            ExpansionError::Cycle { path } => assert_eq!(path, vec!["a", "b", "c", "a"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn nested_placeholders_build_names() {
        let vars = space(&[("a", "x"), ("x_b", "found")]);
        assert_eq!(Expander::new(&vars).expand("{{a}_b}").expect("expand"), "found");
    }

    #[test]
    fn strict_and_lenient_modes_differ_on_undefined() {
        let vars = space(&[("a", "1")]);
        let lenient = Expander::new(&vars);
        assert_eq!(lenient.expand("{a} {missing}").expect("expand"), "1 {missing}");
        assert_eq!(lenient.expand("${HOME}/x").expect("expand"), "${HOME}/x");
        let strict = Expander::new(&vars).strict(true);
        match strict.expand("{a} {missing}").expect_err("undefined") {
            ExpansionError::Undefined { name, .. } => assert_eq!(name, "missing"),
            other => panic!("expected undefined, got {:?}", other),
        }
    }

    #[test]
    fn escaped_braces_survive_exactly_one_round() {
        let vars = space(&[("a", "1"), ("deferred", "\\{a\\}")]);
        let expander = Expander::new(&vars);
        let once = expander.expand("{deferred} \\{a\\}").expect("expand");
        assert_eq!(once, "{a} {a}");
        assert_eq!(expander.expand(&once).expect("expand"), "1 1");
        assert_eq!(expander.expand("\\\\{a\\\\}").expect("expand"), "\\{a\\}");
    }

    #[test]
    fn literals_keep_their_spelling() {
        let vars = space(&[("v", "007"), ("f", "1.50")]);
        let expander = Expander::new(&vars);
        assert_eq!(expander.expand("{v}").expect("expand"), "007");
        assert_eq!(expander.expand("{f}").expect("expand"), "1.50");
    }

    #[test]
    fn arithmetic_failures_are_errors() {
        let vars = space(&[("a", "1"), ("b", "0")]);
        let err = Expander::new(&vars).expand("{a}/{b}").expect_err("division");
        assert!(matches!(err, ExpansionError::Arithmetic { .. }));
    }

    #[test]
    fn recursion_limit_is_enforced() {
        let vars = space(&[("a", "{b}"), ("b", "{c}"), ("c", "1")]);
        let err = Expander::new(&vars)
            .max_depth(2)
            .expand("{a}")
            .expect_err("limit");
        assert!(matches!(err, ExpansionError::RecursionLimit { .. }), "{:?}", err);
    }

    #[test]
    fn cross_experiment_references_use_lookup() {
        let vars = space(&[("n", "{n_nodes in app.wl.base}")]);
        let mut resolved: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        resolved
            .entry("app.wl.base".to_string())
            .or_default()
            .insert("n_nodes".to_string(), "4".to_string());
        let expander = Expander::new(&vars).with_lookup(&resolved);
        assert_eq!(expander.expand("{n}*2").expect("expand"), "8");
        assert_eq!(
            find_cross_references("x {n_nodes in app.wl.base} {{y} in a.b.c}"),
            vec![CrossReference {
                variable: "n_nodes".into(),
                namespace: "app.wl.base".into()
            }]
        );
    }

    #[test]
    fn where_expressions_evaluate_to_booleans() {
        let vars = space(&[("platform", "p1"), ("n_nodes", "2")]);
        let expander = Expander::new(&vars);
        assert!(expander
            .evaluate_bool("'{platform}' == 'p1' and {n_nodes} > 1")
            .expect("eval"));
        assert!(expander.evaluate_bool("{platform}").is_err());
    }

    #[test]
    fn vectors_cannot_be_expanded_as_scalars() {
        let mut vars = VariableSpace::new();
        vars.define(
            Scope::Experiment,
            "v",
            VarValue::List(vec!["1".into(), "2".into()]),
        );
        assert!(matches!(
            Expander::new(&vars).expand("{v}"),
            Err(ExpansionError::Type { .. })
        ));
    }
}
