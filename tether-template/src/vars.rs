//! Variable scope and placeholder rendering.
//!
//! Placeholders are `{{path}}` with dot traversal and bracket indexing
//! (`a.b[0].c`). Prompt bodies may also contain `{% if EXPR %}…{% endif %}`
//! and `{% for X in ARR %}…{% endfor %}` blocks, which are expanded
//! before placeholder substitution. Rendering is idempotent on strings
//! without placeholders.

use serde_json::Value;

use tether_types::TemplateError;

/// A template execution scope: named bindings resolvable by path.
///
/// Scopes are plain values; a child scope is a clone plus extra
/// bindings, so loop iterations and sub-templates cannot leak writes
/// back into their parent.
#[derive(Debug, Clone, Default)]
pub struct Scope {
    values: serde_json::Map<String, Value>,
}

impl Scope {
    /// An empty scope.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, replacing any existing binding.
    pub fn insert(&mut self, name: impl Into<String>, value: Value) {
        self.values.insert(name.into(), value);
    }

    /// Whether `name` is bound at the top level.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Resolve a dotted/bracketed path against the scope.
    #[must_use]
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        let mut segments = parse_path(path)?.into_iter();
        let first = segments.next()?;
        let PathSegment::Key(root) = first else { return None };
        let mut current = self.values.get(&root)?;
        for segment in segments {
            current = match segment {
                PathSegment::Key(key) => current.get(key.as_str())?,
                PathSegment::Index(index) => current.get(index)?,
            };
        }
        Some(current)
    }
}

enum PathSegment {
    Key(String),
    Index(usize),
}

/// Split `a.b[0].c` into key/index segments.
fn parse_path(path: &str) -> Option<Vec<PathSegment>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        let key_end = rest.find('[').unwrap_or(rest.len());
        if key_end > 0 {
            segments.push(PathSegment::Key(rest[..key_end].to_string()));
        }
        rest = &rest[key_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped.find(']')?;
            let index: usize = stripped[..close].parse().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return None;
        }
    }
    Some(segments)
}

/// Render a value for embedding in text: strings verbatim, everything
/// else as compact JSON.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Truthiness for conditions: null, false, empty string/array/object,
/// and zero are false.
#[must_use]
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Render a template string against a scope.
///
/// Block tags expand first (`{% for %}`, `{% if %}`), then `{{path}}`
/// placeholders substitute. An unresolvable placeholder fails the
/// render.
///
/// # Errors
///
/// [`TemplateError::VariableMissing`] for undefined placeholder paths;
/// [`TemplateError::Parse`] for malformed block tags.
pub fn render(input: &str, scope: &Scope) -> Result<String, TemplateError> {
    let expanded = expand_blocks(input, scope)?;
    substitute(&expanded, scope)
}

fn substitute(input: &str, scope: &Scope) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(end) = after.find("}}") else {
            return Err(TemplateError::Parse("unterminated {{ placeholder".into()));
        };
        let path = after[..end].trim();
        let value = scope
            .resolve(path)
            .ok_or_else(|| TemplateError::VariableMissing(path.to_string()))?;
        out.push_str(&value_to_string(value));
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Evaluate a condition expression on the scope.
///
/// Operators: `==`, `!=`, `contains`, `not contains`; a bare expression
/// tests truthiness. Unresolvable references evaluate as empty (falsy)
/// rather than failing, so a condition can probe optional bindings.
#[must_use]
pub fn evaluate_condition(expr: &str, scope: &Scope) -> bool {
    let expr = expr.trim();
    if let Some((left, right)) = split_operator(expr, "==") {
        return side_value(left, scope) == side_value(right, scope);
    }
    if let Some((left, right)) = split_operator(expr, "!=") {
        return side_value(left, scope) != side_value(right, scope);
    }
    if let Some((left, right)) = split_operator(expr, " not contains ") {
        return !side_value(left, scope).contains(&side_value(right, scope));
    }
    if let Some((left, right)) = split_operator(expr, " contains ") {
        return side_value(left, scope).contains(&side_value(right, scope));
    }
    match resolve_side(expr, scope) {
        Some(value) => is_truthy(&value),
        // Quoted literals carry their own truthiness; an unresolved
        // reference is falsy, so conditions can probe optional bindings.
        None if expr.starts_with('\'') || expr.starts_with('"') => {
            let literal = side_literal(expr);
            !literal.is_empty() && literal != "false"
        }
        None => false,
    }
}

fn split_operator<'a>(expr: &'a str, op: &str) -> Option<(&'a str, &'a str)> {
    expr.split_once(op).map(|(l, r)| (l.trim(), r.trim()))
}

/// Resolve one side of a comparison to its string form.
fn side_value(side: &str, scope: &Scope) -> String {
    match resolve_side(side, scope) {
        Some(value) => value_to_string(&value),
        None => side_literal(side),
    }
}

/// Resolve `{{path}}` or a bare path; `None` for literals/unresolved.
fn resolve_side(side: &str, scope: &Scope) -> Option<Value> {
    let path = side
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map_or(side, str::trim)
        .trim();
    if path.starts_with('\'') || path.starts_with('"') {
        return None;
    }
    scope.resolve(path).cloned()
}

fn side_literal(side: &str) -> String {
    let side = side.trim();
    let side = side
        .strip_prefix("{{")
        .and_then(|s| s.strip_suffix("}}"))
        .map(str::trim)
        .unwrap_or(side);
    side.trim_matches(|c| c == '\'' || c == '"').to_string()
}

/// Expand `{% if %}` and `{% for %}` blocks, innermost-last via
/// recursion on the block bodies.
fn expand_blocks(input: &str, scope: &Scope) -> Result<String, TemplateError> {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("{%") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let Some(tag_end) = after.find("%}") else {
            return Err(TemplateError::Parse("unterminated {% tag".into()));
        };
        let tag = after[..tag_end].trim();
        let body_start = &after[tag_end + 2..];

        if let Some(expr) = tag.strip_prefix("if ") {
            let (body, remainder) = take_block(body_start, "if", "endif")?;
            if evaluate_condition(expr, scope) {
                out.push_str(&expand_blocks(body, scope)?);
            }
            rest = remainder;
        } else if let Some(head) = tag.strip_prefix("for ") {
            let Some((var, array_expr)) = head.split_once(" in ") else {
                return Err(TemplateError::Parse(format!("malformed for tag: {tag}")));
            };
            let (body, remainder) = take_block(body_start, "for", "endfor")?;
            let array_path = array_expr
                .trim()
                .strip_prefix("{{")
                .and_then(|s| s.strip_suffix("}}"))
                .map_or(array_expr.trim(), str::trim);
            let items = match scope.resolve(array_path) {
                Some(Value::Array(items)) => items.clone(),
                Some(_) => {
                    return Err(TemplateError::TypeMismatch {
                        context: format!("for {var}"),
                        expected: "array".into(),
                    });
                }
                None => return Err(TemplateError::VariableMissing(array_path.to_string())),
            };
            for item in items {
                let mut iteration = scope.clone();
                iteration.insert(var.trim(), item);
                out.push_str(&expand_blocks(body, &iteration)?);
            }
            rest = remainder;
        } else if tag == "endif" || tag == "endfor" {
            return Err(TemplateError::Parse(format!("unexpected {{% {tag} %}}")));
        } else {
            return Err(TemplateError::Parse(format!("unknown tag: {tag}")));
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Take a block body up to the matching end tag, handling nesting.
fn take_block<'a>(
    input: &'a str,
    open: &str,
    close: &str,
) -> Result<(&'a str, &'a str), TemplateError> {
    let mut depth = 1usize;
    let mut cursor = 0usize;
    while let Some(pos) = input[cursor..].find("{%") {
        let tag_start = cursor + pos;
        let after = &input[tag_start + 2..];
        let Some(tag_end) = after.find("%}") else {
            return Err(TemplateError::Parse("unterminated {% tag".into()));
        };
        let tag = after[..tag_end].trim();
        if tag.starts_with(&format!("{open} ")) || tag == open {
            depth += 1;
        } else if tag == close {
            depth -= 1;
            if depth == 0 {
                return Ok((&input[..tag_start], &after[tag_end + 2..]));
            }
        }
        cursor = tag_start + 2 + tag_end + 2;
    }
    Err(TemplateError::Parse(format!("missing {{% {close} %}}")))
}
