//! Condition-expression compiler.
//!
//! Rewrites a human-readable condition such as
//! `Info.Year BETWEEN :lo AND :hi AND attribute_exists(Title)` into the
//! store's placeholder form, where every attribute name segment is replaced by
//! a `#nK` name placeholder and every `:value` is bound to an
//! [`AttributeValue`].
//!
//! Grammar (case-sensitive keywords, single-space separated):
//!
//! ```text
//! expression := or_group (' AND ' or_group)*
//! or_group   := term (' OR ' term)*
//! term       := ['NOT '] (function | between | in | comparison)
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use serde_json::Value;

use crate::codec;
use crate::error::ExpressionError;
use crate::types::AttributeValue;

/// Stands in for the `AND` of a `BETWEEN` while the text is split on ` AND `.
const BETWEEN_AND: &str = "\u{1f}AND\u{1f}";

const COMPARATORS: [&str; 5] = [">", ">=", "=", "<", "<="];

/// Built-in condition functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Function {
    AttributeExists,
    AttributeNotExists,
    AttributeType,
    BeginsWith,
    Contains,
}

impl Function {
    const ALL: [Function; 5] = [
        Function::AttributeExists,
        Function::AttributeNotExists,
        Function::AttributeType,
        Function::BeginsWith,
        Function::Contains,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Function::AttributeExists => "attribute_exists",
            Function::AttributeNotExists => "attribute_not_exists",
            Function::AttributeType => "attribute_type",
            Function::BeginsWith => "begins_with",
            Function::Contains => "contains",
        }
    }

    fn takes_value(self) -> bool {
        !matches!(
            self,
            Function::AttributeExists | Function::AttributeNotExists
        )
    }
}

/// Shape of a single parsed term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TermKind {
    Comparison,
    Between,
    In,
    Function(Function),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Term {
    kind: TermKind,
    negated: bool,
}

/// A compiled condition: rewritten text plus its placeholder bindings.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledExpression {
    expression: String,
    names: BTreeMap<String, String>,
    values: BTreeMap<String, AttributeValue>,
    terms: Vec<Term>,
}

impl CompiledExpression {
    /// The rewritten expression text.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Name placeholder to attribute name.
    pub fn names(&self) -> &BTreeMap<String, String> {
        &self.names
    }

    /// Value placeholder to bound value.
    pub fn values(&self) -> &BTreeMap<String, AttributeValue> {
        &self.values
    }

    /// Substitute the name placeholders back, recovering the source text.
    pub fn expand(&self) -> String {
        let mut out = String::with_capacity(self.expression.len());
        let mut chars = self.expression.char_indices().peekable();
        while let Some((start, c)) = chars.next() {
            if c != '#' {
                out.push(c);
                continue;
            }
            let mut end = start + 1;
            while let Some(&(i, next)) = chars.peek() {
                if next.is_ascii_alphanumeric() || next == '_' {
                    end = i + next.len_utf8();
                    chars.next();
                } else {
                    break;
                }
            }
            let placeholder = &self.expression[start..end];
            match self.names.get(placeholder) {
                Some(name) => out.push_str(name),
                None => out.push_str(placeholder),
            }
        }
        out
    }

    /// The only term of this expression, if it has exactly one and it is not negated.
    pub(crate) fn single_term(&self) -> Option<TermKind> {
        match self.terms.as_slice() {
            [term] if !term.negated => Some(term.kind),
            _ => None,
        }
    }

    /// Join two expressions with `AND`.
    pub fn and(self, other: CompiledExpression) -> Result<CompiledExpression, ExpressionError> {
        self.combine(other, "AND")
    }

    /// Join two expressions with `OR`.
    pub fn or(self, other: CompiledExpression) -> Result<CompiledExpression, ExpressionError> {
        self.combine(other, "OR")
    }

    fn combine(
        self,
        other: CompiledExpression,
        op: &str,
    ) -> Result<CompiledExpression, ExpressionError> {
        let expression = format!(
            "{} {op} {}",
            grouped(&self.expression, self.terms.len()),
            grouped(&other.expression, other.terms.len())
        );

        let mut names = self.names;
        for (placeholder, name) in other.names {
            match names.get(&placeholder) {
                Some(existing) if *existing != name => {
                    return Err(ExpressionError::DuplicatePlaceholder(placeholder));
                }
                _ => {
                    names.insert(placeholder, name);
                }
            }
        }

        let mut values = self.values;
        for (placeholder, value) in other.values {
            if values.contains_key(&placeholder) {
                return Err(ExpressionError::DuplicatePlaceholder(placeholder));
            }
            values.insert(placeholder, value);
        }

        let mut terms = self.terms;
        terms.extend(other.terms);

        Ok(CompiledExpression {
            expression,
            names,
            values,
            terms,
        })
    }
}

impl fmt::Display for CompiledExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn grouped(expression: &str, terms: usize) -> String {
    if terms > 1 {
        format!("({expression})")
    } else {
        expression.to_string()
    }
}

/// A placeholder namespace shared by every fragment of one request.
///
/// The same attribute name always maps to the same `#nK` placeholder, and a
/// value placeholder may be bound only once. A failed compile leaves the
/// namespace untouched.
#[derive(Debug, Clone, Default)]
pub struct ExpressionCompiler {
    placeholders: HashMap<String, String>,
    bound_values: HashSet<String>,
    next: usize,
}

impl ExpressionCompiler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compile `expression`, binding `values` to its value placeholders in
    /// the order they appear.
    pub fn compile(
        &mut self,
        expression: &str,
        values: &[Value],
    ) -> Result<CompiledExpression, ExpressionError> {
        let text = expression.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            return Err(ExpressionError::InvalidExpression(
                "empty expression".to_string(),
            ));
        }

        let mut scratch = self.clone();
        let mut pass = Pass {
            ns: &mut scratch,
            names: BTreeMap::new(),
            value_order: Vec::new(),
            terms: Vec::new(),
        };

        let masked = mask_between(&text);
        let mut groups = Vec::new();
        for group in masked.split(" AND ") {
            let mut terms = Vec::new();
            for term in group.split(" OR ") {
                terms.push(pass.term(&term.replace(BETWEEN_AND, "AND"))?);
            }
            groups.push(terms.join(" OR "));
        }

        if pass.value_order.len() != values.len() {
            return Err(ExpressionError::ValueCountMismatch {
                placeholders: pass.value_order.len(),
                values: values.len(),
            });
        }

        let mut bound = BTreeMap::new();
        for (placeholder, value) in pass.value_order.iter().zip(values) {
            let attr =
                codec::to_attribute_value(value).map_err(|e| ExpressionError::InvalidValue {
                    placeholder: placeholder.clone(),
                    reason: e.to_string(),
                })?;
            bound.insert(placeholder.clone(), attr);
        }

        let Pass { names, terms, .. } = pass;
        *self = scratch;

        Ok(CompiledExpression {
            expression: groups.join(" AND "),
            names,
            values: bound,
            terms,
        })
    }
}

/// Compile a standalone expression in a fresh namespace.
pub fn compile(expression: &str, values: &[Value]) -> Result<CompiledExpression, ExpressionError> {
    ExpressionCompiler::new().compile(expression, values)
}

/// Replace the `AND` that closes each `BETWEEN` with [`BETWEEN_AND`].
fn mask_between(text: &str) -> String {
    let mut pending = false;
    text.split(' ')
        .map(|token| {
            if token == "BETWEEN" {
                pending = true;
            } else if pending && token == "AND" {
                pending = false;
                return BETWEEN_AND;
            }
            token
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Split a raw term into (prefix, core, suffix, negated), where the prefix
/// holds leading `(` and `NOT ` and the suffix holds unbalanced trailing `)`.
fn split_edges(raw: &str) -> (&str, &str, &str, bool) {
    let mut rest = raw;
    let mut negated = false;
    loop {
        if let Some(r) = rest.strip_prefix('(') {
            rest = r.trim_start();
        } else if let Some(r) = rest.strip_prefix("NOT ") {
            negated = !negated;
            rest = r;
        } else {
            break;
        }
    }
    let prefix = &raw[..raw.len() - rest.len()];

    let mut core = rest;
    while core.ends_with(')') && core.matches(')').count() > core.matches('(').count() {
        core = core[..core.len() - 1].trim_end();
    }
    let suffix = &rest[core.len()..];

    (prefix, core, suffix, negated)
}

fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(':')
        && name
            .chars()
            .all(|c| !c.is_whitespace() && !"()[],#".contains(c))
}

/// Zero or more `[digits]` groups.
fn is_valid_subscript(mut s: &str) -> bool {
    while !s.is_empty() {
        let Some(inner) = s.strip_prefix('[') else {
            return false;
        };
        let Some(close) = inner.find(']') else {
            return false;
        };
        let digits = &inner[..close];
        if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }
        s = &inner[close + 1..];
    }
    true
}

fn is_valid_placeholder(raw: &str) -> bool {
    raw.strip_prefix(':').is_some_and(|rest| {
        !rest.is_empty() && rest.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    })
}

/// State of one compile call.
struct Pass<'a> {
    ns: &'a mut ExpressionCompiler,
    names: BTreeMap<String, String>,
    value_order: Vec<String>,
    terms: Vec<Term>,
}

impl Pass<'_> {
    fn term(&mut self, raw: &str) -> Result<String, ExpressionError> {
        let (prefix, core, suffix, negated) = split_edges(raw);
        if core.is_empty() {
            return Err(ExpressionError::InvalidExpression(format!(
                "empty term in '{raw}'"
            )));
        }

        let parsed = match self.function(core)? {
            Some(p) => p,
            None => match self.between(core)? {
                Some(p) => p,
                None => match self.in_list(core)? {
                    Some(p) => p,
                    None => self.comparison(core)?.ok_or_else(|| {
                        ExpressionError::InvalidExpression(format!("unrecognised term '{core}'"))
                    })?,
                },
            },
        };

        let (kind, body) = parsed;
        self.terms.push(Term { kind, negated });
        Ok(format!("{prefix}{body}{suffix}"))
    }

    fn function(&mut self, core: &str) -> Result<Option<(TermKind, String)>, ExpressionError> {
        for f in Function::ALL {
            let Some(args) = core
                .strip_prefix(f.name())
                .and_then(|r| r.strip_prefix('('))
                .and_then(|r| r.strip_suffix(')'))
            else {
                continue;
            };

            let args: Vec<&str> = args.split(',').map(str::trim).collect();
            let expected = if f.takes_value() { 2 } else { 1 };
            if args.len() != expected {
                return Err(ExpressionError::InvalidExpression(format!(
                    "{} expects {expected} argument(s), got {}",
                    f.name(),
                    args.len()
                )));
            }

            let path = self.path(args[0])?;
            let body = if f.takes_value() {
                let value = self.value(args[1])?;
                format!("{}({path}, {value})", f.name())
            } else {
                format!("{}({path})", f.name())
            };
            return Ok(Some((TermKind::Function(f), body)));
        }
        Ok(None)
    }

    fn between(&mut self, core: &str) -> Result<Option<(TermKind, String)>, ExpressionError> {
        let tokens: Vec<&str> = core.split(' ').collect();
        let [operand, "BETWEEN", low, "AND", high] = tokens.as_slice() else {
            return Ok(None);
        };
        let operand = self.operand(operand)?;
        let low = self.value(low)?;
        let high = self.value(high)?;
        Ok(Some((
            TermKind::Between,
            format!("{operand} BETWEEN {low} AND {high}"),
        )))
    }

    fn in_list(&mut self, core: &str) -> Result<Option<(TermKind, String)>, ExpressionError> {
        let Some((left, right)) = core.split_once(" IN ") else {
            return Ok(None);
        };
        let Some(list) = right.strip_prefix('(').and_then(|r| r.strip_suffix(')')) else {
            return Ok(None);
        };
        if left.contains(' ') {
            return Ok(None);
        }

        let operand = self.operand(left)?;
        let mut placeholders = Vec::new();
        for item in list.split(',').map(str::trim) {
            placeholders.push(self.value(item)?);
        }
        Ok(Some((
            TermKind::In,
            format!("{operand} IN ({})", placeholders.join(", ")),
        )))
    }

    fn comparison(&mut self, core: &str) -> Result<Option<(TermKind, String)>, ExpressionError> {
        let tokens: Vec<&str> = core.split(' ').collect();
        let [operand, op, value] = tokens.as_slice() else {
            return Ok(None);
        };
        if !COMPARATORS.contains(op) {
            return Ok(None);
        }
        let operand = self.operand(operand)?;
        let value = self.value(value)?;
        Ok(Some((TermKind::Comparison, format!("{operand} {op} {value}"))))
    }

    /// A path, or `size(path)`.
    fn operand(&mut self, raw: &str) -> Result<String, ExpressionError> {
        match raw.strip_prefix("size(").and_then(|r| r.strip_suffix(')')) {
            Some(inner) => Ok(format!("size({})", self.path(inner)?)),
            None => self.path(raw),
        }
    }

    fn path(&mut self, raw: &str) -> Result<String, ExpressionError> {
        let mut segments = Vec::new();
        for segment in raw.split('.') {
            let (name, subscript) = match segment.find('[') {
                Some(i) => segment.split_at(i),
                None => (segment, ""),
            };
            if !is_valid_name(name) || !is_valid_subscript(subscript) {
                return Err(ExpressionError::InvalidExpression(format!(
                    "invalid attribute path '{raw}'"
                )));
            }
            let placeholder = self.name(name);
            segments.push(format!("{placeholder}{subscript}"));
        }
        Ok(segments.join("."))
    }

    fn name(&mut self, name: &str) -> String {
        let placeholder = match self.ns.placeholders.get(name) {
            Some(p) => p.clone(),
            None => {
                let p = format!("#n{}", self.ns.next);
                self.ns.next += 1;
                self.ns.placeholders.insert(name.to_string(), p.clone());
                p
            }
        };
        self.names.insert(placeholder.clone(), name.to_string());
        placeholder
    }

    fn value(&mut self, raw: &str) -> Result<String, ExpressionError> {
        if !is_valid_placeholder(raw) {
            return Err(ExpressionError::InvalidPlaceholder(raw.to_string()));
        }
        if !self.ns.bound_values.insert(raw.to_string()) {
            return Err(ExpressionError::DuplicatePlaceholder(raw.to_string()));
        }
        self.value_order.push(raw.to_string());
        Ok(raw.to_string())
    }
}
