// Copyright 2025 Tributary Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// SPDX-License-Identifier: Apache-2.0

//! Filter and projection expression evaluation.
//!
//! Table mappings are configured with MongoDB-style filter and projection
//! documents. This module parses those documents into a closed AST at load
//! time — unknown operators and ambiguous shapes are configuration errors,
//! not silent no-matches — and evaluates the AST as pure functions over
//! BSON documents.
//!
//! The supported filter subset is `$eq, $ne, $gt, $gte, $lt, $lte, $in,
//! $nin, $not, $exists, $regex, $all, $size` per field, with `$and`/`$or`
//! at the root. Field paths use dot notation and descend through nested
//! documents and arrays.
//!
//! Projections support `1` (include), `0` (exclude, exclude-style only),
//! `"$source.path"` (rename) and computed expressions (`$concat`).
//! Include-style and exclude-style cannot be mixed in one projection.

use bson::{Bson, Document};
use regex::Regex;
use std::cmp::Ordering;
use std::fmt;

/// Errors raised while parsing or evaluating expressions.
///
/// Parse-time variants are configuration errors: the process must not start
/// with a mapping that produces one. `MissingField` is the only variant
/// raised during evaluation; it carries the offending field path and causes
/// the current document to be skipped, not the session to fail.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExprError {
    /// An operator outside the supported subset.
    #[error("unknown operator {operator} at {path}")]
    UnknownOperator {
        /// The rejected operator
        operator: String,
        /// Field path where it appeared
        path: String,
    },

    /// An operator was given an argument of the wrong shape.
    #[error("invalid argument for {operator} at {path}: {message}")]
    InvalidArgument {
        /// The operator
        operator: String,
        /// Field path where it appeared
        path: String,
        /// What was wrong
        message: String,
    },

    /// A `$regex` pattern failed to compile.
    #[error("invalid regex at {path}: {message}")]
    InvalidRegex {
        /// Field path of the pattern
        path: String,
        /// Compiler message
        message: String,
    },

    /// Include-style and exclude-style fields in the same projection.
    #[error("projection mixes include and exclude fields")]
    MixedProjection,

    /// A projection value that is none of `1`, `0`, `"$field"` or a
    /// computed expression.
    #[error("unsupported projection value at {path}")]
    InvalidProjectionValue {
        /// Output field path
        path: String,
    },

    /// A computed expression referenced a field absent from the input
    /// document. Raised at evaluation time.
    #[error("missing field {path} in computed expression")]
    MissingField {
        /// The absent field path
        path: String,
    },
}

/// A dot-separated field path into nested documents and arrays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    /// Parses a dotted path such as `"address.city"`.
    #[must_use]
    pub fn parse(path: &str) -> Self {
        Self(path.split('.').map(str::to_string).collect())
    }

    /// Returns the path segments.
    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// A single-field predicate.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// `$eq` (also the implicit form `{field: value}`)
    Eq(Bson),
    /// `$ne`
    Ne(Bson),
    /// `$gt`
    Gt(Bson),
    /// `$gte`
    Gte(Bson),
    /// `$lt`
    Lt(Bson),
    /// `$lte`
    Lte(Bson),
    /// `$in`
    In(Vec<Bson>),
    /// `$nin`
    Nin(Vec<Bson>),
    /// `$exists`
    Exists(bool),
    /// `$regex`, compiled at parse time
    Regex(Regex),
    /// `$all`
    All(Vec<Bson>),
    /// `$size`
    Size(i64),
    /// `$not` wrapping another predicate
    Not(Box<Predicate>),
}

/// A parsed filter expression.
#[derive(Debug, Clone)]
pub enum FilterExpr {
    /// All sub-filters must match. An empty list matches everything,
    /// which makes `{}` the match-all filter.
    And(Vec<FilterExpr>),
    /// At least one sub-filter must match.
    Or(Vec<FilterExpr>),
    /// A predicate over one field path.
    Field {
        /// The field the predicate applies to
        path: FieldPath,
        /// The predicate
        predicate: Predicate,
    },
}

/// How to treat predicates over fields absent from the input document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalMode {
    /// Normal semantics: a predicate over a missing field does not match
    /// (except `$exists: false` and the negating operators).
    Strict,
    /// Reduced-shape semantics used for delete resolution: a predicate
    /// over a missing field cannot be disproven and passes.
    Lenient,
}

impl FilterExpr {
    /// Parses a MongoDB-style filter document.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unknown operators or malformed
    /// operator arguments.
    pub fn parse(filter: &Document) -> Result<Self, ExprError> {
        let mut clauses = Vec::new();
        for (key, value) in filter {
            match key.as_str() {
                "$and" | "$or" => {
                    let subs = as_document_array(value).ok_or_else(|| {
                        ExprError::InvalidArgument {
                            operator: key.clone(),
                            path: String::new(),
                            message: "expected an array of filter documents".to_string(),
                        }
                    })?;
                    let parsed: Vec<FilterExpr> = subs
                        .iter()
                        .map(|d| FilterExpr::parse(d))
                        .collect::<Result<_, _>>()?;
                    if key == "$and" {
                        clauses.push(FilterExpr::And(parsed));
                    } else {
                        clauses.push(FilterExpr::Or(parsed));
                    }
                }
                op if op.starts_with('$') => {
                    return Err(ExprError::UnknownOperator {
                        operator: op.to_string(),
                        path: String::new(),
                    });
                }
                field => {
                    let path = FieldPath::parse(field);
                    for predicate in parse_field_value(field, value)? {
                        clauses.push(FilterExpr::Field {
                            path: path.clone(),
                            predicate,
                        });
                    }
                }
            }
        }
        if clauses.len() == 1 {
            Ok(clauses.pop().expect("one clause"))
        } else {
            Ok(FilterExpr::And(clauses))
        }
    }

    /// Evaluates the filter against a document with normal semantics.
    #[must_use]
    pub fn matches(&self, doc: &Document) -> bool {
        self.eval(doc, EvalMode::Strict)
    }

    /// Evaluates with reduced-shape semantics, used when resolving deletes
    /// against a key-only payload: predicates over absent fields pass.
    #[must_use]
    pub fn matches_lenient(&self, doc: &Document) -> bool {
        self.eval(doc, EvalMode::Lenient)
    }

    fn eval(&self, doc: &Document, mode: EvalMode) -> bool {
        match self {
            FilterExpr::And(subs) => subs.iter().all(|s| s.eval(doc, mode)),
            FilterExpr::Or(subs) => subs.iter().any(|s| s.eval(doc, mode)),
            FilterExpr::Field { path, predicate } => {
                let candidates = resolve_path(doc, path.segments());
                if candidates.is_empty() && mode == EvalMode::Lenient {
                    return true;
                }
                eval_predicate(predicate, &candidates)
            }
        }
    }
}

/// Parses the value side of `{field: value}` into one or more predicates.
fn parse_field_value(field: &str, value: &Bson) -> Result<Vec<Predicate>, ExprError> {
    if let Bson::Document(ops) = value {
        if ops.keys().all(|k| k.starts_with('$')) && !ops.is_empty() {
            return ops
                .iter()
                .map(|(op, arg)| parse_operator(field, op, arg))
                .collect();
        }
    }
    // Bare value: implicit equality, including whole-document equality.
    Ok(vec![Predicate::Eq(value.clone())])
}

fn parse_operator(field: &str, op: &str, arg: &Bson) -> Result<Predicate, ExprError> {
    let invalid = |message: &str| ExprError::InvalidArgument {
        operator: op.to_string(),
        path: field.to_string(),
        message: message.to_string(),
    };
    match op {
        "$eq" => Ok(Predicate::Eq(arg.clone())),
        "$ne" => Ok(Predicate::Ne(arg.clone())),
        "$gt" => Ok(Predicate::Gt(arg.clone())),
        "$gte" => Ok(Predicate::Gte(arg.clone())),
        "$lt" => Ok(Predicate::Lt(arg.clone())),
        "$lte" => Ok(Predicate::Lte(arg.clone())),
        "$in" => match arg.as_array() {
            Some(items) => Ok(Predicate::In(items.clone())),
            None => Err(invalid("expected an array")),
        },
        "$nin" => match arg.as_array() {
            Some(items) => Ok(Predicate::Nin(items.clone())),
            None => Err(invalid("expected an array")),
        },
        "$exists" => match arg.as_bool() {
            Some(b) => Ok(Predicate::Exists(b)),
            None => Err(invalid("expected a boolean")),
        },
        "$regex" => {
            let pattern = match arg {
                Bson::String(s) => s.clone(),
                Bson::RegularExpression(re) => re.pattern.clone(),
                _ => return Err(invalid("expected a string pattern")),
            };
            let compiled = Regex::new(&pattern).map_err(|e| ExprError::InvalidRegex {
                path: field.to_string(),
                message: e.to_string(),
            })?;
            Ok(Predicate::Regex(compiled))
        }
        "$all" => match arg.as_array() {
            Some(items) => Ok(Predicate::All(items.clone())),
            None => Err(invalid("expected an array")),
        },
        "$size" => match arg {
            Bson::Int32(n) => Ok(Predicate::Size(i64::from(*n))),
            Bson::Int64(n) => Ok(Predicate::Size(*n)),
            _ => Err(invalid("expected an integer")),
        },
        "$not" => match arg {
            Bson::Document(inner) if inner.len() == 1 => {
                let (inner_op, inner_arg) = inner.iter().next().expect("one entry");
                let parsed = parse_operator(field, inner_op, inner_arg)?;
                Ok(Predicate::Not(Box::new(parsed)))
            }
            _ => Err(invalid("expected a document with exactly one operator")),
        },
        other => Err(ExprError::UnknownOperator {
            operator: other.to_string(),
            path: field.to_string(),
        }),
    }
}

fn as_document_array(value: &Bson) -> Option<Vec<Document>> {
    let items = value.as_array()?;
    items
        .iter()
        .map(|i| i.as_document().cloned())
        .collect::<Option<Vec<_>>>()
}

/// Resolves a dotted path, descending nested documents and fanning out
/// through intermediate arrays. Returns every value found at the path.
fn resolve_path<'a>(doc: &'a Document, segments: &[String]) -> Vec<&'a Bson> {
    fn descend<'a>(value: &'a Bson, segments: &[String], out: &mut Vec<&'a Bson>) {
        let Some((head, rest)) = segments.split_first() else {
            out.push(value);
            return;
        };
        match value {
            Bson::Document(d) => {
                if let Some(next) = d.get(head) {
                    descend(next, rest, out);
                }
            }
            Bson::Array(items) => {
                if let Ok(index) = head.parse::<usize>() {
                    if let Some(next) = items.get(index) {
                        descend(next, rest, out);
                    }
                } else {
                    for item in items {
                        if let Bson::Document(d) = item {
                            if let Some(next) = d.get(head) {
                                descend(next, rest, out);
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }

    let mut out = Vec::new();
    let mut segs = segments.to_vec();
    if segs.is_empty() {
        return out;
    }
    let first = segs.remove(0);
    if let Some(value) = doc.get(&first) {
        descend(value, &segs, &mut out);
    }
    out
}

/// Expands array candidates into their elements for membership-style
/// matching, keeping the arrays themselves for whole-value equality.
fn expand<'a>(candidates: &[&'a Bson]) -> Vec<&'a Bson> {
    let mut values: Vec<&Bson> = Vec::with_capacity(candidates.len());
    for c in candidates {
        values.push(c);
        if let Bson::Array(items) = c {
            values.extend(items.iter());
        }
    }
    values
}

fn eval_predicate(predicate: &Predicate, candidates: &[&Bson]) -> bool {
    match predicate {
        Predicate::Eq(target) => expand(candidates).iter().any(|v| bson_eq(v, target)),
        Predicate::Ne(target) => !expand(candidates).iter().any(|v| bson_eq(v, target)),
        Predicate::Gt(target) => cmp_any(candidates, target, Ordering::is_gt),
        Predicate::Gte(target) => cmp_any(candidates, target, Ordering::is_ge),
        Predicate::Lt(target) => cmp_any(candidates, target, Ordering::is_lt),
        Predicate::Lte(target) => cmp_any(candidates, target, Ordering::is_le),
        Predicate::In(items) => expand(candidates)
            .iter()
            .any(|v| items.iter().any(|i| bson_eq(v, i))),
        Predicate::Nin(items) => !expand(candidates)
            .iter()
            .any(|v| items.iter().any(|i| bson_eq(v, i))),
        Predicate::Exists(wanted) => !candidates.is_empty() == *wanted,
        Predicate::Regex(re) => expand(candidates)
            .iter()
            .any(|v| matches!(v, Bson::String(s) if re.is_match(s))),
        Predicate::All(items) => candidates.iter().any(|c| match c {
            Bson::Array(elems) => items
                .iter()
                .all(|i| elems.iter().any(|e| bson_eq(e, i))),
            _ => false,
        }),
        Predicate::Size(n) => candidates
            .iter()
            .any(|c| matches!(c, Bson::Array(elems) if elems.len() as i64 == *n)),
        Predicate::Not(inner) => !eval_predicate(inner, candidates),
    }
}

fn cmp_any(candidates: &[&Bson], target: &Bson, accept: fn(Ordering) -> bool) -> bool {
    expand(candidates)
        .iter()
        .any(|v| bson_cmp(v, target).is_some_and(accept))
}

/// Equality with numeric coercion: `Int32(1)` equals `Int64(1)` equals
/// `Double(1.0)`. Falls back to structural BSON equality otherwise.
fn bson_eq(a: &Bson, b: &Bson) -> bool {
    match (numeric(a), numeric(b)) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

/// Ordering for the comparable subset: numbers (cross-type), strings,
/// booleans and datetimes. Mismatched non-numeric types do not compare,
/// which makes range predicates conservatively false for them.
fn bson_cmp(a: &Bson, b: &Bson) -> Option<Ordering> {
    if let (Some(x), Some(y)) = (numeric(a), numeric(b)) {
        return x.partial_cmp(&y);
    }
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn numeric(value: &Bson) -> Option<f64> {
    match value {
        Bson::Int32(n) => Some(f64::from(*n)),
        Bson::Int64(n) => Some(*n as f64),
        Bson::Double(n) => Some(*n),
        _ => None,
    }
}

/// A deterministic value-building expression for computed fields.
#[derive(Debug, Clone)]
pub enum ValueExpr {
    /// A constant
    Literal(Bson),
    /// A reference to a field of the input document
    Field(FieldPath),
    /// `$concat` of the stringified parts
    Concat(Vec<ValueExpr>),
}

impl ValueExpr {
    /// Parses a value expression: `"$path"` field references, documents
    /// with a single computed operator, or literals.
    pub fn parse(path: &str, value: &Bson) -> Result<Self, ExprError> {
        match value {
            Bson::String(s) if s.starts_with('$') => {
                Ok(ValueExpr::Field(FieldPath::parse(&s[1..])))
            }
            Bson::Document(d) => {
                if d.len() != 1 {
                    return Err(ExprError::InvalidArgument {
                        operator: "computed field".to_string(),
                        path: path.to_string(),
                        message: "expected exactly one operator".to_string(),
                    });
                }
                let (op, arg) = d.iter().next().expect("one entry");
                match op.as_str() {
                    "$concat" => {
                        let parts = arg.as_array().ok_or_else(|| ExprError::InvalidArgument {
                            operator: "$concat".to_string(),
                            path: path.to_string(),
                            message: "expected an array".to_string(),
                        })?;
                        let parsed = parts
                            .iter()
                            .map(|p| ValueExpr::parse(path, p))
                            .collect::<Result<_, _>>()?;
                        Ok(ValueExpr::Concat(parsed))
                    }
                    other => Err(ExprError::UnknownOperator {
                        operator: other.to_string(),
                        path: path.to_string(),
                    }),
                }
            }
            other => Ok(ValueExpr::Literal(other.clone())),
        }
    }

    /// Evaluates against an input document.
    ///
    /// # Errors
    ///
    /// `MissingField` when a referenced field is absent; the error carries
    /// the field path so the caller can log which document path failed.
    pub fn eval(&self, doc: &Document) -> Result<Bson, ExprError> {
        match self {
            ValueExpr::Literal(v) => Ok(v.clone()),
            ValueExpr::Field(path) => resolve_path(doc, path.segments())
                .first()
                .map(|v| (*v).clone())
                .ok_or_else(|| ExprError::MissingField {
                    path: path.to_string(),
                }),
            ValueExpr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&stringify(&part.eval(doc)?));
                }
                Ok(Bson::String(out))
            }
        }
    }
}

fn stringify(value: &Bson) -> String {
    match value {
        Bson::String(s) => s.clone(),
        Bson::Int32(n) => n.to_string(),
        Bson::Int64(n) => n.to_string(),
        Bson::Double(n) => n.to_string(),
        Bson::Boolean(b) => b.to_string(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => other.to_string(),
    }
}

/// Per-output-field action in a projection.
#[derive(Debug, Clone)]
enum FieldAction {
    Include,
    Exclude,
    Value(ValueExpr),
}

/// Whether unmentioned fields are dropped or kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectionMode {
    /// Only mentioned fields appear in the output.
    Include,
    /// Mentioned fields are removed, the rest is kept.
    Exclude,
}

/// A parsed projection.
#[derive(Debug, Clone)]
pub struct ProjectionExpr {
    mode: ProjectionMode,
    fields: Vec<(String, FieldAction)>,
}

impl ProjectionExpr {
    /// Parses a projection document.
    ///
    /// # Errors
    ///
    /// `MixedProjection` if include-style fields (`1`, renames, computed
    /// expressions) are combined with exclude-style fields (`0`), or a
    /// configuration error for unsupported value shapes.
    pub fn parse(projection: &Document) -> Result<Self, ExprError> {
        let mut fields = Vec::with_capacity(projection.len());
        for (name, value) in projection {
            let action = match value {
                Bson::Int32(1) | Bson::Int64(1) | Bson::Boolean(true) => FieldAction::Include,
                Bson::Int32(0) | Bson::Int64(0) | Bson::Boolean(false) => FieldAction::Exclude,
                Bson::Double(d) if *d == 1.0 => FieldAction::Include,
                Bson::Double(d) if *d == 0.0 => FieldAction::Exclude,
                Bson::String(s) if s.starts_with('$') => {
                    FieldAction::Value(ValueExpr::parse(name, value)?)
                }
                Bson::Document(_) => FieldAction::Value(ValueExpr::parse(name, value)?),
                _ => {
                    return Err(ExprError::InvalidProjectionValue {
                        path: name.clone(),
                    })
                }
            };
            fields.push((name.clone(), action));
        }

        let excludes = fields
            .iter()
            .filter(|(_, a)| matches!(a, FieldAction::Exclude))
            .count();
        let mode = if excludes == 0 {
            ProjectionMode::Include
        } else if excludes == fields.len() {
            ProjectionMode::Exclude
        } else {
            return Err(ExprError::MixedProjection);
        };

        Ok(Self { mode, fields })
    }

    /// Returns whether this projection is include- or exclude-style.
    #[must_use]
    pub fn mode(&self) -> ProjectionMode {
        self.mode
    }

    /// Reshapes a document.
    ///
    /// Include mode: mentioned fields are copied (absent source fields are
    /// silently omitted), renames read their source path, computed fields
    /// are evaluated. Exclude mode: mentioned paths are removed.
    ///
    /// # Errors
    ///
    /// Propagates `MissingField` from computed expressions.
    pub fn apply(&self, doc: &Document) -> Result<Document, ExprError> {
        match self.mode {
            ProjectionMode::Exclude => {
                let mut out = doc.clone();
                for (name, _) in &self.fields {
                    remove_path(&mut out, FieldPath::parse(name).segments());
                }
                Ok(out)
            }
            ProjectionMode::Include => {
                let mut out = Document::new();
                for (name, action) in &self.fields {
                    match action {
                        FieldAction::Include => {
                            let path = FieldPath::parse(name);
                            if let Some(value) = resolve_path(doc, path.segments()).first() {
                                set_path(&mut out, path.segments(), (*value).clone());
                            }
                        }
                        FieldAction::Value(ValueExpr::Field(src)) => {
                            // Renames of absent fields are omitted, matching
                            // plain include semantics.
                            if let Some(value) = resolve_path(doc, src.segments()).first() {
                                set_path(
                                    &mut out,
                                    FieldPath::parse(name).segments(),
                                    (*value).clone(),
                                );
                            }
                        }
                        FieldAction::Value(expr) => {
                            let value = expr.eval(doc)?;
                            set_path(&mut out, FieldPath::parse(name).segments(), value);
                        }
                        FieldAction::Exclude => unreachable!("exclude in include mode"),
                    }
                }
                Ok(out)
            }
        }
    }
}

/// An additive field-setting expression (the `$set` stage body).
#[derive(Debug, Clone)]
pub struct SetExpr {
    fields: Vec<(String, ValueExpr)>,
}

impl SetExpr {
    /// Parses a `$set` body: every value is a field reference, computed
    /// expression, or literal.
    pub fn parse(body: &Document) -> Result<Self, ExprError> {
        let fields = body
            .iter()
            .map(|(name, value)| Ok((name.clone(), ValueExpr::parse(name, value)?)))
            .collect::<Result<Vec<_>, ExprError>>()?;
        Ok(Self { fields })
    }

    /// Returns the document with the configured fields added or
    /// overwritten; all pre-existing fields are retained.
    pub fn apply(&self, doc: &Document) -> Result<Document, ExprError> {
        let mut out = doc.clone();
        for (name, expr) in &self.fields {
            let value = expr.eval(doc)?;
            set_path(&mut out, FieldPath::parse(name).segments(), value);
        }
        Ok(out)
    }
}

/// Reads the first value at a dotted path, if any.
pub(crate) fn get_path<'a>(doc: &'a Document, path: &FieldPath) -> Option<&'a Bson> {
    resolve_path(doc, path.segments()).into_iter().next()
}

/// Writes a value at a dotted path, creating intermediate documents.
pub(crate) fn set_path(doc: &mut Document, segments: &[String], value: Bson) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        doc.insert(head.clone(), value);
        return;
    }
    let entry = doc
        .entry(head.clone())
        .or_insert_with(|| Bson::Document(Document::new()));
    if let Bson::Document(inner) = entry {
        set_path(inner, rest, value);
    } else {
        let mut inner = Document::new();
        set_path(&mut inner, rest, value);
        doc.insert(head.clone(), Bson::Document(inner));
    }
}

fn remove_path(doc: &mut Document, segments: &[String]) {
    let Some((head, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        doc.remove(head);
        return;
    }
    if let Some(Bson::Document(inner)) = doc.get_mut(head) {
        remove_path(inner, rest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn empty_filter_matches_everything() {
        let filter = FilterExpr::parse(&doc! {}).unwrap();
        assert!(filter.matches(&doc! {}));
        assert!(filter.matches(&doc! { "a": 1, "b": "x" }));
    }

    #[test]
    fn implicit_equality() {
        let filter = FilterExpr::parse(&doc! { "t": "c" }).unwrap();
        assert!(filter.matches(&doc! { "t": "c" }));
        assert!(!filter.matches(&doc! { "t": "d" }));
        assert!(!filter.matches(&doc! {}));
    }

    #[test]
    fn comparison_operators() {
        let filter = FilterExpr::parse(&doc! { "n": { "$gte": 3, "$lt": 10 } }).unwrap();
        assert!(filter.matches(&doc! { "n": 3 }));
        assert!(filter.matches(&doc! { "n": 9.5 }));
        assert!(!filter.matches(&doc! { "n": 10 }));
        assert!(!filter.matches(&doc! { "n": "9" }));
    }

    #[test]
    fn numeric_coercion_across_types() {
        let filter = FilterExpr::parse(&doc! { "n": 1_i64 }).unwrap();
        assert!(filter.matches(&doc! { "n": 1_i32 }));
        assert!(filter.matches(&doc! { "n": 1.0 }));
    }

    #[test]
    fn in_and_nin() {
        let filter = FilterExpr::parse(&doc! { "t": { "$in": ["c", "p"] } }).unwrap();
        assert!(filter.matches(&doc! { "t": "p" }));
        assert!(!filter.matches(&doc! { "t": "d" }));

        let filter = FilterExpr::parse(&doc! { "t": { "$nin": ["c", "p"] } }).unwrap();
        assert!(filter.matches(&doc! { "t": "d" }));
        assert!(filter.matches(&doc! {})); // absent field is not in the list
    }

    #[test]
    fn exists_and_not() {
        let filter = FilterExpr::parse(&doc! { "archived": { "$exists": false } }).unwrap();
        assert!(filter.matches(&doc! { "name": "general" }));
        assert!(!filter.matches(&doc! { "archived": true }));

        let filter = FilterExpr::parse(&doc! { "n": { "$not": { "$gt": 5 } } }).unwrap();
        assert!(filter.matches(&doc! { "n": 3 }));
        assert!(filter.matches(&doc! {})); // nothing to disprove
        assert!(!filter.matches(&doc! { "n": 7 }));
    }

    #[test]
    fn regex_compiled_at_parse_time() {
        let filter = FilterExpr::parse(&doc! { "name": { "$regex": "^gen" } }).unwrap();
        assert!(filter.matches(&doc! { "name": "general" }));
        assert!(!filter.matches(&doc! { "name": "random" }));

        let err = FilterExpr::parse(&doc! { "name": { "$regex": "(" } }).unwrap_err();
        assert!(matches!(err, ExprError::InvalidRegex { .. }));
    }

    #[test]
    fn all_and_size() {
        let filter = FilterExpr::parse(&doc! { "tags": { "$all": ["a", "b"] } }).unwrap();
        assert!(filter.matches(&doc! { "tags": ["b", "c", "a"] }));
        assert!(!filter.matches(&doc! { "tags": ["a"] }));

        let filter = FilterExpr::parse(&doc! { "tags": { "$size": 2 } }).unwrap();
        assert!(filter.matches(&doc! { "tags": ["a", "b"] }));
        assert!(!filter.matches(&doc! { "tags": ["a"] }));
    }

    #[test]
    fn and_or_combinators() {
        let filter = FilterExpr::parse(&doc! {
            "$or": [ { "t": "c" }, { "t": "p" } ]
        })
        .unwrap();
        assert!(filter.matches(&doc! { "t": "p" }));
        assert!(!filter.matches(&doc! { "t": "d" }));

        let filter = FilterExpr::parse(&doc! {
            "$and": [ { "t": "c" }, { "open": true } ]
        })
        .unwrap();
        assert!(filter.matches(&doc! { "t": "c", "open": true }));
        assert!(!filter.matches(&doc! { "t": "c", "open": false }));
    }

    #[test]
    fn dot_paths_descend_documents_and_arrays() {
        let filter = FilterExpr::parse(&doc! { "address.city": "Rome" }).unwrap();
        assert!(filter.matches(&doc! { "address": { "city": "Rome" } }));

        let filter = FilterExpr::parse(&doc! { "members.name": "ada" }).unwrap();
        assert!(filter.matches(&doc! {
            "members": [ { "name": "bob" }, { "name": "ada" } ]
        }));
    }

    #[test]
    fn array_membership_equality() {
        let filter = FilterExpr::parse(&doc! { "tags": "x" }).unwrap();
        assert!(filter.matches(&doc! { "tags": ["x", "y"] }));
        assert!(!filter.matches(&doc! { "tags": ["y"] }));
    }

    #[test]
    fn unknown_operator_is_a_configuration_error() {
        let err = FilterExpr::parse(&doc! { "a": { "$near": 1 } }).unwrap_err();
        assert!(matches!(err, ExprError::UnknownOperator { .. }));

        let err = FilterExpr::parse(&doc! { "$nor": [] }).unwrap_err();
        assert!(matches!(err, ExprError::UnknownOperator { .. }));
    }

    #[test]
    fn lenient_mode_passes_absent_fields() {
        let filter = FilterExpr::parse(&doc! { "t": "c" }).unwrap();
        let key_only = doc! { "_id": "r1" };
        assert!(!filter.matches(&key_only));
        assert!(filter.matches_lenient(&key_only));

        // Present fields still evaluate normally in lenient mode.
        let filter = FilterExpr::parse(&doc! { "_id": "r2" }).unwrap();
        assert!(!filter.matches_lenient(&key_only));
    }

    #[test]
    fn include_projection() {
        let proj = ProjectionExpr::parse(&doc! { "_id": 1, "name": 1 }).unwrap();
        let out = proj
            .apply(&doc! { "_id": "r1", "name": "general", "t": "c" })
            .unwrap();
        assert_eq!(out, doc! { "_id": "r1", "name": "general" });
    }

    #[test]
    fn exclude_projection_keeps_the_rest() {
        let proj = ProjectionExpr::parse(&doc! { "secret": 0 }).unwrap();
        let out = proj.apply(&doc! { "_id": "r1", "secret": "x" }).unwrap();
        assert_eq!(out, doc! { "_id": "r1" });
    }

    #[test]
    fn mixed_projection_rejected() {
        let err = ProjectionExpr::parse(&doc! { "a": 1, "b": 0 }).unwrap_err();
        assert!(matches!(err, ExprError::MixedProjection));
    }

    #[test]
    fn rename_projection() {
        let proj = ProjectionExpr::parse(&doc! { "city": "$address.city" }).unwrap();
        let out = proj
            .apply(&doc! { "address": { "city": "Rome" } })
            .unwrap();
        assert_eq!(out, doc! { "city": "Rome" });

        // Absent source: field is omitted, not an error.
        let out = proj.apply(&doc! { "other": 1 }).unwrap();
        assert_eq!(out, doc! {});
    }

    #[test]
    fn concat_projection() {
        let proj = ProjectionExpr::parse(&doc! {
            "label": { "$concat": ["$t", "/", "$name"] }
        })
        .unwrap();
        let out = proj.apply(&doc! { "t": "c", "name": "general" }).unwrap();
        assert_eq!(out, doc! { "label": "c/general" });

        let err = proj.apply(&doc! { "t": "c" }).unwrap_err();
        assert!(matches!(err, ExprError::MissingField { ref path } if path == "name"));
    }

    #[test]
    fn set_expr_is_additive() {
        let set = SetExpr::parse(&doc! { "kind": "room", "label": "$name" }).unwrap();
        let out = set.apply(&doc! { "_id": 1, "name": "general" }).unwrap();
        assert_eq!(
            out,
            doc! { "_id": 1, "name": "general", "kind": "room", "label": "general" }
        );
    }

    #[test]
    fn dotted_output_paths_nest() {
        let proj = ProjectionExpr::parse(&doc! { "meta.id": "$_id" }).unwrap();
        let out = proj.apply(&doc! { "_id": "r1" }).unwrap();
        assert_eq!(out, doc! { "meta": { "id": "r1" } });
    }
}
