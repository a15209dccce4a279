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

//! The declarative reshaping pipeline.
//!
//! A [`Pipeline`] is an ordered list of stages applied to each change
//! document before it becomes a table row. Stages compose as document
//! multiset transformers: every stage maps one input document to zero or
//! more output documents, so a pipeline maps one change event to zero or
//! more rows.
//!
//! Four stages are supported:
//!
//! - `$match` — keep the document only if a filter matches
//! - `$unwind` — fan an array field out into one document per element
//! - `$set` — add or overwrite fields, keeping the rest
//! - `$project` — reshape to exactly the listed fields
//!
//! Pipelines are parsed and validated at configuration load; evaluation is
//! pure and deterministic.

use crate::expr::{EvalMode, ExprError, FieldPath, FilterExpr, ProjectionExpr, SetExpr};
use bson::{Bson, Document};

/// One pipeline stage.
#[derive(Debug, Clone)]
pub enum Stage {
    /// `$match`: drop documents the filter rejects.
    Match(FilterExpr),
    /// `$unwind`: one output document per element of the array at `path`,
    /// with the element substituted in place of the array.
    Unwind {
        /// Array field to fan out
        path: FieldPath,
        /// Emit the document unchanged when the field is absent, null or
        /// an empty array, instead of emitting nothing.
        keep_empty: bool,
    },
    /// `$set`: additive field assignment.
    Set(SetExpr),
    /// `$project`: reshape to the listed fields.
    Project(ProjectionExpr),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Match(_) => "$match",
            Stage::Unwind { .. } => "$unwind",
            Stage::Set(_) => "$set",
            Stage::Project(_) => "$project",
        }
    }
}

/// A parsed, validated pipeline.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Parses a pipeline from an array of single-key stage documents.
    ///
    /// # Errors
    ///
    /// Rejects stages outside the supported set, multi-key stage documents,
    /// and malformed stage bodies. All are configuration errors.
    pub fn parse(stages: &[Document]) -> Result<Self, ExprError> {
        let parsed = stages
            .iter()
            .map(parse_stage)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { stages: parsed })
    }

    /// Builds a pipeline from already-parsed stages.
    #[must_use]
    pub fn from_stages(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Whether the pipeline has no stages (identity transform).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Returns the parsed stages.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Runs the pipeline over one input document.
    ///
    /// The mode selects how `$match` treats absent fields: [`EvalMode::Strict`]
    /// for ordinary payloads, [`EvalMode::Lenient`] when resolving a delete
    /// against its key-only shape.
    ///
    /// A computed field referencing an absent path fails only the document
    /// that lacks it: that document is dropped and logged, and the rest of
    /// the batch continues. In particular, siblings fanned out by an
    /// earlier `$unwind` keep flowing.
    ///
    /// # Errors
    ///
    /// Propagates errors of configuration shape only; per-document
    /// evaluation failures never abort the run.
    pub fn run(&self, input: &Document, mode: EvalMode) -> Result<Vec<Document>, ExprError> {
        let mut current = vec![input.clone()];
        for stage in &self.stages {
            let mut next = Vec::with_capacity(current.len());
            for doc in &current {
                match apply_stage(stage, doc, mode, &mut next) {
                    Ok(()) => {}
                    Err(error @ ExprError::MissingField { .. }) => {
                        tracing::warn!(
                            stage = stage.name(),
                            %error,
                            "dropping document: stage evaluation failed"
                        );
                    }
                    Err(error) => return Err(error),
                }
            }
            if next.is_empty() {
                tracing::trace!(stage = stage.name(), "pipeline produced no documents");
                return Ok(next);
            }
            current = next;
        }
        Ok(current)
    }
}

fn parse_stage(stage: &Document) -> Result<Stage, ExprError> {
    if stage.len() != 1 {
        return Err(ExprError::InvalidArgument {
            operator: "pipeline stage".to_string(),
            path: String::new(),
            message: "expected a document with exactly one stage key".to_string(),
        });
    }
    let (name, body) = stage.iter().next().expect("one entry");
    match name.as_str() {
        "$match" => {
            let filter = body.as_document().ok_or_else(|| ExprError::InvalidArgument {
                operator: "$match".to_string(),
                path: String::new(),
                message: "expected a filter document".to_string(),
            })?;
            Ok(Stage::Match(FilterExpr::parse(filter)?))
        }
        "$unwind" => parse_unwind(body),
        "$set" => {
            let fields = body.as_document().ok_or_else(|| ExprError::InvalidArgument {
                operator: "$set".to_string(),
                path: String::new(),
                message: "expected a document of field assignments".to_string(),
            })?;
            Ok(Stage::Set(SetExpr::parse(fields)?))
        }
        "$project" => {
            let fields = body.as_document().ok_or_else(|| ExprError::InvalidArgument {
                operator: "$project".to_string(),
                path: String::new(),
                message: "expected a projection document".to_string(),
            })?;
            Ok(Stage::Project(ProjectionExpr::parse(fields)?))
        }
        other => Err(ExprError::UnknownOperator {
            operator: other.to_string(),
            path: String::new(),
        }),
    }
}

fn parse_unwind(body: &Bson) -> Result<Stage, ExprError> {
    let invalid = |message: &str| ExprError::InvalidArgument {
        operator: "$unwind".to_string(),
        path: String::new(),
        message: message.to_string(),
    };
    match body {
        Bson::String(s) if s.starts_with('$') => Ok(Stage::Unwind {
            path: FieldPath::parse(&s[1..]),
            keep_empty: false,
        }),
        Bson::Document(opts) => {
            let path = match opts.get_str("path") {
                Ok(p) if p.starts_with('$') => FieldPath::parse(&p[1..]),
                _ => return Err(invalid("path must be a string starting with '$'")),
            };
            let keep_empty = opts
                .get_bool("preserveNullAndEmptyArrays")
                .unwrap_or(false);
            for key in opts.keys() {
                if key != "path" && key != "preserveNullAndEmptyArrays" {
                    return Err(invalid("unsupported option"));
                }
            }
            Ok(Stage::Unwind { path, keep_empty })
        }
        _ => Err(invalid("expected \"$field\" or {path, preserveNullAndEmptyArrays}")),
    }
}

fn apply_stage(
    stage: &Stage,
    doc: &Document,
    mode: EvalMode,
    out: &mut Vec<Document>,
) -> Result<(), ExprError> {
    match stage {
        Stage::Match(filter) => {
            let keep = match mode {
                EvalMode::Strict => filter.matches(doc),
                EvalMode::Lenient => filter.matches_lenient(doc),
            };
            if keep {
                out.push(doc.clone());
            }
        }
        Stage::Unwind { path, keep_empty } => unwind(doc, path, *keep_empty, out),
        Stage::Set(set) => out.push(set.apply(doc)?),
        Stage::Project(projection) => out.push(projection.apply(doc)?),
    }
    Ok(())
}

fn unwind(doc: &Document, path: &FieldPath, keep_empty: bool, out: &mut Vec<Document>) {
    // Unwind only descends plain document nesting; the unwound field itself
    // must resolve without fanning out through other arrays.
    let value = get_plain(doc, path.segments());
    match value {
        Some(Bson::Array(items)) if !items.is_empty() => {
            for item in items.clone() {
                let mut copy = doc.clone();
                crate::expr::set_path(&mut copy, path.segments(), item);
                out.push(copy);
            }
        }
        // A non-array value unwinds to itself, as upstream does.
        Some(Bson::Null) | Some(Bson::Array(_)) | None => {
            if keep_empty {
                out.push(doc.clone());
            }
        }
        Some(_) => out.push(doc.clone()),
    }
}

fn get_plain<'a>(doc: &'a Document, segments: &[String]) -> Option<&'a Bson> {
    let (head, rest) = segments.split_first()?;
    let value = doc.get(head)?;
    if rest.is_empty() {
        return Some(value);
    }
    match value {
        Bson::Document(inner) => get_plain(inner, rest),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    fn run(stages: &[Document], input: Document) -> Vec<Document> {
        Pipeline::parse(stages)
            .unwrap()
            .run(&input, EvalMode::Strict)
            .unwrap()
    }

    #[test]
    fn empty_pipeline_is_identity() {
        let input = doc! { "_id": 1, "a": "b" };
        assert_eq!(run(&[], input.clone()), vec![input]);
    }

    #[test]
    fn match_drops_non_matching_documents() {
        let stages = [doc! { "$match": { "t": "c" } }];
        assert_eq!(
            run(&stages, doc! { "_id": 1, "t": "c" }),
            vec![doc! { "_id": 1, "t": "c" }]
        );
        assert!(run(&stages, doc! { "_id": 2, "t": "d" }).is_empty());
    }

    #[test]
    fn unwind_fans_out_array_elements() {
        let stages = [doc! { "$unwind": "$members" }];
        let out = run(
            &stages,
            doc! { "_id": "r1", "members": ["ada", "bob"] },
        );
        assert_eq!(
            out,
            vec![
                doc! { "_id": "r1", "members": "ada" },
                doc! { "_id": "r1", "members": "bob" },
            ]
        );
    }

    #[test]
    fn unwind_empty_array_emits_nothing_by_default() {
        let stages = [doc! { "$unwind": "$members" }];
        assert!(run(&stages, doc! { "_id": "r1", "members": [] }).is_empty());
        assert!(run(&stages, doc! { "_id": "r1" }).is_empty());
    }

    #[test]
    fn unwind_preserves_empty_when_configured() {
        let stages = [doc! {
            "$unwind": { "path": "$members", "preserveNullAndEmptyArrays": true }
        }];
        let input = doc! { "_id": "r1" };
        assert_eq!(run(&stages, input.clone()), vec![input]);
    }

    #[test]
    fn unwind_scalar_passes_through() {
        let stages = [doc! { "$unwind": "$members" }];
        let input = doc! { "_id": "r1", "members": "ada" };
        assert_eq!(run(&stages, input.clone()), vec![input]);
    }

    #[test]
    fn set_then_project_composes() {
        let stages = [
            doc! { "$set": { "kind": "member" } },
            doc! { "$project": { "_id": 1, "kind": 1 } },
        ];
        let out = run(&stages, doc! { "_id": 1, "noise": true });
        assert_eq!(out, vec![doc! { "_id": 1, "kind": "member" }]);
    }

    #[test]
    fn unwind_then_match_filters_elements() {
        let stages = [
            doc! { "$unwind": "$members" },
            doc! { "$match": { "members.role": "admin" } },
        ];
        let out = run(
            &stages,
            doc! {
                "_id": "r1",
                "members": [
                    { "name": "ada", "role": "admin" },
                    { "name": "bob", "role": "user" },
                ]
            },
        );
        assert_eq!(
            out,
            vec![doc! { "_id": "r1", "members": { "name": "ada", "role": "admin" } }]
        );
    }

    #[test]
    fn lenient_mode_reaches_match_stages() {
        let stages = [doc! { "$match": { "t": "c" } }];
        let pipeline = Pipeline::parse(&stages).unwrap();
        let key_only = doc! { "_id": "r1" };
        assert!(pipeline.run(&key_only, EvalMode::Strict).unwrap().is_empty());
        assert_eq!(
            pipeline.run(&key_only, EvalMode::Lenient).unwrap(),
            vec![key_only]
        );
    }

    #[test]
    fn unsupported_stage_rejected_at_parse() {
        let err = Pipeline::parse(&[doc! { "$lookup": { "from": "x" } }]).unwrap_err();
        assert!(matches!(err, ExprError::UnknownOperator { .. }));
    }

    #[test]
    fn multi_key_stage_rejected() {
        let err =
            Pipeline::parse(&[doc! { "$match": {}, "$project": { "_id": 1 } }]).unwrap_err();
        assert!(matches!(err, ExprError::InvalidArgument { .. }));
    }

    #[test]
    fn evaluation_failure_drops_only_the_failing_document() {
        let stages = [
            doc! { "$unwind": "$items" },
            doc! { "$set": { "label": { "$concat": ["$items.name"] } } },
        ];
        // The second element lacks `name`; only its row is lost.
        let out = run(
            &stages,
            doc! { "_id": 1, "items": [{ "name": "ok" }, { "other": true }] },
        );
        assert_eq!(
            out,
            vec![doc! { "_id": 1, "items": { "name": "ok" }, "label": "ok" }]
        );
    }

    #[test]
    fn evaluation_failure_on_every_document_yields_nothing() {
        let stages = [doc! { "$set": { "label": { "$concat": ["$a", "$missing"] } } }];
        assert!(run(&stages, doc! { "a": "x" }).is_empty());
    }
}
