//! Failure signatures and the similarity measure used to rank lessons

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// What went wrong, reduced to comparable fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureSignature {
    /// Session state in which the failure happened (`TESTING`, `REVIEWING`, ...)
    pub stage: String,
    /// Failure kind label (`worker_failure`, `budget_exceeded`, ...)
    pub kind: String,
    /// Finer classification where one exists (`lint`, `test_failure`, `code_not_found`)
    #[serde(default)]
    pub error_class: Option<String>,
    /// Issue category of the failed session
    pub category: String,
    /// Files the session touched or meant to touch, sorted and deduplicated
    #[serde(default)]
    pub files: Vec<String>,
}

impl FailureSignature {
    /// Build a signature; `files` are normalised to a sorted set
    #[must_use]
    pub fn new(
        stage: impl Into<String>,
        kind: impl Into<String>,
        category: impl Into<String>,
        files: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            stage: stage.into(),
            kind: kind.into(),
            error_class: None,
            category: category.into(),
            files: normalise(files),
        }
    }

    /// With a finer error class
    #[inline]
    #[must_use]
    pub fn with_error_class(mut self, class: impl Into<String>) -> Self {
        self.error_class = Some(class.into());
        self
    }

    /// A signature is usable only if it says where and how the session failed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stage.is_empty() || self.kind.is_empty()
    }
}

/// What a strategizing session knows about itself when asking for lessons
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LessonQuery {
    /// Issue category
    pub category: Option<String>,
    /// Files the issue mentions or the previous plan touched
    pub files: Vec<String>,
    /// Stage of the failure being repaired, if any
    pub stage: Option<String>,
    /// Kind of the failure being repaired, if any
    pub kind: Option<String>,
    /// Error class of the failure being repaired, if any
    pub error_class: Option<String>,
}

impl LessonQuery {
    /// Query for a fresh strategy
    #[must_use]
    pub fn for_issue(category: impl Into<String>, files: impl IntoIterator<Item = String>) -> Self {
        Self {
            category: Some(category.into()),
            files: normalise(files),
            ..Self::default()
        }
    }

    /// Narrow the query to a failure being repaired
    #[must_use]
    pub fn repairing(
        mut self,
        stage: impl Into<String>,
        kind: impl Into<String>,
        error_class: Option<String>,
    ) -> Self {
        self.stage = Some(stage.into());
        self.kind = Some(kind.into());
        self.error_class = error_class;
        self
    }
}

const CATEGORY_WEIGHT: u32 = 3;
const KIND_WEIGHT: u32 = 2;
const CLASS_WEIGHT: u32 = 2;
const STAGE_WEIGHT: u32 = 1;
const FILE_WEIGHT: u32 = 4;

/// Similarity between a stored signature and a query; zero means unrelated.
///
/// Exact matches on category, kind, error class and stage each add a fixed
/// weight; file overlap adds up to `FILE_WEIGHT` scaled by Jaccard index.
/// Scores are scaled by 100 to stay integral.
#[must_use]
pub fn similarity(signature: &FailureSignature, query: &LessonQuery) -> u32 {
    let eq = |stored: &str, wanted: Option<&String>| wanted.is_some_and(|w| w == stored);

    let mut score = 0;
    if eq(&signature.category, query.category.as_ref()) {
        score += CATEGORY_WEIGHT * 100;
    }
    if eq(&signature.kind, query.kind.as_ref()) {
        score += KIND_WEIGHT * 100;
    }
    if let Some(class) = &signature.error_class {
        if eq(class, query.error_class.as_ref()) {
            score += CLASS_WEIGHT * 100;
        }
    }
    if eq(&signature.stage, query.stage.as_ref()) {
        score += STAGE_WEIGHT * 100;
    }
    score + file_overlap(&signature.files, &query.files)
}

fn file_overlap(stored: &[String], wanted: &[String]) -> u32 {
    if stored.is_empty() || wanted.is_empty() {
        return 0;
    }
    let a: BTreeSet<&String> = stored.iter().collect();
    let b: BTreeSet<&String> = wanted.iter().collect();
    let shared = a.intersection(&b).count();
    let union = a.union(&b).count();
    let scaled = shared * (FILE_WEIGHT as usize) * 100 / union.max(1);
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

fn normalise(files: impl IntoIterator<Item = String>) -> Vec<String> {
    files
        .into_iter()
        .map(|f| f.trim().to_string())
        .filter(|f| !f.is_empty())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sig(category: &str, files: &[&str]) -> FailureSignature {
        FailureSignature::new(
            "TESTING",
            "worker_failure",
            category,
            files.iter().map(|f| (*f).to_string()),
        )
    }

    #[test]
    fn unrelated_signature_scores_zero() {
        let q = LessonQuery::for_issue("ux", vec!["templates/index.html".to_string()]);
        assert_eq!(similarity(&sig("bug", &["app.py"]), &q), 0);
    }

    #[test]
    fn category_and_files_both_count() {
        let q = LessonQuery::for_issue("bug", vec!["app.py".to_string()]);
        let category_only = similarity(&sig("bug", &["other.py"]), &q);
        let both = similarity(&sig("bug", &["app.py"]), &q);
        assert!(both > category_only);
        assert!(category_only > 0);
    }

    #[test]
    fn repair_context_prefers_matching_failure_kind() {
        let q = LessonQuery::for_issue("bug", Vec::new()).repairing(
            "REVIEWING",
            "worker_failure",
            Some("lint".to_string()),
        );
        let lint = FailureSignature::new("REVIEWING", "worker_failure", "bug", Vec::new())
            .with_error_class("lint");
        let budget = FailureSignature::new("STRATEGIZING", "budget_exceeded", "bug", Vec::new());
        assert!(similarity(&lint, &q) > similarity(&budget, &q));
    }

    #[test]
    fn files_are_normalised() {
        let s = FailureSignature::new(
            "TESTING",
            "worker_failure",
            "bug",
            vec![" b.py ".to_string(), "a.py".to_string(), "b.py".to_string(), String::new()],
        );
        assert_eq!(s.files, vec!["a.py".to_string(), "b.py".to_string()]);
    }

    proptest! {
        #[test]
        fn identical_file_sets_score_full_overlap(files in prop::collection::btree_set("[a-z]{1,6}\\.py", 1..6)) {
            let files: Vec<String> = files.into_iter().collect();
            let stored = FailureSignature::new("TESTING", "worker_failure", "bug", files.clone());
            let q = LessonQuery { files, ..LessonQuery::default() };
            prop_assert_eq!(similarity(&stored, &q), FILE_WEIGHT * 100);
        }

        #[test]
        fn similarity_is_bounded(files in prop::collection::vec("[a-c]\\.py", 0..5), qfiles in prop::collection::vec("[a-c]\\.py", 0..5)) {
            let stored = FailureSignature::new("TESTING", "worker_failure", "bug", files);
            let q = LessonQuery::for_issue("bug", qfiles).repairing("TESTING", "worker_failure", None);
            let max = (CATEGORY_WEIGHT + KIND_WEIGHT + CLASS_WEIGHT + STAGE_WEIGHT + FILE_WEIGHT) * 100;
            prop_assert!(similarity(&stored, &q) <= max);
        }
    }
}
