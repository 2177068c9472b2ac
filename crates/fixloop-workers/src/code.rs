//! Code-edit worker: planned replacements applied directly to the checkout

use crate::command::CommandRunner;
use crate::error::WorkerError;
use crate::settings::WorkerSettings;
use crate::traits::CodeEditor;
use crate::types::{Artifact, CiFailure, FileEdit, SessionArtifacts, WorkerReport};
use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

/// Per-file cap on context handed to the oracle
const CONTEXT_CHARS_PER_FILE: usize = 8000;
/// Longest run of lines tried when matching modulo whitespace
const MAX_WINDOW_LINES: usize = 30;

/// Where an edit's `old_code` was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditMatch {
    /// Byte range of a unique exact or whitespace-normalised match
    Unique(std::ops::Range<usize>),
    /// `old_code` occurs more than once
    Ambiguous(usize),
    /// Not found
    Missing,
}

/// Locate `old_code` in `content`: exact match first, then a line window
/// that is equal once runs of whitespace are collapsed.
#[must_use]
pub fn locate(content: &str, old_code: &str) -> EditMatch {
    if old_code.is_empty() {
        return EditMatch::Missing;
    }
    let exact: Vec<usize> = content.match_indices(old_code).map(|(i, _)| i).collect();
    match exact.as_slice() {
        [start] => return EditMatch::Unique(*start..*start + old_code.len()),
        [] => {}
        many => return EditMatch::Ambiguous(many.len()),
    }

    let target = normalise_ws(old_code);
    if target.is_empty() {
        return EditMatch::Missing;
    }
    // Byte offset of every line start.
    let mut starts = vec![0];
    starts.extend(content.match_indices('\n').map(|(i, _)| i + 1));
    let lines: Vec<&str> = content.split('\n').collect();

    let mut found = Vec::new();
    for i in 0..lines.len() {
        for window in 1..=MAX_WINDOW_LINES.min(lines.len() - i) {
            let candidate = lines[i..i + window].join("\n");
            let normalised = normalise_ws(&candidate);
            if normalised == target {
                let start = starts[i];
                found.push(start..start + candidate.len());
                break;
            }
            if normalised.len() > target.len() {
                break;
            }
        }
    }
    match found.len() {
        0 => EditMatch::Missing,
        1 => EditMatch::Unique(found.remove(0)),
        n => EditMatch::Ambiguous(n),
    }
}

fn normalise_ws(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Reject absolute paths and `..` so edits stay inside the checkout
fn confine(repo: &Path, file: &str) -> Result<PathBuf, WorkerError> {
    let rel = Path::new(file);
    if rel.is_absolute() || rel.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(WorkerError::Invocation(format!("path escapes repository: {file}")));
    }
    Ok(repo.join(rel))
}

/// Filesystem implementation of [`CodeEditor`]
#[derive(Debug, Clone)]
pub struct FsCodeEditor {
    repo: PathBuf,
    lint_fix: Vec<String>,
    runner: CommandRunner,
}

impl FsCodeEditor {
    /// Editor over the configured repository
    #[must_use]
    pub fn new(settings: &WorkerSettings) -> Self {
        Self {
            repo: settings.repo_path.clone(),
            lint_fix: settings.lint_fix_command.clone(),
            runner: CommandRunner::new(
                settings.repo_path.clone(),
                Duration::from_secs(settings.command_timeout_secs),
            ),
        }
    }
}

#[async_trait]
impl CodeEditor for FsCodeEditor {
    async fn gather_context(
        &self,
        _artifacts: &SessionArtifacts,
        files: &[String],
    ) -> Result<WorkerReport, WorkerError> {
        let mut context = String::new();
        for file in files {
            // API routes and the like are not files; skip quietly.
            let Ok(path) = confine(&self.repo, file.trim_start_matches('/')) else {
                continue;
            };
            match tokio::fs::read_to_string(&path).await {
                Ok(text) => {
                    let shown: String = text.chars().take(CONTEXT_CHARS_PER_FILE).collect();
                    context.push_str(&format!("=== {file} ===\n{shown}\n"));
                    if shown.len() < text.len() {
                        context.push_str("... (truncated)\n");
                    }
                }
                Err(e) => tracing::debug!(file = %file, error = %e, "context file unreadable"),
            }
        }
        Ok(WorkerReport::ok(context))
    }

    async fn apply_edits(
        &self,
        artifacts: &SessionArtifacts,
        edits: &[FileEdit],
    ) -> Result<WorkerReport, WorkerError> {
        let mut report = WorkerReport::ok(String::new());
        let mut log = Vec::new();
        for edit in edits {
            let path = confine(&self.repo, &edit.file)?;
            let content = match tokio::fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound && edit.old_code.is_empty() => {
                    String::new()
                }
                Err(e) => {
                    return Ok(WorkerReport::failed(format!("cannot read {}: {e}", edit.file)));
                }
            };

            let updated = if edit.old_code.is_empty() && content.is_empty() {
                // New file.
                edit.new_code.clone()
            } else {
                match locate(&content, &edit.old_code) {
                    EditMatch::Unique(range) => {
                        let mut next = content.clone();
                        next.replace_range(range, &edit.new_code);
                        next
                    }
                    EditMatch::Ambiguous(n) => {
                        return Ok(WorkerReport::failed(format!(
                            "old_code appears {n} times in {}; a unique match is required",
                            edit.file
                        )));
                    }
                    EditMatch::Missing => {
                        return Ok(WorkerReport::failed(format!(
                            "old_code not found in {}",
                            edit.file
                        )));
                    }
                }
            };

            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| WorkerError::Invocation(format!("{}: {e}", parent.display())))?;
            }
            tokio::fs::write(&path, updated)
                .await
                .map_err(|e| WorkerError::Invocation(format!("write {}: {e}", edit.file)))?;
            tracing::info!(session = %artifacts.session, file = %edit.file, "edit applied");
            log.push(format!("edited {}: {}", edit.file, edit.description));
            report = report.with_artifact(Artifact::FileChanged {
                path: edit.file.clone(),
            });
        }
        report.output = log.join("\n");
        Ok(report)
    }

    async fn fix_lint(
        &self,
        artifacts: &SessionArtifacts,
        findings: &[CiFailure],
    ) -> Result<WorkerReport, WorkerError> {
        let Some((program, base_args)) = self.lint_fix.split_first() else {
            return Err(WorkerError::Invocation("no lint fix command configured".to_string()));
        };
        let mut files: Vec<String> = findings.iter().filter_map(|f| f.file.clone()).collect();
        files.sort();
        files.dedup();

        let output = self.runner.run(program, base_args).await?;
        if !output.success {
            return Ok(WorkerReport::failed(output.combined()));
        }
        // Findings without a file mean the fixer touched whatever it touched.
        let touched = if files.is_empty() {
            artifacts.files_changed.clone()
        } else {
            files
        };
        let mut report = WorkerReport::ok(output.combined());
        for path in touched {
            report = report.with_artifact(Artifact::FileChanged { path });
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fixloop_kernel::{Issue, SessionId};
    use pretty_assertions::assert_eq;

    fn artifacts() -> SessionArtifacts {
        SessionArtifacts::new(SessionId::new(), Issue::new("I1", "t", "d", "r"))
    }

    fn editor(dir: &Path) -> FsCodeEditor {
        FsCodeEditor::new(&WorkerSettings {
            repo_path: dir.to_path_buf(),
            ..WorkerSettings::default()
        })
    }

    fn edit(file: &str, old: &str, new: &str) -> FileEdit {
        FileEdit {
            file: file.to_string(),
            description: "test".to_string(),
            old_code: old.to_string(),
            new_code: new.to_string(),
        }
    }

    #[test]
    fn exact_unique_match() {
        assert_eq!(locate("a = 1\nb = 2\n", "b = 2"), EditMatch::Unique(6..11));
        assert_eq!(locate("x x", "x"), EditMatch::Ambiguous(2));
        assert_eq!(locate("abc", "zzz"), EditMatch::Missing);
    }

    #[test]
    fn whitespace_normalised_match() {
        let content = "def f():\n    return  1\n\ndef g():\n    pass\n";
        let m = locate(content, "def f():\n  return 1");
        assert_eq!(m, EditMatch::Unique(0..22));
    }

    #[tokio::test]
    async fn apply_edits_rewrites_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "limit = 10\n").unwrap();
        let report = editor(dir.path())
            .apply_edits(&artifacts(), &[edit("app.py", "limit = 10", "limit = 50")])
            .await
            .unwrap();
        assert!(report.success);
        assert_eq!(report.files_changed(), vec!["app.py".to_string()]);
        assert_eq!(std::fs::read_to_string(dir.path().join("app.py")).unwrap(), "limit = 50\n");
    }

    #[tokio::test]
    async fn ambiguous_edit_fails_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "x = 1\nx = 1\n").unwrap();
        let report = editor(dir.path())
            .apply_edits(&artifacts(), &[edit("app.py", "x = 1", "x = 2")])
            .await
            .unwrap();
        assert!(!report.success);
        assert!(report.output.contains("2 times"));
        assert_eq!(std::fs::read_to_string(dir.path().join("app.py")).unwrap(), "x = 1\nx = 1\n");
    }

    #[tokio::test]
    async fn edits_cannot_escape_repository() {
        let dir = tempfile::tempdir().unwrap();
        let err = editor(dir.path())
            .apply_edits(&artifacts(), &[edit("../etc/passwd", "", "x")])
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::Invocation(_)));
    }

    #[tokio::test]
    async fn new_file_from_empty_old_code() {
        let dir = tempfile::tempdir().unwrap();
        let report = editor(dir.path())
            .apply_edits(&artifacts(), &[edit("tests/test_new.py", "", "def test_x():\n    pass\n")])
            .await
            .unwrap();
        assert!(report.success);
        assert!(dir.path().join("tests/test_new.py").exists());
    }

    #[tokio::test]
    async fn context_skips_missing_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("app.py"), "print('hi')\n").unwrap();
        let report = editor(dir.path())
            .gather_context(&artifacts(), &["app.py".to_string(), "/api/videos".to_string()])
            .await
            .unwrap();
        assert!(report.output.contains("=== app.py ==="));
        assert!(!report.output.contains("/api/videos"));
    }
}
