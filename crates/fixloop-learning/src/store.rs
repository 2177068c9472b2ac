//! Learning Store
//!
//! Every write is an entry in a hash-chained ledger: new lessons, the
//! sessions they were applied to, and how those sessions ended. Lesson
//! counters are derived from the ledger, never stored in place, so nothing
//! is ever rewritten or deleted.

use crate::error::LearningError;
use crate::signature::{similarity, FailureSignature, LessonQuery};
use chrono::{DateTime, Utc};
use fixloop_kernel::{IssueId, Record, RecordLog, SessionId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Resolved applications before a lesson can be demoted
const DEMOTE_MIN_RESOLVED: u64 = 2;

/// Identifier of a lesson; its position among recorded lessons
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LessonId(pub u64);

impl std::fmt::Display for LessonId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// Everything recorded with a new lesson besides its signature
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonNote {
    /// Session that failed
    pub session: SessionId,
    /// Issue it was fixing
    pub issue: IssueId,
    /// Rule to put in front of future strategy prompts
    pub guidance: String,
    /// Actions the session took, in order
    pub actions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entry", rename_all = "snake_case")]
enum LedgerEntry {
    Lesson {
        id: LessonId,
        signature: FailureSignature,
        note: LessonNote,
    },
    Applied {
        session: SessionId,
        lessons: Vec<LessonId>,
    },
    Outcome {
        session: SessionId,
        success: bool,
    },
}

/// A lesson with its derived effectiveness counters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lesson {
    /// Identifier
    pub id: LessonId,
    /// What failed
    pub signature: FailureSignature,
    /// Guidance and provenance
    pub note: LessonNote,
    /// When it was recorded
    pub recorded_at: DateTime<Utc>,
    /// Sessions it was applied to
    pub times_applied: u64,
    /// Of those, sessions that reached DONE
    pub successes: u64,
    /// Of those, sessions that failed or were cancelled
    pub failures: u64,
}

impl Lesson {
    /// Success rate over resolved applications, if any
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn success_rate(&self) -> Option<f64> {
        let resolved = self.successes + self.failures;
        (resolved > 0).then(|| self.successes as f64 / resolved as f64)
    }

    /// Its applications failed more often than they succeeded
    ///
    /// A single unlucky application is not enough; at least two must
    /// have resolved.
    #[must_use]
    pub fn is_demoted(&self) -> bool {
        self.successes + self.failures >= DEMOTE_MIN_RESOLVED && self.failures > self.successes
    }
}

/// Aggregate counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LearningStats {
    /// Lessons recorded
    pub lessons: usize,
    /// Lessons currently demoted
    pub demoted: usize,
    /// Applications recorded
    pub applications: u64,
    /// Sessions still awaiting an outcome
    pub pending_sessions: usize,
}

#[derive(Debug, Default)]
struct Index {
    lessons: Vec<Lesson>,
    pending: HashMap<SessionId, Vec<LessonId>>,
    applications: u64,
}

impl Index {
    fn apply(&mut self, record: &Record<LedgerEntry>) {
        match &record.payload {
            LedgerEntry::Lesson {
                id,
                signature,
                note,
            } => self.lessons.push(Lesson {
                id: *id,
                signature: signature.clone(),
                note: note.clone(),
                recorded_at: record.recorded_at,
                times_applied: 0,
                successes: 0,
                failures: 0,
            }),
            LedgerEntry::Applied { session, lessons } => {
                for id in lessons {
                    if let Some(lesson) = self.lesson_mut(*id) {
                        lesson.times_applied += 1;
                        self.applications += 1;
                    }
                }
                self.pending
                    .entry(*session)
                    .or_default()
                    .extend(lessons.iter().copied());
            }
            LedgerEntry::Outcome { session, success } => {
                for id in self.pending.remove(session).unwrap_or_default() {
                    if let Some(lesson) = self.lesson_mut(id) {
                        if *success {
                            lesson.successes += 1;
                        } else {
                            lesson.failures += 1;
                        }
                    }
                }
            }
        }
    }

    fn lesson_mut(&mut self, id: LessonId) -> Option<&mut Lesson> {
        usize::try_from(id.0)
            .ok()
            .and_then(|i| self.lessons.get_mut(i))
            .filter(|l| l.id == id)
    }
}

/// Append-only lesson store, optionally persisted as JSON lines
#[derive(Debug)]
pub struct LearningStore {
    log: RecordLog<LedgerEntry>,
    index: Mutex<Index>,
    sink: Mutex<Option<File>>,
    path: Option<PathBuf>,
}

impl Default for LearningStore {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl LearningStore {
    /// Store that lives only as long as the process
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            log: RecordLog::new(),
            index: Mutex::new(Index::default()),
            sink: Mutex::new(None),
            path: None,
        }
    }

    /// Open (or create) a store backed by `path`, replaying and verifying its ledger.
    ///
    /// # Errors
    /// I/O failures, malformed lines, or a broken hash chain.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LearningError> {
        let path = path.as_ref().to_path_buf();
        let mut records = Vec::new();
        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            for (n, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let record: Record<LedgerEntry> =
                    serde_json::from_str(&line).map_err(|source| LearningError::Decode {
                        line: n + 1,
                        source,
                    })?;
                records.push(record);
            }
        }

        let mut index = Index::default();
        for record in &records {
            index.apply(record);
        }
        let log = RecordLog::from_records(records)?;
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        tracing::info!(path = %path.display(), lessons = index.lessons.len(), "learning store opened");

        Ok(Self {
            log,
            index: Mutex::new(index),
            sink: Mutex::new(Some(file)),
            path: Some(path),
        })
    }

    /// Backing file, if persisted
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn append(&self, index: &mut Index, entry: LedgerEntry) -> Result<(), LearningError> {
        let record = self.log.append(entry)?;
        if let Some(file) = self.sink.lock().as_mut() {
            let line = serde_json::to_string(&record).map_err(fixloop_kernel::LogError::from)?;
            writeln!(file, "{line}")?;
            file.flush()?;
        }
        index.apply(&record);
        Ok(())
    }

    /// Record a lesson learned from a failed or cancelled session
    ///
    /// # Errors
    /// Persistence failures; the in-memory ledger is still updated.
    pub fn record(
        &self,
        signature: FailureSignature,
        note: LessonNote,
    ) -> Result<LessonId, LearningError> {
        let mut index = self.index.lock();
        let id = LessonId(index.lessons.len() as u64);
        tracing::info!(lesson = %id, session = %note.session, stage = %signature.stage, kind = %signature.kind, "lesson recorded");
        self.append(
            &mut index,
            LedgerEntry::Lesson {
                id,
                signature,
                note,
            },
        )?;
        Ok(id)
    }

    /// Most relevant lessons first, at most `limit`, unrelated lessons omitted.
    ///
    /// Ordered by similarity, then recency. Demoted lessons sort after every
    /// lesson that is not demoted.
    #[must_use]
    pub fn lookup(&self, query: &LessonQuery, limit: usize) -> Vec<Lesson> {
        let index = self.index.lock();
        let mut scored: Vec<(bool, u32, &Lesson)> = index
            .lessons
            .iter()
            .filter_map(|l| {
                let score = similarity(&l.signature, query);
                (score > 0).then_some((l.is_demoted(), score, l))
            })
            .collect();
        scored.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(b.1.cmp(&a.1))
                .then(b.2.id.cmp(&a.2.id))
        });
        scored.into_iter().take(limit).map(|(_, _, l)| l.clone()).collect()
    }

    /// Remember that `lessons` were shown to `session`
    ///
    /// # Errors
    /// Persistence failures.
    pub fn record_application(
        &self,
        session: SessionId,
        lessons: &[LessonId],
    ) -> Result<(), LearningError> {
        if lessons.is_empty() {
            return Ok(());
        }
        let mut index = self.index.lock();
        self.append(
            &mut index,
            LedgerEntry::Applied {
                session,
                lessons: lessons.to_vec(),
            },
        )
    }

    /// Fold a session's terminal outcome into the lessons it was shown
    ///
    /// # Errors
    /// Persistence failures.
    pub fn record_outcome(&self, session: SessionId, success: bool) -> Result<(), LearningError> {
        let mut index = self.index.lock();
        if !index.pending.contains_key(&session) {
            return Ok(());
        }
        self.append(&mut index, LedgerEntry::Outcome { session, success })
    }

    /// Every lesson in recording order
    #[must_use]
    pub fn lessons(&self) -> Vec<Lesson> {
        self.index.lock().lessons.clone()
    }

    /// Number of lessons
    #[must_use]
    pub fn len(&self) -> usize {
        self.index.lock().lessons.len()
    }

    /// True when no lesson has been recorded
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Aggregate counters
    #[must_use]
    pub fn stats(&self) -> LearningStats {
        let index = self.index.lock();
        LearningStats {
            lessons: index.lessons.len(),
            demoted: index.lessons.iter().filter(|l| l.is_demoted()).count(),
            applications: index.applications,
            pending_sessions: index.pending.len(),
        }
    }

    /// Re-verify the ledger hash chain
    ///
    /// # Errors
    /// [`LearningError::Log`] when the chain is broken.
    pub fn verify_integrity(&self) -> Result<(), LearningError> {
        Ok(self.log.verify_integrity()?)
    }
}
