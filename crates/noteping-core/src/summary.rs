//! AI summary watcher
//!
//! After a note is created, or updated with summary regeneration requested,
//! the backend produces its summary asynchronously. `SummaryWatcher` polls
//! the note until `ai_summary` appears and hands the result to a
//! [`NoteDisplay`]. Timing out is a silent degradation: the display gets the
//! last note seen, marked as still pending.

use crate::error::FetchError;
use crate::poller::{CompletionPoller, PollHandle, PollOptions, PollOutcome, Settlement};
use crate::types::JobId;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Note resource as served by the backend
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Note id
    pub id: i64,
    /// Note body
    pub content: String,
    /// Generated summary; `None` while generation is pending
    #[serde(default)]
    pub ai_summary: Option<String>,
    /// Owning notebook
    #[serde(default)]
    pub notebook_id: Option<i64>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last modification time
    pub updated_at: DateTime<Utc>,
}

impl Note {
    /// Summary generation has finished
    #[inline]
    #[must_use]
    pub fn has_summary(&self) -> bool {
        self.ai_summary.is_some()
    }
}

/// Source of note resources
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NoteSource: Send + Sync {
    /// Fetch the current version of a note
    async fn fetch_note(&self, note_id: i64) -> Result<Note, FetchError>;
}

/// Result delivered to the display
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SummaryUpdate {
    /// Summary is available
    Ready(Note),
    /// Polling gave up; the summary may still arrive later
    StillPending {
        /// Note that was watched
        note_id: i64,
        /// Last successfully fetched version
        last_seen: Option<Note>,
    },
}

impl SummaryUpdate {
    /// Note the update refers to
    #[must_use]
    pub fn note_id(&self) -> i64 {
        match self {
            Self::Ready(note) => note.id,
            Self::StillPending { note_id, .. } => *note_id,
        }
    }
}

/// Sink for watcher results
#[cfg_attr(test, mockall::automock)]
pub trait NoteDisplay: Send + Sync {
    /// Show a settled update
    fn show(&self, update: SummaryUpdate);
}

/// Note lifecycle events that may start a summary job
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoteEvent {
    /// Note was created
    Created(Note),
    /// Note was saved
    Updated {
        /// Saved note
        note: Note,
        /// Summary regeneration was requested
        regenerate_summary: bool,
    },
}

/// Watches notes until their summaries are generated
#[derive(Clone)]
pub struct SummaryWatcher {
    poller: CompletionPoller,
    source: Arc<dyn NoteSource>,
    display: Arc<dyn NoteDisplay>,
    options: PollOptions,
}

impl std::fmt::Debug for SummaryWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SummaryWatcher")
            .field("options", &self.options)
            .field("active", &self.poller.active_count())
            .finish_non_exhaustive()
    }
}

impl SummaryWatcher {
    /// Create watcher using the poller's default schedule
    #[must_use]
    pub fn new(
        poller: CompletionPoller,
        source: Arc<dyn NoteSource>,
        display: Arc<dyn NoteDisplay>,
    ) -> Self {
        let options = poller.defaults();
        Self {
            poller,
            source,
            display,
            options,
        }
    }

    /// Override the schedule
    #[inline]
    #[must_use]
    pub fn with_options(mut self, options: PollOptions) -> Self {
        self.options = options;
        self
    }

    /// Start (or restart) watching a note
    pub fn watch(&self, note_id: i64) -> PollHandle {
        let source = Arc::clone(&self.source);
        let display = Arc::clone(&self.display);
        tracing::debug!(note_id, "watching note for summary");

        self.poller.start_with(
            JobId::for_note(note_id),
            move || {
                let source = Arc::clone(&source);
                async move { source.fetch_note(note_id).await }
            },
            Note::has_summary,
            self.options,
            move |settlement: Settlement<Note>| {
                let update = match (settlement.outcome, settlement.resource) {
                    (PollOutcome::Completed, Some(note)) => SummaryUpdate::Ready(note),
                    (_, last_seen) => SummaryUpdate::StillPending { note_id, last_seen },
                };
                display.show(update);
            },
        )
    }

    /// Stop watching a note; `false` if it was not being watched
    pub fn unwatch(&self, note_id: i64) -> bool {
        self.poller.cancel(&JobId::for_note(note_id))
    }

    /// Note has an active watch
    #[must_use]
    pub fn is_watching(&self, note_id: i64) -> bool {
        self.poller.handle(&JobId::for_note(note_id)).is_some()
    }

    /// React to a note event; returns the handle when a watch was started
    pub fn on_event(&self, event: &NoteEvent) -> Option<PollHandle> {
        match event {
            NoteEvent::Created(note)
            | NoteEvent::Updated {
                note,
                regenerate_summary: true,
            } => Some(self.watch(note.id)),
            NoteEvent::Updated { .. } => None,
        }
    }
}
