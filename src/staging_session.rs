//! A single in-progress edit, saved to the staging store on a timer.
//!
//! The session keeps the edited values in memory, writes them back every
//! save interval while there is something new to write, and tracks how many
//! saves in a row have failed. Once that count reaches the configured
//! threshold the session reports [`StagingState::StagingErrorThreshold`];
//! saving continues, and the next successful save brings it back to
//! [`StagingState::Staging`].
//!
//! Saves and `finish()` write to the store one at a time, so a save that is
//! already running when the edit finishes lands before the staged values
//! are cleared, never after.
//!
//! Every `start()` must be paired with `stop()` or `finish()`. Dropping the
//! session also cancels its timer.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::datamodel::RevisionId;
use crate::staging::{staging_key, ExistingRef, StagedData, StagingStore};
use crate::sync_error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagingState {
    /// Nothing staged for this edit yet.
    NoStagedData,
    /// Edits exist and the save cycle is running.
    Staging,
    /// Too many consecutive saves failed.
    StagingErrorThreshold,
    /// The record was submitted and its staged data cleared.
    Saved,
}

/// Which staged document a session writes to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagingTarget {
    pub active_id: String,
    pub view_name: String,
    pub existing: Option<ExistingRef>,
}

impl StagingTarget {
    pub fn new(active_id: impl Into<String>, view_name: impl Into<String>, existing: Option<ExistingRef>) -> Self {
        Self {
            active_id: active_id.into(),
            view_name: view_name.into(),
            existing,
        }
    }

    pub fn key(&self) -> String {
        staging_key(&self.active_id, &self.view_name, self.existing.as_ref())
    }
}

#[derive(Default)]
struct EditState {
    fields: StagedData,
    touched: BTreeSet<String>,
    last_revision: Option<RevisionId>,
    edits: u64,
    saved_edits: u64,
    consecutive_errors: u32,
    last_error: Option<String>,
}

struct SessionInner {
    store: StagingStore,
    target: StagingTarget,
    threshold: u32,
    edit: Mutex<EditState>,
    is_saving: AtomicBool,
    /// Held for the whole store write by `save()` and `finish()`.
    writing: Mutex<()>,
    state: watch::Sender<StagingState>,
}

/// Clears `is_saving` even if the save future is dropped midway.
struct SavingGuard<'a>(&'a AtomicBool);

impl Drop for SavingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl SessionInner {
    fn state(&self) -> StagingState {
        *self.state.borrow()
    }

    fn set_state(&self, next: StagingState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            debug!("Staging {} moved from {current:?} to {next:?}", self.target.key());
            *current = next;
            true
        });
    }

    async fn save(&self) -> Result<bool> {
        if self.state() == StagingState::Saved {
            return Ok(false);
        }
        if self
            .is_saving
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Save of {} already running, skipping", self.target.key());
            return Ok(false);
        }
        let _guard = SavingGuard(&self.is_saving);
        let _writing = self.writing.lock().await;
        if self.state() == StagingState::Saved {
            return Ok(false);
        }

        let (fields, revision, edits) = {
            let edit = self.edit.lock().await;
            if edit.edits == edit.saved_edits {
                return Ok(false);
            }
            (edit.fields.clone(), edit.last_revision.clone(), edit.edits)
        };

        let result = self
            .store
            .set_staged(
                fields,
                revision.as_deref(),
                &self.target.active_id,
                &self.target.view_name,
                self.target.existing.as_ref(),
            )
            .await;

        let mut edit = self.edit.lock().await;
        match result {
            Ok(rev) => {
                edit.last_revision = Some(rev);
                edit.saved_edits = edits;
                edit.consecutive_errors = 0;
                edit.last_error = None;
                drop(edit);
                self.set_state(StagingState::Staging);
                Ok(true)
            }
            Err(e) => {
                edit.consecutive_errors += 1;
                edit.last_error = Some(e.to_string());
                let errors = edit.consecutive_errors;
                drop(edit);

                if errors >= self.threshold {
                    error!(
                        "Staging {} failed {errors} times in a row: {e}",
                        self.target.key()
                    );
                    self.set_state(StagingState::StagingErrorThreshold);
                } else {
                    warn!("Staging save of {} failed ({errors}/{}): {e}", self.target.key(), self.threshold);
                }
                Err(e)
            }
        }
    }
}

pub struct StagingSession {
    inner: Arc<SessionInner>,
    interval: Duration,
    timer: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl StagingSession {
    /// Opens a session, resuming whatever was staged for `target` before.
    pub async fn load(store: StagingStore, target: StagingTarget, interval: Duration, threshold: u32) -> Result<Self> {
        let mut edit = EditState::default();
        let initial = match store
            .get_staged(&target.active_id, &target.view_name, target.existing.as_ref())
            .await?
        {
            Some(staged) => {
                edit.last_revision = Some(staged.revision);
                let resumed = !staged.data.is_empty();
                edit.fields = staged.data;
                if resumed {
                    StagingState::Staging
                } else {
                    StagingState::NoStagedData
                }
            }
            None => StagingState::NoStagedData,
        };
        debug!("Loaded staging session {} in {initial:?}", target.key());

        let (state, _) = watch::channel(initial);
        Ok(Self {
            inner: Arc::new(SessionInner {
                store,
                target,
                threshold: threshold.max(1),
                edit: Mutex::new(edit),
                is_saving: AtomicBool::new(false),
                writing: Mutex::new(()),
                state,
            }),
            interval,
            timer: std::sync::Mutex::new(None),
        })
    }

    pub fn target(&self) -> &StagingTarget {
        &self.inner.target
    }

    pub fn state(&self) -> StagingState {
        self.inner.state()
    }

    pub fn subscribe(&self) -> watch::Receiver<StagingState> {
        self.inner.state.subscribe()
    }

    /// The values the edit started from or has reached so far.
    pub async fn values(&self) -> StagedData {
        self.inner.edit.lock().await.fields.clone()
    }

    /// Fields changed in this session.
    pub async fn touched(&self) -> BTreeSet<String> {
        self.inner.edit.lock().await.touched.clone()
    }

    pub async fn last_revision(&self) -> Option<RevisionId> {
        self.inner.edit.lock().await.last_revision.clone()
    }

    pub async fn consecutive_errors(&self) -> u32 {
        self.inner.edit.lock().await.consecutive_errors
    }

    pub async fn last_error(&self) -> Option<String> {
        self.inner.edit.lock().await.last_error.clone()
    }

    /// Records a field change. Ignored once the session is saved.
    pub async fn touch(&self, field: impl Into<String>, value: JsonValue) {
        if self.state() == StagingState::Saved {
            return;
        }
        let field = field.into();
        {
            let mut edit = self.inner.edit.lock().await;
            edit.fields.insert(field.clone(), value);
            edit.touched.insert(field);
            edit.edits += 1;
        }
        if self.state() == StagingState::NoStagedData {
            self.inner.set_state(StagingState::Staging);
        }
    }

    /// Runs one save cycle. Returns whether anything was written; a cycle that
    /// overlaps a running one, or has nothing new to write, is skipped.
    pub async fn save_now(&self) -> Result<bool> {
        self.inner.save().await
    }

    /// Starts the periodic save timer. Must run inside a tokio runtime.
    pub fn start(&self) {
        let Ok(mut timer) = self.timer.lock() else {
            warn!("Staging timer of {} is poisoned", self.inner.target.key());
            return;
        };
        if timer.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let period = self.interval;
        *timer = Some(tokio::spawn(async move {
            let mut ticks = tokio::time::interval(period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            ticks.tick().await;
            loop {
                ticks.tick().await;
                if let Err(e) = inner.save().await {
                    debug!("Periodic save of {} failed: {e}", inner.target.key());
                }
            }
        }));
        debug!("Started staging timer for {} every {period:?}", self.inner.target.key());
    }

    /// Cancels the periodic save timer.
    pub fn stop(&self) {
        self.cancel_timer();
    }

    fn cancel_timer(&self) -> Option<JoinHandle<()>> {
        let handle = self.timer.lock().ok()?.take()?;
        handle.abort();
        debug!("Stopped staging timer for {}", self.inner.target.key());
        Some(handle)
    }

    pub fn is_running(&self) -> bool {
        self.timer.lock().map(|timer| timer.is_some()).unwrap_or(false)
    }

    /// Ends the edit after its record was submitted: clears the staged
    /// values and stops the timer.
    pub async fn finish(&self) -> Result<()> {
        if let Some(handle) = self.cancel_timer() {
            // Cancelled is the expected outcome.
            let _ = handle.await;
        }
        let _writing = self.inner.writing.lock().await;
        if self.state() == StagingState::Saved {
            return Ok(());
        }

        let revision = self.last_revision().await;
        let target = &self.inner.target;
        let rev = self
            .inner
            .store
            .clear_staged(revision.as_deref(), &target.active_id, &target.view_name, target.existing.as_ref())
            .await?;

        {
            let mut edit = self.inner.edit.lock().await;
            edit.fields.clear();
            edit.last_revision = Some(rev);
            edit.saved_edits = edit.edits;
        }
        self.inner.set_state(StagingState::Saved);
        info!("Cleared staged data for {}", target.key());
        Ok(())
    }
}

impl Drop for StagingSession {
    fn drop(&mut self) {
        self.stop();
    }
}
