//! Client-side library: the document index kept in sync with a server.
//!
//! [`Library`] owns the [`DocumentIndex`] behind a mutex together with a
//! [`ServerConn`]. It coordinates the two writers of the index:
//!
//! - **Bulk loads** clear the index and refill it from the record stream.
//! - **Server events** apply point mutations.
//!
//! Events that arrive while a load is in progress are queued and replayed in
//! arrival order once the load has finished, so a mutation is never wiped by
//! a load that started before it. This also holds when the load future is
//! dropped before it completes; the index is then left uninitialized.
//!
//! Entry events that arrive without a summary are completed by a background
//! fetch. Every entry event bumps a per-id sequence number on arrival, and a
//! fetched summary is discarded if a newer event for the same id arrived in
//! the meantime.
//!
//! The mutex is only taken between suspension points, never across `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use lires_client_core::channel::{EventHandler, HandlerRegistry, Subscription};
use lires_client_core::events::{EntryChange, Event, EventKind, EventPayload};
use lires_client_core::search::{self, SearchOutcome};
use lires_client_core::stream::{LoadProgress, StreamIngestor};
use lires_client_core::tags::TagSet;
use lires_client_core::{DocumentIndex, DocumentRecord};
use tracing::{debug, info, warn};

use crate::config::LoadConfig;
use crate::conn::{ServerConn, SupplementKind};
use crate::progress::{LoadProgressEvent, LoadProgressReporter};

#[derive(Default)]
struct LibraryState {
    index: DocumentIndex,
    loading: bool,
    pending: Vec<Event>,
    /// Arrival counter per entry id, see [`LibraryState::bump`].
    entry_seq: HashMap<String, u64>,
}

impl LibraryState {
    /// Record the arrival of an entry event for `id`.
    fn bump(&mut self, id: &str) -> u64 {
        let seq = self.entry_seq.entry(id.to_string()).or_insert(0);
        *seq += 1;
        *seq
    }

    fn apply_or_queue(&mut self, event: &Event) -> bool {
        if self.loading {
            debug!(kind = %event.kind(), "load in progress, queueing event");
            self.pending.push(event.clone());
            return false;
        }
        self.index.apply_event(event)
    }

    /// Apply events queued during a load, in arrival order.
    fn replay_pending(&mut self) -> (usize, usize) {
        let pending = std::mem::take(&mut self.pending);
        let changed = pending
            .iter()
            .filter(|event| self.index.apply_event(event))
            .count();
        (pending.len(), changed)
    }
}

type SharedState = Arc<Mutex<LibraryState>>;

fn lock(state: &Mutex<LibraryState>) -> MutexGuard<'_, LibraryState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

fn entry_id(event: &Event) -> Option<&str> {
    match &event.payload {
        EventPayload::AddEntry(change)
        | EventPayload::UpdateEntry(change)
        | EventPayload::DeleteEntry(change) => Some(change.uuid.as_str()),
        _ => None,
    }
}

/// Apply `event`, or queue it while a load is running.
fn apply_or_queue(state: &Mutex<LibraryState>, event: &Event) -> bool {
    let mut state = lock(state);
    if let Some(id) = entry_id(event) {
        state.bump(id);
    }
    state.apply_or_queue(event)
}

/// Apply a summary fetched for the entry event that arrived as number `seq`
/// for its id. Dropped if a later event for the id has arrived since.
fn apply_fetched(state: &Mutex<LibraryState>, seq: u64, event: &Event) -> bool {
    let mut state = lock(state);
    let Some(id) = entry_id(event) else {
        return false;
    };
    if state.entry_seq.get(id) != Some(&seq) {
        debug!(uuid = id, "discarding summary superseded by a newer event");
        return false;
    }
    state.apply_or_queue(event)
}

/// Id of an add/update event that arrived without its summary.
fn missing_summary(event: &Event) -> Option<&str> {
    match &event.payload {
        EventPayload::AddEntry(change) | EventPayload::UpdateEntry(change)
            if change.datapoint_summary.is_none() =>
        {
            Some(change.uuid.as_str())
        }
        _ => None,
    }
}

/// Marks a load as running. Dropping it ends the load, whether the load
/// completed or its future was cancelled, and replays queued events.
struct LoadGuard<'a> {
    state: &'a Mutex<LibraryState>,
}

impl<'a> LoadGuard<'a> {
    fn begin(state: &'a Mutex<LibraryState>) -> Result<Self> {
        let mut locked = lock(state);
        if locked.loading {
            bail!("a library load is already in progress");
        }
        locked.loading = true;
        locked.index.clear();
        Ok(Self { state })
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        let mut state = lock(self.state);
        state.loading = false;
        if !state.index.is_initialized() {
            debug!("load ended before completion");
        }
        let (replayed, changed) = state.replay_pending();
        if replayed > 0 {
            info!(replayed, changed, "replayed events queued during load");
        }
    }
}

/// One search hit with its relevance, when the selector is scored.
#[derive(Debug, Clone)]
pub struct SearchHit {
    pub record: DocumentRecord,
    pub score: Option<f64>,
}

pub struct Library {
    conn: ServerConn,
    load: LoadConfig,
    state: SharedState,
}

impl Library {
    pub fn new(conn: ServerConn, load: LoadConfig) -> Self {
        Self {
            conn,
            load,
            state: SharedState::default(),
        }
    }

    pub fn conn(&self) -> &ServerConn {
        &self.conn
    }

    /// Run `f` against the current index.
    pub fn read<R>(&self, f: impl FnOnce(&DocumentIndex) -> R) -> R {
        f(&lock(&self.state).index)
    }

    pub fn is_loading(&self) -> bool {
        lock(&self.state).loading
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.state).index.is_initialized()
    }

    /// Clear the index and reload it from the server, then replay events
    /// that arrived meanwhile.
    pub async fn load(&self, reporter: &dyn LoadProgressReporter) -> Result<LoadProgress> {
        let guard = LoadGuard::begin(&self.state)?;
        let result = self.fill(reporter).await;
        if result.is_ok() {
            lock(&self.state).index.mark_initialized();
        }
        drop(guard);

        let progress = result?;
        reporter.report(LoadProgressEvent::Finished(progress));
        Ok(progress)
    }

    async fn fill(&self, reporter: &dyn LoadProgressReporter) -> Result<LoadProgress> {
        let tags: TagSet = self.load.tags.iter().collect();

        if !self.load.streaming {
            reporter.report(LoadProgressEvent::Started { total: None });
            let records = self
                .conn
                .file_list(&tags)
                .await
                .context("Failed to fetch document list")?;
            let count = records.len() as u64;
            lock(&self.state).index.load_all(records);
            info!(records = count, "bulk load complete");
            return Ok(LoadProgress {
                current: count,
                total: None,
                finished: true,
            });
        }

        let (total, chunks) = self
            .conn
            .file_list_stream(&tags)
            .await
            .context("Failed to open document stream")?;
        reporter.report(LoadProgressEvent::Started { total });
        let progress = StreamIngestor::new(total)
            .with_policy(self.load.malformed.into())
            .run(chunks, |record, progress| {
                lock(&self.state).index.add(record);
                reporter.report(LoadProgressEvent::Loading(progress));
            })
            .await
            .context("Document stream failed")?;
        info!(records = progress.current, total = ?progress.total, "stream load complete");
        Ok(progress)
    }

    /// Apply a server event now, or after the running load.
    pub fn apply_event(&self, event: &Event) -> bool {
        apply_or_queue(&self.state, event)
    }

    /// Handler that keeps this library in sync with server events.
    ///
    /// Entry events without a summary trigger a background fetch of the
    /// summary; this needs a tokio runtime.
    pub fn event_handler(&self) -> EventHandler {
        let state = Arc::clone(&self.state);
        let conn = self.conn.clone();
        Arc::new(move |event: &Event| {
            let Some(id) = missing_summary(event) else {
                apply_or_queue(&state, event);
                return;
            };
            let seq = lock(&state).bump(id);
            let Ok(runtime) = tokio::runtime::Handle::try_current() else {
                warn!(uuid = id, "no runtime to fetch summary for entry event");
                return;
            };
            let (state, conn, id, session_id) =
                (Arc::clone(&state), conn.clone(), id.to_string(), event.session_id.clone());
            runtime.spawn(async move {
                match conn.summary(&id).await {
                    Ok(record) => {
                        let event = Event {
                            session_id,
                            payload: EventPayload::UpdateEntry(EntryChange {
                                uuid: id,
                                datapoint_summary: Some(record),
                            }),
                        };
                        apply_fetched(&state, seq, &event);
                    }
                    Err(e) => warn!(uuid = %id, error = %e, "failed to fetch summary for entry event"),
                }
            });
        })
    }

    /// Register [`event_handler`](Self::event_handler) for every
    /// index-mutating event kind.
    pub fn subscribe(&self, registry: &HandlerRegistry) -> Subscription {
        registry.register(EventKind::LIBRARY, self.event_handler())
    }

    /// Re-fetch one summary and store it, keeping cached supplements.
    pub async fn refresh(&self, id: &str) -> Result<DocumentRecord> {
        let mut record = self
            .conn
            .summary(id)
            .await
            .with_context(|| format!("Failed to fetch summary for {}", id))?;
        let mut state = lock(&self.state);
        if let Some(existing) = state.index.get(id) {
            record.supplement = existing.supplement.clone();
        }
        Ok(state.index.add(record).clone())
    }

    fn cached_supplement(&self, kind: SupplementKind, id: &str) -> Option<String> {
        let state = lock(&self.state);
        let supplement = &state.index.get(id)?.supplement;
        match kind {
            SupplementKind::Note => supplement.note.clone(),
            SupplementKind::Abstract => supplement.abstract_text.clone(),
        }
    }

    fn store_supplement(&self, kind: SupplementKind, id: &str, text: String) {
        let mut state = lock(&self.state);
        if let Some(record) = state.index.get_mut(id) {
            match kind {
                SupplementKind::Note => record.set_note(text),
                SupplementKind::Abstract => record.set_abstract(text),
            }
        }
    }

    /// Note or abstract of `id`, fetched once and cached on the record.
    pub async fn supplement(&self, kind: SupplementKind, id: &str) -> Result<String> {
        if let Some(text) = self.cached_supplement(kind, id) {
            return Ok(text);
        }
        let text = self
            .conn
            .supplement(kind, id)
            .await
            .with_context(|| format!("Failed to fetch {:?} for {}", kind, id))?;
        self.store_supplement(kind, id, text.clone());
        Ok(text)
    }

    pub async fn update_supplement(&self, kind: SupplementKind, id: &str, text: String) -> Result<()> {
        self.conn
            .update_supplement(kind, id, &text)
            .await
            .with_context(|| format!("Failed to update {:?} for {}", kind, id))?;
        self.store_supplement(kind, id, text);
        Ok(())
    }

    /// Rename a tag on the server and mirror it locally. The server's
    /// `update_tag` echo is then a no-op.
    pub async fn rename_tag(&self, from: &str, to: &str) -> Result<usize> {
        self.conn
            .rename_tag(from, to)
            .await
            .with_context(|| format!("Failed to rename tag {} to {}", from, to))?;
        Ok(lock(&self.state).index.rename_tag(from, to))
    }

    pub async fn delete_tag(&self, tag: &str) -> Result<usize> {
        self.conn
            .delete_tag(tag)
            .await
            .with_context(|| format!("Failed to delete tag {}", tag))?;
        Ok(lock(&self.state).index.delete_tag(tag))
    }

    /// Search among the records carrying all of `tags`.
    pub async fn search(&self, selector: &str, pattern: &str, tags: &TagSet) -> Result<Vec<SearchHit>> {
        let candidates: Vec<DocumentRecord> = {
            let state = lock(&self.state);
            state.index.by_tags(tags).into_iter().cloned().collect()
        };
        let SearchOutcome { records, scores } =
            search::filter(candidates.iter().collect(), selector, pattern, &self.conn).await?;
        let hits = match scores {
            Some(scores) => records
                .into_iter()
                .zip(scores)
                .map(|(r, s)| SearchHit {
                    record: r.clone(),
                    score: Some(s),
                })
                .collect(),
            None => records
                .into_iter()
                .map(|r| SearchHit {
                    record: r.clone(),
                    score: None,
                })
                .collect(),
        };
        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NoProgress;
    use lires_client_core::events::TagChange;
    use std::time::Duration;

    fn library() -> Library {
        let conn = ServerConn::new("http://127.0.0.1:9", "k", None).unwrap();
        Library::new(conn, LoadConfig::default())
    }

    fn tag_event(src: &str, dst: Option<&str>) -> Event {
        Event {
            session_id: "other".into(),
            payload: EventPayload::UpdateTag(TagChange {
                src_tag: src.into(),
                dst_tag: dst.map(str::to_string),
            }),
        }
    }

    #[test]
    fn events_queue_while_loading() {
        let lib = library();
        {
            let mut state = lock(&lib.state);
            let mut rec = DocumentRecord::new("a");
            rec.tags.insert("x");
            state.index.add(rec);
            state.loading = true;
        }
        assert!(!lib.apply_event(&tag_event("x", Some("y"))));
        assert_eq!(lock(&lib.state).pending.len(), 1);
        assert!(lib.read(|idx| idx.get("a").unwrap().tags.contains("x")));

        lock(&lib.state).loading = false;
        assert!(lib.apply_event(&tag_event("x", Some("y"))));
        assert!(lib.read(|idx| idx.get("a").unwrap().tags.contains("y")));
    }

    #[test]
    fn missing_summary_detection() {
        let add = Event {
            session_id: String::new(),
            payload: EventPayload::AddEntry(EntryChange {
                uuid: "n".into(),
                datapoint_summary: None,
            }),
        };
        assert_eq!(missing_summary(&add), Some("n"));
        assert_eq!(missing_summary(&tag_event("a", None)), None);
    }

    fn entry_event(kind: &str, id: &str, title: Option<&str>) -> Event {
        let summary = title.map(|t| {
            let mut rec = DocumentRecord::new(id);
            rec.title = t.to_string();
            rec
        });
        let change = EntryChange {
            uuid: id.into(),
            datapoint_summary: summary,
        };
        let payload = match kind {
            "add" => EventPayload::AddEntry(change),
            "update" => EventPayload::UpdateEntry(change),
            _ => EventPayload::DeleteEntry(change),
        };
        Event {
            session_id: "other".into(),
            payload,
        }
    }

    #[test]
    fn fetched_summary_after_delete_is_discarded() {
        let lib = library();
        let seq = lock(&lib.state).bump("x");
        assert!(lib.apply_event(&entry_event("add", "x", Some("first"))));
        assert!(lib.apply_event(&entry_event("delete", "x", None)));

        assert!(!apply_fetched(&lib.state, seq, &entry_event("update", "x", Some("stale"))));
        assert!(!lib.read(|idx| idx.contains("x")));
    }

    #[test]
    fn fetched_summary_does_not_override_newer_update() {
        let lib = library();
        let seq = lock(&lib.state).bump("x");
        assert!(lib.apply_event(&entry_event("update", "x", Some("newer"))));

        assert!(!apply_fetched(&lib.state, seq, &entry_event("update", "x", Some("stale"))));
        assert_eq!(lib.read(|idx| idx.get("x").unwrap().title.clone()), "newer");

        let seq = lock(&lib.state).bump("y");
        assert!(apply_fetched(&lib.state, seq, &entry_event("update", "y", Some("fresh"))));
        assert_eq!(lib.read(|idx| idx.get("y").unwrap().title.clone()), "fresh");
    }

    #[tokio::test]
    async fn cancelled_load_releases_the_library() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });
        let conn = ServerConn::new(format!("http://{}", addr), "k", None).unwrap();
        let lib = Library::new(conn, LoadConfig::default());

        let first = tokio::time::timeout(Duration::from_millis(200), lib.load(&NoProgress)).await;
        assert!(first.is_err());
        assert!(!lib.is_loading());
        assert!(!lib.is_initialized());

        assert!(lib.apply_event(&entry_event("add", "x", Some("live"))));
        assert!(lock(&lib.state).pending.is_empty());

        // A new load starts instead of reporting one already in progress.
        let second = tokio::time::timeout(Duration::from_millis(200), lib.load(&NoProgress)).await;
        assert!(second.is_err());
        assert!(!lib.is_loading());
    }

    #[tokio::test]
    async fn failed_load_leaves_index_uninitialized() {
        let lib = library();
        let err = lib.load(&NoProgress).await;
        assert!(err.is_err());
        assert!(!lib.is_loading());
        assert!(!lib.is_initialized());
    }
}
