//! In-memory document index keyed by record id.
//!
//! The index is the single owner of [`DocumentRecord`]s on the client. It is
//! rebuilt wholesale by a stream load and kept current afterwards by applying
//! server [`Event`]s.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;

use tracing::debug;

use crate::events::{Event, EventPayload};
use crate::models::DocumentRecord;
use crate::tags::{self, TagSet};

pub struct DocumentIndex {
    records: BTreeMap<String, DocumentRecord>,
    initialized: bool,
    placeholder: DocumentRecord,
}

impl DocumentIndex {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            initialized: false,
            placeholder: DocumentRecord::placeholder(),
        }
    }

    /// Insert or replace by id. Returns the stored record.
    pub fn add(&mut self, record: DocumentRecord) -> &DocumentRecord {
        match self.records.entry(record.id.clone()) {
            Entry::Occupied(mut slot) => {
                slot.insert(record);
                slot.into_mut()
            }
            Entry::Vacant(slot) => slot.insert(record),
        }
    }

    pub fn get(&self, id: &str) -> Option<&DocumentRecord> {
        self.records.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut DocumentRecord> {
        self.records.get_mut(id)
    }

    /// Like [`get`](Self::get), but falls back to the placeholder record so
    /// presentation code can keep rendering a row whose document was just
    /// deleted.
    pub fn get_or_dummy(&self, id: &str) -> &DocumentRecord {
        self.records.get(id).unwrap_or(&self.placeholder)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.records.contains_key(id)
    }

    /// Remove by id. Absent ids are a no-op.
    pub fn delete(&mut self, id: &str) -> Option<DocumentRecord> {
        self.records.remove(id)
    }

    /// Drop every record and mark the index as not yet loaded.
    pub fn clear(&mut self) {
        self.records.clear();
        self.initialized = false;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records in id order.
    pub fn iter(&self) -> impl Iterator<Item = &DocumentRecord> {
        self.records.values()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    pub fn mark_initialized(&mut self) {
        self.initialized = true;
    }

    /// Replace the contents with `records` in one step and mark the index
    /// initialized.
    pub fn load_all(&mut self, records: impl IntoIterator<Item = DocumentRecord>) {
        self.clear();
        for record in records {
            self.add(record);
        }
        self.mark_initialized();
    }

    /// Union of all records' tags.
    pub fn all_tags(&self) -> TagSet {
        let mut out = TagSet::new();
        for record in self.records.values() {
            out.union_with(&record.tags);
        }
        out
    }

    /// Records whose tags, closed under ancestors, contain every tag of
    /// `query`. An empty query selects everything.
    pub fn by_tags(&self, query: &TagSet) -> Vec<&DocumentRecord> {
        self.records
            .values()
            .filter(|r| tags::matches(query, &r.tags))
            .collect()
    }

    /// Apply one server event. Returns `true` if the index changed.
    ///
    /// Entry events without a summary (other than deletions) cannot be
    /// applied locally; the caller is expected to fetch the summary.
    pub fn apply_event(&mut self, event: &Event) -> bool {
        match &event.payload {
            EventPayload::AddEntry(change) | EventPayload::UpdateEntry(change) => {
                let Some(summary) = &change.datapoint_summary else {
                    debug!(uuid = %change.uuid, "entry event without summary");
                    return false;
                };
                let mut record = summary.clone();
                if let Some(existing) = self.records.get(&record.id) {
                    record.supplement = existing.supplement.clone();
                }
                self.add(record);
                true
            }
            EventPayload::DeleteEntry(change) => self.delete(&change.uuid).is_some(),
            EventPayload::UpdateNote(change) => {
                let Some(record) = change.uuid.as_deref().and_then(|id| self.records.get_mut(id))
                else {
                    return false;
                };
                record.set_note(change.note.clone());
                true
            }
            EventPayload::UpdateTag(change) => match &change.dst_tag {
                Some(dst) => self.rename_tag(&change.src_tag, dst) > 0,
                None => self.delete_tag(&change.src_tag) > 0,
            },
            EventPayload::DeleteTag(change) => self.delete_tag(&change.src_tag) > 0,
            EventPayload::AddUser(_)
            | EventPayload::UpdateUser(_)
            | EventPayload::DeleteUser(_)
            | EventPayload::Login(_)
            | EventPayload::Logout(_) => false,
        }
    }

    /// Rename a tag (and its descendants) on every record. Returns the
    /// number of records touched.
    pub fn rename_tag(&mut self, from: &str, to: &str) -> usize {
        let mut touched = 0;
        for record in self.records.values_mut() {
            if let Some(renamed) = tags::rename_tag(&record.tags, from, to) {
                record.tags = renamed;
                touched += 1;
            }
        }
        touched
    }

    /// Remove a tag (and its descendants) from every record.
    pub fn delete_tag(&mut self, tag: &str) -> usize {
        let mut touched = 0;
        for record in self.records.values_mut() {
            if let Some(kept) = tags::delete_tag(&record.tags, tag) {
                record.tags = kept;
                touched += 1;
            }
        }
        touched
    }
}

impl Default for DocumentIndex {
    fn default() -> Self {
        Self::new()
    }
}
