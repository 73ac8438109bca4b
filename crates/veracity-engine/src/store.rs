use std::collections::BTreeSet;

use veracity_contracts::records::{ImageFile, ImageRecord, PreviewHandle, RecordStatus};

/// Every image in the current batch, in insertion order, plus the selection.
///
/// Records are only ever replaced whole, keyed by id.
#[derive(Debug, Default)]
pub struct ImageRecordStore {
    records: Vec<ImageRecord>,
    selected_id: Option<String>,
    next_preview_id: u64,
    live_previews: BTreeSet<u64>,
}

impl ImageRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> &[ImageRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&ImageRecord> {
        self.records.iter().find(|record| record.id == id)
    }

    pub fn selected_id(&self) -> Option<&str> {
        self.selected_id.as_deref()
    }

    pub fn selected(&self) -> Option<&ImageRecord> {
        self.selected_id.as_deref().and_then(|id| self.get(id))
    }

    pub fn pending_count(&self) -> usize {
        self.records
            .iter()
            .filter(|record| record.status == RecordStatus::Pending)
            .count()
    }

    /// Appends one pending record per file and returns the new ids. Selects
    /// the first new record when nothing is selected. `stamp_millis` seeds
    /// the ids.
    pub fn add(&mut self, files: Vec<ImageFile>, stamp_millis: i64) -> Vec<String> {
        let mut ids = Vec::with_capacity(files.len());
        for file in files {
            let id = self.unique_id(&format!("{stamp_millis}-{}", file.name));
            let preview = self.issue_preview(&file);
            self.records
                .push(ImageRecord::pending(id.clone(), file, preview));
            ids.push(id);
        }
        if self.selected_id.is_none() {
            self.selected_id = ids.first().cloned();
        }
        ids
    }

    /// Changes the selection. Unknown ids and re-selecting the current id
    /// return false.
    pub fn select(&mut self, id: &str) -> bool {
        if self.selected_id.as_deref() == Some(id) || self.get(id).is_none() {
            return false;
        }
        self.selected_id = Some(id.to_string());
        true
    }

    /// Moves every pending record to loading in one step and returns them.
    pub fn begin_analysis(&mut self) -> Vec<ImageRecord> {
        let mut launched = Vec::new();
        for record in self.records.iter_mut() {
            if record.status == RecordStatus::Pending {
                *record = record.with_status(RecordStatus::Loading);
                launched.push(record.clone());
            }
        }
        launched
    }

    /// Replaces the record with `id` by whatever `next` derives from it.
    /// Missing ids and a `None` from `next` leave the store untouched.
    pub fn update<F>(&mut self, id: &str, next: F) -> Option<ImageRecord>
    where
        F: FnOnce(&ImageRecord) -> Option<ImageRecord>,
    {
        let slot = self.records.iter_mut().find(|record| record.id == id)?;
        let replacement = next(slot)?;
        *slot = replacement.clone();
        Some(replacement)
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.selected_id = None;
    }

    /// Replaces the whole batch with one selected record.
    pub fn replace_with(&mut self, record: ImageRecord) {
        self.live_previews.insert(record.preview.id());
        self.selected_id = Some(record.id.clone());
        self.records = vec![record];
    }

    /// Forgets and returns every issued preview that neither a record nor
    /// one of `retained` still references.
    pub fn sweep_previews(&mut self, retained: impl IntoIterator<Item = u64>) -> Vec<u64> {
        let mut reachable: BTreeSet<u64> = retained.into_iter().collect();
        reachable.extend(self.records.iter().map(|record| record.preview.id()));
        let released: Vec<u64> = self
            .live_previews
            .iter()
            .copied()
            .filter(|id| !reachable.contains(id))
            .collect();
        for id in &released {
            self.live_previews.remove(id);
        }
        released
    }

    fn issue_preview(&mut self, file: &ImageFile) -> PreviewHandle {
        self.next_preview_id += 1;
        self.live_previews.insert(self.next_preview_id);
        PreviewHandle::new(self.next_preview_id, file)
    }

    fn unique_id(&self, base: &str) -> String {
        if self.get(base).is_none() {
            return base.to_string();
        }
        (2..)
            .map(|suffix| format!("{base}-{suffix}"))
            .find(|candidate| self.get(candidate).is_none())
            .unwrap_or_else(|| base.to_string())
    }
}
