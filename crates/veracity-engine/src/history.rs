use veracity_contracts::records::HistoryEntry;

/// Completed analyses, most recent first. Outlives batch clears.
#[derive(Debug, Default, Clone)]
pub struct HistoryStore {
    entries: Vec<HistoryEntry>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&HistoryEntry> {
        self.entries.iter().find(|entry| entry.id == id)
    }

    /// Puts one batch's entries ahead of everything older, keeping their order.
    pub fn prepend_batch(&mut self, batch: Vec<HistoryEntry>) {
        if batch.is_empty() {
            return;
        }
        let mut merged = batch;
        merged.append(&mut self.entries);
        self.entries = merged;
    }

    pub fn preview_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.entries.iter().map(|entry| entry.preview.id())
    }
}
