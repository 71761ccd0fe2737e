//! Last-known-good merge owned by the caller of the stateless decoder.

use crate::ipc::events::TipDocument;

/// Merges successive decodes so a populated field never reverts to empty.
///
/// Empty in an update means "not streamed yet" and keeps the previous value;
/// a non-empty update replaces it (refinement).
#[derive(Debug, Clone, Default)]
pub struct TipMerger {
    current: TipDocument,
}

impl TipMerger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold `update` in. Returns `true` if any field changed.
    pub fn merge(&mut self, mut update: TipDocument) -> bool {
        let mut changed = false;
        for (slot, incoming) in self.current.fields_mut().into_iter().zip(update.fields_mut()) {
            if incoming.is_empty() || *slot == *incoming {
                continue;
            }
            *slot = std::mem::take(incoming);
            changed = true;
        }
        changed
    }

    pub fn current(&self) -> &TipDocument {
        &self.current
    }

    pub fn into_inner(self) -> TipDocument {
        self.current
    }
}
