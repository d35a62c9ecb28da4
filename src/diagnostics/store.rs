//! Published diagnostics per document
//!
//! An entry is always replaced wholesale. A document without diagnostics
//! has no entry at all, never an empty list.

use lsp_types::Diagnostic;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::trace;
use url::Url;

/// Change notification for the editor
#[derive(Debug, Clone, PartialEq)]
pub enum DiagnosticUpdate {
    Replace(Url, Vec<Diagnostic>),
    Clear(Url),
}

pub struct DiagnosticStore {
    entries: Mutex<HashMap<Url, Vec<Diagnostic>>>,
    updates: mpsc::UnboundedSender<DiagnosticUpdate>,
}

impl DiagnosticStore {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DiagnosticUpdate>) {
        let (updates, receiver) = mpsc::unbounded_channel();
        (
            Self {
                entries: Mutex::new(HashMap::new()),
                updates,
            },
            receiver,
        )
    }

    /// Replace the diagnostics of `uri`; an empty list clears the entry
    ///
    /// Returns whether the stored value changed.
    pub fn replace(&self, uri: Url, diagnostics: Vec<Diagnostic>) -> bool {
        // Intentional .unwrap() - poisoned mutex indicates serious bug
        let mut entries = self.entries.lock().unwrap();
        self.replace_locked(&mut entries, uri, diagnostics)
    }

    /// Remove the entry for `uri`; returns whether one existed
    pub fn clear(&self, uri: &Url) -> bool {
        let mut entries = self.entries.lock().unwrap();
        self.clear_locked(&mut entries, uri)
    }

    /// Install a complete workspace result
    ///
    /// Every stored file absent from `result` is cleared, then every file in
    /// it is replaced in URI order.
    pub fn replace_all(&self, result: BTreeMap<Url, Vec<Diagnostic>>) {
        let mut entries = self.entries.lock().unwrap();

        let stale: Vec<Url> = entries
            .keys()
            .filter(|uri| !result.contains_key(*uri))
            .cloned()
            .collect();
        for uri in &stale {
            self.clear_locked(&mut entries, uri);
        }

        for (uri, diagnostics) in result {
            self.replace_locked(&mut entries, uri, diagnostics);
        }
    }

    pub fn get(&self, uri: &Url) -> Option<Vec<Diagnostic>> {
        self.entries.lock().unwrap().get(uri).cloned()
    }

    pub fn contains(&self, uri: &Url) -> bool {
        self.entries.lock().unwrap().contains_key(uri)
    }

    pub fn snapshot(&self) -> HashMap<Url, Vec<Diagnostic>> {
        self.entries.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn replace_locked(
        &self,
        entries: &mut HashMap<Url, Vec<Diagnostic>>,
        uri: Url,
        diagnostics: Vec<Diagnostic>,
    ) -> bool {
        if diagnostics.is_empty() {
            return self.clear_locked(entries, &uri);
        }
        if entries.get(&uri) == Some(&diagnostics) {
            return false;
        }

        trace!("Diagnostics: {} -> {} entries", uri, diagnostics.len());
        entries.insert(uri.clone(), diagnostics.clone());
        let _ = self.updates.send(DiagnosticUpdate::Replace(uri, diagnostics));
        true
    }

    fn clear_locked(&self, entries: &mut HashMap<Url, Vec<Diagnostic>>, uri: &Url) -> bool {
        if entries.remove(uri).is_none() {
            return false;
        }

        trace!("Diagnostics: {} cleared", uri);
        let _ = self.updates.send(DiagnosticUpdate::Clear(uri.clone()));
        true
    }
}
