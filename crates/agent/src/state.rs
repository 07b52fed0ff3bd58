use builder_core::model::FileMap;
use serde::{Deserialize, Serialize};

/// Mutable accumulator for one job execution.
///
/// `files` only grows (last write wins per path). `summary` is written once;
/// a non-empty summary is the only completion signal of the agent loop.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    files: FileMap,
    summary: Option<String>,
}

impl RunState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn files(&self) -> &FileMap {
        &self.files
    }

    /// Completion summary, `None` until the agent emitted the marker.
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Merge written files into the state. Existing paths are overwritten,
    /// nothing is removed.
    pub fn merge_files(&mut self, files: FileMap) {
        self.files.extend(files);
    }

    /// Record the completion summary. Returns `false` (and keeps the previous
    /// value) when a summary is already set or `text` is empty.
    pub fn record_summary(&mut self, text: &str) -> bool {
        if self.is_complete() || text.is_empty() {
            return false;
        }
        self.summary = Some(text.to_string());
        true
    }

    pub fn is_complete(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.is_empty())
    }

    /// Complete and produced at least one file.
    pub fn is_successful(&self) -> bool {
        self.is_complete() && !self.files.is_empty()
    }

    pub fn into_parts(self) -> (FileMap, String) {
        (self.files, self.summary.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(pairs: &[(&str, &str)]) -> FileMap {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn merge_is_monotonic_and_last_write_wins() {
        let mut state = RunState::new();
        state.merge_files(files(&[("a.ts", "1"), ("b.ts", "1")]));
        let before = state.files().clone();

        state.merge_files(files(&[("b.ts", "2"), ("c.ts", "1")]));

        for path in before.keys() {
            assert!(state.files().contains_key(path));
        }
        assert_eq!(state.files()["a.ts"], "1");
        assert_eq!(state.files()["b.ts"], "2");
        assert_eq!(state.files().len(), 3);
    }

    #[test]
    fn summary_is_write_once() {
        let mut state = RunState::new();
        assert!(!state.is_complete());
        assert!(!state.record_summary(""));
        assert!(state.record_summary("<task_summary>first</task_summary>"));
        assert!(!state.record_summary("<task_summary>second</task_summary>"));
        assert_eq!(state.summary(), Some("<task_summary>first</task_summary>"));
    }

    #[test]
    fn success_needs_summary_and_files() {
        let mut state = RunState::new();
        state.merge_files(files(&[("a.ts", "x")]));
        assert!(!state.is_successful());

        let mut state = RunState::new();
        state.record_summary("<task_summary>done</task_summary>");
        assert!(state.is_complete());
        assert!(!state.is_successful());

        state.merge_files(files(&[("a.ts", "x")]));
        assert!(state.is_successful());
    }
}
