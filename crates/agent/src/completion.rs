/// Marker the coding agent emits in its final message.
pub const TASK_SUMMARY_MARKER: &str = "<task_summary>";

/// Completion-signal detection over free-text model output.
///
/// The loop only asks this type whether a turn finished the task; swapping the
/// marker convention does not touch the loop.
#[derive(Debug, Clone)]
pub struct CompletionSignal {
    marker: String,
}

impl Default for CompletionSignal {
    fn default() -> Self {
        Self::new(TASK_SUMMARY_MARKER)
    }
}

impl CompletionSignal {
    pub fn new(marker: impl Into<String>) -> Self {
        Self {
            marker: marker.into(),
        }
    }

    pub fn marker(&self) -> &str {
        &self.marker
    }

    /// Text that closes the summary: `</tag>` for a `<tag>` marker, the
    /// marker itself otherwise.
    pub fn closing_marker(&self) -> String {
        match self
            .marker
            .strip_prefix('<')
            .and_then(|m| m.strip_suffix('>'))
        {
            Some(tag) if !tag.is_empty() && !tag.starts_with('/') => format!("</{tag}>"),
            _ => self.marker.clone(),
        }
    }

    /// Returns the full message text when it carries the marker. The whole
    /// marker-bearing text becomes the task summary, not just the tagged part.
    pub fn detect<'a>(&self, text: &'a str) -> Option<&'a str> {
        if self.marker.is_empty() || !text.contains(&self.marker) {
            return None;
        }
        Some(text)
    }
}
