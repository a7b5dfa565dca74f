//! Resumption selectors.

use serde::{Deserialize, Serialize};

/// An opaque resumption token identifying a known-good data snapshot.
///
/// A selector is either empty (no transfer has completed yet) or carries the
/// `state` string and `version` reported by the last `payload-transferred`
/// event. An empty selector cannot be used as a basis for a data source.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Selector {
    version: u64,
    state: Option<String>,
}

impl Selector {
    /// Creates the empty selector.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a selector for a completed transfer.
    pub fn new(version: u64, state: impl Into<String>) -> Self {
        Self {
            version,
            state: Some(state.into()),
        }
    }

    /// Returns true if no transfer has completed yet.
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
    }

    /// The version of the data associated with this selector.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// The state identifier, or `None` if the selector is empty.
    pub fn state(&self) -> Option<&str> {
        self.state.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_selector() {
        let selector = Selector::empty();
        assert!(selector.is_empty());
        assert_eq!(selector.version(), 0);
        assert_eq!(selector.state(), None);
        assert_eq!(selector, Selector::default());
    }

    #[test]
    fn made_selector_is_never_empty() {
        let selector = Selector::new(52, "(p:p1:52)");
        assert!(!selector.is_empty());
        assert_eq!(selector.version(), 52);
        assert_eq!(selector.state(), Some("(p:p1:52)"));

        // An empty state string is still a completed transfer.
        assert!(!Selector::new(0, "").is_empty());
    }
}
