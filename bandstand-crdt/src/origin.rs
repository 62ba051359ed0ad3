//! Origin markers for applied updates.

use std::fmt;

/// Tag attached to a transaction that applies remote bytes.
///
/// Every provider applies network updates under its own origin and skips
/// forwarding any update observed with that same origin, which breaks
/// echo loops between three or more peers.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Origin {
    label: String,
    inner: yrs::Origin,
}

impl Origin {
    /// Creates an origin from a label. Equal labels yield equal origins.
    pub fn new(label: impl Into<String>) -> Self {
        let label = label.into();
        let inner = yrs::Origin::from(label.as_str());
        Self { label, inner }
    }

    /// Human-readable label (used in logs).
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether a transaction origin reported by the engine is this origin.
    pub(crate) fn matches(&self, raw: Option<&yrs::Origin>) -> bool {
        raw == Some(&self.inner)
    }

    pub(crate) fn as_yrs(&self) -> &yrs::Origin {
        &self.inner
    }
}

impl fmt::Debug for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Origin").field(&self.label).finish()
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}
