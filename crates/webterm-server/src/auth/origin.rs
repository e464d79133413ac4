//! Origin allowlist checked at WebSocket upgrade time.

use std::collections::HashSet;

/// Set of browser origins allowed to open a terminal connection.
#[derive(Debug, Clone, Default)]
pub struct OriginPolicy {
    allowed: HashSet<String>,
}

impl OriginPolicy {
    pub fn new<I, S>(origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            allowed: origins
                .into_iter()
                .map(|o| o.into().trim_end_matches('/').to_string())
                .collect(),
        }
    }

    /// A missing or empty origin is a same-origin or non-browser client and
    /// is allowed; anything else must match exactly.
    pub fn is_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(o) if o.is_empty() => true,
            Some(o) => self.allowed.contains(o),
        }
    }
}
