use std::fmt;

use serde::{Deserialize, Serialize};

/// Repository kind. Appears in URL paths pluralized ("models"), in the
/// database singular ("model").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepoType {
    Model,
    Dataset,
    Space,
}

impl RepoType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Model => "model",
            Self::Dataset => "dataset",
            Self::Space => "space",
        }
    }

    /// The plural path segment HuggingFace clients use ("models", ...).
    #[must_use]
    pub fn plural(self) -> &'static str {
        match self {
            Self::Model => "models",
            Self::Dataset => "datasets",
            Self::Space => "spaces",
        }
    }

    #[must_use]
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "model" => Some(Self::Model),
            "dataset" => Some(Self::Dataset),
            "space" => Some(Self::Space),
            _ => None,
        }
    }

    #[must_use]
    pub fn from_plural(s: &str) -> Option<Self> {
        match s {
            "models" => Some(Self::Model),
            "datasets" => Some(Self::Dataset),
            "spaces" => Some(Self::Space),
            _ => None,
        }
    }
}

impl fmt::Display for RepoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_plural_and_singular() {
        for t in [RepoType::Model, RepoType::Dataset, RepoType::Space] {
            assert_eq!(RepoType::from_str(t.as_str()), Some(t));
            assert_eq!(RepoType::from_plural(t.plural()), Some(t));
        }
        assert_eq!(RepoType::from_plural("model"), None);
        assert_eq!(RepoType::from_str("models"), None);
    }
}
