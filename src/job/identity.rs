use std::fmt;

use serde::{Deserialize, Serialize};

/// A unique identifier for a job: the name of the model being trained and,
/// optionally, the version of that model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobIdentity {
    /// The name of the model, as known by the coordinator
    pub model_name: String,
    /// The version of the model. `None` matches any version.
    pub version: Option<String>,
}

impl JobIdentity {
    pub fn new<S: Into<String>>(model_name: S, version: Option<String>) -> Self {
        Self {
            model_name: model_name.into(),
            version,
        }
    }

    /// Check whether this identity designates the same job as the given model name and
    /// version.
    ///
    /// Model names must always be equal. Versions are only compared when both are
    /// present: a missing (or empty) version on either side acts as a wildcard.
    pub fn matches(&self, model_name: &str, version: Option<&str>) -> bool {
        let own = self.version.as_deref().filter(|v| !v.is_empty());
        let other = version.filter(|v| !v.is_empty());
        match (own, other) {
            (Some(own), Some(other)) => self.model_name == model_name && own == other,
            _ => self.model_name == model_name,
        }
    }

    /// Same as [`JobIdentity::matches`], taking another identity.
    pub fn matches_identity(&self, other: &JobIdentity) -> bool {
        self.matches(&other.model_name, other.version.as_deref())
    }
}

impl fmt::Display for JobIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.version {
            Some(ref version) => write!(f, "{}@{}", self.model_name, version),
            None => write!(f, "{}", self.model_name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(name: &str, version: Option<&str>) -> JobIdentity {
        JobIdentity::new(name, version.map(String::from))
    }

    #[test]
    fn test_versioned_matches_unversioned() {
        assert!(id("mnist", Some("1")).matches_identity(&id("mnist", None)));
        assert!(id("mnist", None).matches_identity(&id("mnist", Some("1"))));
    }

    #[test]
    fn test_different_versions_do_not_match() {
        assert!(!id("mnist", Some("1")).matches_identity(&id("mnist", Some("2"))));
        assert!(id("mnist", Some("2")).matches("mnist", Some("2")));
    }

    #[test]
    fn test_names_must_match() {
        assert!(!id("mnist", None).matches("cifar", None));
        assert!(!id("mnist", Some("1")).matches("cifar", Some("1")));
    }

    #[test]
    fn test_empty_version_is_a_wildcard() {
        assert!(id("mnist", Some("")).matches("mnist", Some("3")));
        assert!(id("mnist", Some("3")).matches("mnist", Some("")));
    }

    #[test]
    fn test_display() {
        assert_eq!(id("mnist", Some("1.0")).to_string(), "mnist@1.0");
        assert_eq!(id("mnist", None).to_string(), "mnist");
    }
}
