pub mod error;
pub mod utils;

pub use error::{AgentError, ErrorCategory, ErrorClassifier, ForgeError, LlmError, Result, ResultExt};
pub use utils::{
    json_string, json_string_array, json_string_or, json_type_name, log_filter_warn,
    truncate_chars,
};

// =============================================================================
// Domain Newtypes
// =============================================================================

use serde::{Deserialize, Serialize};
use std::fmt;

/// Type-safe wrapper for job IDs
///
/// Prevents accidental mixing of job IDs with user IDs and agent names.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_id_generate_is_unique() {
        assert_ne!(JobId::generate(), JobId::generate());
    }

    #[test]
    fn test_job_id_serde_transparent() {
        let id = JobId::new("job-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"job-1\"");
    }
}
