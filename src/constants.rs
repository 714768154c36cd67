//! Global Constants
//!
//! Centralized constants for configuration and tuning.
//! Values here are defaults; most can be overridden through [`crate::config`].

/// Lesson document shape limits
pub mod document {
    /// Maximum characters in a lesson title
    pub const MAX_LESSON_TITLE: usize = 200;

    /// Maximum sections per lesson
    pub const MAX_SECTIONS: usize = 12;

    /// Maximum characters in a section title or subsection heading
    pub const MAX_SECTION_TITLE: usize = 120;

    /// Maximum content items directly under a section
    pub const MAX_SECTION_ITEMS: usize = 24;

    /// Maximum subsections per section
    pub const MAX_SUBSECTIONS: usize = 8;

    /// Maximum content items per subsection
    pub const MAX_SUBSECTION_ITEMS: usize = 16;

    /// Canonical key for a subsection title
    pub const HEADING_KEY: &str = "heading";

    /// Legacy title keys migrated to [`HEADING_KEY`], in priority order
    pub const LEGACY_HEADING_KEYS: &[&str] = &["title", "subsection_title", "name", "header"];
}

/// Repair engine constants
pub mod repair {
    /// Errors on one target above this count are treated as union-variant noise
    pub const NOISE_THRESHOLD: usize = 8;

    /// Summary message used when a noisy target has no identifiable kind
    pub const UNRECOGNIZED_CONTENT: &str = "payload does not match any supported content type";

    /// Maximum characters of a fragment echoed into the repair prompt
    pub const MAX_FRAGMENT_CHARS: usize = 4000;
}

/// Job tracker constants
pub mod tracker {
    /// Default rolling log window size
    pub const DEFAULT_LOG_WINDOW: usize = 50;

    /// Maximum characters kept per log line
    pub const MAX_LOG_LINE: usize = 500;

    /// Steps reserved for planning and stitching around per-section steps
    pub const FIXED_STEPS: u32 = 2;
}

/// Worker constants
pub mod worker {
    /// Default poll interval (milliseconds)
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;

    /// Default jobs claimed per poll cycle
    pub const DEFAULT_BATCH_SIZE: usize = 4;

    /// Default maximum concurrent jobs
    pub const DEFAULT_MAX_CONCURRENT_JOBS: usize = 4;

    /// Default soft timeout (seconds) - logs a warning
    pub const DEFAULT_SOFT_TIMEOUT_SECS: u64 = 600;

    /// Default hard timeout (seconds) - aborts the job
    pub const DEFAULT_HARD_TIMEOUT_SECS: u64 = 1200;

    /// Default job-level retry limit
    pub const DEFAULT_RETRY_LIMIT: u32 = 3;

    /// Agent name of the main lesson pipeline
    pub const LESSON_AGENT: &str = "lesson";
}

/// Quota constants
pub mod quota {
    /// Metric key for whole lessons
    pub const LESSONS_METRIC: &str = "lessons";

    /// Metric key for generated sections
    pub const SECTIONS_METRIC: &str = "sections";

    /// Default accounting period
    pub const DEFAULT_PERIOD: &str = "monthly";
}

/// LLM provider constants
pub mod llm {
    /// Default request timeout (seconds)
    pub const DEFAULT_TIMEOUT_SECS: u64 = 180;

    /// Default model name
    pub const DEFAULT_MODEL: &str = "gpt-4o-mini";

    /// Default sampling temperature
    pub const DEFAULT_TEMPERATURE: f32 = 0.4;

    /// Default completion token cap
    pub const DEFAULT_MAX_TOKENS: u32 = 8192;
}
