//! Error types for transforms, lookups, scripts and scheduling.

use thiserror::Error;

/// Failure inside the script sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    /// The script did not parse.
    #[error("script failed to compile: {message}")]
    Compile {
        /// Parser message
        message: String,
    },

    /// The script raised an error while running.
    #[error("script failed at runtime: {message}")]
    Runtime {
        /// Engine message
        message: String,
    },

    /// The wall-clock budget ran out.
    #[error("script exceeded its {timeout_ms}ms time limit")]
    Timeout {
        /// Budget that was exceeded
        timeout_ms: u64,
    },

    /// The result nests deeper than allowed.
    #[error("script result nests deeper than {max_depth} levels")]
    DepthExceeded {
        /// Configured maximum
        max_depth: usize,
    },

    /// The result contains a value with no JSON form.
    #[error("script result contains a non-serializable {type_name}")]
    NotSerializable {
        /// Engine type name of the offending value
        type_name: String,
    },

    /// An operation, size or recursion limit was hit.
    #[error("script exceeded a resource limit: {message}")]
    ResourceLimit {
        /// Which limit
        message: String,
    },

    /// The sandbox itself failed, e.g. the worker thread panicked.
    #[error("script sandbox failure: {message}")]
    Internal {
        /// Details
        message: String,
    },
}

impl ScriptError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Compile { .. } => "SCRIPT_COMPILE_ERROR",
            Self::Runtime { .. } => "SCRIPT_RUNTIME_ERROR",
            Self::Timeout { .. } => "SCRIPT_TIMEOUT",
            Self::DepthExceeded { .. } => "SCRIPT_DEPTH_EXCEEDED",
            Self::NotSerializable { .. } => "SCRIPT_NOT_SERIALIZABLE",
            Self::ResourceLimit { .. } => "SCRIPT_RESOURCE_LIMIT",
            Self::Internal { .. } => "SCRIPT_INTERNAL_ERROR",
        }
    }
}

/// Failure of the lookup or transform stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// A script transform failed.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// A `FAIL` lookup met a code without mapping.
    #[error("unmapped code '{code}' for lookup '{lookup_type}' at '{source_field}'")]
    UnmappedCode {
        /// Lookup namespace
        lookup_type: String,
        /// Path that held the code
        source_field: String,
        /// The code itself
        code: String,
    },
}

impl TransformError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Script(e) => e.code(),
            Self::UnmappedCode { .. } => "LOOKUP_UNMAPPED_CODE",
        }
    }

    /// Whether the failure came from the lookup stage.
    pub const fn is_lookup(&self) -> bool {
        matches!(self, Self::UnmappedCode { .. })
    }
}

/// Failure computing or validating a delivery schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchedulingError {
    /// The scheduling script failed.
    #[error(transparent)]
    Script(#[from] ScriptError),

    /// The script returned something of the wrong shape.
    #[error("invalid scheduling result: {reason}")]
    InvalidResult {
        /// What was wrong
        reason: String,
    },

    /// The computed time is not strictly in the future.
    #[error("scheduled time {at_ms} is not in the future")]
    NotInFuture {
        /// Computed epoch ms
        at_ms: i64,
    },

    /// The computed time is more than a year ahead.
    #[error("scheduled time {at_ms} is more than one year ahead")]
    TooFarAhead {
        /// Computed epoch ms
        at_ms: i64,
    },

    /// The recurrence interval is below the minimum.
    #[error("recurrence interval {interval_ms}ms is below the {min_ms}ms minimum")]
    IntervalTooShort {
        /// Interval returned
        interval_ms: i64,
        /// Minimum allowed
        min_ms: i64,
    },

    /// Neither or both end conditions were given, or one is out of range.
    #[error("invalid recurrence end condition: {reason}")]
    InvalidEndCondition {
        /// What was wrong
        reason: String,
    },
}

impl SchedulingError {
    /// Stable error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Script(e) => e.code(),
            Self::InvalidResult { .. } => "SCHEDULING_INVALID_RESULT",
            Self::NotInFuture { .. } => "SCHEDULING_NOT_IN_FUTURE",
            Self::TooFarAhead { .. } => "SCHEDULING_TOO_FAR_AHEAD",
            Self::IntervalTooShort { .. } => "SCHEDULING_INTERVAL_TOO_SHORT",
            Self::InvalidEndCondition { .. } => "SCHEDULING_INVALID_END_CONDITION",
        }
    }
}
