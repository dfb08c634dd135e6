//! Error types for the speed test application.
//!
//! Per-chunk transport failures are recovered inside the workers and never
//! reach the caller. What does reach the caller is a [`SpeedTestError`]:
//! one terminal outcome per phase, with a kind that keeps "measured a value
//! close to zero" apart from "failed to measure".

use std::error::Error;
use std::fmt;

use crate::speedtest::progress::TestPhase;

/// Exit codes for the application.
pub mod exit_codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Network error (connection failed, timeout, etc.).
    pub const NETWORK_ERROR: i32 = 1;
    /// API error (server returned an error response).
    pub const API_ERROR: i32 = 2;
    /// Configuration error (invalid arguments, invalid settings file).
    pub const CONFIG_ERROR: i32 = 3;
    /// A phase ran but produced nothing that could be measured.
    pub const MEASUREMENT_FAILED: i32 = 4;
    /// The user aborted the run.
    pub const ABORTED: i32 = 130;
    /// Unknown/unexpected error.
    pub const UNKNOWN_ERROR: i32 = 99;
}

/// Categories of errors that can occur during speed testing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network connectivity issues.
    Network,
    /// DNS resolution failures.
    Dns,
    /// Connection timeout.
    Timeout,
    /// TLS/SSL handshake failures.
    Tls,
    /// Server returned a non-success response.
    Api,
    /// Invalid configuration or arguments.
    Config,
    /// A transfer phase finished without a single post-grace byte.
    NoData,
    /// Aggregation was asked to reduce an empty sample set.
    InsufficientSamples,
    /// Caller-initiated cancellation.
    Aborted,
    /// Unknown or unexpected errors.
    Unknown,
}

impl ErrorKind {
    /// Get the exit code for this error kind.
    pub fn exit_code(&self) -> i32 {
        match self {
            ErrorKind::Network => exit_codes::NETWORK_ERROR,
            ErrorKind::Dns => exit_codes::NETWORK_ERROR,
            ErrorKind::Timeout => exit_codes::NETWORK_ERROR,
            ErrorKind::Tls => exit_codes::NETWORK_ERROR,
            ErrorKind::Api => exit_codes::API_ERROR,
            ErrorKind::Config => exit_codes::CONFIG_ERROR,
            ErrorKind::NoData => exit_codes::MEASUREMENT_FAILED,
            ErrorKind::InsufficientSamples => exit_codes::MEASUREMENT_FAILED,
            ErrorKind::Aborted => exit_codes::ABORTED,
            ErrorKind::Unknown => exit_codes::UNKNOWN_ERROR,
        }
    }

    /// Get a user-friendly description of this error kind.
    pub fn description(&self) -> &'static str {
        match self {
            ErrorKind::Network => "Network error",
            ErrorKind::Dns => "DNS resolution error",
            ErrorKind::Timeout => "Connection timeout",
            ErrorKind::Tls => "TLS/SSL error",
            ErrorKind::Api => "Server error",
            ErrorKind::Config => "Configuration error",
            ErrorKind::NoData => "No data transferred",
            ErrorKind::InsufficientSamples => "Insufficient samples",
            ErrorKind::Aborted => "Aborted",
            ErrorKind::Unknown => "Unknown error",
        }
    }

    /// Stable lowercase identifier used in JSON output.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Network => "network",
            ErrorKind::Dns => "dns",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Tls => "tls",
            ErrorKind::Api => "api",
            ErrorKind::Config => "config",
            ErrorKind::NoData => "no_data",
            ErrorKind::InsufficientSamples => "insufficient_samples",
            ErrorKind::Aborted => "aborted",
            ErrorKind::Unknown => "unknown",
        }
    }
}

/// A user-friendly error type for speed test operations.
#[derive(Debug)]
pub struct SpeedTestError {
    /// The kind of error.
    pub kind: ErrorKind,
    /// The phase that failed, when the error is tied to one.
    pub phase: Option<TestPhase>,
    /// User-friendly error message.
    pub message: String,
    /// Optional suggestion for how to resolve the error.
    pub suggestion: Option<String>,
    /// The underlying error, if any.
    pub source: Option<Box<dyn Error + Send + Sync>>,
}

impl SpeedTestError {
    /// Create a new SpeedTestError.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            phase: None,
            message: message.into(),
            suggestion: None,
            source: None,
        }
    }

    /// Add a suggestion for how to resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Add the underlying error source.
    pub fn with_source(
        mut self,
        source: impl Error + Send + Sync + 'static,
    ) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    /// Attach the phase this error terminated. An already recorded phase
    /// wins so the innermost caller decides.
    pub fn in_phase(mut self, phase: TestPhase) -> Self {
        self.phase.get_or_insert(phase);
        self
    }

    /// Get the exit code for this error.
    pub fn exit_code(&self) -> i32 {
        self.kind.exit_code()
    }

    /// Returns true if the run was cancelled by the caller.
    pub fn is_aborted(&self) -> bool {
        self.kind == ErrorKind::Aborted
    }

    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Network, message)
            .with_suggestion("Check your internet connection and try again.")
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Config, message)
    }

    /// A transfer phase recorded zero bytes after the grace period.
    pub fn no_data(phase: TestPhase) -> Self {
        Self::new(
            ErrorKind::NoData,
            format!("{} phase finished without transferring any data", phase),
        )
        .in_phase(phase)
        .with_suggestion(
            "The speed server may be unreachable or rejecting requests.",
        )
    }

    /// Aggregation was invoked without post-grace speed samples.
    pub fn insufficient_samples() -> Self {
        Self::new(
            ErrorKind::InsufficientSamples,
            "no speed samples were collected after the grace period",
        )
    }

    /// The run was cancelled.
    pub fn aborted() -> Self {
        Self::new(ErrorKind::Aborted, "speed test aborted")
    }
}

impl fmt::Display for SpeedTestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.description(), self.message)?;

        if let Some(ref suggestion) = self.suggestion {
            write!(f, "\n  Suggestion: {}", suggestion)?;
        }

        Ok(())
    }
}

impl Error for SpeedTestError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as &(dyn Error + 'static))
    }
}

/// Classify an error into an ErrorKind based on its message.
pub fn classify_error(error: &dyn Error) -> ErrorKind {
    let error_str = error.to_string().to_lowercase();

    if error_str.contains("dns")
        || error_str.contains("resolve")
        || error_str.contains("no such host")
    {
        return ErrorKind::Dns;
    }

    if error_str.contains("timeout")
        || error_str.contains("timed out")
        || error_str.contains("deadline")
    {
        return ErrorKind::Timeout;
    }

    if error_str.contains("tls")
        || error_str.contains("ssl")
        || error_str.contains("certificate")
        || error_str.contains("handshake")
    {
        return ErrorKind::Tls;
    }

    if error_str.contains("connection refused")
        || error_str.contains("connection reset")
        || error_str.contains("network unreachable")
        || error_str.contains("host unreachable")
        || error_str.contains("no route")
        || error_str.contains("broken pipe")
        || error_str.contains("error sending request")
    {
        return ErrorKind::Network;
    }

    if error_str.contains("status: 4")
        || error_str.contains("status: 5")
        || error_str.contains("http status")
        || error_str.contains("server error")
    {
        return ErrorKind::Api;
    }

    ErrorKind::Unknown
}

/// Format an error for user display.
pub fn format_error_for_display(error: &SpeedTestError) -> String {
    let mut output = match error.phase {
        Some(phase) => format!("Error ({} phase): {}", phase, error.message),
        None => format!("Error: {}", error.message),
    };

    if let Some(ref suggestion) = error.suggestion {
        output.push_str(&format!("\n\nSuggestion: {}", suggestion));
    }

    output
}
