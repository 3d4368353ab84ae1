// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error taxonomy and user-facing error formatting for modelfetch.
//!
//! Library code propagates errors through `anyhow::Result`. Failures that callers
//! need to reason about (retry, surface, abort) are raised as [`HubError`] and
//! recovered with `err.downcast_ref::<HubError>()`.

use std::fmt;

use crate::utils::format_bytes;

/// Errors raised by the registry client, selectors, estimator and pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum HubError {
    /// 401, or a gated repository with no token configured.
    AuthenticationRequired(String),
    /// 404 for a repository, revision or file.
    NotFound(String),
    /// Any other non-2xx status.
    Http { status: u16, url: String },
    /// Connection refused, reset or dropped mid-body.
    Network(String),
    /// Request or chunk read exceeded its deadline.
    Timeout(String),
    /// The body ended before the declared size was reached.
    IncompleteTransfer { path: String, expected: u64, actual: u64 },
    /// Downloaded content does not hash to the LFS object id.
    ChecksumMismatch { path: String, expected: String, actual: String },
    /// Not enough free space at the destination volume.
    InsufficientSpace { required: u64, available: u64 },
    /// `parameters × bits_per_parameter` does not fit in 64 bits.
    Overflow { parameters: u64, bits_per_parameter: f64 },
    /// No selector matched any file in the listing.
    UnsupportedFormat(String),
    /// A caller-named file is not in the listing.
    FileNotFound(String),
    /// Repository id could not be parsed.
    InvalidRepository(String),
    /// A listed file path would land outside the destination directory.
    InvalidPath(String),
    /// Cooperative cancellation observed.
    Cancelled,
}

impl HubError {
    /// Whether a retry has a chance of succeeding.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::IncompleteTransfer { .. } => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Short actionable hint shown under the error, if there is one.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::AuthenticationRequired(_) => {
                Some("Set a token: modelfetch login --token <TOKEN> (or export HF_TOKEN)".to_string())
            }
            Self::NotFound(_) | Self::FileNotFound(_) => {
                Some("Check the repository id, revision and file name".to_string())
            }
            Self::Network(_) | Self::Timeout(_) | Self::IncompleteTransfer { .. } => {
                Some("Check network connection and retry; partial files are resumed".to_string())
            }
            Self::Http { status, .. } if *status == 429 => {
                Some("The registry is rate limiting requests, wait a minute and retry".to_string())
            }
            Self::InsufficientSpace { required, available } => Some(format!(
                "Free up disk space: need {}, have {}",
                format_bytes(*required),
                format_bytes(*available)
            )),
            Self::UnsupportedFormat(_) => {
                Some("Pick another backend with --backend gguf|coreml|safetensors".to_string())
            }
            Self::ChecksumMismatch { .. } => {
                Some("Delete the file and download it again".to_string())
            }
            _ => None,
        }
    }

    /// Render the error as a multi-line message with causes and fixes.
    pub fn user_message(&self) -> String {
        let mut builder = ErrorBuilder::new(self.to_string());
        match self {
            Self::AuthenticationRequired(_) => {
                builder = builder
                    .cause("No token configured")
                    .cause("The repository is gated or private");
            }
            Self::Network(_) | Self::Timeout(_) => {
                builder = builder
                    .cause("Connection dropped or the registry is unreachable")
                    .cause("A proxy or firewall blocks the request");
            }
            _ => {}
        }
        if let Some(fix) = self.remediation() {
            builder = builder.fix(fix);
        }
        builder.build()
    }
}

impl fmt::Display for HubError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AuthenticationRequired(msg) => write!(f, "Authentication required: {}", msg),
            Self::NotFound(what) => write!(f, "Not found: {}", what),
            Self::Http { status, url } => write!(f, "HTTP {} from {}", status, url),
            Self::Network(msg) => write!(f, "Network error: {}", msg),
            Self::Timeout(msg) => write!(f, "Request timed out: {}", msg),
            Self::IncompleteTransfer { path, expected, actual } => write!(
                f,
                "Incomplete transfer of {}: expected {} bytes, got {}",
                path, expected, actual
            ),
            Self::ChecksumMismatch { path, expected, actual } => write!(
                f,
                "Checksum mismatch for {}: expected {}, got {}",
                path, expected, actual
            ),
            Self::InsufficientSpace { required, available } => write!(
                f,
                "Insufficient disk space: need {}, have {}",
                format_bytes(*required),
                format_bytes(*available)
            ),
            Self::Overflow { parameters, bits_per_parameter } => write!(
                f,
                "Memory estimate overflow: {} parameters x {} bits exceeds 64-bit range",
                parameters, bits_per_parameter
            ),
            Self::UnsupportedFormat(msg) => write!(f, "Unsupported format: {}", msg),
            Self::FileNotFound(name) => write!(f, "File not found in repository: {}", name),
            Self::InvalidRepository(id) => {
                write!(f, "Invalid repository id '{}', expected namespace/name", id)
            }
            Self::InvalidPath(path) => {
                write!(f, "Refusing unsafe file path '{}' from the registry listing", path)
            }
            Self::Cancelled => write!(f, "Download cancelled"),
        }
    }
}

impl std::error::Error for HubError {}

/// Find a [`HubError`] anywhere in an error chain.
pub fn hub_error(err: &anyhow::Error) -> Option<&HubError> {
    err.chain().find_map(|e| e.downcast_ref::<HubError>())
}

/// Formats an error message with title, causes and fixes.
///
/// # Example
///
/// ```
/// use modelfetch::error::format_error;
///
/// let error = format_error(
///     "Failed to reach the registry",
///     &["No network connection", "Wrong endpoint in config"],
///     &["Check network connection", "Verify endpoint: modelfetch config"],
/// );
/// println!("{}", error);
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Builder for constructing formatted error messages.
#[derive(Debug, Clone)]
pub struct ErrorBuilder {
    title: String,
    causes: Vec<String>,
    fixes: Vec<String>,
}

impl ErrorBuilder {
    /// Create a new error builder with the given title.
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            causes: Vec::new(),
            fixes: Vec::new(),
        }
    }

    /// Add a possible cause.
    pub fn cause(mut self, cause: impl Into<String>) -> Self {
        self.causes.push(cause.into());
        self
    }

    /// Add a suggested fix.
    pub fn fix(mut self, fix: impl Into<String>) -> Self {
        self.fixes.push(fix.into());
        self
    }

    /// Build the formatted error message.
    pub fn build(self) -> String {
        let causes: Vec<&str> = self.causes.iter().map(|s| s.as_str()).collect();
        let fixes: Vec<&str> = self.fixes.iter().map(|s| s.as_str()).collect();
        format_error(&self.title, &causes, &fixes)
    }
}

impl fmt::Display for ErrorBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.clone().build())
    }
}
