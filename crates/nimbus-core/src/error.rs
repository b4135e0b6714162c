// Copyright (C) 2025 Nimbus Cloud Contributors
// SPDX-License-Identifier: EUPL-1.2
//! Error types for nimbus-core.
//!
//! Provides a unified error type that maps to call-layer error responses.

use std::fmt;

use crate::job::{JobState, ProviderKind};

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while orchestrating jobs.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum CoreError {
    /// Job was not found in the registry.
    JobNotFound {
        /// The job ID that was not found.
        job_id: String,
    },

    /// No provider advertises support for the requested reservation.
    UnsupportedReservation {
        /// The machine class that was requested.
        reservation: String,
    },

    /// The submitting principal is over an accounting limit.
    QuotaExceeded {
        /// Owner or project that hit the limit.
        wallet: String,
    },

    /// The backend rejected the request.
    BackendRejected {
        /// Backend that rejected.
        provider: ProviderKind,
        /// Backend-supplied reason.
        reason: String,
    },

    /// The assigned provider does not support the requested operation.
    CapabilityNotSupported {
        /// Backend the operation was requested on.
        provider: ProviderKind,
        /// The unsupported operation.
        operation: &'static str,
    },

    /// Job is in an invalid state for the requested operation.
    InvalidJobState {
        /// The job ID.
        job_id: String,
        /// The expected state.
        expected: JobState,
        /// The actual state.
        actual: JobState,
    },

    /// A `(provider, provider_job_id)` pair resolved to two different jobs,
    /// or a provider job ID was assigned twice. Indicates a correctness bug
    /// upstream; the affected job is aborted.
    RegistryCorruption {
        /// Backend the conflicting identifier belongs to.
        provider: ProviderKind,
        /// The conflicting backend-native identifier.
        provider_job_id: String,
        /// Details of the conflict.
        details: String,
    },

    /// Input validation failed.
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::JobNotFound { .. } => "JOB_NOT_FOUND",
            Self::UnsupportedReservation { .. } => "UNSUPPORTED_RESERVATION",
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::BackendRejected { .. } => "BACKEND_REJECTED",
            Self::CapabilityNotSupported { .. } => "CAPABILITY_NOT_SUPPORTED",
            Self::InvalidJobState { .. } => "INVALID_JOB_STATE",
            Self::RegistryCorruption { .. } => "REGISTRY_CORRUPTION",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
        }
    }
}

impl fmt::Display for CoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::JobNotFound { job_id } => {
                write!(f, "Job '{}' not found", job_id)
            }
            Self::UnsupportedReservation { reservation } => {
                write!(f, "No provider supports reservation '{}'", reservation)
            }
            Self::QuotaExceeded { wallet } => {
                write!(f, "Compute quota exceeded for '{}'", wallet)
            }
            Self::BackendRejected { provider, reason } => {
                write!(f, "Backend '{}' rejected the request: {}", provider, reason)
            }
            Self::CapabilityNotSupported {
                provider,
                operation,
            } => {
                write!(f, "Provider '{}' does not support '{}'", provider, operation)
            }
            Self::InvalidJobState {
                job_id,
                expected,
                actual,
            } => {
                write!(
                    f,
                    "Job '{}' is in invalid state: expected '{}', got '{}'",
                    job_id, expected, actual
                )
            }
            Self::RegistryCorruption {
                provider,
                provider_job_id,
                details,
            } => {
                write!(
                    f,
                    "Registry corruption for ({}, {}): {}",
                    provider, provider_job_id, details
                )
            }
            Self::ValidationError { field, message } => {
                write!(f, "Validation error for '{}': {}", field, message)
            }
            Self::DatabaseError { operation, details } => {
                write!(f, "Database error during '{}': {}", operation, details)
            }
        }
    }
}

impl std::error::Error for CoreError {}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}
