//! Error taxonomy shared by the waveform compiler and the streaming backend.
//!
//! Every failure surfaced to a caller of the compiler or of the execution engine is a [`StimError`].
//! Callers that need to branch on the cause (e.g. to decide whether the device session should be
//! reopened) use [`StimError::kind`] rather than matching on message text.
//!
//! | kind | raised by | touches the device |
//! |---|---|---|
//! | [`FailureKind::Validation`] | parameter checks | never |
//! | [`FailureKind::MemoryLimitExceeded`] | size check before transfer | never |
//! | [`FailureKind::Transfer`] | memory write / read back | yes |
//! | [`FailureKind::VerificationMismatch`] | read back comparison | yes |
//! | [`FailureKind::Device`] | command / cursor poll | yes |
//! | [`FailureKind::CalibrationMissing`] | milliwatt output without calibration | never |
//! | [`FailureKind::Timeout`] | stalled cursor (opt-in) | yes |
//! | [`FailureKind::Config`] | run file parsing | never |

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, StimError>;

/// Machine-distinguishable failure category of a [`StimError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Validation,
    MemoryLimitExceeded,
    Transfer,
    VerificationMismatch,
    Device,
    CalibrationMissing,
    Timeout,
    Config,
}

#[derive(Debug, Error)]
pub enum StimError {
    #[error("Invalid stimulus parameters: {0}")]
    Validation(String),

    #[error("Waveform is too big. Limit(bytes) = {limit}, waveform(bytes) = {requested}")]
    MemoryLimitExceeded { limit: usize, requested: usize },

    #[error("Failed to {operation}: device error {code} ({text})")]
    Transfer {
        operation: &'static str,
        code: i32,
        text: String,
    },

    #[error("Memory does not match written data at sample {index}: wrote {expected}, read {found}")]
    VerificationMismatch { index: usize, expected: i16, found: i16 },

    #[error("Device rejected {context}: error {code} ({text})")]
    Device {
        context: String,
        code: i32,
        text: String,
    },

    #[error("Power conversion requested but no calibration is configured")]
    CalibrationMissing,

    #[error("Device cursor stalled during {stage} for {waited_ms} ms")]
    Timeout { stage: &'static str, waited_ms: u128 },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl StimError {
    pub fn kind(&self) -> FailureKind {
        match self {
            StimError::Validation(_) => FailureKind::Validation,
            StimError::MemoryLimitExceeded { .. } => FailureKind::MemoryLimitExceeded,
            StimError::Transfer { .. } => FailureKind::Transfer,
            StimError::VerificationMismatch { .. } => FailureKind::VerificationMismatch,
            StimError::Device { .. } => FailureKind::Device,
            StimError::CalibrationMissing => FailureKind::CalibrationMissing,
            StimError::Timeout { .. } => FailureKind::Timeout,
            StimError::Config(_) => FailureKind::Config,
        }
    }

    /// Whether the device session should be treated as suspect after this failure.
    pub fn session_suspect(&self) -> bool {
        matches!(
            self.kind(),
            FailureKind::Transfer
                | FailureKind::VerificationMismatch
                | FailureKind::Device
                | FailureKind::Timeout
        )
    }
}

#[cfg(feature = "python")]
impl From<StimError> for pyo3::PyErr {
    fn from(err: StimError) -> pyo3::PyErr {
        match err.kind() {
            FailureKind::Validation | FailureKind::MemoryLimitExceeded | FailureKind::Config => {
                pyo3::exceptions::PyValueError::new_err(err.to_string())
            }
            _ => pyo3::exceptions::PyRuntimeError::new_err(err.to_string()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn kinds_and_suspect_sessions() {
        let err = StimError::Validation("bad length".into());
        assert_eq!(err.kind(), FailureKind::Validation);
        assert!(!err.session_suspect());

        let err = StimError::VerificationMismatch { index: 3, expected: 10, found: 11 };
        assert_eq!(err.kind(), FailureKind::VerificationMismatch);
        assert!(err.session_suspect());
        assert!(err.to_string().contains("sample 3"));
    }
}
