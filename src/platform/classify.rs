//! Error classification
//!
//! Maps every failure onto one class of the engine's taxonomy. Classification
//! looks at status codes, numeric platform codes and the explicit transient
//! flag only; message text is never inspected.

use serde::{Deserialize, Serialize};

use super::{PlatformError, TRANSIENT_ERROR_CODES};

/// Failure classes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Local admission control refused the call; retry after the window resets
    QuotaExceeded,
    /// The platform flagged the condition as temporary
    Transient,
    /// The object is invalid per platform rules; never retried
    PermanentValidation,
    /// A batch call succeeded but some of its entries failed
    PartialBatch,
    /// The call itself could not complete
    Transport,
    /// Engine-side fault (quota overflow) or a reply that cannot be read
    Internal,
}

impl ErrorClass {
    /// Whether the failure may be retried
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorClass::QuotaExceeded | ErrorClass::Transient | ErrorClass::Transport
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::QuotaExceeded => "quota_exceeded",
            ErrorClass::Transient => "transient",
            ErrorClass::PermanentValidation => "permanent_validation",
            ErrorClass::PartialBatch => "partial_batch",
            ErrorClass::Transport => "transport",
            ErrorClass::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a platform failure
pub fn classify(error: &PlatformError) -> ErrorClass {
    match error {
        PlatformError::Transport(_) | PlatformError::Timeout => ErrorClass::Transport,
        // the call reached the platform and may have run
        PlatformError::Malformed(_) => ErrorClass::Internal,
        PlatformError::NotExecuted => ErrorClass::Transient,
        PlatformError::Api {
            status,
            code,
            transient,
            ..
        } => {
            if let Some(flag) = transient {
                return if *flag {
                    ErrorClass::Transient
                } else {
                    ErrorClass::PermanentValidation
                };
            }
            if code.is_some_and(|c| TRANSIENT_ERROR_CODES.contains(&c)) {
                return ErrorClass::Transient;
            }
            if *status == 429 || *status >= 500 {
                return ErrorClass::Transient;
            }
            ErrorClass::PermanentValidation
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, code: Option<i64>, transient: Option<bool>) -> PlatformError {
        PlatformError::Api {
            status,
            code,
            subcode: None,
            transient,
            message: "Service temporarily unavailable".to_string(),
        }
    }

    #[test]
    fn test_transport_failures() {
        assert_eq!(
            classify(&PlatformError::Transport("reset".into())),
            ErrorClass::Transport
        );
        assert_eq!(classify(&PlatformError::Timeout), ErrorClass::Transport);
    }

    #[test]
    fn test_unreadable_reply_is_not_retried() {
        let err = PlatformError::Malformed("batch of 6 operations answered with 5 entries".into());
        assert_eq!(classify(&err), ErrorClass::Internal);
        assert!(!classify(&err).is_retryable());
    }

    #[test]
    fn test_explicit_flag_wins() {
        assert_eq!(classify(&api(400, Some(100), Some(true))), ErrorClass::Transient);
        assert_eq!(
            classify(&api(500, Some(2), Some(false))),
            ErrorClass::PermanentValidation
        );
    }

    #[test]
    fn test_throttling_codes_are_transient() {
        assert_eq!(classify(&api(400, Some(17), None)), ErrorClass::Transient);
        assert_eq!(classify(&api(400, Some(613), None)), ErrorClass::Transient);
        assert_eq!(classify(&api(503, None, None)), ErrorClass::Transient);
    }

    #[test]
    fn test_validation_is_permanent_regardless_of_message() {
        // message text mentions "temporarily" but the code says validation
        let err = api(400, Some(100), None);
        assert_eq!(classify(&err), ErrorClass::PermanentValidation);
        assert!(!classify(&err).is_retryable());
    }
}
