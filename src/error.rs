use crate::tuple::Value;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripleStoreErrorCode {
    Options,
    InvalidValue,
    InvalidScanOp,
    IndexNotFound,
    WriteRule,
    Conflict,
    Encode,
    Decode,
    Internal,
}

impl TripleStoreErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            TripleStoreErrorCode::Options => "options",
            TripleStoreErrorCode::InvalidValue => "invalid_value",
            TripleStoreErrorCode::InvalidScanOp => "invalid_scan_op",
            TripleStoreErrorCode::IndexNotFound => "index_not_found",
            TripleStoreErrorCode::WriteRule => "write_rule",
            TripleStoreErrorCode::Conflict => "conflict",
            TripleStoreErrorCode::Encode => "encode",
            TripleStoreErrorCode::Decode => "decode",
            TripleStoreErrorCode::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum TripleStoreError {
    #[error("invalid store options: {0}")]
    Options(String),
    #[error("invalid triple value: {0:?}")]
    InvalidValue(Value),
    #[error("invalid timestamp index scan operator: '{0}'")]
    InvalidTimestampScanOp(String),
    #[error("unknown index family: '{0}'")]
    IndexNotFound(String),
    #[error("write rule violation: {0}")]
    WriteRule(String),
    #[error("commit conflict: {0}")]
    Conflict(String),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("internal invariant violated: {0}")]
    Internal(String),
}

impl TripleStoreError {
    pub fn code(&self) -> TripleStoreErrorCode {
        match self {
            TripleStoreError::Options(_) => TripleStoreErrorCode::Options,
            TripleStoreError::InvalidValue(_) => TripleStoreErrorCode::InvalidValue,
            TripleStoreError::InvalidTimestampScanOp(_) => TripleStoreErrorCode::InvalidScanOp,
            TripleStoreError::IndexNotFound(_) => TripleStoreErrorCode::IndexNotFound,
            TripleStoreError::WriteRule(_) => TripleStoreErrorCode::WriteRule,
            TripleStoreError::Conflict(_) => TripleStoreErrorCode::Conflict,
            TripleStoreError::Encode(_) => TripleStoreErrorCode::Encode,
            TripleStoreError::Decode(_) => TripleStoreErrorCode::Decode,
            TripleStoreError::Internal(_) => TripleStoreErrorCode::Internal,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, TripleStoreError::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::{TripleStoreError, TripleStoreErrorCode};

    #[test]
    fn error_code_strings_are_stable() {
        assert_eq!(TripleStoreErrorCode::Options.as_str(), "options");
        assert_eq!(TripleStoreErrorCode::InvalidScanOp.as_str(), "invalid_scan_op");
        assert_eq!(TripleStoreErrorCode::WriteRule.as_str(), "write_rule");
        assert_eq!(TripleStoreErrorCode::IndexNotFound.as_str(), "index_not_found");
    }

    #[test]
    fn only_conflicts_are_retryable() {
        assert!(TripleStoreError::Conflict("seq moved".into()).is_retryable());
        assert!(!TripleStoreError::WriteRule("denied".into()).is_retryable());
        assert!(!TripleStoreError::Internal("dup key".into()).is_retryable());
    }

    #[test]
    fn code_matches_variant_mapping() {
        let err = TripleStoreError::InvalidTimestampScanOp("between".into());
        assert_eq!(err.code(), TripleStoreErrorCode::InvalidScanOp);
        assert_eq!(err.code_str(), "invalid_scan_op");
    }
}
