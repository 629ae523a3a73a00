//! Error classification for dead-letter recovery.
//!
//! DLQ messages carry a serialized error string. The classifier pattern-
//! matches it (case-insensitively) into an [`ErrorType`], decides
//! retryability, and for nonce errors extracts the sub-kind and the
//! expected/actual nonce values when the node included them.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// The error taxonomy used by strategy dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    NonceError,
    InsufficientFunds,
    GasError,
    NetworkError,
    Timeout,
    InvalidAddress,
    ContractError,
    Unknown,
}

impl Display for ErrorType {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorType::NonceError => "NONCE_ERROR",
            ErrorType::InsufficientFunds => "INSUFFICIENT_FUNDS",
            ErrorType::GasError => "GAS_ERROR",
            ErrorType::NetworkError => "NETWORK_ERROR",
            ErrorType::Timeout => "TIMEOUT",
            ErrorType::InvalidAddress => "INVALID_ADDRESS",
            ErrorType::ContractError => "CONTRACT_ERROR",
            ErrorType::Unknown => "UNKNOWN",
        };
        write!(f, "{s}")
    }
}

/// Nonce-error sub-kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    /// The transaction nonce is below the chain's next nonce: most likely
    /// the transaction already mined.
    TooLow,
    /// The transaction nonce is above the chain's next nonce: a gap exists.
    TooHigh,
}

/// Extracted nonce details, when the node's message carried numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NonceDetails {
    pub kind: NonceKind,
    /// The nonce the chain expects next.
    pub expected: Option<u64>,
    /// The nonce the transaction carried.
    pub actual: Option<u64>,
}

impl NonceDetails {
    /// Gap between the transaction's nonce and the chain's next nonce, for
    /// `TooHigh` errors with both numbers present.
    pub fn gap(&self) -> Option<u64> {
        match (self.kind, self.expected, self.actual) {
            (NonceKind::TooHigh, Some(expected), Some(actual)) if actual > expected => {
                Some(actual - expected)
            }
            _ => None,
        }
    }
}

/// A classified DLQ error.
#[derive(Debug, Clone)]
pub struct ClassifiedError {
    pub error_type: ErrorType,
    pub is_retryable: bool,
    pub nonce: Option<NonceDetails>,
    pub raw: String,
}

static NONCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)nonce too (low|high)",
        r"(?i)replacement transaction underpriced",
        r"(?i)already known",
        r"(?i)known transaction",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static NONCE_DETAIL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)nonce too (low|high)(?:\D+(\d+)\D+(\d+))?").expect("static regex")
});

static GAS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)gas too low",
        r"(?i)out of gas",
        r"(?i)gas required exceeds",
        r"(?i)intrinsic gas too low",
        r"(?i)max fee per gas",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static NETWORK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)ECONNREFUSED",
        r"(?i)ETIMEDOUT",
        r"(?i)ENOTFOUND",
        r"(?i)connection refused",
        r"(?i)connection reset",
        r"(?i)transport error",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static TIMEOUT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)timed out", r"(?i)timeout"]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
});

static INSUFFICIENT_PATTERNS: Lazy<Vec<Regex>> =
    Lazy::new(|| vec![Regex::new(r"(?i)insufficient funds").expect("static regex")]);

static INVALID_ADDRESS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)invalid address",
        r"(?i)bad address checksum",
        r"(?i)malformed (recipient|token) address",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static regex"))
    .collect()
});

static CONTRACT_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [r"(?i)execution reverted", r"(?i)revert", r"(?i)contract error"]
        .iter()
        .map(|p| Regex::new(p).expect("static regex"))
        .collect()
});

fn matches_any(patterns: &[Regex], error: &str) -> bool {
    patterns.iter().any(|p| p.is_match(error))
}

/// Classify a serialized error string.
pub fn classify(error: &str) -> ClassifiedError {
    if matches_any(&NONCE_PATTERNS, error) {
        let nonce = extract_nonce_details(error);
        return ClassifiedError {
            error_type: ErrorType::NonceError,
            is_retryable: true,
            nonce,
            raw: error.to_string(),
        };
    }
    if matches_any(&INSUFFICIENT_PATTERNS, error) {
        return not_retryable(ErrorType::InsufficientFunds, error);
    }
    if matches_any(&GAS_PATTERNS, error) {
        return retryable(ErrorType::GasError, error);
    }
    if matches_any(&TIMEOUT_PATTERNS, error) && !matches_any(&NETWORK_PATTERNS, error) {
        return retryable(ErrorType::Timeout, error);
    }
    if matches_any(&NETWORK_PATTERNS, error) {
        return retryable(ErrorType::NetworkError, error);
    }
    if matches_any(&INVALID_ADDRESS_PATTERNS, error) {
        return not_retryable(ErrorType::InvalidAddress, error);
    }
    if matches_any(&CONTRACT_PATTERNS, error) {
        return not_retryable(ErrorType::ContractError, error);
    }
    retryable(ErrorType::Unknown, error)
}

fn retryable(error_type: ErrorType, raw: &str) -> ClassifiedError {
    ClassifiedError {
        error_type,
        is_retryable: true,
        nonce: None,
        raw: raw.to_string(),
    }
}

fn not_retryable(error_type: ErrorType, raw: &str) -> ClassifiedError {
    ClassifiedError {
        error_type,
        is_retryable: false,
        nonce: None,
        raw: raw.to_string(),
    }
}

/// Pull the sub-kind and nonce numbers out of a nonce error.
///
/// Geth-style messages read `nonce too low: next nonce 8, tx nonce 7`; the
/// first number is what the chain expects, the second what the transaction
/// carried. `already known` and underpriced-replacement errors behave like
/// `TooLow`: the nonce was consumed.
fn extract_nonce_details(error: &str) -> Option<NonceDetails> {
    if let Some(captures) = NONCE_DETAIL.captures(error) {
        let kind = match captures.get(1)?.as_str().to_ascii_lowercase().as_str() {
            "high" => NonceKind::TooHigh,
            _ => NonceKind::TooLow,
        };
        let expected = captures.get(2).and_then(|m| m.as_str().parse().ok());
        let actual = captures.get(3).and_then(|m| m.as_str().parse().ok());
        return Some(NonceDetails {
            kind,
            expected,
            actual,
        });
    }
    // The remaining nonce patterns imply an already-used nonce.
    Some(NonceDetails {
        kind: NonceKind::TooLow,
        expected: None,
        actual: None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_too_low_with_numbers() {
        let classified = classify("rpc error -32000: nonce too low: next nonce 8, tx nonce 7");
        assert_eq!(classified.error_type, ErrorType::NonceError);
        assert!(classified.is_retryable);
        let nonce = classified.nonce.unwrap();
        assert_eq!(nonce.kind, NonceKind::TooLow);
        assert_eq!(nonce.expected, Some(8));
        assert_eq!(nonce.actual, Some(7));
        assert_eq!(nonce.gap(), None);
    }

    #[test]
    fn nonce_too_high_gap() {
        let classified = classify("Nonce too HIGH: next nonce 7, tx nonce 10");
        let nonce = classified.nonce.unwrap();
        assert_eq!(nonce.kind, NonceKind::TooHigh);
        assert_eq!(nonce.gap(), Some(3));
    }

    #[test]
    fn duplicate_transaction_is_nonce_class() {
        for error in [
            "already known",
            "known transaction: deadbeef",
            "replacement transaction underpriced",
        ] {
            let classified = classify(error);
            assert_eq!(classified.error_type, ErrorType::NonceError);
            assert_eq!(classified.nonce.unwrap().kind, NonceKind::TooLow);
        }
    }

    #[test]
    fn gas_class() {
        for error in [
            "intrinsic gas too low",
            "out of gas",
            "gas required exceeds allowance",
            "max fee per gas less than block base fee",
        ] {
            let classified = classify(error);
            assert_eq!(classified.error_type, ErrorType::GasError, "{error}");
            assert!(classified.is_retryable);
        }
    }

    #[test]
    fn network_and_timeout_split() {
        assert_eq!(
            classify("connect ECONNREFUSED 127.0.0.1:8545").error_type,
            ErrorType::NetworkError
        );
        assert_eq!(
            classify("transport error: connection reset").error_type,
            ErrorType::NetworkError
        );
        assert_eq!(
            classify("rpc call timed out after 10s").error_type,
            ErrorType::Timeout
        );
        // ETIMEDOUT belongs to the network class even though it names a
        // timeout.
        assert_eq!(classify("connect ETIMEDOUT").error_type, ErrorType::NetworkError);
    }

    #[test]
    fn terminal_classes_are_not_retryable() {
        let insufficient = classify("insufficient funds for gas * price + value");
        assert_eq!(insufficient.error_type, ErrorType::InsufficientFunds);
        assert!(!insufficient.is_retryable);

        let address = classify("malformed recipient address 0xzz");
        assert_eq!(address.error_type, ErrorType::InvalidAddress);
        assert!(!address.is_retryable);

        let contract = classify("execution reverted: ERC20: transfer amount exceeds balance");
        assert_eq!(contract.error_type, ErrorType::ContractError);
        assert!(!contract.is_retryable);
    }

    #[test]
    fn unknown_is_retryable_fallback() {
        let classified = classify("some entirely novel failure");
        assert_eq!(classified.error_type, ErrorType::Unknown);
        assert!(classified.is_retryable);
    }
}
