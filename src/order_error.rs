// =============================================================================
// Order error taxonomy — classification of failures from the Order Service
// =============================================================================
//
// Mirrors spec §7's taxonomy. `classify` maps a `VenueError` (HTTP status +
// venue error code) onto the action the Order Service must take; the enum
// variants themselves carry no behavior — callers match on them.
// =============================================================================

use crate::venue::VenueError;

#[derive(Debug, Clone, PartialEq)]
pub enum OrderError {
    /// Network error, timeout, or 5xx — retry with exponential backoff.
    Transient { message: String },
    /// HTTP 429 — honor `retry_after` when supplied.
    RateLimited { retry_after_secs: Option<u64>, message: String },
    /// Unknown symbol, missing filter, non-finite price, notional below
    /// minimum — fail fast, set cooldown, no retry.
    Validation { message: String },
    /// Venue rejects due to tick/step mismatch — re-round and retry once.
    Precision { message: String },
    /// "Position already open", "max concurrent trades reached" — silent
    /// skip, no cooldown.
    Business { message: String },
    /// Invalid signature, revoked credentials, insufficient margin,
    /// position-mode mismatch — notify, long cooldown.
    Fatal { message: String },
    /// Programmer error — propagate and log at error level.
    Internal { message: String },
}

impl std::fmt::Display for OrderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Transient { message } => write!(f, "transient: {message}"),
            Self::RateLimited { retry_after_secs, message } => {
                write!(f, "rate-limited (retry_after={retry_after_secs:?}): {message}")
            }
            Self::Validation { message } => write!(f, "validation: {message}"),
            Self::Precision { message } => write!(f, "precision: {message}"),
            Self::Business { message } => write!(f, "business: {message}"),
            Self::Fatal { message } => write!(f, "fatal: {message}"),
            Self::Internal { message } => write!(f, "internal: {message}"),
        }
    }
}

impl std::error::Error for OrderError {}

/// Binance futures codes that classify as precision / margin / position-mode
/// errors (spec §4.8 step 8, §7).
const PRECISION_CODES: &[i64] = &[-1111];
const FATAL_MARGIN_CODES: &[i64] = &[-2019];
const FATAL_POSITION_MODE_CODES: &[i64] = &[-4061];
/// Bybit retCodes for the same classes of failure.
const BYBIT_PRECISION_CODES: &[i64] = &[10001];
const BYBIT_MARGIN_CODES: &[i64] = &[110007];
const BYBIT_POSITION_MODE_CODES: &[i64] = &[110010];

pub fn classify(err: &VenueError) -> OrderError {
    if let Some(status) = err.http_status {
        if status == 429 {
            return OrderError::RateLimited { retry_after_secs: None, message: err.message.clone() };
        }
        if status >= 500 {
            return OrderError::Transient { message: err.message.clone() };
        }
    } else {
        // No HTTP status at all -> transport-level failure (timeout, DNS,
        // connection reset).
        return OrderError::Transient { message: err.message.clone() };
    }

    if let Some(code) = err.code {
        if PRECISION_CODES.contains(&code) || BYBIT_PRECISION_CODES.contains(&code) {
            return OrderError::Precision { message: err.message.clone() };
        }
        if FATAL_MARGIN_CODES.contains(&code)
            || FATAL_POSITION_MODE_CODES.contains(&code)
            || BYBIT_MARGIN_CODES.contains(&code)
            || BYBIT_POSITION_MODE_CODES.contains(&code)
        {
            return OrderError::Fatal { message: err.message.clone() };
        }
    }

    OrderError::Validation { message: err.message.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn venue_err(status: u16, code: Option<i64>) -> VenueError {
        VenueError { http_status: Some(status), code, message: "boom".into() }
    }

    #[test]
    fn http_429_is_rate_limited() {
        assert!(matches!(classify(&venue_err(429, None)), OrderError::RateLimited { .. }));
    }

    #[test]
    fn http_5xx_is_transient() {
        assert!(matches!(classify(&venue_err(503, None)), OrderError::Transient { .. }));
    }

    #[test]
    fn precision_code_maps_to_precision() {
        assert!(matches!(classify(&venue_err(400, Some(-1111))), OrderError::Precision { .. }));
    }

    #[test]
    fn margin_code_maps_to_fatal() {
        assert!(matches!(classify(&venue_err(400, Some(-2019))), OrderError::Fatal { .. }));
    }

    #[test]
    fn position_mode_code_maps_to_fatal() {
        assert!(matches!(classify(&venue_err(400, Some(-4061))), OrderError::Fatal { .. }));
    }

    #[test]
    fn unknown_code_defaults_to_validation() {
        assert!(matches!(classify(&venue_err(400, Some(-9999))), OrderError::Validation { .. }));
    }

    #[test]
    fn transport_failure_with_no_status_is_transient() {
        let err = VenueError { http_status: None, code: None, message: "connection reset".into() };
        assert!(matches!(classify(&err), OrderError::Transient { .. }));
    }
}
