use thiserror::Error;

/* ============================= STRATEGY VALIDATION ============================= */

/// Validation failures for a resource strategy.
///
/// Raised eagerly when a config or policy changes; an offending policy is
/// marked `Invalid` in its status and never applied.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum StrategyError {
    #[error("scaleDownThreshold {down} must be strictly below scaleUpThreshold {up}")]
    ThresholdOrder { down: f64, up: f64 },

    #[error("requestMultiplier {0} must not be negative")]
    NegativeRequestMultiplier(f64),

    #[error("limitMultiplier {0} must be at least 1")]
    LimitMultiplierBelowOne(f64),

    #[error("scaleUpThreshold {0} must be in (0, 1]")]
    ScaleUpOutOfRange(f64),

    #[error("scaleDownThreshold {0} must be in [0, 1)")]
    ScaleDownOutOfRange(f64),

    #[error("percentile {0} must be in 1..=99")]
    PercentileOutOfRange(u8),

    #[error("historyWindow must be greater than zero")]
    EmptyHistoryWindow,

    #[error("minRequest {min} exceeds maxLimit {max}")]
    BoundsInverted { min: String, max: String },

    #[error("unparseable quantity '{0}'")]
    BadQuantity(String),
}

/* ============================= RESIZE FAILURES ============================= */

/// Classified failure from a resize attempt.
///
/// The variant decides the recovery path: transient errors are retried
/// inside the executor, deferrals re-enqueue with a cooldown, everything
/// else surfaces on the pod record.
#[derive(Debug, Error)]
pub enum ResizeError {
    /// Stale resource version. One immediate refetch-and-retry, then the
    /// normal retry budget.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network failures, 5xx, too-many-requests.
    #[error("transient: {0}")]
    Transient(String),

    /// The platform cannot shrink this resource in place.
    #[error("in-place decrease unsupported: {0}")]
    DecreaseUnsupported(String),

    /// The API server refused the patch (limit range, quota, validation).
    #[error("admission rejected: {0}")]
    AdmissionRejected(String),

    /// Unrecognized 4xx, permission denied. Sticky until the pod spec or
    /// strategy changes.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl ResizeError {
    /// Map a kube client error onto the failure taxonomy.
    pub fn classify(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref status) => {
                let message = status.message.clone();
                let lowered = message.to_lowercase();

                if lowered.contains("decrease") && lowered.contains("not supported") {
                    return ResizeError::DecreaseUnsupported(message);
                }

                match status.code {
                    409 => ResizeError::Conflict(message),
                    429 => ResizeError::Transient(message),
                    code if code >= 500 => ResizeError::Transient(message),
                    403 if lowered.contains("quota") || lowered.contains("limitrange") => {
                        ResizeError::AdmissionRejected(message)
                    }
                    422 => ResizeError::AdmissionRejected(message),
                    _ => ResizeError::Fatal(message),
                }
            }
            other => ResizeError::Transient(other.to_string()),
        }
    }

    /// Stable label for the `reason` dimension on failure counters.
    pub fn reason_label(&self) -> &'static str {
        match self {
            ResizeError::Conflict(_) => "Conflict",
            ResizeError::Transient(_) => "Transient",
            ResizeError::DecreaseUnsupported(_) => "DecreaseUnsupported",
            ResizeError::AdmissionRejected(_) => "AdmissionRejected",
            ResizeError::Fatal(_) => "Fatal",
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ResizeError::Transient(_) | ResizeError::Conflict(_))
    }
}

/* ============================= TESTS ============================= */
