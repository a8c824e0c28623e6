//! Retry backoff policy for failed operations.

use crate::{Operation, OperationStatus, Timestamp};
use chrono::Duration;

/// Default spacing between retry loop ticks.
pub const DEFAULT_RETRY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5 * 60);

/// Decides when a failed operation is due for another attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry; later retries wait a multiple of it.
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::minutes(1),
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// How long after its last failure an operation with `retry_count`
    /// retries behind it must wait: `(retry_count + 1) × base_delay`.
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        let factor = i32::try_from(retry_count.saturating_add(1)).unwrap_or(i32::MAX);
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    /// Whether `op` may be reset to pending at `now`.
    pub fn is_due(&self, op: &Operation, now: Timestamp) -> bool {
        op.status == OperationStatus::Failed
            && op.has_retry_budget()
            && now - op.updated_at >= self.delay_for(op.retry_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::{NewOperation, OperationKind, DEFAULT_MAX_RETRIES};
    use chrono::Utc;

    fn failed_op(retry_count: u32, failed_at: Timestamp) -> Operation {
        let mut op = NewOperation::new(OperationKind::Delete, "products", "1", None)
            .into_operation(1, "op".into(), DEFAULT_MAX_RETRIES, failed_at);
        op.status = OperationStatus::Failed;
        op.retry_count = retry_count;
        op
    }

    #[test]
    fn delay_grows_with_retry_count() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::minutes(1));
        assert_eq!(policy.delay_for(3), Duration::minutes(4));
    }

    #[test]
    fn due_only_after_delay() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();
        let op = failed_op(1, failed_at);

        assert!(!policy.is_due(&op, failed_at + Duration::seconds(119)));
        assert!(policy.is_due(&op, failed_at + Duration::minutes(2)));
    }

    #[test]
    fn never_due_without_budget_or_when_not_failed() {
        let policy = RetryPolicy::default();
        let failed_at = Utc::now();
        let later = failed_at + Duration::days(1);

        assert!(!policy.is_due(&failed_op(DEFAULT_MAX_RETRIES, failed_at), later));

        let mut pending = failed_op(0, failed_at);
        pending.status = OperationStatus::Pending;
        assert!(!policy.is_due(&pending, later));
    }
}
