use std::time::Duration;

use kube::runtime::controller::Action;

use super::error::ReconcileError;
use crate::config::OperatorConfig;

/// Outcome of one pipeline step. The pipeline inspects the tag and stops at
/// the first result that is not `Continue`.
#[derive(Debug)]
pub enum ReconcileResult {
    /// Step satisfied, evaluate the next one.
    Continue,
    /// Nothing further to do this pass; wait for the next change.
    Done,
    /// The pass failed; surfaced to the caller for backoff requeue.
    Error(ReconcileError),
    /// Come back after the given delay.
    Retry(Duration),
}

impl ReconcileResult {
    pub fn completed(&self) -> bool {
        !matches!(self, ReconcileResult::Continue)
    }

    /// Translate into the controller action, flooring requested delays so
    /// child-side event bursts cannot re-invoke the loop in a tight storm.
    pub fn into_action(
        self,
        cfg: &OperatorConfig,
    ) -> Result<Action, ReconcileError> {
        match self {
            ReconcileResult::Continue | ReconcileResult::Done => {
                Ok(Action::await_change())
            }
            ReconcileResult::Retry(after) => {
                Ok(Action::requeue(after.max(cfg.min_requeue())))
            }
            ReconcileResult::Error(e) => Err(e),
        }
    }
}

/// Folds step errors into the `Error` variant so pipeline code matches on
/// tags instead of juggling nested results.
impl From<Result<ReconcileResult, ReconcileError>> for ReconcileResult {
    fn from(res: Result<ReconcileResult, ReconcileError>) -> Self {
        res.unwrap_or_else(ReconcileResult::Error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_continue_is_incomplete() {
        assert!(!ReconcileResult::Continue.completed());
        assert!(ReconcileResult::Done.completed());
        assert!(
            ReconcileResult::Retry(Duration::from_secs(1)).completed()
        );
        assert!(
            ReconcileResult::Error(ReconcileError::Internal("x".into()))
                .completed()
        );
    }

    #[test]
    fn retry_below_floor_is_raised() {
        let cfg = OperatorConfig::default();
        let action = ReconcileResult::Retry(Duration::from_millis(10))
            .into_action(&cfg)
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_millis(500)));
    }

    #[test]
    fn retry_above_floor_is_kept() {
        let cfg = OperatorConfig::default();
        let action = ReconcileResult::Retry(Duration::from_secs(5))
            .into_action(&cfg)
            .unwrap();
        assert_eq!(action, Action::requeue(Duration::from_secs(5)));
    }

    #[test]
    fn done_and_continue_wait_for_changes() {
        let cfg = OperatorConfig::default();
        assert_eq!(
            ReconcileResult::Done.into_action(&cfg).unwrap(),
            Action::await_change()
        );
        assert_eq!(
            ReconcileResult::Continue.into_action(&cfg).unwrap(),
            Action::await_change()
        );
    }

    #[test]
    fn step_errors_fold_into_the_error_variant() {
        let folded = ReconcileResult::from(Err::<ReconcileResult, _>(
            ReconcileError::Internal("boom".into()),
        ));
        assert!(matches!(folded, ReconcileResult::Error(_)));

        let passed =
            ReconcileResult::from(Ok::<_, ReconcileError>(ReconcileResult::Done));
        assert!(matches!(passed, ReconcileResult::Done));
    }
}
