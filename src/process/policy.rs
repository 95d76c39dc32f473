//! Restart and backoff decisions.
//!
//! The delay before retry `n` (1-based failure count) is
//! `first × factor^(n-1)`, clamped to `max`. With `factor >= 1.0` the
//! schedule never decreases until the failure counter is reset.

use super::types::ExitResult;
use crate::configs::{BackoffConfig, RestartPolicy};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// The program is done; no restart.
    Exited,
    /// The exit counts as a failed attempt.
    Failed,
}

/// How a process exit is judged. `early` means the start dwell had not
/// elapsed yet.
pub fn judge_exit(policy: RestartPolicy, result: &ExitResult, early: bool) -> ExitOutcome {
    let unexpected = !result.success();
    let restart = match policy {
        RestartPolicy::Never => early && unexpected,
        RestartPolicy::OnFailure => unexpected,
        RestartPolicy::Always => true,
    };
    if restart {
        ExitOutcome::Failed
    } else {
        ExitOutcome::Exited
    }
}

pub fn backoff_delay(config: &BackoffConfig, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(i32::MAX as u32) as i32;
    let secs = config.first.as_secs_f64() * config.factor.powi(exponent);
    if !secs.is_finite() || secs < 0.0 || secs > config.max.as_secs_f64() {
        config.max
    } else {
        Duration::from_secs_f64(secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::types::ExitKind;

    fn exit(kind: ExitKind) -> ExitResult {
        ExitResult {
            kind,
            duration: Duration::from_millis(10),
        }
    }

    #[test]
    fn restart_table() {
        let ok = exit(ExitKind::Code(0));
        let failed = exit(ExitKind::Code(1));
        let killed = exit(ExitKind::Signal(9));

        assert_eq!(judge_exit(RestartPolicy::OnFailure, &ok, true), ExitOutcome::Exited);
        assert_eq!(judge_exit(RestartPolicy::OnFailure, &ok, false), ExitOutcome::Exited);
        assert_eq!(judge_exit(RestartPolicy::OnFailure, &failed, true), ExitOutcome::Failed);
        assert_eq!(judge_exit(RestartPolicy::OnFailure, &killed, false), ExitOutcome::Failed);

        assert_eq!(judge_exit(RestartPolicy::Always, &ok, false), ExitOutcome::Failed);
        assert_eq!(judge_exit(RestartPolicy::Always, &ok, true), ExitOutcome::Failed);

        assert_eq!(judge_exit(RestartPolicy::Never, &failed, false), ExitOutcome::Exited);
        assert_eq!(judge_exit(RestartPolicy::Never, &failed, true), ExitOutcome::Failed);
        assert_eq!(judge_exit(RestartPolicy::Never, &ok, true), ExitOutcome::Exited);
    }

    #[test]
    fn delays_grow_and_cap() {
        let config = BackoffConfig {
            first: Duration::from_millis(100),
            max: Duration::from_secs(1),
            factor: 2.0,
            reset_after: Duration::from_secs(60),
        };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(100));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(200));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(800));
        assert_eq!(backoff_delay(&config, 5), Duration::from_secs(1));
        assert_eq!(backoff_delay(&config, u32::MAX), Duration::from_secs(1));

        let delays: Vec<_> = (1..20).map(|n| backoff_delay(&config, n)).collect();
        assert!(delays.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn constant_factor_keeps_first_delay() {
        let config = BackoffConfig {
            factor: 1.0,
            ..BackoffConfig::default()
        };
        assert_eq!(backoff_delay(&config, 7), config.first);
    }
}
