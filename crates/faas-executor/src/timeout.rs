use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of one invocation's deadline. `Armed` moves to exactly one of
/// the two terminal states and never leaves it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Armed,
    /// The deadline passed first; the caller must terminate the sandbox.
    Fired,
    /// The supervised work finished first.
    Disarmed,
}

/// Outcome of racing work against the deadline.
#[derive(Debug)]
pub enum Supervised<T> {
    Disarmed { output: T, elapsed: Duration },
    Fired { elapsed: Duration },
}

impl<T> Supervised<T> {
    pub fn state(&self) -> SupervisorState {
        match self {
            Supervised::Disarmed { .. } => SupervisorState::Disarmed,
            Supervised::Fired { .. } => SupervisorState::Fired,
        }
    }

    pub fn elapsed(&self) -> Duration {
        match self {
            Supervised::Disarmed { elapsed, .. } | Supervised::Fired { elapsed } => *elapsed,
        }
    }
}

/// Per-invocation deadline, armed when the sandboxed program is started.
#[derive(Debug)]
pub struct TimeoutSupervisor {
    timeout: Duration,
    armed_at: Instant,
}

impl TimeoutSupervisor {
    pub fn arm(timeout: Duration) -> Self {
        Self {
            timeout,
            armed_at: Instant::now(),
        }
    }

    pub fn state(&self) -> SupervisorState {
        SupervisorState::Armed
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn deadline(&self) -> Instant {
        self.armed_at + self.timeout
    }

    /// Races `work` against the deadline. Consuming `self` makes firing and
    /// disarming mutually exclusive. When the deadline wins, `work` is
    /// dropped before this returns.
    pub async fn race<F>(self, work: F) -> Supervised<F::Output>
    where
        F: Future,
    {
        match tokio::time::timeout_at(self.deadline(), work).await {
            Ok(output) => Supervised::Disarmed {
                output,
                elapsed: self.armed_at.elapsed(),
            },
            Err(_) => {
                debug!(timeout_ms = self.timeout.as_millis() as u64, "Invocation deadline fired");
                Supervised::Fired {
                    elapsed: self.armed_at.elapsed(),
                }
            }
        }
    }
}

/// Error text attached to a timed-out invocation.
pub fn timeout_message(timeout: Duration) -> String {
    format!("execution timed out after {}ms", timeout.as_millis())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_fast_work_disarms() {
        let supervisor = TimeoutSupervisor::arm(Duration::from_millis(500));
        assert_eq!(supervisor.state(), SupervisorState::Armed);

        let outcome = supervisor
            .race(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                7
            })
            .await;

        assert_eq!(outcome.state(), SupervisorState::Disarmed);
        assert!(matches!(outcome, Supervised::Disarmed { output: 7, .. }));
        assert_eq!(outcome.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_work_fires_at_deadline() {
        let supervisor = TimeoutSupervisor::arm(Duration::from_millis(300));
        let outcome = supervisor
            .race(std::future::pending::<()>())
            .await;

        assert_eq!(outcome.state(), SupervisorState::Fired);
        assert_eq!(outcome.elapsed(), Duration::from_millis(300));
    }

    #[test]
    fn test_timeout_message() {
        assert_eq!(
            timeout_message(Duration::from_millis(1000)),
            "execution timed out after 1000ms"
        );
    }
}
