//! The per-checkpoint state machine.
//!
//! Each checkpoint id carries exactly one [`CheckpointState`]. On every pass the state is
//! advanced with the merged view of the data sources ([`ApiCondition`]) and the resulting state
//! decides what happens to the checkpoint on disk ([`Action`]). Grace periods keep a checkpoint
//! around for a while after its parent disappears from the API so that scheduler churn or a
//! flapping API server does not tear down a control plane pod.
use std::time::{Duration, Instant};

/// The longest grace period a deadline is computed from. Longer periods are clamped to it
pub const MAX_GRACE_PERIOD: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// The merged condition of a single checkpoint id across all data sources
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ApiCondition {
    /// The API server could be reached during this pass
    pub api_available: bool,
    /// The API server lists the parent pod on this node
    pub api_parent: bool,
    /// The container runtime reports the parent pod as running
    pub local_running: bool,
    /// The kubelet lists the parent pod
    pub local_parent: bool,
}

/// What should happen to a checkpoint on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// Leave it alone
    None,
    /// Make sure the checkpoint is active
    Start,
    /// Make sure the checkpoint is inactive
    Stop,
    /// Delete the checkpoint and everything it references
    Remove,
}

/// The state of a single checkpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CheckpointState {
    /// Nothing is known to need checkpointing yet
    None,
    /// The checkpoint is staged but not running
    Inactive,
    /// The parent is gone from the API; the checkpoint stays staged until the deadline
    InactiveGracePeriod(Instant),
    /// The checkpoint is running in place of its parent
    Active,
    /// The parent is gone from the API; the checkpoint keeps running until the deadline
    ActiveGracePeriod(Instant),
    /// The checkpoint of the checkpointer itself, which always runs
    SelfCheckpointActive,
    /// The checkpoint is garbage collected. This state is terminal
    Remove,
}

impl CheckpointState {
    /// The state an id starts in the first time it is observed. A checkpoint found on disk
    /// resumes as whatever the disk says it is; the checkpointer's own checkpoint always resumes
    /// running.
    pub fn initial(is_self: bool, active: bool, inactive: bool) -> Self {
        if is_self && (active || inactive) {
            CheckpointState::SelfCheckpointActive
        } else if active {
            CheckpointState::Active
        } else if inactive {
            CheckpointState::Inactive
        } else {
            CheckpointState::None
        }
    }

    /// The action the checkpoint should undergo in this state
    pub fn action(&self) -> Action {
        match self {
            CheckpointState::None => Action::None,
            CheckpointState::Inactive | CheckpointState::InactiveGracePeriod(_) => Action::Stop,
            CheckpointState::Active
            | CheckpointState::ActiveGracePeriod(_)
            | CheckpointState::SelfCheckpointActive => Action::Start,
            CheckpointState::Remove => Action::Remove,
        }
    }

    /// Advance the state, taking care of the checkpointer's own checkpoint. The self-checkpoint
    /// is never stopped by normal reconciliation: it either runs or, once the API confirms its
    /// parent is gone, runs out its grace period and is removed.
    pub fn advance(
        self,
        now: Instant,
        apis: ApiCondition,
        grace_period: Duration,
        is_self: bool,
    ) -> Self {
        let next = self.transition(now, apis, grace_period);
        if !is_self {
            return next;
        }
        match next {
            CheckpointState::Inactive | CheckpointState::Active => {
                CheckpointState::SelfCheckpointActive
            }
            CheckpointState::InactiveGracePeriod(deadline) => {
                CheckpointState::ActiveGracePeriod(deadline)
            }
            other => other,
        }
    }

    /// Compute the next state from the current one
    pub fn transition(self, now: Instant, apis: ApiCondition, grace_period: Duration) -> Self {
        match self {
            CheckpointState::None => {
                if apis.local_running || apis.local_parent {
                    CheckpointState::Inactive.transition(now, apis, grace_period)
                } else {
                    self
                }
            }
            CheckpointState::Inactive => {
                if apis.api_available && !apis.api_parent {
                    // Evaluated right away so a zero grace period removes within the same pass
                    let deadline = grace_deadline(now, grace_period);
                    return CheckpointState::InactiveGracePeriod(deadline).transition(now, apis, grace_period);
                }
                if apis.local_running {
                    self
                } else {
                    CheckpointState::Active
                }
            }
            CheckpointState::InactiveGracePeriod(deadline) => {
                if apis.api_available && apis.api_parent {
                    return CheckpointState::Inactive.transition(now, apis, grace_period);
                }
                if now >= deadline && apis.api_available && !apis.local_parent {
                    return CheckpointState::Remove;
                }
                if apis.local_running {
                    self
                } else {
                    CheckpointState::ActiveGracePeriod(deadline)
                }
            }
            CheckpointState::Active => {
                if apis.api_available && !apis.api_parent {
                    let deadline = grace_deadline(now, grace_period);
                    return CheckpointState::ActiveGracePeriod(deadline).transition(now, apis, grace_period);
                }
                if apis.local_running {
                    CheckpointState::Inactive
                } else {
                    self
                }
            }
            CheckpointState::ActiveGracePeriod(deadline) => {
                if now >= deadline {
                    return CheckpointState::InactiveGracePeriod(deadline).transition(
                        now,
                        apis,
                        grace_period,
                    );
                }
                if apis.api_available && apis.api_parent {
                    return CheckpointState::Active.transition(now, apis, grace_period);
                }
                if apis.local_running {
                    CheckpointState::InactiveGracePeriod(deadline)
                } else {
                    self
                }
            }
            CheckpointState::SelfCheckpointActive => {
                if apis.api_available && !apis.api_parent {
                    let deadline = grace_deadline(now, grace_period);
                    CheckpointState::ActiveGracePeriod(deadline).transition(now, apis, grace_period)
                } else {
                    self
                }
            }
            CheckpointState::Remove => self,
        }
    }
}

// Saturates instead of overflowing the instant
fn grace_deadline(now: Instant, grace_period: Duration) -> Instant {
    now.checked_add(grace_period.min(MAX_GRACE_PERIOD))
        .unwrap_or(now)
}

#[cfg(test)]
mod test {
    use super::*;

    const GRACE: Duration = Duration::from_secs(60);

    fn cond(
        api_available: bool,
        api_parent: bool,
        local_running: bool,
        local_parent: bool,
    ) -> ApiCondition {
        ApiCondition {
            api_available,
            api_parent,
            local_running,
            local_parent,
        }
    }

    fn all_conditions() -> Vec<ApiCondition> {
        (0u8..16)
            .map(|bits| cond(bits & 1 != 0, bits & 2 != 0, bits & 4 != 0, bits & 8 != 0))
            .collect()
    }

    #[test]
    fn test_huge_grace_period_is_clamped() {
        let now = Instant::now();
        let huge = Duration::from_secs(u64::MAX);
        for state in [
            CheckpointState::Inactive,
            CheckpointState::Active,
            CheckpointState::SelfCheckpointActive,
        ] {
            let next = state.transition(now, cond(true, false, true, false), huge);
            assert_eq!(
                next,
                CheckpointState::InactiveGracePeriod(now + MAX_GRACE_PERIOD),
                "from {:?}",
                state
            );
            assert_eq!(next.action(), Action::Stop);
        }
    }

    #[test]
    fn test_none_stays_none_without_local_pods() {
        let now = Instant::now();
        let next = CheckpointState::None.transition(now, cond(true, true, false, false), GRACE);
        assert_eq!(next, CheckpointState::None);
        assert_eq!(next.action(), Action::None);
    }

    #[test]
    fn test_none_with_local_pods_behaves_like_inactive() {
        let now = Instant::now();
        for apis in all_conditions()
            .into_iter()
            .filter(|c| c.local_running || c.local_parent)
        {
            assert_eq!(
                CheckpointState::None.transition(now, apis, GRACE),
                CheckpointState::Inactive.transition(now, apis, GRACE),
                "condition {:?}",
                apis
            );
        }
    }

    #[test]
    fn test_inactive_transitions() {
        let now = Instant::now();
        let next = |apis| CheckpointState::Inactive.transition(now, apis, GRACE);

        assert_eq!(next(cond(false, false, true, false)), CheckpointState::Inactive);
        assert_eq!(next(cond(false, false, false, false)), CheckpointState::Active);
        assert_eq!(next(cond(true, true, true, true)), CheckpointState::Inactive);
        assert_eq!(next(cond(true, true, false, true)), CheckpointState::Active);
        assert_eq!(
            next(cond(true, false, true, false)),
            CheckpointState::InactiveGracePeriod(now + GRACE)
        );
        // Nothing runs the parent anymore, so the checkpoint takes over while the grace
        // period runs out
        assert_eq!(
            next(cond(true, false, false, false)),
            CheckpointState::ActiveGracePeriod(now + GRACE)
        );
    }

    #[test]
    fn test_active_transitions() {
        let now = Instant::now();
        let next = |apis| CheckpointState::Active.transition(now, apis, GRACE);

        assert_eq!(next(cond(false, false, true, false)), CheckpointState::Inactive);
        assert_eq!(next(cond(false, false, false, false)), CheckpointState::Active);
        assert_eq!(next(cond(true, true, true, true)), CheckpointState::Inactive);
        assert_eq!(next(cond(true, true, false, true)), CheckpointState::Active);
        assert_eq!(
            next(cond(true, false, false, false)),
            CheckpointState::ActiveGracePeriod(now + GRACE)
        );
        assert_eq!(
            next(cond(true, false, true, false)),
            CheckpointState::InactiveGracePeriod(now + GRACE)
        );
    }

    #[test]
    fn test_grace_period_elapses_into_remove() {
        let start = Instant::now();
        let deadline = start + GRACE;
        let orphaned = cond(true, false, false, false);

        let inactive = CheckpointState::InactiveGracePeriod(deadline);
        assert_eq!(
            inactive.transition(start, orphaned, GRACE),
            CheckpointState::ActiveGracePeriod(deadline)
        );
        assert_eq!(
            inactive.transition(deadline, orphaned, GRACE),
            CheckpointState::Remove
        );

        let active = CheckpointState::ActiveGracePeriod(deadline);
        assert_eq!(active.transition(start, orphaned, GRACE), active);
        assert_eq!(
            active.transition(deadline + GRACE, orphaned, GRACE),
            CheckpointState::Remove
        );
    }

    #[test]
    fn test_parent_reappearing_ends_grace_period() {
        let now = Instant::now();
        let deadline = now + GRACE;
        for state in [
            CheckpointState::InactiveGracePeriod(deadline),
            CheckpointState::ActiveGracePeriod(deadline),
        ] {
            assert_eq!(
                state.transition(now, cond(true, true, true, true), GRACE),
                CheckpointState::Inactive
            );
            assert_eq!(
                state.transition(now, cond(true, true, false, true), GRACE),
                CheckpointState::Active
            );
        }
        // Even past the deadline a parent that came back wins over removal
        assert_eq!(
            CheckpointState::ActiveGracePeriod(deadline).transition(
                deadline,
                cond(true, true, true, false),
                GRACE
            ),
            CheckpointState::Inactive
        );
    }

    #[test]
    fn test_grace_period_never_removes_without_api_or_with_local_parent() {
        let expired = Instant::now();
        let now = expired + GRACE;
        for state in [
            CheckpointState::InactiveGracePeriod(expired),
            CheckpointState::ActiveGracePeriod(expired),
        ] {
            for apis in all_conditions()
                .into_iter()
                .filter(|c| !c.api_available || c.local_parent)
            {
                assert_ne!(
                    state.transition(now, apis, GRACE),
                    CheckpointState::Remove,
                    "{:?} with {:?}",
                    state,
                    apis
                );
            }
        }
    }

    #[test]
    fn test_self_checkpoint() {
        let now = Instant::now();
        let s = CheckpointState::SelfCheckpointActive;
        assert_eq!(s.advance(now, cond(false, false, false, false), GRACE, true), s);
        assert_eq!(s.advance(now, cond(true, true, true, true), GRACE, true), s);
        assert_eq!(
            s.advance(now, cond(true, false, true, false), GRACE, true),
            CheckpointState::ActiveGracePeriod(now + GRACE)
        );
        assert_eq!(
            s.advance(now, cond(true, false, true, false), Duration::from_secs(0), true),
            CheckpointState::Remove
        );
    }

    #[test]
    fn test_self_checkpoint_is_never_stopped() {
        let start = Instant::now();
        let now = start + GRACE;
        let states = [
            CheckpointState::SelfCheckpointActive,
            CheckpointState::ActiveGracePeriod(now + GRACE),
            CheckpointState::ActiveGracePeriod(start),
        ];
        for state in states {
            for apis in all_conditions() {
                let next = state.advance(now, apis, GRACE, true);
                assert_ne!(next.action(), Action::Stop, "{:?} with {:?}", state, apis);
            }
        }
    }

    #[test]
    fn test_remove_is_terminal() {
        let now = Instant::now();
        for apis in all_conditions() {
            assert_eq!(
                CheckpointState::Remove.transition(now, apis, GRACE),
                CheckpointState::Remove
            );
        }
    }

    #[test]
    fn test_actions() {
        let now = Instant::now();
        assert_eq!(CheckpointState::None.action(), Action::None);
        assert_eq!(CheckpointState::Inactive.action(), Action::Stop);
        assert_eq!(CheckpointState::InactiveGracePeriod(now).action(), Action::Stop);
        assert_eq!(CheckpointState::Active.action(), Action::Start);
        assert_eq!(CheckpointState::ActiveGracePeriod(now).action(), Action::Start);
        assert_eq!(CheckpointState::SelfCheckpointActive.action(), Action::Start);
        assert_eq!(CheckpointState::Remove.action(), Action::Remove);
    }

    #[test]
    fn test_initial_state() {
        assert_eq!(
            CheckpointState::initial(true, false, true),
            CheckpointState::SelfCheckpointActive
        );
        assert_eq!(CheckpointState::initial(true, false, false), CheckpointState::None);
        assert_eq!(CheckpointState::initial(false, true, true), CheckpointState::Active);
        assert_eq!(CheckpointState::initial(false, false, true), CheckpointState::Inactive);
        assert_eq!(CheckpointState::initial(false, false, false), CheckpointState::None);
    }
}
