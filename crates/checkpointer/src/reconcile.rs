//! The reconciliation engine: one pass merges everything known about the node into a state per
//! checkpoint, keeps the staged checkpoints of parent pods up to date and then acts on the
//! decisions.
use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};

use crate::pod::{CheckpointId, Pod, PodMap};
use crate::sanitize::PodSanitizer;
use crate::snapshot::ResourceSnapshotter;
use crate::state::{Action, ApiCondition, CheckpointState};
use crate::store::{self, CheckpointStore};

/// Everything the data sources reported during one pass
#[derive(Clone, Debug, Default)]
pub struct Observation {
    /// Pods the container runtime reports as running
    pub local_running: BTreeSet<CheckpointId>,
    /// Parent pods the kubelet knows about
    pub local_parents: PodMap,
    /// Parent pods the API server has scheduled to this node, or `None` if the API server could
    /// not be reached
    pub api_parents: Option<PodMap>,
}

/// The checkpoints to start, stop and remove as decided by one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Decisions {
    /// Checkpoints to copy into the active manifest directory
    pub start: Vec<CheckpointId>,
    /// Checkpoints to delete from the active manifest directory
    pub stop: Vec<CheckpointId>,
    /// Checkpoints to delete entirely. The checkpointer's own checkpoint, if present, is last
    pub remove: Vec<CheckpointId>,
}

/// Tracks the state of every checkpoint on the node across passes
pub struct ReconciliationEngine {
    store: CheckpointStore,
    snapshotter: ResourceSnapshotter,
    sanitizer: PodSanitizer,
    self_id: CheckpointId,
    grace_period: Duration,
    refresh_interval: Duration,
    last_refresh: Option<Instant>,
    states: BTreeMap<CheckpointId, CheckpointState>,
}

impl ReconciliationEngine {
    /// Returns an engine with no known checkpoint states. `self_id` identifies the
    /// checkpointer's own pod. Snapshots of unchanged checkpoints are refreshed every
    /// `refresh_interval`
    pub fn new(
        store: CheckpointStore,
        snapshotter: ResourceSnapshotter,
        self_id: CheckpointId,
        grace_period: Duration,
        refresh_interval: Duration,
    ) -> Self {
        let sanitizer = PodSanitizer::new(snapshotter.paths().clone());
        ReconciliationEngine {
            store,
            snapshotter,
            sanitizer,
            self_id,
            grace_period,
            refresh_interval,
            last_refresh: None,
            states: BTreeMap::new(),
        }
    }

    /// The current state of a checkpoint, if it is tracked
    pub fn state(&self, id: &CheckpointId) -> Option<CheckpointState> {
        self.states.get(id).copied()
    }

    /// Runs one full pass: lists the checkpoints on disk, advances every state, refreshes the
    /// staged checkpoints of parent pods and then stops, starts and removes checkpoints, in that
    /// order. Failures for a single checkpoint are logged and do not affect the others
    pub async fn reconcile(
        &mut self,
        now: Instant,
        observation: Observation,
    ) -> anyhow::Result<Decisions> {
        let active = self.store.list_active().await?;
        let inactive = self.store.list_inactive().await?;

        let decisions = self.plan(now, &observation, &active, &inactive);
        debug!(?decisions, "Planned checkpoint actions");

        self.write_checkpoints(now, &observation.local_parents, &decisions.remove)
            .await;
        self.execute(&decisions).await;
        Ok(decisions)
    }

    /// Advances the state of every known checkpoint and returns what should happen to each.
    /// Nothing on disk is touched
    pub fn plan(
        &mut self,
        now: Instant,
        observation: &Observation,
        active: &PodMap,
        inactive: &PodMap,
    ) -> Decisions {
        let api_available = observation.api_parents.is_some();
        let no_parents = PodMap::new();
        let api_parents = observation.api_parents.as_ref().unwrap_or(&no_parents);

        let observed: BTreeSet<&CheckpointId> = observation
            .local_parents
            .keys()
            .chain(api_parents.keys())
            .chain(active.keys())
            .chain(inactive.keys())
            .collect();
        let known: BTreeSet<CheckpointId> = observed
            .iter()
            .copied()
            .chain(self.states.keys())
            .cloned()
            .collect();

        let mut previous = BTreeMap::new();
        let mut next_states = BTreeMap::new();
        for id in known {
            let is_self = id == self.self_id;
            let apis = ApiCondition {
                api_available,
                api_parent: api_parents.contains_key(&id),
                local_running: observation.local_running.contains(&id),
                local_parent: observation.local_parents.contains_key(&id),
            };
            let initial = || {
                CheckpointState::initial(
                    is_self,
                    active.contains_key(&id),
                    inactive.contains_key(&id),
                )
            };
            let current = match self.states.get(&id).copied() {
                // A local parent came back before the removal finished. Start over rather than
                // delete a checkpoint the kubelet may still need
                Some(CheckpointState::Remove) if apis.local_parent => initial(),
                Some(state) => state,
                None => initial(),
            };

            let next = match current {
                CheckpointState::Remove => CheckpointState::Remove,
                state => state.advance(now, apis, self.grace_period, is_self),
            };
            trace!(checkpoint = %id, from = ?current, to = ?next, ?apis, "Advanced checkpoint state");

            if next == CheckpointState::None && !observed.contains(&id) {
                continue;
            }
            previous.insert(id.clone(), current);
            next_states.insert(id, next);
        }

        self.hold_self_checkpoint(&previous, &mut next_states);
        for (id, from, to) in changed_states(&previous, &next_states) {
            info!(checkpoint = %id, ?from, ?to, "Checkpoint state changed");
        }

        let mut decisions = Decisions::default();
        for (id, state) in next_states.iter() {
            match state.action() {
                Action::Start => decisions.start.push(id.clone()),
                Action::Stop => decisions.stop.push(id.clone()),
                Action::Remove => decisions.remove.push(id.clone()),
                Action::None => (),
            }
        }
        if let Some(pos) = decisions.remove.iter().position(|id| *id == self.self_id) {
            let self_id = decisions.remove.remove(pos);
            decisions.remove.push(self_id);
        }

        self.states = next_states;
        decisions
    }

    /// The self-checkpoint goes last: it may only be removed in a pass that removes every other
    /// checkpoint too. Otherwise it keeps its previous state and tries again next pass
    fn hold_self_checkpoint(
        &self,
        previous: &BTreeMap<CheckpointId, CheckpointState>,
        next_states: &mut BTreeMap<CheckpointId, CheckpointState>,
    ) {
        if next_states.get(&self.self_id) != Some(&CheckpointState::Remove) {
            return;
        }
        let others_remain = next_states.iter().any(|(id, state)| {
            *id != self.self_id
                && !matches!(state, CheckpointState::None | CheckpointState::Remove)
        });
        if others_remain {
            if let Some(prev) = previous.get(&self.self_id) {
                debug!(checkpoint = %self.self_id, "Holding self-checkpoint until all other checkpoints are removed");
                next_states.insert(self.self_id.clone(), *prev);
            }
        }
    }

    /// Writes (or refreshes) the staged checkpoint of every parent pod that isn't being removed
    async fn write_checkpoints(&mut self, now: Instant, parents: &PodMap, remove: &[CheckpointId]) {
        let refresh_due = self
            .last_refresh
            .map(|last| now.saturating_duration_since(last) >= self.refresh_interval)
            .unwrap_or(true);

        for (id, parent) in parents
            .iter()
            .filter(|(id, pod)| pod.is_parent() && !remove.contains(id))
        {
            if let Err(e) = self.write_checkpoint(id, parent, refresh_due).await {
                error!(error = ?e, checkpoint = %id, "Unable to write checkpoint, will retry next pass");
            }
        }

        if refresh_due {
            self.last_refresh = Some(now);
        }
    }

    async fn write_checkpoint(
        &self,
        id: &CheckpointId,
        parent: &Pod,
        refresh_due: bool,
    ) -> anyhow::Result<()> {
        let checkpoint = self.sanitizer.sanitize(parent);
        let manifest = store::encode(&checkpoint)?;

        let changed = self.store.inactive_differs(id, &manifest).await?;
        if !changed && !refresh_due {
            trace!(checkpoint = %id, "Checkpoint is up to date");
            return Ok(());
        }

        // Snapshots go first so a staged checkpoint never points at missing data
        self.snapshotter.snapshot_pod(parent).await?;
        if self.store.stage(id, &manifest).await? {
            info!(checkpoint = %id, "Wrote checkpoint");
        }
        Ok(())
    }

    async fn execute(&mut self, decisions: &Decisions) {
        for id in decisions.stop.iter() {
            match self.store.deactivate(id).await {
                Ok(true) => info!(checkpoint = %id, "Stopped checkpoint"),
                Ok(false) => trace!(checkpoint = %id, "Checkpoint already stopped"),
                Err(e) => error!(error = ?e, checkpoint = %id, "Unable to stop checkpoint"),
            }
        }

        for id in decisions.start.iter() {
            match self.store.activate(id).await {
                Ok(true) => info!(checkpoint = %id, "Started checkpoint"),
                Ok(false) => trace!(checkpoint = %id, "Checkpoint already running"),
                Err(e) => error!(error = ?e, checkpoint = %id, "Unable to start checkpoint"),
            }
        }

        for id in decisions.remove.iter() {
            match self.remove_checkpoint(id).await {
                Ok(()) => {
                    info!(checkpoint = %id, "Removed checkpoint");
                    self.states.remove(id);
                }
                Err(e) => error!(error = ?e, checkpoint = %id, "Unable to remove checkpoint"),
            }
        }
    }

    // Snapshots, then the staged manifest, then the active one. A failure leaves the state at
    // Remove and the remaining steps are retried next pass
    async fn remove_checkpoint(&self, id: &CheckpointId) -> anyhow::Result<()> {
        self.snapshotter.purge(id).await?;
        self.store.remove_inactive(id).await?;
        self.store.deactivate(id).await?;
        Ok(())
    }
}

fn changed_states<'a>(
    previous: &'a BTreeMap<CheckpointId, CheckpointState>,
    next_states: &'a BTreeMap<CheckpointId, CheckpointState>,
) -> impl Iterator<Item = (&'a CheckpointId, CheckpointState, CheckpointState)> + 'a {
    next_states.iter().filter_map(move |(id, to)| match previous.get(id) {
        Some(from) if from != to => Some((id, *from, *to)),
        _ => None,
    })
}
