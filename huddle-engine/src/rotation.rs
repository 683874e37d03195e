//! RotationScheduler - fair "whose turn is it" cooldowns within a cohort
//!
//! When a member acts, every other member on cooldown moves one step closer
//! to eligibility and the actor goes to the back of the line
//! (`cohort_size - 1`). Every `remaining` stays within `[0, cohort_size - 1]`,
//! including right after members join or leave.
//!
//! The table is persisted as the payload of the cohort's backing resource
//! and only the elected writer for that resource mutates it.

use crate::election::{AccessPolicies, WriteDecision, WriteGate};
use crate::error::EngineError;
use huddle_model::{DocumentStore, Fields, PeerId, ResourceId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Result of a rotation mutation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RotationOutcome {
    /// The action was recorded; `remaining` is the actor's new cooldown.
    Recorded { remaining: u32 },
    /// An administrative change was applied.
    Applied,
    /// The entity is still cooling down or is downed.
    Ineligible { remaining: u32, downed: bool },
    /// The entity is not a member of the cohort.
    UnknownEntity,
    /// Another peer owns the cohort's writes (or nobody may write it).
    NotElected { writer: Option<PeerId> },
}

/// Cooldown state of one cohort.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CooldownTable {
    #[serde(default)]
    remaining: BTreeMap<ResourceId, u32>,
    #[serde(default)]
    downed: BTreeSet<ResourceId>,
}

impl CooldownTable {
    pub fn new(members: impl IntoIterator<Item = ResourceId>) -> Self {
        Self {
            remaining: members.into_iter().map(|m| (m, 0)).collect(),
            downed: BTreeSet::new(),
        }
    }

    pub fn cohort_size(&self) -> usize {
        self.remaining.len()
    }

    /// Upper bound for any member's cooldown.
    pub fn max_remaining(&self) -> u32 {
        u32::try_from(self.cohort_size().saturating_sub(1)).unwrap_or(u32::MAX)
    }

    pub fn members(&self) -> impl Iterator<Item = &ResourceId> {
        self.remaining.keys()
    }

    pub fn is_member(&self, entity: &ResourceId) -> bool {
        self.remaining.contains_key(entity)
    }

    pub fn remaining(&self, entity: &ResourceId) -> Option<u32> {
        self.remaining.get(entity).copied()
    }

    pub fn is_downed(&self, entity: &ResourceId) -> bool {
        self.downed.contains(entity)
    }

    pub fn is_eligible(&self, entity: &ResourceId) -> bool {
        self.remaining(entity) == Some(0) && !self.is_downed(entity)
    }

    /// Apply one action by `entity`.
    ///
    /// Only an eligible member may act; anything else leaves the table untouched.
    pub fn record_action(&mut self, entity: &ResourceId) -> RotationOutcome {
        let Some(current) = self.remaining(entity) else {
            return RotationOutcome::UnknownEntity;
        };
        if !self.is_eligible(entity) {
            return RotationOutcome::Ineligible { remaining: current, downed: self.is_downed(entity) };
        }

        for (member, remaining) in self.remaining.iter_mut() {
            if member != entity {
                *remaining = remaining.saturating_sub(1);
            }
        }
        let cooldown = self.max_remaining();
        self.remaining.insert(entity.clone(), cooldown);
        RotationOutcome::Recorded { remaining: cooldown }
    }

    /// Replace the cohort membership and re-clamp every cooldown.
    pub fn set_members(&mut self, members: impl IntoIterator<Item = ResourceId>) {
        let members: BTreeSet<ResourceId> = members.into_iter().collect();
        self.remaining.retain(|m, _| members.contains(m));
        self.downed.retain(|m| members.contains(m));
        for member in members {
            self.remaining.entry(member).or_insert(0);
        }
        let bound = self.max_remaining();
        for remaining in self.remaining.values_mut() {
            *remaining = (*remaining).min(bound);
        }
    }

    /// Returns `false` if `entity` is not a member.
    pub fn set_downed(&mut self, entity: &ResourceId, downed: bool) -> bool {
        if !self.is_member(entity) {
            return false;
        }
        if downed {
            self.downed.insert(entity.clone());
        } else {
            self.downed.remove(entity);
        }
        true
    }

    /// Make `entity` eligible again. Returns `false` if it is not a member.
    pub fn reset(&mut self, entity: &ResourceId) -> bool {
        match self.remaining.get_mut(entity) {
            Some(remaining) => {
                *remaining = 0;
                true
            }
            None => false,
        }
    }

    pub fn from_fields(fields: Fields) -> Result<Self, EngineError> {
        let mut table: Self = serde_json::from_value(serde_json::Value::Object(fields))?;
        // A hand-edited payload may carry out-of-range values
        let bound = table.max_remaining();
        for remaining in table.remaining.values_mut() {
            *remaining = (*remaining).min(bound);
        }
        Ok(table)
    }

    pub fn to_fields(&self) -> Result<Fields, EngineError> {
        match serde_json::to_value(self)? {
            serde_json::Value::Object(fields) => Ok(fields),
            other => Err(EngineError::Serialization(format!("cooldown table is not an object: {}", other))),
        }
    }
}

/// Store-backed rotation for one cohort resource.
pub struct RotationScheduler {
    cohort_id: ResourceId,
    store: Arc<dyn DocumentStore>,
    gate: Arc<WriteGate>,
    policies: AccessPolicies,
    write_lock: Mutex<()>,
}

impl RotationScheduler {
    pub fn new(
        cohort_id: ResourceId,
        store: Arc<dyn DocumentStore>,
        gate: Arc<WriteGate>,
        policies: AccessPolicies,
    ) -> Self {
        Self { cohort_id, store, gate, policies, write_lock: Mutex::new(()) }
    }

    pub fn cohort_id(&self) -> &ResourceId {
        &self.cohort_id
    }

    pub fn policies(&self) -> &AccessPolicies {
        &self.policies
    }

    /// Whether the local peer currently applies this cohort's transitions.
    pub fn is_writer(&self) -> bool {
        self.gate.decide(&self.cohort_id).may_write()
    }

    /// Committed table, empty if the cohort was never written.
    pub async fn table(&self) -> Result<CooldownTable, EngineError> {
        match self.store.read(&self.cohort_id).await? {
            Some(fields) => CooldownTable::from_fields(fields),
            None => Ok(CooldownTable::default()),
        }
    }

    pub async fn is_eligible(&self, entity: &ResourceId) -> Result<bool, EngineError> {
        Ok(self.table().await?.is_eligible(entity))
    }

    pub async fn record_action(&self, entity: &ResourceId) -> Result<RotationOutcome, EngineError> {
        self.mutate(|table| table.record_action(entity)).await
    }

    pub async fn set_members(&self, members: Vec<ResourceId>) -> Result<RotationOutcome, EngineError> {
        self.mutate(move |table| {
            table.set_members(members);
            RotationOutcome::Applied
        })
        .await
    }

    pub async fn set_downed(&self, entity: &ResourceId, downed: bool) -> Result<RotationOutcome, EngineError> {
        self.mutate(|table| {
            if table.set_downed(entity, downed) {
                RotationOutcome::Applied
            } else {
                RotationOutcome::UnknownEntity
            }
        })
        .await
    }

    pub async fn reset(&self, entity: &ResourceId) -> Result<RotationOutcome, EngineError> {
        self.mutate(|table| {
            if table.reset(entity) {
                RotationOutcome::Applied
            } else {
                RotationOutcome::UnknownEntity
            }
        })
        .await
    }

    /// Gate, read, transition, and write back if anything changed.
    async fn mutate(&self, transition: impl FnOnce(&mut CooldownTable) -> RotationOutcome) -> Result<RotationOutcome, EngineError> {
        let decision = self.gate.decide(&self.cohort_id);
        if !decision.may_write() {
            tracing::debug!(cohort = %self.cohort_id, ?decision, "Not the cohort writer, skipping");
            let writer = match decision {
                WriteDecision::NotElected { writer } => Some(writer),
                _ => None,
            };
            return Ok(RotationOutcome::NotElected { writer });
        }

        let _guard = self.write_lock.lock().await;
        let before = self.table().await?;
        let mut after = before.clone();
        let outcome = transition(&mut after);
        if after != before {
            self.store.write(&self.cohort_id, after.to_fields()?).await?;
            tracing::debug!(cohort = %self.cohort_id, ?outcome, "Cohort updated");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(s: &str) -> ResourceId {
        ResourceId::new(s)
    }

    fn cohort(names: &[&str]) -> CooldownTable {
        CooldownTable::new(names.iter().map(|n| id(n)))
    }

    #[test]
    fn test_four_member_rotation() {
        let mut table = cohort(&["a", "b", "c", "d"]);

        assert_eq!(table.record_action(&id("a")), RotationOutcome::Recorded { remaining: 3 });
        assert_eq!(table.remaining(&id("b")), Some(0));
        assert_eq!(table.remaining(&id("c")), Some(0));

        assert_eq!(table.record_action(&id("b")), RotationOutcome::Recorded { remaining: 3 });
        assert_eq!(table.remaining(&id("a")), Some(2));
        assert_eq!(table.remaining(&id("d")), Some(0));

        let before = table.clone();
        assert_eq!(
            table.record_action(&id("a")),
            RotationOutcome::Ineligible { remaining: 2, downed: false }
        );
        assert_eq!(table, before);

        assert!(table.reset(&id("a")));
        assert_eq!(table.record_action(&id("a")), RotationOutcome::Recorded { remaining: 3 });
        assert_eq!(table.remaining(&id("b")), Some(2));
    }

    #[test]
    fn test_downed_and_unknown_entities() {
        let mut table = cohort(&["a", "b"]);
        assert!(table.set_downed(&id("a"), true));
        assert!(!table.is_eligible(&id("a")));
        assert_eq!(table.record_action(&id("a")), RotationOutcome::Ineligible { remaining: 0, downed: true });
        assert_eq!(table.record_action(&id("z")), RotationOutcome::UnknownEntity);
        assert!(!table.set_downed(&id("z"), true));
    }

    #[test]
    fn test_shrinking_cohort_reclamps() {
        let mut table = cohort(&["a", "b", "c", "d"]);
        table.record_action(&id("a"));
        table.set_members([id("a"), id("b")]);
        assert_eq!(table.cohort_size(), 2);
        assert_eq!(table.remaining(&id("a")), Some(1));
        assert!(!table.is_member(&id("c")));

        table.set_members([id("a")]);
        assert_eq!(table.remaining(&id("a")), Some(0));
        assert_eq!(table.record_action(&id("a")), RotationOutcome::Recorded { remaining: 0 });
    }

    #[test]
    fn test_fields_round_trip_clamps_bad_values() {
        let mut fields = Fields::new();
        fields.insert("remaining".into(), serde_json::json!({"a": 9, "b": 0}));
        let table = CooldownTable::from_fields(fields).unwrap();
        assert_eq!(table.remaining(&id("a")), Some(1));
        assert_eq!(CooldownTable::from_fields(table.to_fields().unwrap()).unwrap(), table);
    }

    #[derive(Clone, Debug)]
    enum Step {
        Act(usize),
        Resize(usize),
        Down(usize, bool),
        Reset(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            4 => (0usize..10).prop_map(Step::Act),
            1 => (1usize..10).prop_map(Step::Resize),
            1 => (0usize..10, any::<bool>()).prop_map(|(i, d)| Step::Down(i, d)),
            1 => (0usize..10).prop_map(Step::Reset),
        ]
    }

    fn member(i: usize) -> ResourceId {
        ResourceId::new(format!("e{}", i))
    }

    proptest! {
        #[test]
        fn cooldowns_stay_in_bounds(size in 1usize..10, steps in proptest::collection::vec(step(), 0..64)) {
            let mut table = CooldownTable::new((0..size).map(member));
            for step in steps {
                match step {
                    Step::Act(i) => { table.record_action(&member(i)); }
                    Step::Resize(n) => table.set_members((0..n).map(member)),
                    Step::Down(i, d) => { table.set_downed(&member(i), d); }
                    Step::Reset(i) => { table.reset(&member(i)); }
                }
                let bound = table.max_remaining();
                for m in table.members() {
                    let remaining = table.remaining(m).unwrap();
                    prop_assert!(remaining <= bound, "{} has {} > {}", m, remaining, bound);
                }
            }
        }

        #[test]
        fn exactly_one_member_at_max_after_an_action(size in 2usize..10, actor in 0usize..10) {
            let mut table = CooldownTable::new((0..size).map(member));
            let actor = member(actor % size);
            prop_assert_eq!(table.record_action(&actor), RotationOutcome::Recorded { remaining: (size - 1) as u32 });
            let at_max = table.members().filter(|m| table.remaining(m) == Some(table.max_remaining())).count();
            prop_assert_eq!(at_max, 1);
        }
    }
}
