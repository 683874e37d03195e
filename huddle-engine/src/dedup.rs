//! DedupReconciliationPass - collapse duplicate sub-objects to one canonical instance
//!
//! Runs before a derived recompute so the recompute always sees a clean set.
//! For each logical key:
//! - one or more of ours: keep the first, delete every other instance
//! - only foreign ones: delete them all, and create a fresh canonical
//!   instance if the underlying condition is active
//!
//! Applying a plan and running the pass again yields an empty plan.

use huddle_model::{DocumentStore, Fields, NewSubObject, Origin, ResourceId, StoreError, SubObject, SubObjectId};
use std::collections::{BTreeMap, HashMap};

/// Deletions and creations that bring a resource to one canonical instance per key.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ReconcilePlan {
    pub to_delete: Vec<SubObjectId>,
    pub to_create: Vec<NewSubObject>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_delete.is_empty() && self.to_create.is_empty()
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct DedupReconciliationPass;

impl DedupReconciliationPass {
    pub fn new() -> Self {
        Self
    }

    /// Plan the dedup of `sub_objects` (in store order).
    ///
    /// `active` maps each currently active condition to the payload its
    /// canonical instance should carry.
    pub fn reconcile(
        &self,
        resource_id: &ResourceId,
        sub_objects: &[SubObject],
        active: &BTreeMap<String, Fields>,
    ) -> ReconcilePlan {
        let mut groups: Vec<(&str, Vec<&SubObject>)> = Vec::new();
        let mut index: HashMap<&str, usize> = HashMap::new();
        for sub in sub_objects {
            let key = sub.logical_key.as_str();
            match index.get(key) {
                Some(&i) => groups[i].1.push(sub),
                None => {
                    index.insert(key, groups.len());
                    groups.push((key, vec![sub]));
                }
            }
        }

        let mut plan = ReconcilePlan::default();
        for (key, members) in &groups {
            let canonical = members.iter().find(|s| s.origin() == Origin::Ours);
            match canonical {
                Some(keep) => {
                    plan.to_delete.extend(
                        members.iter().filter(|s| s.id != keep.id).map(|s| s.id.clone()),
                    );
                }
                None => {
                    plan.to_delete.extend(members.iter().map(|s| s.id.clone()));
                    if let Some(fields) = active.get(*key) {
                        plan.to_create.push(NewSubObject::canonical(*key, fields.clone()));
                    }
                }
            }
        }

        // Active conditions with no instance at all
        for (key, fields) in active {
            if !index.contains_key(key.as_str()) {
                plan.to_create.push(NewSubObject::canonical(key.clone(), fields.clone()));
            }
        }

        if !plan.is_empty() {
            tracing::debug!(
                resource_id = %resource_id,
                delete = plan.to_delete.len(),
                create = plan.to_create.len(),
                "Dedup plan"
            );
        }
        plan
    }

    /// Apply a plan: deletions first, then creations.
    pub async fn apply(
        &self,
        store: &dyn DocumentStore,
        resource_id: &ResourceId,
        plan: ReconcilePlan,
    ) -> Result<(), StoreError> {
        if !plan.to_delete.is_empty() {
            store.delete_sub_objects(resource_id, &plan.to_delete).await?;
        }
        if !plan.to_create.is_empty() {
            store.create_sub_objects(resource_id, plan.to_create).await?;
        }
        Ok(())
    }
}
