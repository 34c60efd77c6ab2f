//! Batch planning
//!
//! Turns "N copies of a template" into groups of parent/child sub-operations,
//! each group sent as one batch call. A child references its parent inside
//! the same group by name (`{result=<name>:$.id}`); the position of every
//! sub-operation in the flattened request (and therefore response) array is
//! decided by [`BatchGroup::slot`], which the result parser uses as well.

use serde::{Deserialize, Serialize};

use crate::platform::BatchRequest;
use crate::templates::Template;
use crate::types::{ReplicatorError, Result};

/// Order of sub-operations inside one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum BatchLayout {
    /// parent 0, child 0, parent 1, child 1, ...
    #[default]
    Interleaved,
    /// parent 0..k, then child 0..k
    ParentsFirst,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpRole {
    Parent,
    Child,
}

/// One create inside a batch
#[derive(Debug, Clone)]
pub struct SubOperation {
    /// Position in the batch
    pub relative_index: usize,
    /// Pair this operation belongs to, within the group
    pub pair_index: usize,
    pub copy_number: u32,
    pub role: OpRole,
    /// Relative index of the sub-operation this one references
    pub depends_on: Option<usize>,
    pub request: BatchRequest,
}

/// Where the pairs of a plan are created
#[derive(Debug, Clone)]
pub struct PlanTarget<'a> {
    /// Owner scope for the new objects (ad account)
    pub owner: &'a str,
    /// Container the parents link to
    pub container_id: &'a str,
    pub pixel_id: Option<&'a str>,
}

/// Sub-operations sent as one batch call
#[derive(Debug, Clone)]
pub struct BatchGroup {
    pub sequence: usize,
    pub layout: BatchLayout,
    pub operations: Vec<SubOperation>,
    pairs: usize,
}

impl BatchGroup {
    pub fn pair_count(&self) -> usize {
        self.pairs
    }

    /// Number of sub-operations (calls charged against quota)
    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// Position of `pair`'s `role` operation in the request and response arrays
    pub fn slot(&self, pair: usize, role: OpRole) -> usize {
        slot(self.layout, self.pairs, pair, role)
    }

    pub fn copy_number(&self, pair: usize) -> u32 {
        self.operations[self.slot(pair, OpRole::Parent)].copy_number
    }

    pub fn requests(&self) -> Vec<BatchRequest> {
        self.operations.iter().map(|op| op.request.clone()).collect()
    }
}

fn slot(layout: BatchLayout, pairs: usize, pair: usize, role: OpRole) -> usize {
    match (layout, role) {
        (BatchLayout::Interleaved, OpRole::Parent) => pair * 2,
        (BatchLayout::Interleaved, OpRole::Child) => pair * 2 + 1,
        (BatchLayout::ParentsFirst, OpRole::Parent) => pair,
        (BatchLayout::ParentsFirst, OpRole::Child) => pairs + pair,
    }
}

/// Pairs that fit in one call of `max_ops_per_call` sub-operations
pub fn pairs_per_call(max_ops_per_call: usize) -> usize {
    max_ops_per_call / 2
}

/// Plan `count` copies numbered from `first_copy`
pub fn plan(
    template: &Template,
    target: &PlanTarget<'_>,
    first_copy: u32,
    count: u32,
    max_ops_per_call: usize,
    layout: BatchLayout,
) -> Result<Vec<BatchGroup>> {
    let per_call = pairs_per_call(max_ops_per_call);
    if per_call == 0 {
        return Err(ReplicatorError::Config(format!(
            "max_ops_per_call {} cannot hold a parent/child pair",
            max_ops_per_call
        )));
    }

    let copies: Vec<u32> = (0..count).map(|i| first_copy + i).collect();
    let groups = copies
        .chunks(per_call)
        .enumerate()
        .map(|(sequence, chunk)| build_group(template, target, sequence, chunk, layout))
        .collect();
    Ok(groups)
}

fn build_group(
    template: &Template,
    target: &PlanTarget<'_>,
    sequence: usize,
    copies: &[u32],
    layout: BatchLayout,
) -> BatchGroup {
    let pairs = copies.len();
    let mut slots: Vec<Option<SubOperation>> = vec![None; pairs * 2];

    for (pair_index, &copy_number) in copies.iter().enumerate() {
        let parent_slot = slot(layout, pairs, pair_index, OpRole::Parent);
        let child_slot = slot(layout, pairs, pair_index, OpRole::Child);
        let parent_name = format!("parent_{}", pair_index);

        slots[parent_slot] = Some(SubOperation {
            relative_index: parent_slot,
            pair_index,
            copy_number,
            role: OpRole::Parent,
            depends_on: None,
            request: BatchRequest {
                method: "POST".to_string(),
                relative_url: format!("{}/{}", target.owner, template.parent.edge),
                name: Some(parent_name.clone()),
                body: template.parent_body(target.container_id, copy_number, target.pixel_id),
            },
        });

        let back_reference = format!("{{result={}:$.id}}", parent_name);
        slots[child_slot] = Some(SubOperation {
            relative_index: child_slot,
            pair_index,
            copy_number,
            role: OpRole::Child,
            depends_on: Some(parent_slot),
            request: BatchRequest {
                method: "POST".to_string(),
                relative_url: format!("{}/{}", target.owner, template.child.edge),
                name: None,
                body: template.child_body(&back_reference, copy_number),
            },
        });
    }

    BatchGroup {
        sequence,
        layout,
        operations: slots.into_iter().flatten().collect(),
        pairs,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::tests::sample_template;
    use serde_json::json;

    fn target() -> PlanTarget<'static> {
        PlanTarget {
            owner: "act_1",
            container_id: "c-1",
            pixel_id: None,
        }
    }

    #[test]
    fn test_forty_nine_copies_make_two_calls() {
        let groups = plan(&sample_template(), &target(), 1, 49, 50, BatchLayout::Interleaved).unwrap();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].pair_count(), 25);
        assert_eq!(groups[1].pair_count(), 24);
        assert_eq!(groups[0].len(), 50);
        assert_eq!(groups[1].len(), 48);
        assert_eq!(groups[1].copy_number(0), 26);
        assert_eq!(groups[1].copy_number(23), 49);
    }

    #[test]
    fn test_child_references_its_own_parent_in_every_layout() {
        for layout in [BatchLayout::Interleaved, BatchLayout::ParentsFirst] {
            let groups = plan(&sample_template(), &target(), 1, 3, 50, layout).unwrap();
            let group = &groups[0];

            for pair in 0..group.pair_count() {
                let parent = &group.operations[group.slot(pair, OpRole::Parent)];
                let child = &group.operations[group.slot(pair, OpRole::Child)];

                assert_eq!(parent.role, OpRole::Parent);
                assert_eq!(child.role, OpRole::Child);
                assert_eq!(child.depends_on, Some(parent.relative_index));
                assert_eq!(parent.pair_index, pair);

                let name = parent.request.name.clone().unwrap();
                assert_eq!(
                    child.request.body["adset_id"],
                    json!(format!("{{result={}:$.id}}", name))
                );
            }
        }
    }

    #[test]
    fn test_operations_are_in_slot_order() {
        let groups = plan(&sample_template(), &target(), 1, 2, 50, BatchLayout::ParentsFirst).unwrap();
        let roles: Vec<OpRole> = groups[0].operations.iter().map(|o| o.role).collect();
        assert_eq!(
            roles,
            vec![OpRole::Parent, OpRole::Parent, OpRole::Child, OpRole::Child]
        );
        for (index, op) in groups[0].operations.iter().enumerate() {
            assert_eq!(op.relative_index, index);
        }
    }

    #[test]
    fn test_rejects_calls_too_small_for_a_pair() {
        let result = plan(&sample_template(), &target(), 1, 5, 1, BatchLayout::Interleaved);
        assert!(matches!(result, Err(ReplicatorError::Config(_))));
    }

    #[test]
    fn test_zero_copies_plan_nothing() {
        let groups = plan(&sample_template(), &target(), 1, 0, 50, BatchLayout::Interleaved).unwrap();
        assert!(groups.is_empty());
    }
}
