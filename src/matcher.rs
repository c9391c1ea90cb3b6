//! Greedy assignment of connected heads to profile constraints.
//!
//! Each constraint, in profile order, claims the first unclaimed eligible
//! head in model order. There is no backtracking: existing configurations
//! rely on named outputs being tried before wildcards.

use std::rc::Rc;

use crate::{
    model::{DisplayModel, Head},
    profile::{OutputConstraint, Profile, WILDCARD},
};

/// `constraints[i]` is the index, inside the profile, of the constraint
/// claimed by the i-th head of the model.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Assignment {
    constraints: Vec<usize>,
}

impl Assignment {
    pub fn constraint_for_head(&self, head_index: usize) -> Option<usize> {
        self.constraints.get(head_index).copied()
    }

    /// `(head index, constraint index)` pairs in model order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.constraints.iter().copied().enumerate()
    }

    pub fn len(&self) -> usize {
        self.constraints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.constraints.is_empty()
    }
}

pub fn output_matches_head(output: &OutputConstraint, head: &Head) -> bool {
    output.selector == WILDCARD || output.selector == head.name || output.selector == head.identity()
}

pub fn match_profile(model: &DisplayModel, profile: &Profile) -> Option<Assignment> {
    let heads = model.heads();
    if profile.outputs().len() != heads.len() {
        return None;
    }

    let mut claimed: Vec<Option<usize>> = vec![None; heads.len()];
    for (constraint_index, output) in profile.outputs().iter().enumerate() {
        let head_index = heads
            .iter()
            .enumerate()
            .find(|(index, head)| claimed[*index].is_none() && output_matches_head(output, head))
            .map(|(index, _)| index)?;
        claimed[head_index] = Some(constraint_index);
    }

    claimed
        .into_iter()
        .collect::<Option<Vec<_>>>()
        .map(|constraints| Assignment { constraints })
}

/// First profile, in declaration order, that matches the model.
pub fn match_best(model: &DisplayModel, profiles: &[Rc<Profile>]) -> Option<(Rc<Profile>, Assignment)> {
    profiles.iter().find_map(|profile| {
        match_profile(model, profile).map(|assignment| (Rc::clone(profile), assignment))
    })
}
