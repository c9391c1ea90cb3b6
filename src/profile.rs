//! Parsed profiles. A [`ProfileStore`] is built once per (re)load and never
//! mutated afterwards; profiles are shared by `Rc` so an in-flight
//! transaction can outlive a reload.

use std::{fmt, rc::Rc};

use crate::model::{Position, Transform};

pub const WILDCARD: &str = "*";

/// Desired mode: exact size plus an optional refresh target in mHz.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModeRequest {
    pub width: i32,
    pub height: i32,
    pub refresh: Option<i32>,
}

impl fmt::Display for ModeRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)?;
        if let Some(refresh) = self.refresh {
            write!(f, "@{}Hz", refresh as f64 / 1000.0)?;
        }
        Ok(())
    }
}

/// One `output` clause of a profile. Fields left `None` are not touched when
/// the profile is applied.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct OutputConstraint {
    pub selector: String,
    pub enabled: Option<bool>,
    pub mode: Option<ModeRequest>,
    pub position: Option<Position>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    pub adaptive_sync: Option<bool>,
}

impl OutputConstraint {
    pub fn new(selector: impl Into<String>) -> Self {
        Self {
            selector: selector.into(),
            ..Self::default()
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.selector == WILDCARD
    }
}

#[derive(Debug, PartialEq)]
pub struct Profile {
    pub name: String,
    outputs: Vec<OutputConstraint>,
    pub commands: Vec<String>,
}

impl Profile {
    /// Wildcard constraints are moved behind every named one, keeping the
    /// declared order inside each group.
    pub fn new(name: impl Into<String>, outputs: Vec<OutputConstraint>, commands: Vec<String>) -> Self {
        let (mut ordered, wildcards): (Vec<_>, Vec<_>) =
            outputs.into_iter().partition(|output| !output.is_wildcard());
        ordered.extend(wildcards);
        Self {
            name: name.into(),
            outputs: ordered,
            commands,
        }
    }

    pub fn outputs(&self) -> &[OutputConstraint] {
        &self.outputs
    }
}

#[derive(Debug, Default)]
pub struct ProfileStore {
    profiles: Vec<Rc<Profile>>,
}

impl ProfileStore {
    pub fn new(profiles: Vec<Profile>) -> Self {
        Self {
            profiles: profiles.into_iter().map(Rc::new).collect(),
        }
    }

    /// Profiles in declaration order.
    pub fn profiles(&self) -> &[Rc<Profile>] {
        &self.profiles
    }

    pub fn find(&self, name: &str) -> Option<&Rc<Profile>> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn contains(&self, profile: &Rc<Profile>) -> bool {
        self.profiles.iter().any(|candidate| Rc::ptr_eq(candidate, profile))
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}
