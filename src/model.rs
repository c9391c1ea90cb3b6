//! In-memory registry of connected heads and their modes.
//!
//! Every mutation is driven by an output-management notification. Heads are
//! owned by [`DisplayModel`], modes by their [`Head`]; the current mode is a
//! [`ModeId`] key that is re-resolved on every use.

use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HeadId(u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModeId(u32);

impl fmt::Display for HeadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "head#{}", self.0)
    }
}

impl fmt::Display for ModeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mode#{}", self.0)
    }
}

/// Rotation and flip of an output, numbered as in `wl_output.transform`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Transform {
    #[default]
    Normal,
    _90,
    _180,
    _270,
    Flipped,
    Flipped90,
    Flipped180,
    Flipped270,
}

impl Transform {
    pub fn from_raw(raw: u32) -> Option<Self> {
        Some(match raw {
            0 => Transform::Normal,
            1 => Transform::_90,
            2 => Transform::_180,
            3 => Transform::_270,
            4 => Transform::Flipped,
            5 => Transform::Flipped90,
            6 => Transform::Flipped180,
            7 => Transform::Flipped270,
            _ => return None,
        })
    }

    pub fn to_raw(self) -> u32 {
        match self {
            Transform::Normal => 0,
            Transform::_90 => 1,
            Transform::_180 => 2,
            Transform::_270 => 3,
            Transform::Flipped => 4,
            Transform::Flipped90 => 5,
            Transform::Flipped180 => 6,
            Transform::Flipped270 => 7,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
}

impl Position {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Mode {
    id: ModeId,
    pub width: i32,
    pub height: i32,
    /// Refresh rate in mHz.
    pub refresh: i32,
    pub preferred: bool,
}

impl Mode {
    pub fn id(&self) -> ModeId {
        self.id
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}@{:.3}Hz",
            self.width,
            self.height,
            self.refresh as f64 / 1000.0
        )
    }
}

#[derive(Clone, Debug)]
pub struct Head {
    id: HeadId,
    pub name: String,
    pub description: String,
    pub make: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    /// Physical size in millimeters.
    pub physical_size: (i32, i32),
    pub position: Position,
    pub transform: Transform,
    pub scale: f64,
    pub adaptive_sync: bool,
    enabled: bool,
    current_mode: Option<ModeId>,
    modes: Vec<Mode>,
}

impl Head {
    fn new(id: HeadId) -> Self {
        Self {
            id,
            name: String::new(),
            description: String::new(),
            make: None,
            model: None,
            serial_number: None,
            physical_size: (0, 0),
            position: Position::default(),
            transform: Transform::Normal,
            scale: 1.0,
            adaptive_sync: false,
            enabled: false,
            current_mode: None,
            modes: Vec::new(),
        }
    }

    pub fn id(&self) -> HeadId {
        self.id
    }

    /// `"<make> <model> <serial>"`, the form profile selectors are written against.
    pub fn identity(&self) -> String {
        const UNKNOWN: &str = "Unknown";
        format!(
            "{} {} {}",
            self.make.as_deref().unwrap_or(UNKNOWN),
            self.model.as_deref().unwrap_or(UNKNOWN),
            self.serial_number.as_deref().unwrap_or(UNKNOWN)
        )
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
        if !enabled {
            self.current_mode = None;
        }
    }

    pub fn current_mode(&self) -> Option<&Mode> {
        self.current_mode.and_then(|id| self.mode(id))
    }

    /// Points the current mode at one of this head's modes. An unknown id
    /// clears the reference.
    pub fn set_current_mode(&mut self, id: ModeId) {
        if self.mode(id).is_some() {
            self.current_mode = Some(id);
        } else {
            tracing::warn!(head = %self.name, mode = %id, "received unknown current mode");
            self.current_mode = None;
        }
    }

    pub fn clear_current_mode(&mut self) {
        self.current_mode = None;
    }

    pub fn modes(&self) -> &[Mode] {
        &self.modes
    }

    pub fn mode(&self, id: ModeId) -> Option<&Mode> {
        self.modes.iter().find(|mode| mode.id == id)
    }

    pub fn mode_mut(&mut self, id: ModeId) -> Option<&mut Mode> {
        self.modes.iter_mut().find(|mode| mode.id == id)
    }

    fn push_mode(&mut self, id: ModeId) {
        self.modes.push(Mode {
            id,
            width: 0,
            height: 0,
            refresh: 0,
            preferred: false,
        });
    }

    pub fn remove_mode(&mut self, id: ModeId) -> Option<Mode> {
        let index = self.modes.iter().position(|mode| mode.id == id)?;
        if self.current_mode == Some(id) {
            self.current_mode = None;
        }
        Some(self.modes.remove(index))
    }
}

#[derive(Debug, Default)]
pub struct DisplayModel {
    heads: Vec<Head>,
    next_id: u32,
}

impl DisplayModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_head(&mut self) -> HeadId {
        let id = HeadId(self.allocate_id());
        self.heads.push(Head::new(id));
        id
    }

    /// Drops the head together with all of its modes.
    pub fn remove_head(&mut self, id: HeadId) -> Option<Head> {
        let index = self.heads.iter().position(|head| head.id == id)?;
        Some(self.heads.remove(index))
    }

    /// Appends an empty mode to `head`; size, refresh and preferred arrive
    /// in follow-up notifications.
    pub fn add_mode(&mut self, head: HeadId) -> Option<ModeId> {
        let id = ModeId(self.allocate_id());
        self.head_mut(head)?.push_mode(id);
        Some(id)
    }

    pub fn remove_mode(&mut self, head: HeadId, mode: ModeId) -> Option<Mode> {
        self.head_mut(head)?.remove_mode(mode)
    }

    pub fn head(&self, id: HeadId) -> Option<&Head> {
        self.heads.iter().find(|head| head.id == id)
    }

    pub fn head_mut(&mut self, id: HeadId) -> Option<&mut Head> {
        self.heads.iter_mut().find(|head| head.id == id)
    }

    /// Heads in model order, the order the matcher scans them in.
    pub fn heads(&self) -> &[Head] {
        &self.heads
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with_modes(model: &mut DisplayModel, name: &str, count: usize) -> (HeadId, Vec<ModeId>) {
        let head = model.add_head();
        model.head_mut(head).unwrap().name = name.to_owned();
        let modes = (0..count).map(|_| model.add_mode(head).unwrap()).collect();
        (head, modes)
    }

    #[test]
    fn identity_substitutes_unknown_for_missing_fields() {
        let mut model = DisplayModel::new();
        let id = model.add_head();
        let head = model.head_mut(id).unwrap();
        head.model = Some("X".to_owned());

        assert_eq!(head.identity(), "Unknown X Unknown");

        head.make = Some("Dell Inc.".to_owned());
        head.serial_number = Some("ABC123".to_owned());
        assert_eq!(head.identity(), "Dell Inc. X ABC123");
    }

    #[test]
    fn new_head_defaults_to_unit_scale() {
        let mut model = DisplayModel::new();
        let id = model.add_head();
        let head = model.head(id).unwrap();
        assert_eq!(head.scale, 1.0);
        assert!(!head.enabled());
        assert!(head.current_mode().is_none());
    }

    #[test]
    fn disabling_clears_current_mode() {
        let mut model = DisplayModel::new();
        let (id, modes) = head_with_modes(&mut model, "DP-1", 2);
        let head = model.head_mut(id).unwrap();
        head.set_enabled(true);
        head.set_current_mode(modes[1]);
        assert_eq!(head.current_mode().map(Mode::id), Some(modes[1]));

        head.set_enabled(false);
        assert!(head.current_mode().is_none());
    }

    #[test]
    fn unknown_current_mode_clears_reference() {
        let mut model = DisplayModel::new();
        let (first, first_modes) = head_with_modes(&mut model, "DP-1", 1);
        let (second, second_modes) = head_with_modes(&mut model, "DP-2", 1);

        let head = model.head_mut(first).unwrap();
        head.set_current_mode(first_modes[0]);
        head.set_current_mode(second_modes[0]);
        assert!(head.current_mode().is_none());
        assert!(model.head(second).unwrap().current_mode().is_none());
    }

    #[test]
    fn removing_current_mode_clears_reference() {
        let mut model = DisplayModel::new();
        let (id, modes) = head_with_modes(&mut model, "DP-1", 2);
        model.head_mut(id).unwrap().set_current_mode(modes[0]);

        let removed = model.remove_mode(id, modes[0]).unwrap();
        assert_eq!(removed.id(), modes[0]);

        let head = model.head(id).unwrap();
        assert!(head.current_mode().is_none());
        assert_eq!(head.modes().len(), 1);
    }

    #[test]
    fn heads_keep_insertion_order_and_removal_drops_modes() {
        let mut model = DisplayModel::new();
        let (a, _) = head_with_modes(&mut model, "A", 3);
        let (b, _) = head_with_modes(&mut model, "B", 1);
        let (c, _) = head_with_modes(&mut model, "C", 0);

        let names: Vec<_> = model.heads().iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, ["A", "B", "C"]);

        let removed = model.remove_head(a).unwrap();
        assert_eq!(removed.modes().len(), 3);
        assert_eq!(model.len(), 2);
        assert!(model.head(a).is_none());
        assert!(model.add_mode(a).is_none());
        assert_eq!(model.heads()[0].id(), b);
        assert_eq!(model.heads()[1].id(), c);
    }
}
