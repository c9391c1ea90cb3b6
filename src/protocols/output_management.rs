//! Client side of `wlr-output-management-unstable-v1`.
//!
//! Head and mode notifications are folded into the session's
//! [`DisplayModel`](crate::model::DisplayModel); [`WlrOutputs`] keeps the
//! protocol objects behind each [`HeadId`]/[`ModeId`] and turns a
//! [`Transaction`] into a configuration request.

use std::collections::HashMap;

use wayland_client::{
    Connection, Dispatch, Proxy, QueueHandle, WEnum,
    backend::ObjectId,
    event_created_child,
    protocol::{wl_output, wl_registry},
};
use wayland_protocols_wlr::output_management::v1::client::{
    zwlr_output_configuration_head_v1::ZwlrOutputConfigurationHeadV1,
    zwlr_output_configuration_v1::{self, ZwlrOutputConfigurationV1},
    zwlr_output_head_v1::{self, AdaptiveSyncState, ZwlrOutputHeadV1},
    zwlr_output_manager_v1::{self, ZwlrOutputManagerV1},
    zwlr_output_mode_v1::{self, ZwlrOutputModeV1},
};

use crate::{
    PerchError, Result,
    apply::{HeadConfig, Outcome, OutputManager, Transaction, TransactionId},
    model::{HeadId, ModeId, Position, Transform},
    state::Perch,
};

const MANAGER_MIN_VERSION: u32 = 2;
const MANAGER_MAX_VERSION: u32 = 4;
/// First version with `adaptive_sync` on heads and configuration heads.
const ADAPTIVE_SYNC_VERSION: u32 = 4;
/// First version where heads and modes have a `release` request.
const RELEASE_VERSION: u32 = 3;

fn bind_version(advertised: u32) -> Option<u32> {
    (advertised >= MANAGER_MIN_VERSION).then(|| advertised.min(MANAGER_MAX_VERSION))
}

fn transform_from_wire(transform: WEnum<wl_output::Transform>) -> Option<Transform> {
    let raw = match transform {
        WEnum::Value(transform) => u32::from(transform),
        WEnum::Unknown(raw) => raw,
    };
    Transform::from_raw(raw)
}

fn transform_to_wire(transform: Transform) -> Option<wl_output::Transform> {
    wl_output::Transform::try_from(transform.to_raw()).ok()
}

pub struct WlrOutputs {
    qh: QueueHandle<Perch>,
    manager: Option<ZwlrOutputManagerV1>,
    version: u32,
    heads: HashMap<HeadId, ZwlrOutputHeadV1>,
    modes: HashMap<ModeId, ZwlrOutputModeV1>,
    head_ids: HashMap<ObjectId, HeadId>,
    mode_ids: HashMap<ObjectId, (HeadId, ModeId)>,
}

impl WlrOutputs {
    pub fn new(qh: QueueHandle<Perch>) -> Self {
        Self {
            qh,
            manager: None,
            version: 0,
            heads: HashMap::new(),
            modes: HashMap::new(),
            head_ids: HashMap::new(),
            mode_ids: HashMap::new(),
        }
    }

    pub fn is_bound(&self) -> bool {
        self.manager.is_some()
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    fn track_head(&mut self, id: HeadId, head: ZwlrOutputHeadV1) {
        self.head_ids.insert(head.id(), id);
        self.heads.insert(id, head);
    }

    fn forget_head(&mut self, id: HeadId, head: &ZwlrOutputHeadV1) {
        self.head_ids.remove(&head.id());
        self.heads.remove(&id);
        // The compositor may finish a head without finishing its modes first.
        for mode in take_head_modes(&mut self.mode_ids, &mut self.modes, id) {
            if mode.version() >= RELEASE_VERSION {
                mode.release();
            }
        }
        // Older versions have no release request; dropping the proxy is all
        // there is to do.
        if head.version() >= RELEASE_VERSION {
            head.release();
        }
    }

    fn track_mode(&mut self, head: HeadId, id: ModeId, mode: ZwlrOutputModeV1) {
        self.mode_ids.insert(mode.id(), (head, id));
        self.modes.insert(id, mode);
    }

    fn forget_mode(&mut self, id: ModeId, mode: &ZwlrOutputModeV1) {
        self.mode_ids.remove(&mode.id());
        self.modes.remove(&id);
        if mode.version() >= RELEASE_VERSION {
            mode.release();
        }
    }

    fn head_id(&self, head: &ZwlrOutputHeadV1) -> Option<HeadId> {
        self.head_ids.get(&head.id()).copied()
    }

    fn mode_id(&self, mode: &ZwlrOutputModeV1) -> Option<(HeadId, ModeId)> {
        self.mode_ids.get(&mode.id()).copied()
    }
}

/// Removes every mode owned by `head` from both lookup maps and returns the
/// protocol objects.
fn take_head_modes<K, P>(
    mode_ids: &mut HashMap<K, (HeadId, ModeId)>,
    modes: &mut HashMap<ModeId, P>,
    head: HeadId,
) -> Vec<P>
where
    K: Eq + std::hash::Hash,
{
    let mut taken = Vec::new();
    mode_ids.retain(|_, (owner, mode)| {
        if *owner != head {
            return true;
        }
        taken.extend(modes.remove(&*mode));
        false
    });
    taken
}

impl OutputManager for WlrOutputs {
    fn submit(&mut self, transaction: &Transaction) -> Result<()> {
        let manager = self
            .manager
            .as_ref()
            .ok_or_else(|| PerchError::Wayland("output manager is not available".to_owned()))?;

        // Resolve every object first so a stale id never leaves a
        // half-built configuration behind.
        let mut resolved = Vec::with_capacity(transaction.heads.len());
        for config in &transaction.heads {
            let head = self.heads.get(&config.head()).ok_or_else(|| {
                PerchError::Wayland(format!("{} has no protocol object", config.head()))
            })?;
            let mode = match config {
                HeadConfig::Enable(enable) => enable
                    .mode
                    .map(|mode| {
                        self.modes.get(&mode).ok_or_else(|| {
                            PerchError::Wayland(format!("{mode} has no protocol object"))
                        })
                    })
                    .transpose()?,
                HeadConfig::Disable { .. } => None,
            };
            resolved.push((config, head, mode));
        }

        let configuration =
            manager.create_configuration(transaction.serial, &self.qh, transaction.id);

        for (config, head, mode) in resolved {
            let enable = match config {
                HeadConfig::Disable { .. } => {
                    configuration.disable_head(head);
                    continue;
                }
                HeadConfig::Enable(enable) => enable,
            };

            let config_head = configuration.enable_head(head, &self.qh, ());
            if let Some(mode) = mode {
                config_head.set_mode(mode);
            }
            if let Some(Position { x, y }) = enable.position {
                config_head.set_position(x, y);
            }
            if let Some(scale) = enable.scale {
                config_head.set_scale(scale);
            }
            if let Some(transform) = enable.transform.and_then(transform_to_wire) {
                config_head.set_transform(transform);
            }
            if let Some(adaptive_sync) = enable.adaptive_sync {
                if self.version >= ADAPTIVE_SYNC_VERSION {
                    config_head.set_adaptive_sync(if adaptive_sync {
                        AdaptiveSyncState::Enabled
                    } else {
                        AdaptiveSyncState::Disabled
                    });
                } else {
                    tracing::warn!(
                        head = %enable.head,
                        version = self.version,
                        "compositor does not support adaptive sync; ignoring"
                    );
                }
            }
        }

        configuration.apply();
        tracing::debug!(
            transaction = %transaction.id,
            serial = transaction.serial,
            heads = transaction.heads.len(),
            "submitted output configuration"
        );
        Ok(())
    }
}

impl Dispatch<wl_registry::WlRegistry, ()> for Perch {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &(),
        _: &Connection,
        qh: &QueueHandle<Self>,
    ) {
        let wl_registry::Event::Global {
            name,
            interface,
            version,
        } = event
        else {
            return;
        };
        if interface != ZwlrOutputManagerV1::interface().name || state.outputs.is_bound() {
            return;
        }

        let Some(version) = bind_version(version) else {
            tracing::warn!(version, "output manager version too old; ignoring");
            return;
        };
        let manager = registry.bind::<ZwlrOutputManagerV1, _, _>(name, version, qh, ());
        tracing::info!(version, "bound output manager");
        state.outputs.manager = Some(manager);
        state.outputs.version = version;
    }
}

impl Dispatch<ZwlrOutputManagerV1, ()> for Perch {
    fn event(
        state: &mut Self,
        _: &ZwlrOutputManagerV1,
        event: zwlr_output_manager_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_output_manager_v1::Event::Head { head } => {
                let id = state.session.model_mut().add_head();
                tracing::debug!(head = %id, "head added");
                state.outputs.track_head(id, head);
            }
            zwlr_output_manager_v1::Event::Done { serial } => {
                state.session.on_topology_settled(serial, &mut state.outputs);
            }
            zwlr_output_manager_v1::Event::Finished => {
                tracing::warn!("output manager finished; no further configuration possible");
                state.outputs.manager = None;
            }
            _ => {}
        }
    }

    event_created_child!(Perch, ZwlrOutputManagerV1, [
        zwlr_output_manager_v1::EVT_HEAD_OPCODE => (ZwlrOutputHeadV1, ())
    ]);
}

impl Dispatch<ZwlrOutputHeadV1, ()> for Perch {
    fn event(
        state: &mut Self,
        proxy: &ZwlrOutputHeadV1,
        event: zwlr_output_head_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some(id) = state.outputs.head_id(proxy) else {
            tracing::warn!(object = %proxy.id(), "event for untracked head");
            return;
        };

        let event = match event {
            zwlr_output_head_v1::Event::Mode { mode } => {
                if let Some(mode_id) = state.session.model_mut().add_mode(id) {
                    state.outputs.track_mode(id, mode_id, mode);
                }
                return;
            }
            zwlr_output_head_v1::Event::Finished => {
                if let Some(head) = state.session.model_mut().remove_head(id) {
                    tracing::debug!(head = %head.name, "head removed");
                }
                state.outputs.forget_head(id, proxy);
                return;
            }
            event => event,
        };

        let Some(head) = state.session.model_mut().head_mut(id) else {
            return;
        };

        match event {
            zwlr_output_head_v1::Event::Name { name } => head.name = name,
            zwlr_output_head_v1::Event::Description { description } => {
                head.description = description;
            }
            zwlr_output_head_v1::Event::PhysicalSize { width, height } => {
                head.physical_size = (width, height);
            }
            zwlr_output_head_v1::Event::Enabled { enabled } => head.set_enabled(enabled != 0),
            zwlr_output_head_v1::Event::CurrentMode { mode } => {
                match state.outputs.mode_id(&mode) {
                    Some((_, mode_id)) => head.set_current_mode(mode_id),
                    None => {
                        tracing::warn!(head = %head.name, "received unknown current mode");
                        head.clear_current_mode();
                    }
                }
            }
            zwlr_output_head_v1::Event::Position { x, y } => head.position = Position::new(x, y),
            zwlr_output_head_v1::Event::Transform { transform } => {
                match transform_from_wire(transform) {
                    Some(transform) => head.transform = transform,
                    None => tracing::warn!(head = %head.name, "received unknown transform"),
                }
            }
            zwlr_output_head_v1::Event::Scale { scale } => head.scale = scale,
            zwlr_output_head_v1::Event::Make { make } => head.make = Some(make),
            zwlr_output_head_v1::Event::Model { model } => head.model = Some(model),
            zwlr_output_head_v1::Event::SerialNumber { serial_number } => {
                head.serial_number = Some(serial_number);
            }
            zwlr_output_head_v1::Event::AdaptiveSync { state: sync } => {
                head.adaptive_sync = matches!(sync, WEnum::Value(AdaptiveSyncState::Enabled));
            }
            _ => {}
        }
    }

    event_created_child!(Perch, ZwlrOutputHeadV1, [
        zwlr_output_head_v1::EVT_MODE_OPCODE => (ZwlrOutputModeV1, ())
    ]);
}

impl Dispatch<ZwlrOutputModeV1, ()> for Perch {
    fn event(
        state: &mut Self,
        proxy: &ZwlrOutputModeV1,
        event: zwlr_output_mode_v1::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let Some((head_id, mode_id)) = state.outputs.mode_id(proxy) else {
            tracing::warn!(object = %proxy.id(), "event for untracked mode");
            return;
        };

        if let zwlr_output_mode_v1::Event::Finished = event {
            state.session.model_mut().remove_mode(head_id, mode_id);
            state.outputs.forget_mode(mode_id, proxy);
            return;
        }

        let Some(mode) = state
            .session
            .model_mut()
            .head_mut(head_id)
            .and_then(|head| head.mode_mut(mode_id))
        else {
            return;
        };

        match event {
            zwlr_output_mode_v1::Event::Size { width, height } => {
                mode.width = width;
                mode.height = height;
            }
            zwlr_output_mode_v1::Event::Refresh { refresh } => mode.refresh = refresh,
            zwlr_output_mode_v1::Event::Preferred => mode.preferred = true,
            _ => {}
        }
    }
}

impl Dispatch<ZwlrOutputConfigurationV1, TransactionId> for Perch {
    fn event(
        state: &mut Self,
        proxy: &ZwlrOutputConfigurationV1,
        event: zwlr_output_configuration_v1::Event,
        id: &TransactionId,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        let outcome = match event {
            zwlr_output_configuration_v1::Event::Succeeded => Outcome::Succeeded,
            zwlr_output_configuration_v1::Event::Failed => Outcome::Failed,
            zwlr_output_configuration_v1::Event::Cancelled => Outcome::Cancelled,
            _ => return,
        };
        proxy.destroy();
        state.session.handle_outcome(*id, outcome);
    }
}

impl Dispatch<ZwlrOutputConfigurationHeadV1, ()> for Perch {
    fn event(
        _: &mut Self,
        _: &ZwlrOutputConfigurationHeadV1,
        _: <ZwlrOutputConfigurationHeadV1 as Proxy>::Event,
        _: &(),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
    }
}
