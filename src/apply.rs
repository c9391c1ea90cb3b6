//! Turning a matched profile into a configuration transaction, and reacting
//! to the compositor's verdict on it.
//!
//! A transaction moves `Building -> Submitted -> {Succeeded | Failed |
//! Cancelled}`. Building happens entirely before submission, so a profile
//! asking for a mode a head cannot provide never reaches the compositor.

use std::{fmt, rc::Rc};

use thiserror::Error;

use crate::{
    Result,
    errors::ControlError,
    matcher::Assignment,
    mode::select_mode,
    model::{DisplayModel, HeadId, ModeId, Position, Transform},
    profile::{ModeRequest, Profile},
    session::{Completion, Session, complete},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransactionId(u64);

impl TransactionId {
    pub(crate) fn new(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn#{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct EnableHead {
    pub head: HeadId,
    pub mode: Option<ModeId>,
    pub position: Option<Position>,
    pub scale: Option<f64>,
    pub transform: Option<Transform>,
    pub adaptive_sync: Option<bool>,
}

/// Per-head instruction inside a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum HeadConfig {
    Disable { head: HeadId },
    Enable(EnableHead),
}

impl HeadConfig {
    pub fn head(&self) -> HeadId {
        match self {
            HeadConfig::Disable { head } => *head,
            HeadConfig::Enable(enable) => enable.head,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Transaction {
    pub id: TransactionId,
    /// Serial of the last `done` event seen when the transaction was built.
    pub serial: u32,
    pub heads: Vec<HeadConfig>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Succeeded,
    Failed,
    Cancelled,
}

/// The compositor side of a transaction. Exactly one [`Outcome`] for every
/// submitted transaction must later be fed to [`Session::handle_outcome`].
pub trait OutputManager {
    fn submit(&mut self, transaction: &Transaction) -> Result<()>;
}

#[derive(Debug, Error, PartialEq)]
pub enum BuildError {
    #[error("output '{head}' doesn't support mode '{mode}'")]
    UnsupportedMode { head: String, mode: ModeRequest },
    #[error("no head at position {0} of the display model")]
    MissingHead(usize),
    #[error("profile has no output at index {0}")]
    MissingOutput(usize),
}

pub(crate) struct PendingTransaction {
    pub(crate) serial: u32,
    pub(crate) profile: Rc<Profile>,
    pub(crate) completion: Option<Completion>,
}

/// Resolves every matched constraint against its head.
pub fn build_head_configs(
    model: &DisplayModel,
    profile: &Profile,
    assignment: &Assignment,
) -> Result<Vec<HeadConfig>, BuildError> {
    let mut configs = Vec::with_capacity(assignment.len());

    for (head_index, output_index) in assignment.iter() {
        let head = model
            .heads()
            .get(head_index)
            .ok_or(BuildError::MissingHead(head_index))?;
        let output = profile
            .outputs()
            .get(output_index)
            .ok_or(BuildError::MissingOutput(output_index))?;

        tracing::debug!(
            profile = %profile.name,
            output = %output.selector,
            head = %head.name,
            "applying profile output on connected head"
        );

        if !output.enabled.unwrap_or(head.enabled()) {
            configs.push(HeadConfig::Disable { head: head.id() });
            continue;
        }

        let mode = match output.mode {
            Some(request) => {
                let mode = select_mode(head, request.width, request.height, request.refresh)
                    .ok_or_else(|| BuildError::UnsupportedMode {
                        head: head.name.clone(),
                        mode: request,
                    })?;
                Some(mode.id())
            }
            None => None,
        };

        configs.push(HeadConfig::Enable(EnableHead {
            head: head.id(),
            mode,
            position: output.position,
            scale: output.scale,
            transform: output.transform,
            adaptive_sync: output.adaptive_sync,
        }));
    }

    Ok(configs)
}

impl Session {
    /// Builds and submits a transaction for `profile`, unless it is already
    /// applied or in flight.
    pub(crate) fn apply_profile(
        &mut self,
        profile: Rc<Profile>,
        assignment: &Assignment,
        completion: Option<Completion>,
        manager: &mut dyn OutputManager,
    ) {
        if self.is_current(&profile) || self.is_pending(&profile) {
            tracing::debug!(profile = %profile.name, "profile already applied or pending");
            complete(completion, Ok(()));
            return;
        }

        tracing::info!(profile = %profile.name, "applying profile");

        let heads = match build_head_configs(&self.model, &profile, assignment) {
            Ok(heads) => heads,
            Err(err) => {
                tracing::warn!(profile = %profile.name, "{err}");
                complete(completion, Err(ControlError::ProfileNotMatched));
                return;
            }
        };

        let transaction = Transaction {
            id: self.allocate_transaction_id(),
            serial: self.serial,
            heads,
        };

        if let Err(err) = manager.submit(&transaction) {
            tracing::error!(profile = %profile.name, "failed to submit configuration: {err}");
            complete(completion, Err(ControlError::ProfileNotApplied));
            return;
        }

        self.pending = Some(Rc::clone(&profile));
        self.transactions.insert(
            transaction.id,
            PendingTransaction {
                serial: transaction.serial,
                profile,
                completion,
            },
        );
    }

    /// Terminal step of a transaction. The record is consumed whatever the
    /// outcome; a cancellation retry is scheduled, never run inline.
    pub fn handle_outcome(&mut self, id: TransactionId, outcome: Outcome) {
        let Some(PendingTransaction {
            serial,
            profile,
            completion,
        }) = self.transactions.remove(&id)
        else {
            tracing::warn!(transaction = %id, ?outcome, "outcome for unknown transaction");
            return;
        };

        if self.is_pending(&profile) {
            self.pending = None;
        }

        match outcome {
            Outcome::Succeeded => {
                for command in &profile.commands {
                    tracing::info!(profile = %profile.name, command = %command, "running command");
                    if let Err(err) = self.hooks.run(command) {
                        tracing::warn!(command = %command, "failed to run command: {err}");
                    }
                }

                tracing::info!(profile = %profile.name, "configuration applied");
                if self.store.contains(&profile) {
                    self.current = Some(profile);
                } else {
                    tracing::debug!(
                        profile = %profile.name,
                        "applied profile belongs to a replaced config; not tracking it"
                    );
                }
                complete(completion, Ok(()));
            }
            Outcome::Failed => {
                tracing::warn!(profile = %profile.name, "failed to apply configuration");
                complete(completion, Err(ControlError::ProfileNotApplied));
            }
            Outcome::Cancelled => {
                tracing::info!(profile = %profile.name, "configuration cancelled");
                if serial != self.serial {
                    tracing::info!(
                        profile = %profile.name,
                        built_for = serial,
                        current = self.serial,
                        "topology changed since submission; scheduling re-match"
                    );
                    self.rematch_scheduled = true;
                }
                complete(completion, Err(ControlError::ProfileNotApplied));
            }
        }
    }
}
