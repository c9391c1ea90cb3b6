use std::{os::unix::net::UnixStream, path::PathBuf};

use calloop::LoopSignal;
use wayland_client::{Connection, QueueHandle};

use crate::{
    config,
    errors::ControlError,
    hooks::ShellHooks,
    ipc::{self, Request},
    profile::ProfileStore,
    protocols::output_management::WlrOutputs,
    session::{Completion, Session},
};

/// Everything the event loop callbacks operate on.
pub struct Perch {
    pub session: Session,
    pub outputs: WlrOutputs,
    pub connection: Connection,
    pub config_path: PathBuf,
    pub loop_signal: LoopSignal,
    pub ipc_socket_path: Option<PathBuf>,
}

impl Perch {
    pub fn new(
        store: ProfileStore,
        config_path: PathBuf,
        connection: Connection,
        qh: QueueHandle<Perch>,
        loop_signal: LoopSignal,
    ) -> Self {
        Self {
            session: Session::new(store, Box::new(ShellHooks::default())),
            outputs: WlrOutputs::new(qh),
            connection,
            config_path,
            loop_signal,
            ipc_socket_path: None,
        }
    }

    /// Serves one fully read control request; the reply goes to `stream`.
    pub fn handle_ipc_request(
        &mut self,
        mut stream: UnixStream,
        request: Result<Request, ControlError>,
    ) {
        let request = match request {
            Ok(request) => request,
            Err(err) => {
                ipc::write_reply(&mut stream, &Err(err));
                return;
            }
        };

        tracing::info!(request = ?request, "ipc request");
        let completion: Completion = Box::new(move |result: Result<(), ControlError>| {
            match &result {
                Ok(()) => tracing::debug!("ipc request succeeded"),
                Err(err) => tracing::info!(error = err.wire_name(), "ipc request failed: {err}"),
            }
            ipc::write_reply(&mut stream, &result);
        });

        match request {
            Request::Reload => self.reload_config(Some(completion)),
            Request::Switch(name) => self.switch_profile(&name, Some(completion)),
        }
    }

    /// Re-reads the config file. On failure the previous profiles stay
    /// active.
    pub fn reload_config(&mut self, completion: Option<Completion>) {
        tracing::info!(path = %self.config_path.display(), "reloading config");
        match config::load_from_path(&self.config_path) {
            Ok(store) => self.session.reload(store, completion, &mut self.outputs),
            Err(err) => {
                tracing::warn!("failed to reload config: {err}");
                if let Some(completion) = completion {
                    completion(Err(ControlError::InvalidConfig));
                }
            }
        }
    }

    pub fn switch_profile(&mut self, name: &str, completion: Option<Completion>) {
        tracing::info!(profile = %name, "switching profile");
        self.session.switch(name, completion, &mut self.outputs);
    }

    /// Per-iteration housekeeping: deferred re-matches, then pushing queued
    /// requests to the compositor.
    pub fn after_dispatch(&mut self) {
        self.session.run_scheduled(&mut self.outputs);

        if let Err(err) = self.connection.flush() {
            tracing::error!("failed to flush wayland connection: {err}");
            self.loop_signal.stop();
        }
    }
}
