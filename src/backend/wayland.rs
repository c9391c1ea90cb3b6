use std::io;

use calloop::{Interest, LoopHandle, Mode, PostAction, generic::Generic};
use wayland_client::{Connection, EventQueue, backend::WaylandError};

use crate::{PerchError, Result, state::Perch};

/// Connects to the compositor named by `WAYLAND_DISPLAY` and requests the
/// registry. Globals are bound once the queue is first dispatched.
pub fn connect() -> Result<(Connection, EventQueue<Perch>)> {
    let connection = Connection::connect_to_env()
        .map_err(|err| PerchError::Wayland(format!("failed to connect to display: {err}")))?;
    let queue = connection.new_event_queue();
    connection.display().get_registry(&queue.handle(), ());
    Ok((connection, queue))
}

/// Binds the output manager and hands the queue to the event loop. Fails if
/// the compositor does not offer output management.
pub fn init_wayland(
    loop_handle: &LoopHandle<'static, Perch>,
    mut queue: EventQueue<Perch>,
    state: &mut Perch,
) -> Result<()> {
    queue
        .roundtrip(state)
        .map_err(|err| PerchError::Wayland(format!("initial roundtrip failed: {err}")))?;

    if !state.outputs.is_bound() {
        return Err(PerchError::Wayland(
            "compositor doesn't support wlr-output-management-unstable-v1".to_owned(),
        ));
    }

    // Second roundtrip: the initial heads and the first `done` follow the bind.
    queue
        .roundtrip(state)
        .map_err(|err| PerchError::Wayland(format!("output roundtrip failed: {err}")))?;
    queue
        .dispatch_pending(state)
        .map_err(|err| PerchError::Wayland(format!("failed to dispatch wayland events: {err}")))?;
    tracing::info!(heads = state.session.model().len(), "initial outputs received");

    let fd = state
        .connection
        .backend()
        .poll_fd()
        .try_clone_to_owned()
        .map_err(|err| PerchError::Wayland(format!("failed to clone wayland fd: {err}")))?;

    loop_handle
        .insert_source(
            Generic::new(fd, Interest::READ, Mode::Level),
            move |_, _, state| {
                if let Some(guard) = queue.prepare_read() {
                    match guard.read() {
                        Ok(_) => {}
                        Err(err) if is_would_block(&err) => {}
                        Err(err) => {
                            tracing::error!("failed to read wayland events: {err}");
                            state.loop_signal.stop();
                            return Err(io::Error::other(err));
                        }
                    }
                }

                if let Err(err) = queue.dispatch_pending(state) {
                    tracing::error!("failed to dispatch wayland events: {err}");
                    state.loop_signal.stop();
                    return Err(io::Error::other(err));
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| PerchError::EventLoop(format!("failed to insert wayland source: {err}")))?;

    Ok(())
}

/// Another reader already drained the socket.
fn is_would_block(err: &WaylandError) -> bool {
    matches!(err, WaylandError::Io(err) if err.kind() == io::ErrorKind::WouldBlock)
}
