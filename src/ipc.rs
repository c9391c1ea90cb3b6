//! Control socket shared by the daemon and the `perch reload` / `perch
//! switch` client. One request per connection; the reply is written once
//! the request has a final outcome, which for an applied profile means after
//! the compositor answered.

use std::{
    ffi::OsStr,
    io::{self, Read, Write},
    os::unix::{
        io::{FromRawFd, RawFd},
        net::{UnixListener, UnixStream},
    },
    path::{Path, PathBuf},
};

use calloop::{
    Interest, LoopHandle, Mode, PostAction,
    generic::Generic,
};

use crate::{PerchError, Result, errors::ControlError, state::Perch};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    Reload,
    Switch(String),
}

impl Request {
    pub fn parse(raw: &str) -> Result<Self, ControlError> {
        let raw = raw.trim();
        if raw == "reload" {
            return Ok(Request::Reload);
        }
        if let Some(name) = raw.strip_prefix("switch")
            && name.starts_with(char::is_whitespace)
            && !name.trim().is_empty()
        {
            return Ok(Request::Switch(name.trim().to_owned()));
        }
        Err(ControlError::InvalidRequest)
    }

    pub fn to_wire(&self) -> String {
        match self {
            Request::Reload => "reload".to_owned(),
            Request::Switch(name) => format!("switch {name}"),
        }
    }
}

pub fn format_reply(result: &Result<(), ControlError>) -> String {
    match result {
        Ok(()) => "ok\n".to_owned(),
        Err(err) => format!("error: {}\n", err.wire_name()),
    }
}

pub fn parse_reply(raw: &str) -> Result<Result<(), ControlError>> {
    let reply = raw.trim();
    if reply == "ok" {
        return Ok(Ok(()));
    }
    reply
        .strip_prefix("error:")
        .and_then(|name| ControlError::from_wire_name(name.trim()))
        .map(Err)
        .ok_or_else(|| PerchError::Ipc(format!("unexpected reply from perch: {reply:?}")))
}

pub(crate) fn write_reply(stream: &mut UnixStream, result: &Result<(), ControlError>) {
    if let Err(err) = stream.write_all(format_reply(result).as_bytes()) {
        tracing::warn!("failed to write ipc response: {err}");
    }
}

const MAX_REQUEST_LEN: usize = 4096;

#[derive(Debug, PartialEq, Eq)]
enum ReadState {
    Pending,
    Complete,
}

/// Appends whatever the client has sent so far. The request is complete once
/// the client shuts down its write half.
fn read_available(mut reader: impl Read, buf: &mut Vec<u8>) -> io::Result<ReadState> {
    let mut chunk = [0u8; 512];
    loop {
        match reader.read(&mut chunk) {
            Ok(0) => return Ok(ReadState::Complete),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                if buf.len() > MAX_REQUEST_LEN {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "ipc request is too long",
                    ));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(ReadState::Pending),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
}

fn parse_request(raw: &[u8]) -> Result<Request, ControlError> {
    std::str::from_utf8(raw)
        .map_err(|_| ControlError::InvalidRequest)
        .and_then(Request::parse)
}

/// Watches one accepted connection until its request is complete, then hands
/// it to the daemon. Nothing blocks the loop while the client is writing.
fn insert_client(loop_handle: &LoopHandle<'static, Perch>, stream: UnixStream) -> Result<()> {
    stream
        .set_nonblocking(true)
        .map_err(|err| PerchError::Ipc(format!("failed to set ipc client nonblocking: {err}")))?;

    let mut request = Vec::new();
    loop_handle
        .insert_source(
            Generic::new(stream, Interest::READ, Mode::Level),
            move |_, stream, state| {
                let parsed = match read_available(&**stream, &mut request) {
                    Ok(ReadState::Pending) => return Ok(PostAction::Continue),
                    Ok(ReadState::Complete) => parse_request(&request),
                    Err(err) => {
                        tracing::warn!("failed to read ipc request: {err}");
                        Err(ControlError::InvalidRequest)
                    }
                };

                // The source owns the watched stream; the reply goes out on a
                // duplicate that outlives it.
                match stream.try_clone().and_then(|reply| {
                    reply.set_nonblocking(false)?;
                    Ok(reply)
                }) {
                    Ok(reply) => state.handle_ipc_request(reply, parsed),
                    Err(err) => tracing::warn!("failed to keep ipc client for reply: {err}"),
                }
                Ok(PostAction::Remove)
            },
        )
        .map_err(|err| PerchError::EventLoop(format!("failed to watch ipc client: {err}")))?;

    Ok(())
}

pub fn socket_path(runtime_dir: &Path, wayland_display: &OsStr) -> Result<PathBuf> {
    let display = wayland_display.to_string_lossy().trim().to_owned();
    if display.is_empty() {
        return Err(PerchError::Ipc(
            "wayland display name is empty; cannot locate ipc socket".to_owned(),
        ));
    }
    // WAYLAND_DISPLAY may be an absolute path.
    let display = display.rsplit('/').next().unwrap_or(&display).to_owned();
    Ok(runtime_dir.join(format!("perch-{display}.sock")))
}

pub fn socket_path_from_env() -> Result<PathBuf> {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .ok_or_else(|| PerchError::Ipc("XDG_RUNTIME_DIR is not set".to_owned()))?;
    let display = std::env::var_os("WAYLAND_DISPLAY").unwrap_or_else(|| "wayland-0".into());
    socket_path(Path::new(&runtime_dir), &display)
}

/// Adopts a listening socket handed over by a service manager. The fd is
/// marked close-on-exec so profile commands do not inherit it.
pub fn listener_from_fd(fd: RawFd) -> Result<UnixListener> {
    if fd < 0 {
        return Err(PerchError::Ipc(format!("invalid listen fd {fd}")));
    }

    // SAFETY: fcntl on an integer fd touches no Rust-owned memory.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
    if flags < 0 {
        return Err(PerchError::Ipc(format!(
            "fcntl(F_GETFD) on listen fd {fd} failed: {}",
            io::Error::last_os_error()
        )));
    }
    // SAFETY: as above.
    if unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) } < 0 {
        return Err(PerchError::Ipc(format!(
            "fcntl(F_SETFD) on listen fd {fd} failed: {}",
            io::Error::last_os_error()
        )));
    }

    // SAFETY: the fd was passed to us on the command line for exclusive use
    // as the control socket.
    Ok(unsafe { UnixListener::from_raw_fd(fd) })
}

fn bind_listener() -> Result<(UnixListener, PathBuf)> {
    let path = socket_path_from_env()?;

    if path.exists()
        && let Err(err) = std::fs::remove_file(&path)
    {
        return Err(PerchError::Ipc(format!(
            "failed to remove stale ipc socket {}: {err}",
            path.display()
        )));
    }

    let listener = UnixListener::bind(&path).map_err(|err| {
        PerchError::Ipc(format!("failed to bind ipc socket {}: {err}", path.display()))
    })?;
    Ok((listener, path))
}

/// Starts serving control requests, either on a socket bound next to the
/// Wayland display or on `listen_fd`. Returns the path perch bound, which is
/// the caller's to remove on exit.
pub fn init_ipc_listener(
    loop_handle: &LoopHandle<'static, Perch>,
    listen_fd: Option<RawFd>,
) -> Result<Option<PathBuf>> {
    let (listener, path) = match listen_fd {
        Some(fd) => (listener_from_fd(fd)?, None),
        None => {
            let (listener, path) = bind_listener()?;
            (listener, Some(path))
        }
    };
    listener
        .set_nonblocking(true)
        .map_err(|err| PerchError::Ipc(format!("failed to set ipc socket nonblocking: {err}")))?;

    let handle = loop_handle.clone();
    loop_handle
        .insert_source(
            Generic::new(listener, Interest::READ, Mode::Level),
            move |_, listener, _| {
                loop {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if let Err(err) = insert_client(&handle, stream) {
                                tracing::warn!("{err}");
                            }
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                        Err(err) => {
                            tracing::warn!("ipc accept failed: {err}");
                            break;
                        }
                    }
                }
                Ok(PostAction::Continue)
            },
        )
        .map_err(|err| PerchError::EventLoop(format!("failed to init ipc listener: {err}")))?;

    Ok(path)
}

/// Sends one request to a running daemon and waits for its verdict.
pub fn run_ipc_command(request: &Request) -> Result<Result<(), ControlError>> {
    let path = socket_path_from_env()?;
    let mut stream = UnixStream::connect(&path).map_err(|err| {
        PerchError::Ipc(format!(
            "failed to connect to perch ipc socket {} (is perch running?): {err}",
            path.display()
        ))
    })?;

    stream
        .write_all(request.to_wire().as_bytes())
        .map_err(|err| PerchError::Ipc(format!("failed to send ipc command: {err}")))?;
    stream
        .shutdown(std::net::Shutdown::Write)
        .map_err(|err| PerchError::Ipc(format!("failed to finalize ipc command write: {err}")))?;

    let mut response = String::new();
    stream
        .read_to_string(&mut response)
        .map_err(|err| PerchError::Ipc(format!("failed to read ipc response: {err}")))?;

    if response.is_empty() {
        return Err(PerchError::Ipc("empty response from perch ipc".to_owned()));
    }

    parse_reply(&response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requests() {
        assert_eq!(Request::parse("reload\n"), Ok(Request::Reload));
        assert_eq!(
            Request::parse("switch  home office "),
            Ok(Request::Switch("home office".to_owned()))
        );
        assert_eq!(Request::parse("switch"), Err(ControlError::InvalidRequest));
        assert_eq!(Request::parse("switchboard"), Err(ControlError::InvalidRequest));
        assert_eq!(Request::parse(""), Err(ControlError::InvalidRequest));
    }

    #[test]
    fn replies_carry_wire_names() {
        assert_eq!(format_reply(&Ok(())), "ok\n");
        assert_eq!(
            format_reply(&Err(ControlError::ProfileNotMatched)),
            "error: ProfileNotMatched\n"
        );
        assert_eq!(
            parse_reply("error: ProfileNotFound\n").unwrap(),
            Err(ControlError::ProfileNotFound)
        );
        assert_eq!(parse_reply("ok").unwrap(), Ok(()));
        assert!(parse_reply("error: Whatever").is_err());
    }

    #[test]
    fn socket_path_is_per_display() {
        let path = socket_path(Path::new("/run/user/1000"), OsStr::new("wayland-1")).unwrap();
        assert_eq!(path, Path::new("/run/user/1000/perch-wayland-1.sock"));

        let path = socket_path(Path::new("/run/user/1000"), OsStr::new("/tmp/wl/wayland-2")).unwrap();
        assert_eq!(path, Path::new("/run/user/1000/perch-wayland-2.sock"));

        assert!(socket_path(Path::new("/run/user/1000"), OsStr::new(" ")).is_err());
    }

    #[test]
    fn partial_requests_wait_for_end_of_input() {
        let (daemon, mut client) = UnixStream::pair().unwrap();
        daemon.set_nonblocking(true).unwrap();
        let mut request = Vec::new();

        assert_eq!(read_available(&daemon, &mut request).unwrap(), ReadState::Pending);
        assert!(request.is_empty());

        client.write_all(b"swi").unwrap();
        assert_eq!(read_available(&daemon, &mut request).unwrap(), ReadState::Pending);
        assert_eq!(request, b"swi");

        client.write_all(b"tch desk").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        assert_eq!(read_available(&daemon, &mut request).unwrap(), ReadState::Complete);
        assert_eq!(parse_request(&request), Ok(Request::Switch("desk".to_owned())));
    }

    #[test]
    fn oversized_and_non_utf8_requests_are_rejected() {
        let (daemon, mut client) = UnixStream::pair().unwrap();
        daemon.set_nonblocking(true).unwrap();
        client.write_all(&[b'x'; MAX_REQUEST_LEN + 1]).unwrap();

        let mut request = Vec::new();
        let err = read_available(&daemon, &mut request).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        assert_eq!(parse_request(b"switch \xff"), Err(ControlError::InvalidRequest));
    }

    #[test]
    fn adopted_listen_fd_is_cloexec_and_accepts() {
        let path = std::env::temp_dir().join(format!("perch-listen-fd-{}.sock", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let fd = std::os::unix::io::IntoRawFd::into_raw_fd(UnixListener::bind(&path).unwrap());
        unsafe {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }

        let listener = listener_from_fd(fd).unwrap();
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFD) };
        assert_ne!(flags & libc::FD_CLOEXEC, 0);

        let _client = UnixStream::connect(&path).unwrap();
        assert!(listener.accept().is_ok());

        drop(listener);
        std::fs::remove_file(&path).unwrap();
        assert!(listener_from_fd(-1).is_err());
    }

    #[test]
    fn replies_travel_over_a_socket_pair() {
        let (mut daemon, mut client) = UnixStream::pair().unwrap();
        client.write_all(b"switch desk").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();

        let mut request = Vec::new();
        assert_eq!(read_available(&daemon, &mut request).unwrap(), ReadState::Complete);
        assert_eq!(parse_request(&request), Ok(Request::Switch("desk".to_owned())));
        write_reply(&mut daemon, &Err(ControlError::ProfileNotApplied));
        drop(daemon);

        let mut reply = String::new();
        client.read_to_string(&mut reply).unwrap();
        assert_eq!(parse_reply(&reply).unwrap(), Err(ControlError::ProfileNotApplied));
    }
}
