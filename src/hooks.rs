//! Post-apply commands.

use std::{
    io,
    os::unix::process::CommandExt,
    path::PathBuf,
    process::{Command, Stdio},
    thread,
};

pub const DEFAULT_SHELL: &str = "/bin/sh";

/// Runs a profile command after its configuration was applied.
pub trait HookRunner {
    fn run(&mut self, command: &str) -> io::Result<()>;
}

/// Runs each command as `<shell> -c <command>` in its own session with a
/// clean signal state. The exit status is only logged.
#[derive(Clone, Debug)]
pub struct ShellHooks {
    shell: PathBuf,
}

impl ShellHooks {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellHooks {
    fn default() -> Self {
        Self::new(DEFAULT_SHELL)
    }
}

impl HookRunner for ShellHooks {
    fn run(&mut self, command: &str) -> io::Result<()> {
        if command.trim().is_empty() {
            return Ok(());
        }

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c").arg(command).stdin(Stdio::null());

        // SAFETY: only async-signal-safe libc calls run between fork and exec.
        unsafe {
            cmd.pre_exec(detach_child);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();
        let command = command.to_owned();

        thread::Builder::new()
            .name(format!("perch-hook-{pid}"))
            .spawn(move || match child.wait() {
                Ok(status) if status.success() => {
                    tracing::debug!(command = %command, pid, "command exited");
                }
                Ok(status) => {
                    tracing::warn!(command = %command, pid, %status, "command exited unsuccessfully");
                }
                Err(err) => {
                    tracing::warn!(command = %command, pid, "failed to reap command: {err}");
                }
            })?;

        Ok(())
    }
}

fn detach_child() -> io::Result<()> {
    // SAFETY: plain syscalls on the freshly forked child, nothing is shared.
    unsafe {
        if libc::setsid() < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut set: libc::sigset_t = std::mem::zeroed();
        libc::sigemptyset(&mut set);
        if libc::sigprocmask(libc::SIG_SETMASK, &set, std::ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error());
        }

        let mut action: libc::sigaction = std::mem::zeroed();
        action.sa_sigaction = libc::SIG_DFL;
        libc::sigemptyset(&mut action.sa_mask);
        for signal in [libc::SIGINT, libc::SIGQUIT, libc::SIGTERM, libc::SIGHUP] {
            if libc::sigaction(signal, &action, std::ptr::null_mut()) < 0 {
                return Err(io::Error::last_os_error());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        path::Path,
        time::{Duration, Instant},
    };

    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("perch-hooks-{}-{name}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn wait_for_file(path: &Path) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Ok(contents) = fs::read_to_string(path) {
                return contents;
            }
            assert!(Instant::now() < deadline, "{} never appeared", path.display());
            thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn command_runs_in_its_own_session_with_empty_mask() {
        let dir = scratch_dir("session");
        let report = dir.join("report");
        let command = format!(
            "cd '{}' && echo $$ > tmp && cat /proc/$$/stat >> tmp && \
             grep '^SigBlk' /proc/$$/status >> tmp && \
             grep '^SigIgn' /proc/$$/status >> tmp && mv tmp report",
            dir.display()
        );

        // Spawn while blocking SIGUSR2 and ignoring SIGHUP; the child must
        // inherit neither.
        thread::spawn(move || {
            unsafe {
                let mut set: libc::sigset_t = std::mem::zeroed();
                libc::sigemptyset(&mut set);
                libc::sigaddset(&mut set, libc::SIGUSR2);
                libc::pthread_sigmask(libc::SIG_BLOCK, &set, std::ptr::null_mut());
                libc::signal(libc::SIGHUP, libc::SIG_IGN);
            }
            let result = ShellHooks::default().run(&command);
            unsafe {
                libc::signal(libc::SIGHUP, libc::SIG_DFL);
            }
            result.unwrap();
        })
        .join()
        .unwrap();

        let report = wait_for_file(&report);
        let mut lines = report.lines();
        let pid: i32 = lines.next().unwrap().trim().parse().unwrap();

        let stat = lines.next().unwrap();
        let fields: Vec<_> = stat[stat.rfind(')').unwrap() + 1..].split_whitespace().collect();
        let session: i32 = fields[3].parse().unwrap();
        assert_eq!(session, pid);

        let blocked = lines.next().unwrap().trim_start_matches("SigBlk:").trim();
        assert!(blocked.chars().all(|c| c == '0'), "blocked signals: {blocked}");

        let ignored = lines.next().unwrap().trim_start_matches("SigIgn:").trim();
        let ignored = u64::from_str_radix(ignored, 16).unwrap();
        assert_eq!(ignored & (1 << (libc::SIGHUP - 1)), 0, "SIGHUP still ignored");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn commands_each_get_a_shell_in_declared_order() {
        let dir = scratch_dir("order");
        let mut hooks = ShellHooks::default();
        hooks
            .run(&format!("cd '{}' && echo first >> log", dir.display()))
            .unwrap();
        hooks
            .run(&format!(
                "cd '{}' && i=0; while [ $i -lt 200 ] && ! grep -q first log 2>/dev/null; \
                 do sleep 0.05; i=$((i+1)); done; echo second >> log; touch done",
                dir.display()
            ))
            .unwrap();

        wait_for_file(&dir.join("done"));
        assert_eq!(fs::read_to_string(dir.join("log")).unwrap(), "first\nsecond\n");

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn blank_command_is_skipped() {
        let mut hooks = ShellHooks::new("/nonexistent/shell");
        assert!(hooks.run("   ").is_ok());
    }

    #[test]
    fn missing_shell_reports_spawn_error() {
        let mut hooks = ShellHooks::new("/nonexistent/shell");
        assert!(hooks.run("true").is_err());
    }
}
