use std::io;

/// Signals sent to a shell session's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupSignal {
    Terminate,
    Kill,
}

/// Make the calling (freshly forked) process the leader of a new process
/// group, and on Linux ask the kernel to SIGKILL it when the daemon dies.
///
/// Meant to run inside `pre_exec`: only async-signal-safe calls.
#[cfg(target_family = "unix")]
pub fn become_group_leader() -> io::Result<()> {
    if unsafe { libc::setpgid(0, 0) } != 0 {
        return Err(io::Error::last_os_error());
    }

    #[cfg(target_os = "linux")]
    {
        let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGKILL, 0, 0, 0) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Send `signal` to every process in group `pgid`.
///
/// Returns `Ok(false)` when the group no longer exists.
#[cfg(target_family = "unix")]
pub fn signal_group(pgid: u32, signal: GroupSignal) -> io::Result<bool> {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let sig = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };

    match killpg(Pid::from_raw(pgid as i32), sig) {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => Ok(false),
        Err(errno) => Err(io::Error::from_raw_os_error(errno as i32)),
    }
}

/// Windows has no process groups in this sense; the session supervisor kills
/// the child directly instead.
#[cfg(not(target_family = "unix"))]
pub fn signal_group(_pgid: u32, _signal: GroupSignal) -> io::Result<bool> {
    Ok(false)
}

/// Whether any process of group `pgid` is still alive (signal 0 probe).
#[cfg(target_family = "unix")]
pub fn group_alive(pgid: u32) -> bool {
    use nix::sys::signal::killpg;
    use nix::unistd::Pid;

    killpg(Pid::from_raw(pgid as i32), None).is_ok()
}

#[cfg(not(target_family = "unix"))]
pub fn group_alive(_pgid: u32) -> bool {
    false
}

#[cfg(all(test, target_family = "unix"))]
mod tests {
    use super::*;
    use std::os::unix::process::CommandExt;
    use std::process::Command;
    use std::time::{Duration, Instant};

    #[test]
    fn test_signal_group_terminates_leader() {
        let mut child = unsafe {
            Command::new("sleep")
                .arg("30")
                .pre_exec(become_group_leader)
                .spawn()
                .expect("spawn sleep")
        };
        let pgid = child.id();

        assert!(group_alive(pgid));
        assert!(signal_group(pgid, GroupSignal::Terminate).unwrap());

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if child.try_wait().unwrap().is_some() {
                break;
            }
            assert!(Instant::now() < deadline, "sleep did not exit on SIGTERM");
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(!group_alive(pgid));
    }

    #[test]
    fn test_signal_missing_group_reports_gone() {
        // Above the largest possible pid_max.
        assert!(!signal_group(2_147_000_000, GroupSignal::Kill).unwrap());
    }
}
