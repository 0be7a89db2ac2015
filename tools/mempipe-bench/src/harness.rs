// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Process plumbing: fork, CPU pinning and child supervision.

use std::error::Error;
use std::io;
use std::process;

/// CPUs the two sides are pinned to
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuPair {
    /// Consumer (child) CPU
    pub first: Option<usize>,
    /// Producer (parent) CPU
    pub second: Option<usize>,
}

/// Which side of the fork this process is on
pub enum Side {
    Parent(ChildProcess),
    Child,
}

/// Handle on the forked consumer process
pub struct ChildProcess {
    pid: libc::pid_t,
}

/// Pin the calling thread to `cpu`.
pub fn set_affinity(cpu: usize) -> io::Result<()> {
    // SAFETY: cpu_set_t is plain data; CPU_SET bounds-checks against the set
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Fork and pin each side to its CPU.
///
/// The shared region and pipes must already exist. Must be called while
/// the process is single-threaded.
pub fn fork_pinned(cpus: CpuPair) -> io::Result<Side> {
    // SAFETY: the benchmark is single-threaded at this point
    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(io::Error::last_os_error());
    }
    let (side, cpu) = if pid == 0 {
        (Side::Child, cpus.first)
    } else {
        (Side::Parent(ChildProcess { pid }), cpus.second)
    };
    if let Some(cpu) = cpu {
        set_affinity(cpu).map_err(|e| io::Error::new(e.kind(), format!("pin to CPU {cpu}: {e}")))?;
        log::debug!("[BENCH] pid {} pinned to CPU {cpu}", process::id());
    }
    Ok(side)
}

/// Run the child's work and terminate without returning to `main`.
///
/// Exit status is 0 on success and 1 on error.
pub fn exit_child<F>(work: F) -> !
where
    F: FnOnce() -> Result<(), Box<dyn Error>>,
{
    let code = match work() {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("child: {e}");
            1
        }
    };
    // SAFETY: skip atexit handlers and destructors inherited from the parent
    unsafe { libc::_exit(code) }
}

impl ChildProcess {
    /// Reap the child; any exit other than status 0 is an error.
    pub fn wait(self) -> io::Result<()> {
        let mut status = 0;
        loop {
            // SAFETY: pid is our direct child
            let rv = unsafe { libc::waitpid(self.pid, &mut status, 0) };
            if rv >= 0 {
                break;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }

        if libc::WIFSIGNALED(status) {
            return Err(io::Error::other(format!(
                "child killed by signal {}",
                libc::WTERMSIG(status)
            )));
        }
        if !libc::WIFEXITED(status) {
            return Err(io::Error::other(format!(
                "unexpected status {status:#x} from waitpid"
            )));
        }
        match libc::WEXITSTATUS(status) {
            0 => Ok(()),
            code => Err(io::Error::other(format!("child exited with status {code}"))),
        }
    }

    /// Kill the child after a parent-side failure and reap it.
    pub fn abort(self) {
        // SAFETY: pid is our direct child and has not been reaped
        unsafe { libc::kill(self.pid, libc::SIGKILL) };
        if let Err(e) = self.wait() {
            log::debug!("[BENCH] Aborted child: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_child_status_reported() {
        // SAFETY: test harness threads are idle in fork(); the child only
        // calls _exit
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe { libc::_exit(3) };
        }
        let err = ChildProcess { pid }.wait().expect_err("nonzero status");
        assert!(err.to_string().contains("status 3"));
    }

    #[test]
    fn test_clean_child_exit() {
        let pid = unsafe { libc::fork() };
        assert!(pid >= 0);
        if pid == 0 {
            unsafe { libc::_exit(0) };
        }
        ChildProcess { pid }.wait().expect("clean exit");
    }

    #[test]
    fn test_affinity_to_cpu_zero() {
        set_affinity(0).expect("CPU 0 is always online");
    }
}
