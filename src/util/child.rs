//! Run a closure in a forked child so we can watch it die. Guard pages are
//! only interesting when something hits them, and a fault takes the whole
//! process down with it.

use std::{
    fs::File,
    io::Read,
    os::fd::FromRawFd,
    panic::{self, AssertUnwindSafe},
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChildExit {
    Exited(i32),
    Signaled(i32),
}

impl ChildExit {
    /// Did the child die from a memory protection fault?
    pub fn faulted(self) -> bool {
        matches!(self, ChildExit::Signaled(libc::SIGSEGV | libc::SIGBUS))
    }
}

fn wait(pid: libc::pid_t) -> ChildExit {
    let mut status = 0;
    // SAFETY: `pid` is our own child
    let rc = unsafe { libc::waitpid(pid, &mut status, 0) };
    assert_eq!(rc, pid, "waitpid() failed");
    if libc::WIFSIGNALED(status) {
        ChildExit::Signaled(libc::WTERMSIG(status))
    } else {
        ChildExit::Exited(libc::WEXITSTATUS(status))
    }
}

/// Only call this in the child. Never returns.
fn run_child<F: FnOnce()>(f: F) -> ! {
    let no_core = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: plain syscalls on our own process
    unsafe {
        libc::setrlimit(libc::RLIMIT_CORE, &no_core);
        let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
            Ok(()) => 0,
            Err(_) => 101,
        };
        libc::_exit(code)
    }
}

/// Anything lazily initialized must be ready before we fork, or the child
/// may inherit it half-built.
fn warm_up() {
    crate::os::mem::page_size();
}

/// Run `f` in a forked child and report how it ended.
pub fn run_in_child<F: FnOnce()>(f: F) -> ChildExit {
    warm_up();
    // SAFETY: the child only runs `f` and then `_exit()`s
    match unsafe { libc::fork() } {
        -1 => panic!("fork() failed"),
        0 => run_child(f),
        pid => wait(pid),
    }
}

/// Like [`run_in_child()`], but also hands back everything the child wrote
/// to stdout.
pub fn run_in_child_captured<F: FnOnce()>(f: F) -> (ChildExit, String) {
    warm_up();
    let mut fds = [0; 2];
    // SAFETY: `fds` has room for both ends
    assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0, "pipe() failed");
    let [read_end, write_end] = fds;
    // SAFETY: the child only redirects stdout, runs `f` and `_exit()`s
    match unsafe { libc::fork() } {
        -1 => panic!("fork() failed"),
        0 => {
            unsafe {
                libc::close(read_end);
                libc::dup2(write_end, libc::STDOUT_FILENO);
                libc::close(write_end);
            }
            run_child(f)
        }
        pid => {
            unsafe { libc::close(write_end) };
            // SAFETY: we own `read_end` and nobody else closes it
            let mut pipe = unsafe { File::from_raw_fd(read_end) };
            let mut out = String::new();
            pipe.read_to_string(&mut out).expect("child output is utf-8");
            (wait(pid), out)
        }
    }
}
