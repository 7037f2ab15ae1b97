//! A cut-down copy of the crate's fork harness, for integration tests.

use std::panic::{self, AssertUnwindSafe};

/// Run `f` in a forked child and report whether it died from a memory
/// protection fault. The child must not allocate.
pub fn faults<F: FnOnce()>(f: F) -> bool {
    // SAFETY: the child only runs `f` and then `_exit()`s
    match unsafe { libc::fork() } {
        -1 => panic!("fork() failed"),
        0 => unsafe {
            let no_core = libc::rlimit {
                rlim_cur: 0,
                rlim_max: 0,
            };
            libc::setrlimit(libc::RLIMIT_CORE, &no_core);
            let code = match panic::catch_unwind(AssertUnwindSafe(f)) {
                Ok(()) => 0,
                Err(_) => 101,
            };
            libc::_exit(code)
        },
        pid => {
            let mut status = 0;
            // SAFETY: `pid` is our own child
            assert_eq!(unsafe { libc::waitpid(pid, &mut status, 0) }, pid);
            libc::WIFSIGNALED(status)
                && matches!(libc::WTERMSIG(status), libc::SIGSEGV | libc::SIGBUS)
        }
    }
}
