use std::ffi::CString;

use anyhow::{Context, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};
use nix::unistd::{ForkResult, Pid, execvp, fork, setsid};
use tracing::{debug, warn};

use crate::reaper::ReaperState;

/// A successfully forked job.
#[derive(Debug, Clone, Copy)]
pub struct JobHandle {
    pub pid: Pid,
    pub background: bool,
}

/// Fork and exec `argv`, registering a timer for the child.
///
/// Never blocks; foreground jobs are awaited by the caller on the
/// completion channel. The timer is registered before this returns, so
/// the only gap the reaper can beat is fork-to-register, which the
/// unknown-elapsed sentinel covers.
pub fn launch(reaper: &ReaperState, argv: &[String], background: bool) -> Result<JobHandle> {
    // exec wants NUL-terminated strings; build them before forking so the
    // child touches no allocator.
    let exec_argv = to_exec_argv(argv)?;

    match unsafe { fork() }.context("fork failed")? {
        ForkResult::Parent { child } => {
            if !reaper.registry.register(child, background) {
                warn!(pid = child.as_raw(), "timer table full, job will report untimed");
            }
            debug!(pid = child.as_raw(), background, command = %argv[0], "launched");
            Ok(JobHandle {
                pid: child,
                background,
            })
        }
        ForkResult::Child => {
            if background {
                // Own session: terminal-generated signals stay with the shell.
                let _ = setsid();
            }
            restore_default_sigint();
            // execvp only returns on failure.
            if let Some(err) = execvp(&exec_argv[0], &exec_argv).err() {
                eprintln!("{}: exec failed: {}", argv[0], err);
            }
            std::process::exit(127)
        }
    }
}

/// The shell ignores SIGINT, and ignored dispositions survive exec, so
/// the child puts the default back before replacing its image.
fn restore_default_sigint() {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        let _ = sigaction(Signal::SIGINT, &action);
    }
}

fn to_exec_argv(argv: &[String]) -> Result<Vec<CString>> {
    argv.iter()
        .map(|arg| {
            CString::new(arg.as_str())
                .with_context(|| format!("argument contains a NUL byte: {arg:?}"))
        })
        .collect()
}
