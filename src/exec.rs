//! The executor: walking the pipeline graph, forking stages in order,
//! connecting descriptors, and reaping children.
//!
//! Execution starts from whichever stage the user touched, walks upstream
//! to the head, then runs each stage in order back down to the tail.  A
//! forking stage resolves default bindings for unset slots, materializes a
//! child descriptor per slot (input first, so the pipes feeding it exist
//! before it forks), forks, and in the child rewires fd 0/1/2 before
//! execing or running the in-process code block.  Non-forking fittings
//! just join the running pipeline; their in-parent helpers (bucket pour
//! and spool, the hose handle) drive the descriptors they hold.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ffi::{OsStr, OsString};
use std::io::Write;
use std::os::unix::io::{AsRawFd, IntoRawFd};
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::stage::{Bound, ChildFd, Kind, SlotId, Stage, StageInner};
use crate::status::{ExitStatus, Status};
use crate::trace::{fd_trace, plumb_debug};
use crate::{fittings, plumb, posix};

thread_local! {
    /// Running children of this orchestrating thread, by pid.  Mutated on
    /// fork and on reap; holds weak references so it never prolongs a
    /// stage's lifetime.  Stages are single-threaded, so each thread that
    /// forks pipelines services its own children.
    static RUNNING: RefCell<HashMap<u32, Weak<RefCell<StageInner>>>> =
        RefCell::new(HashMap::new());
}

/// Starts the pipeline containing `stage`; see [`Stage::execute`].
pub(crate) fn execute(stage: &Stage) -> Result<()> {
    let mut visiting = Vec::new();
    execute_inner(stage, &mut visiting)?;
    run_pending_pours(stage)
}

fn execute_inner(stage: &Stage, visiting: &mut Vec<Stage>) -> Result<()> {
    if started(stage) {
        return Ok(());
    }
    if visiting.contains(stage) {
        return Err(Error::config(format!(
            "pipeline around {} contains a cycle",
            stage.name()
        )));
    }
    visiting.push(stage.clone());

    // walk to the head; the cascade back down will run this stage
    let upstream = stage
        .peer(SlotId::Input)
        .filter(|up| !matches!(up.status(), Status::Running | Status::Done));
    match upstream {
        Some(up) => {
            execute_inner(&up, visiting)?;
            if started(stage) {
                Ok(())
            } else {
                // the upstream could not cascade into us (e.g. it was lost)
                run_from(stage)
            }
        }
        None => run_from(stage),
    }
}

fn started(stage: &Stage) -> bool {
    matches!(
        stage.status(),
        Status::Running | Status::Done | Status::Lost
    )
}

/// Run `stage`, whose upstream is already live, then cascade into its
/// downstream peers.
fn run_from(stage: &Stage) -> Result<()> {
    run_one(stage)?;
    for slot in [SlotId::Output, SlotId::Stderr] {
        if let Some(peer) = stage.peer(slot)
            && !started(&peer)
        {
            run_from(&peer)?;
        }
    }
    Ok(())
}

fn run_one(stage: &Stage) -> Result<()> {
    let (forking, status) = {
        let inner = stage.inner.borrow();
        (inner.needs_fork(), inner.status)
    };
    if status == Status::Error {
        return Err(Error::config(format!(
            "{} is not ready to run",
            stage.name()
        )));
    }
    if !forking {
        stage.inner.borrow_mut().status = Status::Running;
        plumb_debug!("{} joins the running pipeline", stage.name());
        return Ok(());
    }

    resolve_defaults(stage);
    for slot in SlotId::ALL {
        plumb::materialize(stage, slot)?;
    }

    if let Some(mut hook) = stage.inner.borrow_mut().pre_fork.take() {
        hook(stage);
        stage.inner.borrow_mut().pre_fork = Some(hook);
    }

    fork_stage(stage)
}

/// Fill in the default bindings for slots left unset: input reads
/// end-of-file from a plug, output collects into a bucket, stderr goes to
/// the host's standard error.  A peer that was dropped counts as unset.
fn resolve_defaults(stage: &Stage) {
    for slot in SlotId::ALL {
        {
            let mut inner = stage.inner.borrow_mut();
            let dead_peer = matches!(
                inner.slot(slot),
                Some(Bound::Peer(edge)) if edge.peer.resolve().is_none()
            );
            if dead_peer {
                *inner.slot_mut(slot) = None;
            }
            if inner.slot(slot).is_some() {
                continue;
            }
            if slot == SlotId::Stderr {
                *inner.slot_mut(slot) = Some(Bound::Inherit);
                continue;
            }
        }
        match slot {
            SlotId::Input => stage.link_default(slot, &Stage::plug()),
            SlotId::Output => stage.link_default(slot, &Stage::bucket()),
            SlotId::Stderr => unreachable!(),
        }
    }
}

fn format_env(env: &[(OsString, OsString)]) -> Vec<OsString> {
    let mut seen = HashSet::<&OsStr>::new();
    let mut formatted: Vec<OsString> = env
        .iter()
        .rev()
        .filter(|(k, _)| seen.insert(k))
        .map(|(k, v)| {
            let mut entry = k.clone();
            entry.push("=");
            entry.push(v);
            entry
        })
        .collect();
    formatted.reverse();
    formatted
}

fn fork_stage(stage: &Stage) -> Result<()> {
    // prepare the exec before forking, so the child only issues syscalls
    let exec_closure = {
        let inner = stage.inner.borrow();
        match inner.kind {
            Kind::Code => None,
            _ => {
                let program = inner
                    .program
                    .clone()
                    .ok_or_else(|| Error::config(format!("{} has no program", inner.name())))?;
                let argv = inner.argv();
                let env = inner.env.as_deref().map(format_env);
                Some(posix::prep_exec(&program, &argv, env.as_deref())?)
            }
        }
    };

    plumb_debug!("forking {}", stage.name());
    match unsafe { posix::fork() }? {
        None => child_main(stage, exec_closure),
        Some(pid) => {
            {
                let mut inner = stage.inner.borrow_mut();
                inner.pid = Some(pid);
                inner.status = Status::Running;
                // close our copies of the descriptors this child now owns;
                // ends held for non-forking neighbours stay open
                let fds = std::mem::take(&mut inner.fds);
                let mut kept = BTreeMap::new();
                for (fd_no, entry) in fds {
                    match entry {
                        ChildFd::Prepared(file, true) => {
                            fd_trace!(
                                "parent closes fd {} after forking pid {}",
                                file.as_raw_fd(),
                                pid
                            );
                        }
                        other => {
                            kept.insert(fd_no, other);
                        }
                    }
                }
                inner.fds = kept;
            }
            RUNNING.with(|table| {
                table
                    .borrow_mut()
                    .insert(pid, Rc::downgrade(&stage.inner));
            });
            plumb_debug!("forked {}", stage.name());
            Ok(())
        }
    }
}

/// Child-side setup: rewire fd 0/1/2, change directory, then exec or run
/// the code block.  Never returns.
fn child_main(
    stage: &Stage,
    exec_closure: Option<impl FnOnce() -> std::io::Error>,
) -> ! {
    let code = {
        let mut inner = stage.inner.borrow_mut();
        let fds = std::mem::take(&mut inner.fds);
        for target in 0..3 {
            match fds.get(&target) {
                Some(ChildFd::Prepared(file, _)) => {
                    if file.as_raw_fd() != target && posix::dup2(file.as_raw_fd(), target).is_err()
                    {
                        posix::_exit(126);
                    }
                }
                Some(ChildFd::Inherit) => {}
                None => {
                    let _ = posix::close(target);
                }
            }
        }
        // close the inherited originals, except one already sitting on its
        // target fd, which must stay open
        for (target, entry) in fds {
            if let ChildFd::Prepared(file, _) = entry {
                if file.as_raw_fd() == target {
                    let _ = file.into_raw_fd();
                }
            }
        }
        if let Some(cwd) = inner.cwd.clone()
            && std::env::set_current_dir(&cwd).is_err()
        {
            eprintln!("cannot chdir to {}", cwd.display());
            posix::_exit(126);
        }
        if inner.code.is_some()
            && let Some(env) = inner.env.take()
        {
            // code blocks run in this address space, so give them the
            // configured environment directly
            let current: Vec<OsString> = std::env::vars_os().map(|(k, _)| k).collect();
            unsafe {
                for key in current {
                    std::env::remove_var(key);
                }
                for (key, value) in env {
                    std::env::set_var(key, value);
                }
            }
        }
        inner.pid = Some(posix::getpid());
        inner.code.take()
    };

    let _ = posix::reset_sigpipe();
    if let Some(mut hook) = stage.inner.borrow_mut().pre_exec.take() {
        hook(stage);
    }

    match exec_closure {
        Some(just_exec) => {
            let err = just_exec();
            eprintln!("exec {}: {}", stage.name(), err);
            posix::_exit(127);
        }
        None => {
            if let Some(mut code) = code {
                code(stage);
            }
            let _ = std::io::stdout().flush();
            let _ = std::io::stderr().flush();
            posix::_exit(0);
        }
    }
}

/// Pour any bucket that has a plumbed pipe end and a forked consumer.
/// Runs after the whole cascade, so the downstream stages that drain the
/// poured data are already alive.
fn run_pending_pours(stage: &Stage) -> Result<()> {
    for member in collect_graph(stage) {
        if fittings::pour_pending(&member) {
            fittings::pour(&member)?;
        }
    }
    Ok(())
}

/// Every stage reachable from `stage` over any edge, in no particular
/// order.
fn collect_graph(stage: &Stage) -> Vec<Stage> {
    let mut seen: Vec<Stage> = Vec::new();
    let mut queue = vec![stage.clone()];
    while let Some(member) = queue.pop() {
        if seen.contains(&member) {
            continue;
        }
        for slot in SlotId::ALL {
            if let Some(peer) = member.peer(slot) {
                queue.push(peer);
            }
        }
        seen.push(member);
    }
    seen
}

/// The input spine from the head down to `stage`, inclusive.
fn upstream_chain(stage: &Stage) -> Vec<Stage> {
    let mut chain = vec![stage.clone()];
    let mut current = stage.clone();
    while let Some(up) = current.peer(SlotId::Input) {
        if chain.contains(&up) {
            break;
        }
        chain.push(up.clone());
        current = up;
    }
    chain.reverse();
    chain
}

/// Waits on `stage` after the pipeline has been executed; see
/// [`Stage::wait`].
pub(crate) fn wait_stage(stage: &Stage) -> Result<Option<ExitStatus>> {
    let last_forker = settle(stage)?;
    if stage.inner.borrow().needs_fork() {
        Ok(stage.rc())
    } else {
        // a fitting reports the producer feeding it
        last_forker.ok_or_else(|| {
            Error::config(format!("{} has no child to wait for", stage.name()))
        })
    }
}

/// Executes, drains, and reaps the pipeline around a fitting, without
/// insisting that a child exists.  Used by the bucket observers.
pub(crate) fn settle_fitting(stage: &Stage) -> Result<()> {
    execute(stage)?;
    settle(stage)?;
    Ok(())
}

/// Drain the terminus bucket, then reap every forking stage on the input
/// spine, head first.  Returns the last forker's result, if there was one.
///
/// Draining before reaping matters: a child blocked writing into an
/// unread pipe never exits, so `waitpid` on it would never return.
fn settle(stage: &Stage) -> Result<Option<Option<ExitStatus>>> {
    fittings::spool(stage)?;
    let terminus = stage.terminus();
    fittings::spool(&terminus)?;

    let mut last = None;
    for member in upstream_chain(stage) {
        if member.inner.borrow().needs_fork() {
            last = Some(wait_one(&member)?);
        } else if member.status() == Status::Running {
            member.inner.borrow_mut().status = Status::Done;
        }
    }
    Ok(last)
}

fn wait_one(stage: &Stage) -> Result<Option<ExitStatus>> {
    let (pid, status) = {
        let inner = stage.inner.borrow();
        (inner.pid, inner.status)
    };
    match status {
        Status::Done => Ok(stage.rc()),
        Status::Lost => Ok(None),
        Status::Running => {
            let Some(pid) = pid else {
                return Ok(None);
            };
            match posix::waitpid(pid, 0) {
                Ok((got, raw)) if got == pid => {
                    let rc = ExitStatus(raw);
                    record_exit(stage, rc);
                    Ok(Some(rc))
                }
                Ok(_) => {
                    mark_lost(stage);
                    Ok(None)
                }
                Err(err) if err.raw_os_error() == Some(posix::ECHILD) => {
                    // someone else reaped the child; its status is gone
                    mark_lost(stage);
                    Ok(None)
                }
                Err(err) => Err(err.into()),
            }
        }
        Status::Ready | Status::Error => Err(Error::config(format!(
            "{} was never started",
            stage.name()
        ))),
    }
}

fn record_exit(stage: &Stage, rc: ExitStatus) {
    let pid = {
        let mut inner = stage.inner.borrow_mut();
        inner.rc = Some(rc);
        inner.status = Status::Done;
        inner.pid
    };
    if let Some(pid) = pid {
        forget_running(pid);
    }
    plumb_debug!("{}: {}", stage.name(), rc);
}

fn mark_lost(stage: &Stage) {
    let pid = {
        let mut inner = stage.inner.borrow_mut();
        inner.status = Status::Lost;
        inner.pid
    };
    if let Some(pid) = pid {
        forget_running(pid);
    }
    plumb_debug!("{}: lost", stage.name());
}

pub(crate) fn forget_running(pid: u32) {
    let _ = RUNNING.try_with(|table| {
        table.borrow_mut().remove(&pid);
    });
}

/// Non-blocking completion check; see [`Stage::poll`].
pub(crate) fn poll_stage(stage: &Stage) -> Option<ExitStatus> {
    let (pid, status) = {
        let inner = stage.inner.borrow();
        (inner.pid, inner.status)
    };
    match status {
        Status::Done => stage.rc(),
        Status::Running => {
            let pid = pid?;
            match posix::waitpid(pid, posix::WNOHANG) {
                Ok((got, raw)) if got == pid => {
                    let rc = ExitStatus(raw);
                    record_exit(stage, rc);
                    Some(rc)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

pub(crate) fn signal_stage(stage: &Stage, signal: i32) -> Result<()> {
    let inner = stage.inner.borrow();
    if inner.status == Status::Running
        && let Some(pid) = inner.pid
    {
        posix::kill(pid, signal)?;
    }
    Ok(())
}

/// Reap finished children without blocking, up to `max` of them (or all
/// that are ready, if `None`).  Returns how many were reaped.
///
/// Any child of this thread's pipelines is serviced, regardless of which
/// stage handles the caller still holds; a stage reaped here transitions
/// to `Done` with its exit status recorded.  Children are polled
/// individually rather than with `waitpid(-1, ...)`, so a host that runs
/// pipelines on several threads, or forks children of its own, never has
/// them reaped out from under it.
pub fn reap(max: Option<usize>) -> usize {
    let pids: Vec<u32> = RUNNING.with(|table| table.borrow().keys().copied().collect());
    let mut reaped = 0;
    for pid in pids {
        if let Some(max) = max
            && reaped >= max
        {
            break;
        }
        let finished = match posix::waitpid(pid, posix::WNOHANG) {
            Ok((got, raw)) if got == pid => Some(Some(ExitStatus(raw))),
            Ok(_) => None,
            Err(err) if err.raw_os_error() == Some(posix::ECHILD) => Some(None),
            Err(_) => None,
        };
        let Some(rc) = finished else {
            continue;
        };
        reaped += 1;
        let found = RUNNING.with(|table| table.borrow_mut().remove(&pid));
        if let Some(inner) = found.and_then(|weak| weak.upgrade()) {
            let mut inner = inner.borrow_mut();
            match rc {
                Some(rc) => {
                    inner.rc = Some(rc);
                    inner.status = Status::Done;
                }
                None => inner.status = Status::Lost,
            }
            plumb_debug!("reaped {}", inner.name());
        }
    }
    reaped
}
