//! Edge materialization: the protocol by which two adjacent stages decide,
//! per edge, whether a pipe is needed, which side creates it, and which
//! side must close which descriptor after fork.
//!
//! When a stage about to fork prepares a slot that points at a peer, it
//! first asks whether the peer can supply a ready-made descriptor for that
//! direction (a device fitting, or a hose handing over one pipe end).  If
//! so, no pipe is created.  Otherwise the forking stage creates a pipe,
//! keeps the end matching its own direction, and hands the opposite end to
//! the peer's fd table.  Each side flags its retained end
//! close-in-parent-after-fork exactly when that side itself forks; a
//! non-forking holder, like a bucket that spools from the parent process,
//! keeps its end open past the peer's fork.  Together with the symmetric
//! back-references this creates every pipe exactly once per edge.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::stage::{Bound, ChildFd, SlotId, Stage};
use crate::trace::{fd_trace, plumb_debug};
use crate::{fittings, posix};

enum Plan {
    Nothing,
    Inherit,
    Open(PathBuf),
    Supplied(File),
    Peer(Stage, SlotId),
    DroppedPeer,
}

/// Prepare the child-side descriptor for one slot of a stage that is
/// about to fork.
pub(crate) fn materialize(stage: &Stage, slot: SlotId) -> Result<()> {
    let fd_no = slot.fd();
    let plan = {
        let mut inner = stage.inner.borrow_mut();
        // the peer may have made this edge when it prepared its own side
        if inner.fds.contains_key(&fd_no) {
            return Ok(());
        }
        match inner.slot_mut(slot) {
            None => Plan::Nothing,
            Some(Bound::Inherit) => Plan::Inherit,
            Some(Bound::Path(path)) => Plan::Open(path.clone()),
            Some(Bound::Handle(file)) => match file.take() {
                Some(file) => Plan::Supplied(file),
                None => Plan::Nothing,
            },
            Some(Bound::Peer(edge)) => {
                let peer_slot = slot.opposite(edge.peer_index);
                match edge.peer.resolve() {
                    Some(peer) => Plan::Peer(peer, peer_slot),
                    None => Plan::DroppedPeer,
                }
            }
        }
    };

    match plan {
        Plan::Nothing => Ok(()),
        Plan::DroppedPeer => Err(Error::config(format!(
            "the stage plumbed into {:?} of {} was dropped",
            slot,
            stage.name()
        ))),
        Plan::Inherit => {
            fd_trace!("{}: fd {} inherited from the host", stage.name(), fd_no);
            stage.inner.borrow_mut().fds.insert(fd_no, ChildFd::Inherit);
            Ok(())
        }
        Plan::Open(path) => {
            let file = if slot.is_input() {
                File::open(&path)?
            } else {
                File::create(&path)?
            };
            fd_trace!(
                "{}: fd {} opened on {}",
                stage.name(),
                file.as_raw_fd(),
                path.display()
            );
            stage.set_fd(fd_no, file, true);
            Ok(())
        }
        Plan::Supplied(file) => {
            fd_trace!(
                "{}: fd {} supplied by the caller",
                stage.name(),
                file.as_raw_fd()
            );
            stage.set_fd(fd_no, file, true);
            Ok(())
        }
        Plan::Peer(peer, peer_slot) => plumb_edge(stage, slot, &peer, peer_slot),
    }
}

fn plumb_edge(stage: &Stage, slot: SlotId, peer: &Stage, peer_slot: SlotId) -> Result<()> {
    if !fittings::needs_pipe(peer, peer_slot) {
        // the peer has a ready-made descriptor for this direction
        let file = fittings::fd_pair(peer, peer_slot)?;
        plumb_debug!(
            "plumb {:?} of {} straight from {}",
            slot,
            stage.name(),
            peer.name()
        );
        stage.set_fd(slot.fd(), file, true);
        return Ok(());
    }

    let (read, write) = posix::pipe()?;
    let peer_forks = peer.inner.borrow().needs_fork();
    plumb_debug!(
        "plumb {:?} of {} to {} via pipe (read fd {}, write fd {})",
        slot,
        stage.name(),
        peer.name(),
        read.as_raw_fd(),
        write.as_raw_fd()
    );
    if slot.is_input() {
        stage.set_fd(slot.fd(), read, true);
        peer.set_fd(peer_slot.fd(), write, peer_forks);
    } else {
        stage.set_fd(slot.fd(), write, true);
        peer.set_fd(peer_slot.fd(), read, peer_forks);
    }
    Ok(())
}
