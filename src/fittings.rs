//! The non-forking stages: plug, vent, bucket, hose, and PRNG.
//!
//! A fitting sources or sinks data without running a program.  Each has at
//! most one active direction: its role is fixed by whichever slot is
//! linked first, and linking the other direction is a configuration error.
//! Plug, vent, and the PRNG source hand a ready-made character-device
//! descriptor straight to the peer, so no pipe is created for their edges;
//! a bucket asks the peer to create a pipe and spools from the parent
//! process; a hose creates the pipe itself and keeps one end for the user.

use std::ffi::OsString;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::os::unix::io::{AsRawFd, RawFd};

use crate::error::{Error, Result};
use crate::stage::{Bound, ChildFd, Kind, SlotId, Stage};
use crate::status::Status;
use crate::trace::{fd_trace, plumb_warn};

const NULL_DEVICE: &str = "/dev/null";
const ZERO_DEVICE: &str = "/dev/zero";
const FULL_DEVICE: &str = "/dev/full";
const ENTROPY_DEVICE: &str = "/dev/urandom";

/// State of a bucket fitting.
#[derive(Default)]
pub(crate) struct BucketState {
    /// The bytes to pour, or the bytes collected so far.
    pub(crate) buffer: Vec<u8>,
    /// Cap on how much a filling bucket will collect.
    pub(crate) collect_max: Option<usize>,
    /// Whether the cap was exceeded and collection cut short.
    pub(crate) truncated: bool,
    /// Guards against spooling twice when the source is a file path.
    pub(crate) spooled: bool,
    /// `getline` position within `buffer`.
    pub(crate) cursor: usize,
}

/// The user-facing end of a hose, once the edge has been materialized.
pub(crate) enum HoseEnd {
    /// Gushing hose: the user writes, the peer reads.
    Writer(File),
    /// Sucking hose: the peer writes, the user reads.
    Reader(BufReader<File>),
}

#[derive(Default)]
pub(crate) struct HoseState {
    pub(crate) end: Option<HoseEnd>,
}

/// State of a PRNG fitting: the command its sink orientation delegates to.
pub(crate) struct PrngState {
    pub(crate) encrypt_argv: Vec<OsString>,
}

impl Default for PrngState {
    fn default() -> PrngState {
        PrngState {
            encrypt_argv: ["gpg", "--encrypt", "--default-recipient-self"]
                .into_iter()
                .map(OsString::from)
                .collect(),
        }
    }
}

fn open_read(path: &str) -> Result<File> {
    Ok(OpenOptions::new().read(true).open(path)?)
}

fn open_write(path: &str) -> Result<File> {
    Ok(OpenOptions::new().write(true).open(path)?)
}

/// Whether an edge landing on `slot` of this stage requires a pipe, or the
/// stage can supply a ready-made descriptor via [`fd_pair`].
pub(crate) fn needs_pipe(stage: &Stage, slot: SlotId) -> bool {
    let inner = stage.inner.borrow();
    match inner.kind {
        Kind::Program | Kind::Code | Kind::Bucket(_) => true,
        Kind::Plug | Kind::Vent | Kind::Hose(_) => false,
        // the PRNG source is a device; the sink forks its encryption
        // command and is plumbed like any program
        Kind::Prng(_) => slot.is_input(),
    }
}

/// Produce the descriptor this fitting contributes for an edge landing on
/// `slot`.  For a hose this creates the pipe and keeps the user-facing
/// end; for the device fittings it opens the appropriate device.
pub(crate) fn fd_pair(stage: &Stage, slot: SlotId) -> Result<File> {
    let mut inner = stage.inner.borrow_mut();
    let file = match &mut inner.kind {
        Kind::Plug => {
            if slot.is_input() {
                // every write must fail: an always-full device
                open_write(FULL_DEVICE)?
            } else {
                // reading the null device yields immediate end-of-file
                open_read(NULL_DEVICE)?
            }
        }
        Kind::Vent => {
            if slot.is_input() {
                open_write(NULL_DEVICE)?
            } else {
                open_read(ZERO_DEVICE)?
            }
        }
        Kind::Prng(_) => open_read(ENTROPY_DEVICE)?,
        Kind::Hose(hose) => {
            let (read, write) = crate::posix::pipe()?;
            if slot.is_input() {
                // peer writes into the hose; user reads
                hose.end = Some(HoseEnd::Reader(BufReader::new(read)));
                write
            } else {
                // hose feeds the peer; user writes
                hose.end = Some(HoseEnd::Writer(write));
                read
            }
        }
        Kind::Program | Kind::Code | Kind::Bucket(_) => {
            unreachable!("fd_pair on a stage that needs a pipe")
        }
    };
    fd_trace!(
        "{} supplies fd {} for its {:?} side",
        inner.name(),
        file.as_raw_fd(),
        slot
    );
    Ok(file)
}

/// True if this is a pouring bucket with a plumbed pipe end it has not yet
/// written its buffer into.
pub(crate) fn pour_pending(stage: &Stage) -> bool {
    let inner = stage.inner.borrow();
    matches!(inner.kind, Kind::Bucket(_))
        && inner.fitting_orientation() == Some(SlotId::Output)
        && inner.fds.contains_key(&SlotId::Output.fd())
}

/// Write a pouring bucket's buffer into its pipe end and close it.
///
/// Runs in the parent, after the consumer has forked.  A consumer that
/// exits without draining its input produces a broken pipe, which is not
/// an error: the consumer's own status tells that story.
pub(crate) fn pour(stage: &Stage) -> Result<()> {
    let (mut file, buffer) = {
        let mut inner = stage.inner.borrow_mut();
        let buffer = match &inner.kind {
            Kind::Bucket(bucket) => bucket.buffer.clone(),
            _ => return Ok(()),
        };
        let Some(ChildFd::Prepared(file, _)) = inner.fds.remove(&SlotId::Output.fd()) else {
            return Ok(());
        };
        inner.status = Status::Done;
        (file, buffer)
    };
    fd_trace!("{} pours {} bytes", stage.name(), buffer.len());
    match file.write_all(&buffer) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::BrokenPipe => Ok(()),
        Err(err) => Err(err.into()),
    }
}

/// Drain a filling bucket's pipe end into its buffer, honoring
/// `collect_max`, then close the pipe.
///
/// Closing at the cap makes further upstream writes fail with a broken
/// pipe, which is what stops an unbounded producer.
pub(crate) fn spool(stage: &Stage) -> Result<()> {
    let (file, max) = {
        let mut inner = stage.inner.borrow_mut();
        if !matches!(inner.kind, Kind::Bucket(_))
            || inner.fitting_orientation() != Some(SlotId::Input)
        {
            return Ok(());
        }
        let max = match &inner.kind {
            Kind::Bucket(bucket) => {
                if bucket.spooled {
                    return Ok(());
                }
                bucket.collect_max
            }
            _ => unreachable!(),
        };
        let file = match inner.fds.remove(&SlotId::Input.fd()) {
            Some(ChildFd::Prepared(file, _)) => Some(file),
            Some(other) => {
                inner.fds.insert(SlotId::Input.fd(), other);
                None
            }
            // a bucket filling straight from a file path has no plumbed
            // pipe; open the file here
            None => match inner.slot(SlotId::Input) {
                Some(Bound::Path(path)) => Some(File::open(path)?),
                _ => None,
            },
        };
        if let Kind::Bucket(bucket) = &mut inner.kind {
            bucket.spooled = true;
        }
        (file, max)
    };
    let Some(mut file) = file else {
        mark_bucket_done(stage);
        return Ok(());
    };

    let mut collected = Vec::new();
    let mut truncated = false;
    match max {
        None => {
            file.read_to_end(&mut collected)?;
        }
        Some(max) => {
            let mut chunk = [0u8; 8192];
            loop {
                let space = max.saturating_sub(collected.len());
                if space == 0 {
                    // probe whether the producer had more to say
                    let mut probe = [0u8; 1];
                    if read_retry(&mut file, &mut probe)? > 0 {
                        truncated = true;
                    }
                    break;
                }
                let want = space.min(chunk.len());
                let n = read_retry(&mut file, &mut chunk[..want])?;
                if n == 0 {
                    break;
                }
                collected.extend_from_slice(&chunk[..n]);
            }
        }
    }
    drop(file);

    if truncated {
        let upstream = upstream_description(stage);
        plumb_warn!(
            "{}: not spooling more than {} bytes from `{}`",
            stage.name(),
            max.unwrap_or_default(),
            upstream
        );
    }
    {
        let mut inner = stage.inner.borrow_mut();
        if let Kind::Bucket(bucket) = &mut inner.kind {
            bucket.buffer.extend_from_slice(&collected);
            bucket.truncated = truncated;
        }
    }
    mark_bucket_done(stage);
    Ok(())
}

fn mark_bucket_done(stage: &Stage) {
    let mut inner = stage.inner.borrow_mut();
    if matches!(inner.status, Status::Ready | Status::Running) {
        inner.status = Status::Done;
    }
}

fn read_retry(file: &mut File, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        match file.read(buf) {
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            other => return other,
        }
    }
}

/// How to refer to the stage feeding this one, for messages: the command
/// line of a program stage, otherwise the peer's name.
fn upstream_description(stage: &Stage) -> String {
    match stage.input_peer() {
        Some(peer) => {
            let inner = peer.inner.borrow();
            match inner.kind {
                Kind::Program => inner.cmdline(),
                _ => inner.name(),
            }
        }
        None => "(unplumbed)".to_owned(),
    }
}

impl Stage {
    fn with_bucket<R>(
        &self,
        op: &str,
        f: impl FnOnce(&mut BucketState) -> R,
    ) -> Result<R> {
        let mut inner = self.inner.borrow_mut();
        match &mut inner.kind {
            Kind::Bucket(bucket) => Ok(f(bucket)),
            _ => Err(Error::config(format!(
                "{} on {}: only a bucket can do that",
                op,
                inner.name()
            ))),
        }
    }

    /// Caps how many bytes this bucket will collect.
    ///
    /// When the producer has more than `max` bytes to offer, collection
    /// stops there, the excess is recorded as truncated, a warning naming
    /// the producer is emitted, and the pipe is closed, which ends an
    /// unbounded producer with a broken pipe.
    ///
    /// Returns the stage for chaining.
    pub fn collect_max(&self, max: usize) -> Result<Stage> {
        self.with_bucket("collect_max", |bucket| bucket.collect_max = Some(max))?;
        Ok(self.clone())
    }

    /// True if this bucket hit its [`collect_max`](Stage::collect_max) cap.
    pub fn truncated(&self) -> bool {
        matches!(
            &self.inner.borrow().kind,
            Kind::Bucket(bucket) if bucket.truncated
        )
    }

    /// The bucket's collected (or to-be-poured) bytes.
    ///
    /// On a filling bucket this forces the upstream pipeline to execute,
    /// drains the pipe, and waits for the producers, so the returned
    /// buffer is complete.
    ///
    /// Writes from several concurrent producers into one bucket are only
    /// atomic up to the kernel's pipe-buffer unit (at least 4 KiB on
    /// POSIX); larger writes may interleave.
    pub fn contents(&self) -> Result<Vec<u8>> {
        self.with_bucket("contents", |_| ())?;
        if self.inner.borrow().fitting_orientation() == Some(SlotId::Input) {
            crate::exec::settle_fitting(self)?;
        }
        self.with_bucket("contents", |bucket| bucket.buffer.clone())
    }

    /// Like [`contents`](Stage::contents), lossily decoded as UTF-8.
    pub fn contents_str(&self) -> Result<String> {
        Ok(String::from_utf8_lossy(&self.contents()?).into_owned())
    }

    /// Replaces a bucket's buffer with `data`, making it worth pouring.
    pub fn set_contents(&self, data: impl Into<Vec<u8>>) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        if inner.fitting_orientation() == Some(SlotId::Input) {
            return Err(Error::config(format!(
                "cannot set contents of {}: it collects, not pours",
                inner.name()
            )));
        }
        match &mut inner.kind {
            Kind::Bucket(bucket) => bucket.buffer = data.into(),
            _ => {
                return Err(Error::config(format!(
                    "set_contents on {}: only a bucket can do that",
                    inner.name()
                )));
            }
        }
        inner.recompute_status();
        Ok(())
    }

    /// Reads the next line, newline included.
    ///
    /// On a filling bucket the first call forces execute-and-wait on the
    /// upstream pipeline, then lines are handed out from the collected
    /// buffer.  On a sucking hose this reads a line from the peer as it is
    /// produced.  Returns `None` at the end of the data.
    pub fn getline(&self) -> Result<Option<String>> {
        enum Which {
            Bucket,
            Hose,
        }
        let which = {
            let inner = self.inner.borrow();
            match inner.kind {
                Kind::Bucket(_) => Which::Bucket,
                Kind::Hose(_) => Which::Hose,
                _ => {
                    return Err(Error::config(format!(
                        "getline on {}: only a bucket or hose can do that",
                        inner.name()
                    )));
                }
            }
        };
        match which {
            Which::Bucket => {
                if self.inner.borrow().fitting_orientation() == Some(SlotId::Input) {
                    crate::exec::settle_fitting(self)?;
                }
                self.with_bucket("getline", |bucket| {
                    let rest = &bucket.buffer[bucket.cursor..];
                    if rest.is_empty() {
                        return None;
                    }
                    let end = match rest.iter().position(|&b| b == b'\n') {
                        Some(newline) => newline + 1,
                        None => rest.len(),
                    };
                    let line = String::from_utf8_lossy(&rest[..end]).into_owned();
                    bucket.cursor += end;
                    Some(line)
                })
            }
            Which::Hose => {
                let mut inner = self.inner.borrow_mut();
                let name = inner.name();
                match &mut inner.kind {
                    Kind::Hose(HoseState {
                        end: Some(HoseEnd::Reader(reader)),
                    }) => {
                        let mut line = String::new();
                        if reader.read_line(&mut line)? == 0 {
                            Ok(None)
                        } else {
                            Ok(Some(line))
                        }
                    }
                    Kind::Hose(HoseState {
                        end: Some(HoseEnd::Writer(_)),
                    }) => Err(Error::config(format!(
                        "getline on {}: the user side of this hose writes",
                        name
                    ))),
                    Kind::Hose(_) => Err(Error::config(format!(
                        "getline on {}: not yet connected",
                        name
                    ))),
                    _ => unreachable!(),
                }
            }
        }
    }

    /// Writes `text` into a gushing hose; the peer reads it as its input.
    pub fn print(&self, text: impl AsRef<[u8]>) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        let name = inner.name();
        match &mut inner.kind {
            Kind::Hose(HoseState {
                end: Some(HoseEnd::Writer(writer)),
            }) => {
                writer.write_all(text.as_ref())?;
                Ok(())
            }
            Kind::Hose(HoseState {
                end: Some(HoseEnd::Reader(_)),
            }) => Err(Error::config(format!(
                "print on {}: the user side of this hose reads",
                name
            ))),
            Kind::Hose(_) => Err(Error::config(format!(
                "print on {}: not yet connected",
                name
            ))),
            _ => Err(Error::config(format!(
                "print on {}: only a hose can do that",
                name
            ))),
        }
    }

    /// Closes the user-facing end of a hose.
    ///
    /// For a gushing hose this delivers end-of-file to the peer, which is
    /// how the peer learns the input is complete.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.borrow_mut();
        match &mut inner.kind {
            Kind::Hose(hose) => {
                hose.end = None;
                Ok(())
            }
            _ => Err(Error::config(format!(
                "close on {}: only a hose can do that",
                inner.name()
            ))),
        }
    }

    /// The raw descriptor of the hose's user-facing end, for callers that
    /// want to poll or hand it to other I/O machinery.
    pub fn handle_fd(&self) -> Option<RawFd> {
        match &self.inner.borrow().kind {
            Kind::Hose(HoseState { end: Some(end) }) => Some(match end {
                HoseEnd::Writer(file) => file.as_raw_fd(),
                HoseEnd::Reader(reader) => reader.get_ref().as_raw_fd(),
            }),
            _ => None,
        }
    }

    /// Replaces the PRNG's sink command, a full command line.
    pub fn encrypt_with(&self, cmdline: impl AsRef<str>) -> Result<Stage> {
        let argv: Vec<OsString> = crate::words::unquote(cmdline.as_ref())?
            .into_iter()
            .map(OsString::from)
            .collect();
        if argv.is_empty() {
            return Err(Error::config("encrypt_with: empty command line"));
        }
        let mut inner = self.inner.borrow_mut();
        match &mut inner.kind {
            Kind::Prng(prng) => {
                prng.encrypt_argv = argv;
                Ok(())
            }
            _ => Err(Error::config(format!(
                "encrypt_with on {}: only a prng can do that",
                inner.name()
            ))),
        }?;
        Ok(self.clone())
    }
}
