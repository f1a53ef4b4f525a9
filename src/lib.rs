//! Process pipelines as first-class values.
//!
//! The entry point is the [`Stage`] type and the [`plumb`] shortcut.  A
//! stage is one node of a pipeline graph: an external command, an
//! in-process code block, or a plumbing fitting that sources or sinks
//! data without running anything.  Stages are linked with
//! [`input`](Stage::input), [`output`](Stage::output) and
//! [`stderr`](Stage::stderr); the graph then runs with
//! [`execute`](Stage::execute), which forks each command with its
//! standard streams connected to its neighbours by pipes.
//!
//! Setup is lazy throughout.  Nothing forks until the pipeline is
//! executed, and querying a result ([`ok`](Stage::ok),
//! [`error`](Stage::error), [`wait`](Stage::wait),
//! [`contents`](Stage::contents), [`getline`](Stage::getline)) executes
//! and waits as needed, so a pipeline can be described in full before a
//! single resource is acquired.
//!
//! The fittings cover the usual ends of a pipeline: a *plug* reads as
//! end-of-file and rejects writes, a *vent* yields endless NUL bytes and
//! discards writes, a *bucket* is an in-memory buffer poured into or
//! filled from a pipe, a *hose* hands the user one raw pipe end, and a
//! *prng* taps the system entropy device.  An unset slot gets a sensible
//! default at execute time: commands read end-of-file, collect their
//! output in a bucket, and share the host's standard error.
//!
//! # Examples
//!
//! Run a command over a buffer and collect the result:
//!
//! ```no_run
//! # use io_plumbing::{plumb, Stage};
//! # fn dummy() -> io_plumbing::Result<()> {
//! let sed = plumb("sed s/o/0/g")?.input(Stage::bucket_from("foo\n"))?;
//! assert_eq!(sed.terminus().contents_str()?, "f00\n");
//! # Ok(())
//! # }
//! ```
//!
//! Chain commands and read the terminus line by line:
//!
//! ```no_run
//! # use io_plumbing::plumb;
//! # fn dummy() -> io_plumbing::Result<()> {
//! let head = plumb("ls -l")?.output(plumb("sort -k5 -n")?)?;
//! let tail = head.terminus();
//! while let Some(line) = tail.getline()? {
//!     print!("{}", line);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! Feed a running command interactively through a hose:
//!
//! ```no_run
//! # use io_plumbing::{plumb, Stage};
//! # fn dummy() -> io_plumbing::Result<()> {
//! let hose = Stage::hose();
//! let cat = plumb("cat")?.input(&hose)?;
//! cat.execute()?;
//! hose.print("Hello, world\n")?;
//! hose.close()?;
//! assert_eq!(cat.terminus().getline()?.as_deref(), Some("Hello, world\n"));
//! # Ok(())
//! # }
//! ```
//!
//! The design is POSIX-only: it leans on `fork`, inherited descriptor
//! tables, and pipe semantics.  Everything runs on one thread in the
//! parent; concurrency between stages comes from the kernel.  Setting the
//! `IO_PLUMBING_DEBUG` environment variable to 1 traces fork and plumb
//! events to standard error, and 2 adds per-descriptor events.

#![warn(missing_docs)]

mod error;
mod exec;
mod fittings;
mod plumb;
mod posix;
mod stage;
mod status;
mod trace;
pub mod words;

pub use crate::error::{Error, Result};
pub use crate::exec::reap;
pub use crate::stage::{IntoInput, IntoOutput, Stage, StageKind};
pub use crate::status::{ExitStatus, Status};
pub use crate::words::{quote, unquote};

/// Constructs a program stage from a full command line.
///
/// The line is split into words with [`unquote`]; the first word becomes
/// the program, the rest its arguments.  Equivalent to
/// [`Stage::command`].
///
/// ```
/// # use io_plumbing::plumb;
/// let stage = plumb("cat -e").unwrap();
/// assert_eq!(stage.name(), "`cat -e`");
/// ```
pub fn plumb(command: impl AsRef<str>) -> Result<Stage> {
    Stage::command(command)
}

#[cfg(test)]
mod tests {
    mod common;
    mod fittings;
    mod pipeline;
    mod stage;
}
