use std::cell::RefCell;
use std::collections::BTreeMap;
use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::rc::{Rc, Weak};

use crate::error::{Error, Result};
use crate::fittings::{BucketState, HoseState, PrngState};
use crate::status::{ExitStatus, Status};
use crate::exec;
use crate::words;

/// The three edge slots of a stage.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum SlotId {
    Input,
    Output,
    Stderr,
}

impl SlotId {
    pub(crate) const ALL: [SlotId; 3] = [SlotId::Input, SlotId::Output, SlotId::Stderr];

    pub(crate) fn idx(self) -> usize {
        match self {
            SlotId::Input => 0,
            SlotId::Output => 1,
            SlotId::Stderr => 2,
        }
    }

    /// The child-side fd number this slot binds to, in the default fd
    /// shape: input is fd 0, output is fd 1, stderr is fd 2.
    pub(crate) fn fd(self) -> i32 {
        self.idx() as i32
    }

    pub(crate) fn is_input(self) -> bool {
        matches!(self, SlotId::Input)
    }

    /// The peer-side slot an edge from this slot terminates at, given the
    /// edge's peer-slot index.
    pub(crate) fn opposite(self, peer_index: usize) -> SlotId {
        if self.is_input() {
            // our input is fed by one of the peer's output-direction slots
            match peer_index {
                0 => SlotId::Output,
                _ => SlotId::Stderr,
            }
        } else {
            SlotId::Input
        }
    }

    /// This slot's index within its direction: input slots count from 0,
    /// as do output-direction slots (output 0, stderr 1).
    pub(crate) fn dir_index(self) -> usize {
        match self {
            SlotId::Input | SlotId::Output => 0,
            SlotId::Stderr => 1,
        }
    }

    fn describe(self) -> &'static str {
        match self {
            SlotId::Input => "input",
            SlotId::Output => "output",
            SlotId::Stderr => "stderr",
        }
    }
}

/// Reference to the peer stage of an edge.
///
/// The slot the user set holds a strong handle; the automatically
/// installed back-reference holds a weak one, so a stage is kept alive by
/// the user and by the forward direction of its edges only.
pub(crate) enum PeerRef {
    Strong(Stage),
    Back(Weak<RefCell<StageInner>>),
}

impl PeerRef {
    pub(crate) fn resolve(&self) -> Option<Stage> {
        match self {
            PeerRef::Strong(stage) => Some(stage.clone()),
            PeerRef::Back(weak) => weak.upgrade().map(|inner| Stage { inner }),
        }
    }
}

/// A directed link between two stages: the peer, and the index of the
/// peer's opposite-direction slot the edge terminates at.
pub(crate) struct Edge {
    pub(crate) peer: PeerRef,
    pub(crate) peer_index: usize,
}

/// What a slot is bound to.
pub(crate) enum Bound {
    /// An edge to another stage.
    Peer(Edge),
    /// A file path, opened when the edge is materialized.
    Path(PathBuf),
    /// An open handle supplied by the user, consumed at materialization.
    Handle(Option<File>),
    /// The host's own standard stream for this slot; the child keeps the
    /// inherited descriptor.
    Inherit,
}

/// A descriptor prepared for the child on a given fd number.
pub(crate) enum ChildFd {
    /// An open descriptor to dup2 onto the fd number in the child.  The
    /// flag says whether the parent must close its copy right after this
    /// stage forks (it must not when a non-forking holder still needs the
    /// descriptor, e.g. for bucket spooling).
    Prepared(File, bool),
    /// Leave the child's inherited descriptor in place.
    Inherit,
}

/// Kind tag, with fitting-specific state on the fitting arms.
pub(crate) enum Kind {
    Program,
    Code,
    Plug,
    Vent,
    Bucket(BucketState),
    Hose(HoseState),
    Prng(PrngState),
}

impl Kind {
    pub(crate) fn is_fitting(&self) -> bool {
        !matches!(self, Kind::Program | Kind::Code)
    }
}

/// Public view of a stage's kind.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum StageKind {
    /// Forks and execs an external program.
    Program,
    /// Forks and runs an in-process closure in the child.
    Code,
    /// Source: end-of-file.  Sink: a device that rejects every write.
    Plug,
    /// Source: endless NUL bytes.  Sink: discards everything.
    Vent,
    /// In-memory byte buffer, poured into or filled from a pipe.
    Bucket,
    /// A raw pipe end exposed to the user.
    Hose,
    /// Source: the system entropy device.  Sink: an encryption command.
    Prng,
}

pub(crate) type Hook = Box<dyn FnMut(&Stage)>;

pub(crate) struct StageInner {
    pub(crate) kind: Kind,
    pub(crate) program: Option<OsString>,
    pub(crate) args: Vec<OsString>,
    pub(crate) code: Option<Hook>,
    pub(crate) env: Option<Vec<(OsString, OsString)>>,
    pub(crate) cwd: Option<PathBuf>,
    pub(crate) slots: [Option<Bound>; 3],
    /// Descriptors prepared for the child, by child-side fd number.
    pub(crate) fds: BTreeMap<i32, ChildFd>,
    pub(crate) status: Status,
    pub(crate) pid: Option<u32>,
    pub(crate) rc: Option<ExitStatus>,
    pub(crate) pre_fork: Option<Hook>,
    pub(crate) pre_exec: Option<Hook>,
    pub(crate) in_execute: bool,
}

impl StageInner {
    fn new(kind: Kind) -> StageInner {
        let mut inner = StageInner {
            kind,
            program: None,
            args: vec![],
            code: None,
            env: None,
            cwd: None,
            slots: [None, None, None],
            fds: BTreeMap::new(),
            status: Status::Error,
            pid: None,
            rc: None,
            pre_fork: None,
            pre_exec: None,
            in_execute: false,
        };
        inner.recompute_status();
        inner
    }

    pub(crate) fn needs_fork(&self) -> bool {
        match self.kind {
            Kind::Program | Kind::Code => true,
            // a PRNG with its input bound delegates to the encryption
            // command, which execs like any program
            Kind::Prng(_) => self.slots[SlotId::Input.idx()].is_some(),
            _ => false,
        }
    }

    fn executable(&self) -> bool {
        match &self.kind {
            Kind::Program => self.program.is_some(),
            Kind::Code => self.code.is_some(),
            Kind::Plug | Kind::Vent | Kind::Hose(_) | Kind::Prng(_) => true,
            Kind::Bucket(bucket) => {
                // a pouring bucket with nothing to pour is misconfigured
                if self.slots[SlotId::Output.idx()].is_some() {
                    !bucket.buffer.is_empty()
                } else {
                    true
                }
            }
        }
    }

    pub(crate) fn recompute_status(&mut self) {
        if matches!(self.status, Status::Error | Status::Ready) {
            self.status = if self.executable() {
                Status::Ready
            } else {
                Status::Error
            };
        }
    }

    pub(crate) fn slot(&self, slot: SlotId) -> &Option<Bound> {
        &self.slots[slot.idx()]
    }

    pub(crate) fn slot_mut(&mut self, slot: SlotId) -> &mut Option<Bound> {
        &mut self.slots[slot.idx()]
    }

    /// The full argv for an exec, program first.
    pub(crate) fn argv(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 1);
        if let Some(program) = &self.program {
            argv.push(program.clone());
        }
        argv.extend(self.args.iter().cloned());
        argv
    }

    /// Render the command line, Unix-quoted, for messages and names.
    pub(crate) fn cmdline(&self) -> String {
        let words: Vec<String> = self
            .argv()
            .iter()
            .map(|w| w.to_string_lossy().into_owned())
            .collect();
        words::quote(&words).unwrap_or_else(|_| words.join(" "))
    }

    pub(crate) fn name(&self) -> String {
        let mut name = match &self.kind {
            Kind::Program => format!("`{}`", self.cmdline()),
            Kind::Code => "code".to_owned(),
            Kind::Plug => "plug".to_owned(),
            Kind::Vent => "vent".to_owned(),
            Kind::Bucket(_) => match self.fitting_orientation() {
                Some(SlotId::Input) => "bucket(filling)".to_owned(),
                Some(SlotId::Output) => "bucket(pouring)".to_owned(),
                _ => "bucket".to_owned(),
            },
            Kind::Hose(_) => match self.fitting_orientation() {
                Some(SlotId::Output) => "hose(gushing)".to_owned(),
                Some(SlotId::Input) => "hose(sucking)".to_owned(),
                _ => "hose".to_owned(),
            },
            Kind::Prng(_) => "prng".to_owned(),
        };
        if let Some(pid) = self.pid {
            name.push_str(&format!(" (pid {})", pid));
        }
        name
    }

    /// Which data-carrying slot of a fitting is bound, if any.  `Output`
    /// means the fitting feeds a consumer (source role), `Input` means a
    /// producer feeds it (sink role).
    pub(crate) fn fitting_orientation(&self) -> Option<SlotId> {
        if self.slots[SlotId::Output.idx()].is_some() {
            Some(SlotId::Output)
        } else if self.slots[SlotId::Input.idx()].is_some() {
            Some(SlotId::Input)
        } else {
            None
        }
    }
}

/// A node in a pipeline graph.
///
/// A stage is one unit of work: an external program, an in-process code
/// block, or a non-forking plumbing fitting that sources or sinks data
/// ([plug](Stage::plug), [vent](Stage::vent), [bucket](Stage::bucket),
/// [hose](Stage::hose), [prng](Stage::prng)).  Stages are linked into a
/// graph with [`input`](Stage::input), [`output`](Stage::output) and
/// [`stderr`](Stage::stderr), and the graph is run with
/// [`execute`](Stage::execute), or implicitly, by querying a result:
/// [`ok`](Stage::ok), [`error`](Stage::error), [`wait`](Stage::wait),
/// [`contents`](Stage::contents) and [`getline`](Stage::getline) all
/// execute the pipeline first if that has not happened yet.
///
/// `Stage` is a cheap handle; clones refer to the same node.  Handles are
/// single-threaded (`!Send`): the whole library orchestrates from one
/// thread in the parent process, and concurrency between stages comes from
/// the kernel scheduling the forked children.
///
/// # Examples
///
/// ```no_run
/// # use io_plumbing::{plumb, Stage};
/// # fn dummy() -> io_plumbing::Result<()> {
/// let sed = plumb("sed s/$/!/")?.input(Stage::bucket_from("hello\n"))?;
/// assert_eq!(sed.terminus().contents_str()?, "hello!\n");
/// # Ok(())
/// # }
/// ```
pub struct Stage {
    pub(crate) inner: Rc<RefCell<StageInner>>,
}

impl Clone for Stage {
    fn clone(&self) -> Stage {
        Stage {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl PartialEq for Stage {
    /// Two handles are equal when they refer to the same stage.
    fn eq(&self, other: &Stage) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Stage {}

fn from_inner(inner: StageInner) -> Stage {
    Stage {
        inner: Rc::new(RefCell::new(inner)),
    }
}

impl Stage {
    /// Constructs a stage that runs `command`, a full command line.
    ///
    /// The command line is split into words with [`words::unquote`]; the
    /// first word becomes the program, the rest the arguments.  To pass a
    /// program name verbatim, use [`Stage::program`].
    pub fn command(command: impl AsRef<str>) -> Result<Stage> {
        let mut words = words::unquote(command.as_ref())?;
        let mut inner = StageInner::new(Kind::Program);
        if !words.is_empty() {
            let program = words.remove(0);
            inner.program = Some(program.into());
            inner.args = words.into_iter().map(OsString::from).collect();
            inner.recompute_status();
        }
        Ok(from_inner(inner))
    }

    /// Constructs a stage that runs `program` with no arguments.
    ///
    /// The name is taken verbatim, with no word splitting.
    pub fn program(program: impl AsRef<OsStr>) -> Stage {
        let mut inner = StageInner::new(Kind::Program);
        inner.program = Some(program.as_ref().to_owned());
        inner.recompute_status();
        from_inner(inner)
    }

    /// Constructs a stage that forks and runs `code` in the child instead
    /// of execing a program.
    ///
    /// The closure receives the stage itself; inside the child its
    /// [`pid`](Stage::pid) is the child's own pid.  When the closure
    /// returns, the child exits with status 0 unconditionally; code that
    /// wants to report failure must call `std::process::exit` itself.
    pub fn code(code: impl FnMut(&Stage) + 'static) -> Stage {
        let mut inner = StageInner::new(Kind::Code);
        inner.code = Some(Box::new(code));
        inner.recompute_status();
        from_inner(inner)
    }

    /// Constructs a plug: reads end-of-file, rejects every write.
    pub fn plug() -> Stage {
        from_inner(StageInner::new(Kind::Plug))
    }

    /// Constructs a vent: yields endless NUL bytes, discards every write.
    pub fn vent() -> Stage {
        from_inner(StageInner::new(Kind::Vent))
    }

    /// Constructs an empty bucket.
    ///
    /// Its orientation is decided by whichever slot is linked first:
    /// linking its input makes it a *filling* bucket that collects the
    /// producer's output; linking its output makes it a *pouring* bucket
    /// that feeds its buffer to a consumer.
    pub fn bucket() -> Stage {
        from_inner(StageInner::new(Kind::Bucket(BucketState::default())))
    }

    /// Constructs a bucket pre-filled with `data`, ready to pour.
    pub fn bucket_from(data: impl Into<Vec<u8>>) -> Stage {
        let mut state = BucketState::default();
        state.buffer = data.into();
        from_inner(StageInner::new(Kind::Bucket(state)))
    }

    /// Constructs a hose: a raw pipe end exposed to the user.
    ///
    /// Link its output into a consumer's input and the hose *gushes*: the
    /// user writes with [`print`](Stage::print) and the peer reads.  Link
    /// a producer's output into the hose and it *sucks*: the peer writes
    /// and the user reads with [`getline`](Stage::getline).
    pub fn hose() -> Stage {
        from_inner(StageInner::new(Kind::Hose(HoseState::default())))
    }

    /// Constructs a PRNG fitting.
    ///
    /// As a source it emits bytes from the system entropy device.  As a
    /// sink it pipes what it is fed into an encryption command, by
    /// default a GPG invocation to the default recipient; see
    /// [`encrypt_with`](Stage::encrypt_with).
    pub fn prng() -> Stage {
        from_inner(StageInner::new(Kind::Prng(PrngState::default())))
    }

    /// The stage's kind.
    pub fn kind(&self) -> StageKind {
        match self.inner.borrow().kind {
            Kind::Program => StageKind::Program,
            Kind::Code => StageKind::Code,
            Kind::Plug => StageKind::Plug,
            Kind::Vent => StageKind::Vent,
            Kind::Bucket(_) => StageKind::Bucket,
            Kind::Hose(_) => StageKind::Hose,
            Kind::Prng(_) => StageKind::Prng,
        }
    }

    // Configuration mutators.  The chainable builder methods consume and
    // return the handle; the set_* forms work through a shared reference.

    /// Appends `arg` to the argument list.
    pub fn arg(self, arg: impl AsRef<OsStr>) -> Stage {
        self.inner.borrow_mut().args.push(arg.as_ref().to_owned());
        self
    }

    /// Extends the argument list with `args`.
    pub fn args(self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> Stage {
        self.inner
            .borrow_mut()
            .args
            .extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    /// Replaces the program.  May turn an unconfigured stage `Ready`.
    pub fn set_program(&self, program: impl AsRef<OsStr>) {
        let mut inner = self.inner.borrow_mut();
        inner.program = Some(program.as_ref().to_owned());
        inner.recompute_status();
    }

    /// Replaces the argument list.
    pub fn set_args(&self, args: impl IntoIterator<Item = impl AsRef<OsStr>>) {
        let mut inner = self.inner.borrow_mut();
        inner.args = args.into_iter().map(|a| a.as_ref().to_owned()).collect();
        inner.recompute_status();
    }

    /// Replaces the in-process code block.
    pub fn set_code(&self, code: impl FnMut(&Stage) + 'static) {
        let mut inner = self.inner.borrow_mut();
        inner.code = Some(Box::new(code));
        inner.recompute_status();
    }

    /// Specifies the working directory of the child.  Unset means inherit.
    pub fn cwd(self, dir: impl AsRef<Path>) -> Stage {
        self.set_cwd(dir);
        self
    }

    /// See [`cwd`](Stage::cwd).
    pub fn set_cwd(&self, dir: impl AsRef<Path>) {
        self.inner.borrow_mut().cwd = Some(dir.as_ref().to_owned());
    }

    /// Sets one environment variable in the child.
    ///
    /// Other variables are inherited unless [`env_clear`](Stage::env_clear)
    /// was called.  If the same variable is set more than once, the last
    /// value wins.
    pub fn env(self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Stage {
        {
            let mut inner = self.inner.borrow_mut();
            let vars = inner.env.get_or_insert_with(|| env::vars_os().collect());
            vars.push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        }
        self
    }

    /// Makes the child start from an empty environment.
    pub fn env_clear(self) -> Stage {
        self.inner.borrow_mut().env = Some(vec![]);
        self
    }

    /// Replaces the child's entire environment with `vars`.
    pub fn set_env(
        &self,
        vars: impl IntoIterator<Item = (impl AsRef<OsStr>, impl AsRef<OsStr>)>,
    ) {
        self.inner.borrow_mut().env = Some(
            vars.into_iter()
                .map(|(k, v)| (k.as_ref().to_owned(), v.as_ref().to_owned()))
                .collect(),
        );
    }

    /// Installs a hook run in the parent just before this stage forks.
    pub fn pre_fork(self, hook: impl FnMut(&Stage) + 'static) -> Stage {
        self.inner.borrow_mut().pre_fork = Some(Box::new(hook));
        self
    }

    /// Installs a hook run in the child just before exec (or before the
    /// code block).  Keep it minimal: it runs between fork and exec.
    pub fn pre_exec(self, hook: impl FnMut(&Stage) + 'static) -> Stage {
        self.inner.borrow_mut().pre_exec = Some(Box::new(hook));
        self
    }

    // Linking.

    /// Links what feeds this stage's standard input.
    ///
    /// Accepts another [`Stage`] (or `&Stage`), a path string, an open
    /// [`File`], or a command-line string ending in `|` which allocates a
    /// new program stage from the embedded command, e.g.
    /// `"gzip -dc log.gz |"`.  Closures become stages via
    /// [`Stage::code`].
    ///
    /// Linking to a peer installs the matching back-reference on the
    /// peer's output, so `a.input(&b)` and `b.output(&a)` describe the
    /// same edge.
    pub fn input(self, source: impl IntoInput) -> Result<Stage> {
        let binding = source.into_input_binding()?;
        self.bind_slot(SlotId::Input, binding)?;
        Ok(self)
    }

    /// Links where this stage's standard output goes.
    ///
    /// Accepts another [`Stage`] (or `&Stage`), a path string, an open
    /// [`File`], or a command-line string starting with `|` which
    /// allocates a new program stage, e.g. `"| grep -c error"`.
    pub fn output(self, sink: impl IntoOutput) -> Result<Stage> {
        let binding = sink.into_output_binding()?;
        self.bind_slot(SlotId::Output, binding)?;
        Ok(self)
    }

    /// Links where this stage's standard error goes.
    ///
    /// Takes the same arguments as [`output`](Stage::output).  When the
    /// target is a peer stage, stderr is plumbed into the peer's input
    /// exactly as a stdout link would be, forming a side pipeline.
    pub fn stderr(self, sink: impl IntoOutput) -> Result<Stage> {
        let binding = sink.into_output_binding()?;
        self.bind_slot(SlotId::Stderr, binding)?;
        Ok(self)
    }

    /// The stage linked into this stage's input, if any.
    pub fn input_peer(&self) -> Option<Stage> {
        self.peer(SlotId::Input)
    }

    /// The stage this stage's output is linked to, if any.
    pub fn output_peer(&self) -> Option<Stage> {
        self.peer(SlotId::Output)
    }

    /// The stage this stage's stderr is linked to, if any.
    pub fn stderr_peer(&self) -> Option<Stage> {
        self.peer(SlotId::Stderr)
    }

    pub(crate) fn peer(&self, slot: SlotId) -> Option<Stage> {
        match self.inner.borrow().slot(slot) {
            Some(Bound::Peer(edge)) => edge.peer.resolve(),
            _ => None,
        }
    }

    fn check_bindable(inner: &StageInner, slot: SlotId) -> Result<()> {
        if matches!(inner.status, Status::Running | Status::Done | Status::Lost) {
            return Err(Error::config(format!(
                "cannot link {} of {}: already executed",
                slot.describe(),
                inner.name()
            )));
        }
        if inner.slot(slot).is_some() {
            return Err(Error::config(format!(
                "{} of {} is already linked",
                slot.describe(),
                inner.name()
            )));
        }
        // a PRNG whose input is bound delegates to its encryption command
        // and is plumbed like a program, output and stderr included
        if inner.kind.is_fitting() && !inner.needs_fork() {
            if slot == SlotId::Stderr {
                return Err(Error::config(format!(
                    "{} has no standard error to link",
                    inner.name()
                )));
            }
            // one active direction at a time
            let opposite = if slot.is_input() {
                SlotId::Output
            } else {
                SlotId::Input
            };
            if inner.slot(opposite).is_some() {
                return Err(Error::config(format!(
                    "cannot bind {} of {}: its {} is already bound",
                    slot.describe(),
                    inner.name(),
                    opposite.describe()
                )));
            }
        }
        Ok(())
    }

    fn after_bind(inner: &mut StageInner, slot: SlotId) {
        if let Kind::Prng(prng) = &inner.kind {
            // binding the input fixes the sink orientation: the PRNG
            // delegates to its encryption command and execs like a program
            if slot == SlotId::Input && inner.program.is_none() {
                let mut argv = prng.encrypt_argv.clone();
                if !argv.is_empty() {
                    inner.program = Some(argv.remove(0));
                    inner.args = argv;
                }
            }
        }
        inner.recompute_status();
    }

    pub(crate) fn bind_slot(&self, slot: SlotId, binding: NewBinding) -> Result<()> {
        match binding {
            NewBinding::Peer(peer) => self.link_peer(slot, peer),
            NewBinding::Path(path) => {
                let mut inner = self.inner.borrow_mut();
                Self::check_bindable(&inner, slot)?;
                *inner.slot_mut(slot) = Some(Bound::Path(path));
                Self::after_bind(&mut inner, slot);
                Ok(())
            }
            NewBinding::Handle(file) => {
                let mut inner = self.inner.borrow_mut();
                Self::check_bindable(&inner, slot)?;
                *inner.slot_mut(slot) = Some(Bound::Handle(Some(file)));
                Self::after_bind(&mut inner, slot);
                Ok(())
            }
        }
    }

    fn link_peer(&self, slot: SlotId, peer: Stage) -> Result<()> {
        if *self == peer {
            return Err(Error::config(format!(
                "cannot link {} to itself",
                self.inner.borrow().name()
            )));
        }
        let back_slot = slot.opposite(0);
        {
            let inner = self.inner.borrow();
            Self::check_bindable(&inner, slot)?;
            let peer_inner = peer.inner.borrow();
            Self::check_bindable(&peer_inner, back_slot)?;
        }
        {
            let mut inner = self.inner.borrow_mut();
            *inner.slot_mut(slot) = Some(Bound::Peer(Edge {
                peer: PeerRef::Strong(peer.clone()),
                peer_index: back_slot.dir_index(),
            }));
            Self::after_bind(&mut inner, slot);
        }
        {
            let mut peer_inner = peer.inner.borrow_mut();
            *peer_inner.slot_mut(back_slot) = Some(Bound::Peer(Edge {
                peer: PeerRef::Back(Rc::downgrade(&self.inner)),
                peer_index: slot.dir_index(),
            }));
            Self::after_bind(&mut peer_inner, back_slot);
        }
        Ok(())
    }

    /// Installs an edge without the public-binding checks; used when the
    /// executor or `terminus` fills in a default.  The new peer must be
    /// freshly constructed and unlinked.
    pub(crate) fn link_default(&self, slot: SlotId, peer: &Stage) {
        let back_slot = slot.opposite(0);
        {
            let mut inner = self.inner.borrow_mut();
            *inner.slot_mut(slot) = Some(Bound::Peer(Edge {
                peer: PeerRef::Strong(peer.clone()),
                peer_index: back_slot.dir_index(),
            }));
            Self::after_bind(&mut inner, slot);
        }
        let mut peer_inner = peer.inner.borrow_mut();
        *peer_inner.slot_mut(back_slot) = Some(Bound::Peer(Edge {
            peer: PeerRef::Back(Rc::downgrade(&self.inner)),
            peer_index: slot.dir_index(),
        }));
        Self::after_bind(&mut peer_inner, back_slot);
    }

    /// Walks the output chain and returns the last reachable stage.
    ///
    /// A forking stage whose output has been left unlinked gets its
    /// default output, a filling bucket, installed by the walk, so the
    /// terminus of a command pipeline is the bucket that execution will
    /// fill.  Fittings have no default output, which ends the walk.
    pub fn terminus(&self) -> Stage {
        enum Next {
            Peer(Stage),
            Stop,
            Fork,
        }
        let mut current = self.clone();
        loop {
            let next = {
                let inner = current.inner.borrow();
                match inner.slot(SlotId::Output) {
                    Some(Bound::Peer(edge)) => match edge.peer.resolve() {
                        Some(peer) => Next::Peer(peer),
                        None => Next::Stop, // peer was dropped
                    },
                    Some(_) => Next::Stop, // file or handle ends the chain
                    None => {
                        if !inner.needs_fork() {
                            Next::Stop
                        } else {
                            Next::Fork
                        }
                    }
                }
            };
            match next {
                Next::Peer(peer) => current = peer,
                Next::Stop => return current,
                Next::Fork => {
                    let bucket = Stage::bucket();
                    current.link_default(SlotId::Output, &bucket);
                    current = bucket;
                }
            }
        }
    }

    // Status and identity.

    /// Where the stage is in its lifecycle.  Does not force execution.
    pub fn status(&self) -> Status {
        self.inner.borrow().status
    }

    /// True if the stage can be executed.
    pub fn ready(&self) -> bool {
        self.status() == Status::Ready
    }

    /// True if the stage has been started and not yet reaped.
    pub fn running(&self) -> bool {
        self.status() == Status::Running
    }

    /// True if the stage's child has been reaped.
    pub fn done(&self) -> bool {
        self.status() == Status::Done
    }

    /// The child's pid, once the stage has forked.  Never cleared.
    pub fn pid(&self) -> Option<u32> {
        self.inner.borrow().pid
    }

    /// The recorded exit status, if the child has been reaped.  Does not
    /// force execution; see [`wait`](Stage::wait).
    pub fn rc(&self) -> Option<ExitStatus> {
        self.inner.borrow().rc
    }

    /// Describes how the stage failed, without forcing execution.
    ///
    /// Empty until the stage has been reaped, and empty for a clean exit.
    pub fn errormsg(&self) -> String {
        let inner = self.inner.borrow();
        match inner.status {
            Status::Done => inner
                .rc
                .and_then(|rc| rc.failure())
                .unwrap_or_default(),
            Status::Lost => match inner.pid {
                Some(pid) => format!("lost track of child (pid {})", pid),
                None => "lost track of child".to_owned(),
            },
            _ => String::new(),
        }
    }

    /// A human-readable description: kind, command line, pid if any.
    pub fn name(&self) -> String {
        self.inner.borrow().name()
    }

    // Execution and observation.  The lazy protocol is: every observer
    // ensures the pipeline has been executed, then ensures this stage has
    // been waited on.

    /// Starts the pipeline this stage belongs to.
    ///
    /// Walks upstream to the head, then forks each forking stage in order
    /// down to the tail, connecting descriptors along the way.  Returns
    /// immediately if the stage is already running or done.
    pub fn execute(&self) -> Result<()> {
        exec::execute(self)
    }

    /// Blocks until this stage's child is reaped, and records its exit
    /// status.  Executes the pipeline first if needed.
    ///
    /// Waiting on a stage also reaps everything upstream of it, and drains
    /// the terminus bucket first so no child can stall on a full pipe.
    /// Returns `None` if the child was lost to a foreign reap.  Calling
    /// `wait` again on a done stage returns the recorded status without
    /// another system call.
    ///
    /// For a non-forking fitting, `wait` waits on the producer feeding it
    /// and returns that producer's status.
    pub fn wait(&self) -> Result<Option<ExitStatus>> {
        self.execute()?;
        exec::wait_stage(self)
    }

    /// Executes and waits, then reports success: true iff the child
    /// exited with status 0.  A lost child counts as failure.
    pub fn ok(&self) -> Result<bool> {
        Ok(matches!(self.wait()?, Some(rc) if rc.success()))
    }

    /// Executes and waits, then describes the failure, or `None` if the
    /// child exited cleanly.
    pub fn error(&self) -> Result<Option<String>> {
        match self.wait()? {
            Some(rc) => Ok(rc.failure()),
            None => Ok(Some(self.errormsg())),
        }
    }

    /// Checks for completion without blocking.  Records and returns the
    /// exit status if the child has finished.
    pub fn poll(&self) -> Option<ExitStatus> {
        exec::poll_stage(self)
    }

    /// Sends SIGTERM to the child, if running.
    pub fn terminate(&self) -> Result<()> {
        exec::signal_stage(self, crate::posix::SIGTERM)
    }

    /// Sends SIGKILL to the child, if running.
    pub fn kill(&self) -> Result<()> {
        exec::signal_stage(self, crate::posix::SIGKILL)
    }

    /// Installs a prepared child descriptor, used by a peer handing over
    /// its end of a pipe during edge materialization.
    pub(crate) fn set_fd(&self, fd: i32, file: File, close_in_parent: bool) {
        self.inner
            .borrow_mut()
            .fds
            .insert(fd, ChildFd::Prepared(file, close_in_parent));
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        write!(f, "Stage {{ {}, {:?} }}", inner.name(), inner.status)
    }
}

impl Drop for StageInner {
    fn drop(&mut self) {
        // best-effort zombie avoidance; a still-running child is left to
        // reap() or to init
        if self.status == Status::Running
            && let Some(pid) = self.pid
        {
            let _ = crate::posix::waitpid(pid, crate::posix::WNOHANG);
            exec::forget_running(pid);
        }
    }
}

/// What a slot setter resolved its argument to.
pub(crate) enum NewBinding {
    Peer(Stage),
    Path(PathBuf),
    Handle(File),
}

mod sealed {
    pub trait IntoInputSealed {}
    pub trait IntoOutputSealed {}
}

/// Argument conversion for [`Stage::input`].
///
/// This is a sealed trait; see `input` for the accepted types.
#[allow(private_interfaces)]
pub trait IntoInput: sealed::IntoInputSealed {
    #[doc(hidden)]
    fn into_input_binding(self) -> Result<NewBinding>;
}

/// Argument conversion for [`Stage::output`] and [`Stage::stderr`].
///
/// This is a sealed trait; see `output` for the accepted types.
#[allow(private_interfaces)]
pub trait IntoOutput: sealed::IntoOutputSealed {
    #[doc(hidden)]
    fn into_output_binding(self) -> Result<NewBinding>;
}

impl sealed::IntoInputSealed for Stage {}
impl IntoInput for Stage {
    fn into_input_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Peer(self))
    }
}

impl sealed::IntoInputSealed for &Stage {}
impl IntoInput for &Stage {
    fn into_input_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Peer(self.clone()))
    }
}

impl sealed::IntoInputSealed for &str {}
impl IntoInput for &str {
    /// A plain string is a file path; `"cmd... |"` allocates a program
    /// stage from the embedded command line.
    fn into_input_binding(self) -> Result<NewBinding> {
        let trimmed = self.trim_end();
        if let Some(cmdline) = trimmed.strip_suffix('|') {
            Ok(NewBinding::Peer(Stage::command(cmdline)?))
        } else {
            Ok(NewBinding::Path(PathBuf::from(self)))
        }
    }
}

impl sealed::IntoInputSealed for String {}
impl IntoInput for String {
    fn into_input_binding(self) -> Result<NewBinding> {
        self.as_str().into_input_binding()
    }
}

impl sealed::IntoInputSealed for &Path {}
impl IntoInput for &Path {
    fn into_input_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Path(self.to_owned()))
    }
}

impl sealed::IntoInputSealed for PathBuf {}
impl IntoInput for PathBuf {
    fn into_input_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Path(self))
    }
}

impl sealed::IntoInputSealed for File {}
impl IntoInput for File {
    fn into_input_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Handle(self))
    }
}

impl sealed::IntoOutputSealed for Stage {}
impl IntoOutput for Stage {
    fn into_output_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Peer(self))
    }
}

impl sealed::IntoOutputSealed for &Stage {}
impl IntoOutput for &Stage {
    fn into_output_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Peer(self.clone()))
    }
}

impl sealed::IntoOutputSealed for &str {}
impl IntoOutput for &str {
    /// A plain string is a file path; `"| cmd..."` allocates a program
    /// stage from the embedded command line.
    fn into_output_binding(self) -> Result<NewBinding> {
        let trimmed = self.trim_start();
        if let Some(cmdline) = trimmed.strip_prefix('|') {
            Ok(NewBinding::Peer(Stage::command(cmdline)?))
        } else {
            Ok(NewBinding::Path(PathBuf::from(self)))
        }
    }
}

impl sealed::IntoOutputSealed for String {}
impl IntoOutput for String {
    fn into_output_binding(self) -> Result<NewBinding> {
        self.as_str().into_output_binding()
    }
}

impl sealed::IntoOutputSealed for &Path {}
impl IntoOutput for &Path {
    fn into_output_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Path(self.to_owned()))
    }
}

impl sealed::IntoOutputSealed for PathBuf {}
impl IntoOutput for PathBuf {
    fn into_output_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Path(self))
    }
}

impl sealed::IntoOutputSealed for File {}
impl IntoOutput for File {
    fn into_output_binding(self) -> Result<NewBinding> {
        Ok(NewBinding::Handle(self))
    }
}
