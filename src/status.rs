use std::fmt;

/// Where a stage is in its lifecycle.
///
/// A stage starts in `Error` or `Ready` depending on whether its
/// configuration is sufficient to run, and moves forward only:
/// `Error -> Ready` as mutators complete the configuration, `Ready ->
/// Running` on execute, `Running -> Done` when the child is reaped, and
/// `Running -> Lost` if somebody else reaped the child behind our back.
#[derive(Debug, Eq, PartialEq, Copy, Clone)]
pub enum Status {
    /// The stage is not executable as configured.
    Error,
    /// The stage can be executed.
    Ready,
    /// The stage has been started and not yet reaped.
    Running,
    /// The child was reaped and its exit status recorded.
    Done,
    /// `waitpid` could not find the child; its exit status is unavailable.
    Lost,
}

/// Exit status of a reaped child, as reported by `waitpid()`.
///
/// Wraps the raw wait status; use the accessors to decode it.  The
/// interpretation matches the POSIX `W*` macros: a non-zero signal portion
/// means the child was killed by that signal, otherwise the high byte is
/// the exit code.
#[derive(Eq, PartialEq, Hash, Copy, Clone)]
pub struct ExitStatus(pub(crate) i32);

impl ExitStatus {
    /// True if the child exited voluntarily with status 0.
    pub fn success(&self) -> bool {
        self.code() == Some(0)
    }

    /// Returns the exit code if the child exited voluntarily (was not
    /// killed by a signal).
    pub fn code(&self) -> Option<u32> {
        libc::WIFEXITED(self.0).then(|| libc::WEXITSTATUS(self.0) as u32)
    }

    /// Returns the signal number if the child was killed by a signal.
    pub fn signal(&self) -> Option<i32> {
        libc::WIFSIGNALED(self.0).then(|| libc::WTERMSIG(self.0))
    }

    /// Describes a failure, or `None` for a clean exit.
    pub fn failure(&self) -> Option<String> {
        if self.success() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(signal) = self.signal() {
            write!(f, "killed by signal {}", signal)
        } else if let Some(code) = self.code() {
            if code == 0 {
                write!(f, "exited normally")
            } else {
                write!(f, "exited with error code {}", code)
            }
        } else {
            write!(f, "unrecognized wait status {:#x}", self.0)
        }
    }
}

impl fmt::Debug for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(signal) = self.signal() {
            write!(f, "ExitStatus(Signaled({}))", signal)
        } else if let Some(code) = self.code() {
            write!(f, "ExitStatus(Exited({}))", code)
        } else {
            write!(f, "ExitStatus(Unknown({:#x}))", self.0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exited(code: i32) -> ExitStatus {
        ExitStatus(code << 8)
    }

    #[test]
    fn decode_clean_exit() {
        let st = exited(0);
        assert!(st.success());
        assert_eq!(st.code(), Some(0));
        assert_eq!(st.signal(), None);
        assert_eq!(st.failure(), None);
    }

    #[test]
    fn decode_error_exit() {
        let st = exited(13);
        assert!(!st.success());
        assert_eq!(st.code(), Some(13));
        assert_eq!(st.failure().unwrap(), "exited with error code 13");
    }

    #[test]
    fn decode_signal() {
        let st = ExitStatus(libc::SIGPIPE);
        assert!(!st.success());
        assert_eq!(st.code(), None);
        assert_eq!(st.signal(), Some(libc::SIGPIPE));
        assert_eq!(
            st.failure().unwrap(),
            format!("killed by signal {}", libc::SIGPIPE)
        );
    }
}
