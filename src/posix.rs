use std::ffi::{CString, OsStr};
use std::fs::File;
use std::io::{Error, Result};
use std::mem::MaybeUninit;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::FromRawFd;
use std::ptr;

pub use libc::ECHILD;

fn check_err<T: Ord + Default>(num: T) -> Result<T> {
    if num < T::default() {
        return Err(Error::last_os_error());
    }
    Ok(num)
}

/// Create a pipe, returning `(read_end, write_end)`.
pub fn pipe() -> Result<(File, File)> {
    let mut fds = [0 as libc::c_int; 2];
    check_err(unsafe { libc::pipe(fds.as_mut_ptr()) })?;
    Ok(unsafe { (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1])) })
}

/// Fork the process.  Returns `Some(child_pid)` in the parent and `None` in
/// the child.
///
/// # Safety
///
/// In a multi-threaded program the child may only call async-signal-safe
/// functions before exec.  This crate is single-threaded by design, but the
/// caller is still responsible for keeping the child-side code minimal.
pub unsafe fn fork() -> Result<Option<u32>> {
    let pid = check_err(unsafe { libc::fork() })?;
    if pid == 0 { Ok(None) } else { Ok(Some(pid as u32)) }
}

fn os_to_cstring(s: &OsStr) -> Result<CString> {
    let bytes = s.as_bytes();
    if bytes.contains(&0) {
        return Err(Error::from_raw_os_error(libc::EINVAL));
    }
    // not expected to fail on Unix, as Unix strings *are* C strings
    Ok(CString::new(bytes).expect("converting Unix string to C string"))
}

fn cstring_ptr_vec(strings: &[CString]) -> Vec<*const libc::c_char> {
    let mut ptrs: Vec<*const libc::c_char> = strings.iter().map(|s| s.as_ptr()).collect();
    ptrs.push(ptr::null());
    ptrs
}

/// Prepare an exec closure before forking.
///
/// All allocation (CString conversion, pointer tables) happens here, in the
/// parent; the returned closure only issues the `execvp`/`execvpe` syscall,
/// which keeps the post-fork child code allocation-free.  Exec only returns
/// on failure, so the closure returns the failure.
pub fn prep_exec<T: AsRef<OsStr>, U: AsRef<OsStr>>(
    cmd: &OsStr,
    args: &[T],
    env: Option<&[U]>,
) -> Result<impl FnOnce() -> Error + use<T, U>> {
    let cmd = os_to_cstring(cmd)?;
    let args: Vec<CString> = args
        .iter()
        .map(|a| os_to_cstring(a.as_ref()))
        .collect::<Result<_>>()?;
    let env: Option<Vec<CString>> = match env {
        Some(env) => Some(
            env.iter()
                .map(|e| os_to_cstring(e.as_ref()))
                .collect::<Result<_>>()?,
        ),
        None => None,
    };
    Ok(move || {
        let argv = cstring_ptr_vec(&args);
        match &env {
            None => unsafe {
                libc::execvp(cmd.as_ptr(), argv.as_ptr());
            },
            Some(env) => {
                let envp = cstring_ptr_vec(env);
                unsafe {
                    libc::execvpe(cmd.as_ptr(), argv.as_ptr(), envp.as_ptr());
                }
            }
        }
        Error::last_os_error()
    })
}

pub fn _exit(status: u8) -> ! {
    unsafe { libc::_exit(status as libc::c_int) }
}

pub fn getpid() -> u32 {
    unsafe { libc::getpid() as u32 }
}

pub const WNOHANG: i32 = libc::WNOHANG;

/// Wait for the given child.  Returns `(pid, raw_status)`; pid is 0 when
/// `WNOHANG` was given and the child has not changed state.
pub fn waitpid(pid: u32, flags: i32) -> Result<(u32, i32)> {
    let mut status = 0 as libc::c_int;
    let pid = check_err(unsafe {
        libc::waitpid(pid as libc::pid_t, &mut status as *mut libc::c_int, flags)
    })?;
    Ok((pid as u32, status))
}

pub const SIGTERM: i32 = libc::SIGTERM;
pub const SIGKILL: i32 = libc::SIGKILL;

pub fn kill(pid: u32, signal: i32) -> Result<()> {
    check_err(unsafe { libc::kill(pid as libc::pid_t, signal as libc::c_int) })?;
    Ok(())
}

pub fn dup2(oldfd: i32, newfd: i32) -> Result<()> {
    check_err(unsafe { libc::dup2(oldfd, newfd) })?;
    Ok(())
}

pub fn close(fd: i32) -> Result<()> {
    check_err(unsafe { libc::close(fd) })?;
    Ok(())
}

/// Reset SIGPIPE handling to the default the child expects.
///
/// libstd ignores SIGPIPE, and signal-handling libraries often set a mask.
/// Child processes inherit ignored signals and the signal mask from their
/// parent, but most Unix programs do not reset these things on their own,
/// so we clean up before exec to avoid confusing the program we are about
/// to run.
pub fn reset_sigpipe() -> Result<()> {
    unsafe {
        let mut set = MaybeUninit::<libc::sigset_t>::uninit();
        check_err(libc::sigemptyset(set.as_mut_ptr()))?;
        check_err(libc::pthread_sigmask(
            libc::SIG_SETMASK,
            set.as_ptr(),
            ptr::null_mut(),
        ))?;
        let ret = libc::signal(libc::SIGPIPE, libc::SIG_DFL);
        if ret == libc::SIG_ERR {
            return Err(Error::last_os_error());
        }
    }
    Ok(())
}
