//! Runtime binding to the winpty support library.
//!
//! The library starts the agent executable that sits next to it. The agent
//! owns a hidden console sized to the request, spawns the exec session on it
//! and exposes the console through two named pipes, which are bridged to the
//! handle's channels the same way a native pty master is.

use std::ffi::{c_void, OsString};
use std::fs::OpenOptions;
use std::os::windows::ffi::{OsStrExt, OsStringExt};
use std::path::Path;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use libloading::Library;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::native::{spawn_reader_thread, spawn_writer_thread};
use super::{BackendHandle, ProcessControl, ShellRequest, CHANNEL_CAPACITY, TERMINATE_GRACE};
use crate::errors::{ConsoleError, ConsoleResult};

type RawHandle = *mut c_void;
type ErrorPtr = *mut c_void;

const SPAWN_FLAG_AUTO_SHUTDOWN: u64 = 1;
const WAIT_OBJECT_0: u32 = 0;

#[link(name = "kernel32")]
extern "system" {
    fn GetProcessId(process: RawHandle) -> u32;
    fn WaitForSingleObject(handle: RawHandle, millis: u32) -> u32;
    fn TerminateProcess(process: RawHandle, exit_code: u32) -> i32;
    fn CloseHandle(handle: RawHandle) -> i32;
}

type ConfigNew = unsafe extern "C" fn(u64, *mut ErrorPtr) -> *mut c_void;
type ConfigFree = unsafe extern "C" fn(*mut c_void);
type ConfigSetInitialSize = unsafe extern "C" fn(*mut c_void, i32, i32);
type Open = unsafe extern "C" fn(*const c_void, *mut ErrorPtr) -> *mut c_void;
type PipeName = unsafe extern "C" fn(*mut c_void) -> *const u16;
type SpawnConfigNew = unsafe extern "C" fn(
    u64,
    *const u16,
    *const u16,
    *const u16,
    *const u16,
    *mut ErrorPtr,
) -> *mut c_void;
type SpawnConfigFree = unsafe extern "C" fn(*mut c_void);
type Spawn = unsafe extern "C" fn(
    *mut c_void,
    *const c_void,
    *mut RawHandle,
    *mut RawHandle,
    *mut u32,
    *mut ErrorPtr,
) -> i32;
type Free = unsafe extern "C" fn(*mut c_void);
type ErrorMsg = unsafe extern "C" fn(ErrorPtr) -> *const u16;
type ErrorFree = unsafe extern "C" fn(ErrorPtr);

/// Entry points resolved from the library. The pointers stay valid for as
/// long as `_library` is loaded.
struct Api {
    config_new: ConfigNew,
    config_free: ConfigFree,
    config_set_initial_size: ConfigSetInitialSize,
    open: Open,
    conin_name: PipeName,
    conout_name: PipeName,
    spawn_config_new: SpawnConfigNew,
    spawn_config_free: SpawnConfigFree,
    spawn: Spawn,
    free: Free,
    error_msg: ErrorMsg,
    error_free: ErrorFree,
    _library: Library,
}

impl Api {
    fn load(path: &Path) -> ConsoleResult<Self> {
        // SAFETY: the library is the winpty release fetched into the helper
        // directory; its initialisers have no preconditions.
        let library = unsafe { Library::new(path) }
            .map_err(|e| ConsoleError::unavailable("failed to load helper library", e))?;

        macro_rules! symbol {
            ($ty:ty, $name:literal) => {{
                // SAFETY: the signature matches the winpty C API declaration.
                let symbol = unsafe { library.get::<$ty>(concat!($name, "\0").as_bytes()) }
                    .map_err(|e| {
                        ConsoleError::unavailable(concat!("helper library lacks ", $name), e)
                    })?;
                *symbol
            }};
        }

        let config_new = symbol!(ConfigNew, "winpty_config_new");
        let config_free = symbol!(ConfigFree, "winpty_config_free");
        let config_set_initial_size =
            symbol!(ConfigSetInitialSize, "winpty_config_set_initial_size");
        let open = symbol!(Open, "winpty_open");
        let conin_name = symbol!(PipeName, "winpty_conin_name");
        let conout_name = symbol!(PipeName, "winpty_conout_name");
        let spawn_config_new = symbol!(SpawnConfigNew, "winpty_spawn_config_new");
        let spawn_config_free = symbol!(SpawnConfigFree, "winpty_spawn_config_free");
        let spawn = symbol!(Spawn, "winpty_spawn");
        let free = symbol!(Free, "winpty_free");
        let error_msg = symbol!(ErrorMsg, "winpty_error_msg");
        let error_free = symbol!(ErrorFree, "winpty_error_free");

        Ok(Self {
            config_new,
            config_free,
            config_set_initial_size,
            open,
            conin_name,
            conout_name,
            spawn_config_new,
            spawn_config_free,
            spawn,
            free,
            error_msg,
            error_free,
            _library: library,
        })
    }

    /// Turns a winpty error object into a backend error and frees it.
    fn error(&self, context: &str, err: ErrorPtr) -> ConsoleError {
        let message = if err.is_null() {
            "unknown error".to_string()
        } else {
            // SAFETY: `err` came from a failed winpty call and is freed once.
            unsafe {
                let message = from_wide((self.error_msg)(err));
                (self.error_free)(err);
                message
            }
        };
        ConsoleError::BackendUnavailable(format!("{context}: {message}"))
    }
}

fn to_wide(s: &str) -> Vec<u16> {
    std::ffi::OsStr::new(s)
        .encode_wide()
        .chain(std::iter::once(0))
        .collect()
}

/// # Safety
/// `ptr` must be null or point to a NUL-terminated UTF-16 string.
unsafe fn from_wide(ptr: *const u16) -> String {
    if ptr.is_null() {
        return String::new();
    }
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    OsString::from_wide(std::slice::from_raw_parts(ptr, len))
        .to_string_lossy()
        .into_owned()
}

/// Joins `args` into a command line that the C runtime splits back into the
/// same arguments.
pub(super) fn command_line<S: AsRef<str>>(args: &[S]) -> String {
    let mut line = String::new();
    for arg in args {
        if !line.is_empty() {
            line.push(' ');
        }
        let arg = arg.as_ref();
        if !arg.is_empty() && !arg.contains([' ', '\t', '"']) {
            line.push_str(arg);
            continue;
        }
        line.push('"');
        let mut backslashes = 0;
        for c in arg.chars() {
            match c {
                '\\' => backslashes += 1,
                '"' => {
                    line.extend(std::iter::repeat('\\').take(backslashes * 2 + 1));
                    line.push('"');
                    backslashes = 0;
                }
                _ => {
                    line.extend(std::iter::repeat('\\').take(backslashes));
                    line.push(c);
                    backslashes = 0;
                }
            }
        }
        line.extend(std::iter::repeat('\\').take(backslashes * 2));
        line.push('"');
    }
    line
}

/// Opens an agent console of the requested size and runs `program args` on it.
pub(super) fn spawn(
    library: &Path,
    program: &Path,
    args: &[String],
    request: &ShellRequest,
) -> ConsoleResult<BackendHandle> {
    let api = Arc::new(Api::load(library)?);

    let mut err: ErrorPtr = ptr::null_mut();
    // SAFETY: every pointer passed below is either null or produced by the
    // library, and each object is freed exactly once.
    let wp = unsafe {
        let config = (api.config_new)(0, &mut err);
        if config.is_null() {
            return Err(api.error("failed to configure helper", err));
        }
        (api.config_set_initial_size)(config, i32::from(request.cols), i32::from(request.rows));
        let wp = (api.open)(config, &mut err);
        (api.config_free)(config);
        if wp.is_null() {
            return Err(api.error("failed to start helper agent", err));
        }
        wp
    };
    let mut agent = Agent {
        api: api.clone(),
        wp,
        process: ptr::null_mut(),
    };

    // SAFETY: `wp` is a live agent; the names live as long as it does.
    let (conin, conout) =
        unsafe { (from_wide((api.conin_name)(wp)), from_wide((api.conout_name)(wp))) };
    let writer = OpenOptions::new()
        .write(true)
        .open(&conin)
        .map_err(|e| ConsoleError::unavailable("failed to open helper input pipe", e))?;
    let reader = OpenOptions::new()
        .read(true)
        .open(&conout)
        .map_err(|e| ConsoleError::unavailable("failed to open helper output pipe", e))?;

    let mut argv = vec![program.to_string_lossy().into_owned()];
    argv.extend(args.iter().cloned());
    let cmdline = to_wide(&command_line(&argv));

    // SAFETY: as above; the spawn config is freed before returning.
    unsafe {
        let spawn_config = (api.spawn_config_new)(
            SPAWN_FLAG_AUTO_SHUTDOWN,
            ptr::null(),
            cmdline.as_ptr(),
            ptr::null(),
            ptr::null(),
            &mut err,
        );
        if spawn_config.is_null() {
            return Err(api.error("failed to describe exec session", err));
        }
        let mut create_error = 0u32;
        let spawned = (api.spawn)(
            wp,
            spawn_config,
            &mut agent.process,
            ptr::null_mut(),
            &mut create_error,
            &mut err,
        );
        (api.spawn_config_free)(spawn_config);
        if spawned == 0 {
            let e = api.error("failed to spawn exec session", err);
            debug!("[helper] CreateProcess error code {}", create_error);
            return Err(e);
        }
    }

    // SAFETY: `process` is the handle winpty_spawn just returned.
    let pid = Some(unsafe { GetProcessId(agent.process) }).filter(|p| *p != 0);
    let label = request.container_id.clone();
    info!(
        "[backend:{}] helper console session started (pid: {:?}, {}x{})",
        label, pid, request.cols, request.rows
    );

    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
    spawn_reader_thread(label.clone(), Box::new(reader), out_tx);
    spawn_writer_thread(label, Box::new(writer), in_rx);

    let process = Arc::new(AgentProcess {
        agent: Mutex::new(Some(agent)),
        pid,
        grace: TERMINATE_GRACE,
    });
    Ok(BackendHandle::new(out_rx, in_tx, process))
}

/// A live agent and the exec session it spawned.
struct Agent {
    api: Arc<Api>,
    wp: *mut c_void,
    process: RawHandle,
}

// SAFETY: the agent pointer and process handle are only touched while the
// owning `AgentProcess` mutex is held, and winpty objects are not thread-bound.
unsafe impl Send for Agent {}

impl Agent {
    /// Closes the agent console, which ends the session, then waits up to
    /// `grace` before killing it outright.
    fn shutdown(mut self, pid: Option<u32>, grace: Duration) {
        let process = std::mem::replace(&mut self.process, ptr::null_mut());
        drop(self);
        if process.is_null() {
            return;
        }
        let millis = u32::try_from(grace.as_millis()).unwrap_or(u32::MAX);
        // SAFETY: `process` is an owned handle closed exactly once here.
        unsafe {
            if WaitForSingleObject(process, millis) != WAIT_OBJECT_0 {
                warn!("[backend] helper pid {:?} did not exit, killing", pid);
                if TerminateProcess(process, 1) == 0 {
                    warn!("[backend] failed to kill helper pid {:?}", pid);
                }
            }
            CloseHandle(process);
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        // SAFETY: `wp` came from winpty_open and is freed only here.
        unsafe {
            (self.api.free)(self.wp);
            if !self.process.is_null() {
                TerminateProcess(self.process, 1);
                CloseHandle(self.process);
            }
        }
    }
}

struct AgentProcess {
    agent: Mutex<Option<Agent>>,
    pid: Option<u32>,
    grace: Duration,
}

#[async_trait]
impl ProcessControl for AgentProcess {
    fn process_id(&self) -> Option<u32> {
        self.pid
    }

    async fn terminate(&self) {
        let Some(agent) = self.agent.lock().take() else {
            return;
        };
        let (pid, grace) = (self.pid, self.grace);
        if let Err(e) = tokio::task::spawn_blocking(move || agent.shutdown(pid, grace)).await {
            warn!("[backend] helper shutdown for pid {:?} failed: {}", pid, e);
        }
    }
}
