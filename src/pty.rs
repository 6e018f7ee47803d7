//! Local PTY backend for the spawn extension. Drives a session-leader child process over a
//! pseudoterminal pair and adapts it to the Simple I/O loop.

use std::os::unix::io::{FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tracing::{info, warn};

use crate::simple_io::{EmitExit, EmitOutput, SimpleIoAdapter};

fn set_winsize(fd: RawFd, rows: i64, cols: i64) {
    if rows <= 0 || cols <= 0 {
        return;
    }
    let ws = libc::winsize {
        ws_row: rows as u16,
        ws_col: cols as u16,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    unsafe {
        libc::ioctl(fd, libc::TIOCSWINSZ, &ws);
    }
}

fn open_pty() -> std::io::Result<(RawFd, RawFd)> {
    let mut master: libc::c_int = 0;
    let mut slave: libc::c_int = 0;
    let rc = unsafe { libc::openpty(&mut master, &mut slave, std::ptr::null_mut(), std::ptr::null_mut(), std::ptr::null_mut()) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok((master, slave))
}

/// Dup's `fd` into a fresh [`Stdio`] the child can own; the original is left untouched.
fn dup_stdio(fd: RawFd) -> std::io::Result<Stdio> {
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(unsafe { Stdio::from_raw_fd(dup) })
}

pub struct PtyAdapter {
    self_weak: Mutex<Weak<PtyAdapter>>,
    master_fd: Mutex<Option<RawFd>>,
    child_pid: Mutex<Option<i32>>,
    stopped: AtomicBool,
    exit_sent: AtomicBool,
    emit_output: Mutex<Option<EmitOutput>>,
    emit_exit: Mutex<Option<EmitExit>>,
}

impl PtyAdapter {
    /// `self_weak` lets `on_start` (which only borrows `&self`, per the [`SimpleIoAdapter`]
    /// contract) hand the reader/wait threads an owned `Arc<Self>`; set once, right after
    /// construction, and never forms a reference cycle (a `Weak` holds no strong count).
    pub fn new() -> Arc<Self> {
        let adapter = Arc::new(PtyAdapter {
            self_weak: Mutex::new(Weak::new()),
            master_fd: Mutex::new(None),
            child_pid: Mutex::new(None),
            stopped: AtomicBool::new(false),
            exit_sent: AtomicBool::new(false),
            emit_output: Mutex::new(None),
            emit_exit: Mutex::new(None),
        });
        *adapter.self_weak.lock().unwrap() = Arc::downgrade(&adapter);
        adapter
    }

    fn emit_output(&self, data: &[u8]) {
        if let Some(f) = self.emit_output.lock().unwrap().as_ref() {
            f(data);
        }
    }

    fn notify_exit(&self, reason: &str) {
        if self.exit_sent.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(f) = self.emit_exit.lock().unwrap().as_ref() {
            f(reason);
        }
    }

    fn read_loop(self: Arc<Self>) {
        let mut buf = [0u8; 4096];
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                return;
            }
            let fd = match *self.master_fd.lock().unwrap() {
                Some(fd) => fd,
                None => return,
            };
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                return;
            }
            self.emit_output(&buf[..n as usize]);
        }
    }

    fn wait_loop(self: Arc<Self>, mut child: Child) {
        match child.wait() {
            Ok(status) if status.success() => {
                info!("pty child exited cleanly");
                self.notify_exit("EOF");
            }
            Ok(status) => {
                let desc = status.code().map(|c| c.to_string()).unwrap_or_else(|| "unknown".to_string());
                warn!(exit_status = %desc, "pty child exited with a non-zero status");
                self.notify_exit(&format!("exit status {desc}"));
            }
            Err(err) => {
                warn!(%err, "failed to wait on pty child, reporting EOF");
                self.notify_exit("EOF");
            }
        }
    }
}

impl SimpleIoAdapter for PtyAdapter {
    fn set_emitters(&self, emit_output: EmitOutput, emit_exit: EmitExit) {
        *self.emit_output.lock().unwrap() = Some(emit_output);
        *self.emit_exit.lock().unwrap() = Some(emit_exit);
    }

    fn on_start(&self, command: Vec<String>, rows: i64, cols: i64, term: String) -> Result<Option<(i64, i64)>, String> {
        if command.is_empty() {
            return Err("start.command is required".to_string());
        }
        let rows = if rows <= 0 { 24 } else { rows };
        let cols = if cols <= 0 { 80 } else { cols };
        let term = if term.is_empty() { "xterm-256color".to_string() } else { term };

        let (master, slave) = open_pty().map_err(|e| e.to_string())?;

        let stdin = dup_stdio(slave).map_err(|e| e.to_string())?;
        let stdout = dup_stdio(slave).map_err(|e| e.to_string())?;
        let stderr = dup_stdio(slave).map_err(|e| e.to_string())?;
        unsafe {
            libc::close(slave);
        }

        let mut cmd = Command::new(&command[0]);
        cmd.args(&command[1..]);
        cmd.env("TERM", &term);
        cmd.stdin(stdin).stdout(stdout).stderr(stderr);
        // Runs in the child between fork and exec; setsid() is async-signal-safe and makes the
        // child its own session/process-group leader so it owns the controlling terminal.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                unsafe {
                    libc::close(master);
                }
                return Err(e.to_string());
            }
        };

        set_winsize(master, rows, cols);
        *self.master_fd.lock().unwrap() = Some(master);
        *self.child_pid.lock().unwrap() = Some(child.id() as i32);
        info!(command = ?command, rows, cols, pid = child.id(), "pty child spawned");

        let self_arc = self
            .self_weak
            .lock()
            .unwrap()
            .upgrade()
            .expect("adapter outlives its own on_start call");
        let reader = Arc::clone(&self_arc);
        thread::Builder::new()
            .name("pty-reader".to_string())
            .spawn(move || reader.read_loop())
            .expect("spawn pty reader thread");
        let waiter = Arc::clone(&self_arc);
        thread::Builder::new()
            .name("pty-waiter".to_string())
            .spawn(move || waiter.wait_loop(child))
            .expect("spawn pty wait thread");

        Ok(Some((rows, cols)))
    }

    fn on_input(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let guard = self.master_fd.lock().unwrap();
        if let Some(fd) = *guard {
            unsafe {
                libc::write(fd, data.as_ptr() as *const libc::c_void, data.len());
            }
        }
    }

    fn on_resize(&self, rows: i64, cols: i64) {
        if rows <= 0 || cols <= 0 {
            return;
        }
        let guard = self.master_fd.lock().unwrap();
        if let Some(fd) = *guard {
            set_winsize(fd, rows, cols);
        }
    }

    fn on_stop(&self) {
        info!("pty adapter stopping");
        self.stopped.store(true, Ordering::SeqCst);
        if let Some(fd) = self.master_fd.lock().unwrap().take() {
            unsafe {
                libc::close(fd);
            }
        }
        if let Some(pid) = self.child_pid.lock().unwrap().take() {
            unsafe {
                libc::kill(pid, libc::SIGINT);
            }
        }
    }
}
