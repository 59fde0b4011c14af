//! Background pty client.
//!
//! A [`PtyClient`] runs a multiplexer client (`tmux attach-session`) inside a
//! pseudo-terminal owned by this process. Holding the client keeps the
//! session's window sized to the preview pane; dropping it detaches without
//! touching the programs inside the session.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::Mutex;

use super::SessionError;

/// Buffer size for draining the client's output.
const READ_BUFFER_SIZE: usize = 4096;

/// Default client width before the first resize.
pub const DEFAULT_COLS: u16 = 200;

/// Default client height before the first resize.
pub const DEFAULT_ROWS: u16 = 50;

/// Linux reports a closed pty peer as EIO rather than EOF.
const EIO: i32 = 5;

/// A multiplexer client running in a local pty.
pub struct PtyClient {
    /// Label used in log fields.
    label: String,

    /// The PTY master handle.
    master: Arc<Mutex<Box<dyn MasterPty + Send>>>,

    /// The client process.
    child: Arc<Mutex<Box<dyn Child + Send + Sync>>>,

    /// Cleared once the client exits or is closed.
    running: Arc<AtomicBool>,

    cols: u16,
    rows: u16,
}

impl PtyClient {
    /// Spawns `program args…` in a new pty of the given size.
    pub fn spawn(
        label: &str,
        program: &str,
        args: &[&str],
        cols: u16,
        rows: u16,
    ) -> Result<Self, SessionError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(args);

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        tracing::debug!(session = %label, pid = ?child.process_id(), "Spawned pty client");

        Ok(Self {
            label: label.to_string(),
            master: Arc::new(Mutex::new(pair.master)),
            child: Arc::new(Mutex::new(child)),
            running: Arc::new(AtomicBool::new(true)),
            cols,
            rows,
        })
    }

    /// Returns the current client size.
    pub fn size(&self) -> (u16, u16) {
        (self.cols, self.rows)
    }

    /// Returns whether the client is still running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Drains the client's output so the pty never fills up.
    ///
    /// The screen contents are read through `capture-pane`, so the bytes are
    /// discarded here.
    pub fn start_drain_loop(&self) {
        let master = Arc::clone(&self.master);
        let running = Arc::clone(&self.running);
        let label = self.label.clone();

        tokio::spawn(async move {
            let reader = {
                let master = master.lock().await;
                match master.try_clone_reader() {
                    Ok(reader) => reader,
                    Err(e) => {
                        tracing::error!(session = %label, error = %e, "Failed to get PTY reader");
                        running.store(false, Ordering::SeqCst);
                        return;
                    }
                }
            };

            let result = tokio::task::spawn_blocking(move || drain(reader)).await;

            match result {
                Ok(Ok(())) => tracing::debug!(session = %label, "PTY client exited"),
                Ok(Err(e)) => {
                    if running.load(Ordering::SeqCst) {
                        tracing::warn!(session = %label, error = %e, "Error reading from PTY client");
                    }
                }
                Err(e) => tracing::error!(session = %label, error = %e, "PTY drain task panicked"),
            }
            running.store(false, Ordering::SeqCst);
        });
    }

    /// Resizes the pty, which resizes the session's window.
    pub async fn resize(&mut self, cols: u16, rows: u16) -> Result<(), SessionError> {
        if !self.is_running() {
            return Err(SessionError::NotAttached(self.label.clone()));
        }

        let master = self.master.lock().await;
        master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Pty(e.to_string()))?;

        self.cols = cols;
        self.rows = rows;

        tracing::debug!(session = %self.label, cols, rows, "Resized PTY client");
        Ok(())
    }

    /// Terminates the client process. The session it was attached to keeps
    /// running.
    pub async fn close(&self) -> Result<(), SessionError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut child = self.child.lock().await;
        if child.try_wait()?.is_none() {
            child.kill().map_err(|e| SessionError::Pty(e.to_string()))?;
            child.wait()?;
        }

        tracing::debug!(session = %self.label, "Closed PTY client");
        Ok(())
    }
}

fn drain(mut reader: Box<dyn Read + Send>) -> std::io::Result<()> {
    let mut buffer = [0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => return Ok(()),
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) if e.raw_os_error() == Some(EIO) => return Ok(()),
            Err(e) => return Err(e),
        }
    }
}
