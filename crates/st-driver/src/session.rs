//! Interactive shell sessions driven over pipes.

use st_types::{DriverError, DriverResult};
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, warn};

use crate::config::ReadLimits;

const READ_CHUNK: usize = 4096;

/// Text read from a session up to a marker.
#[derive(Debug, Clone, PartialEq)]
pub struct Capture {
    /// Everything read, ending with the marker when it was found.
    pub text: String,
    pub marker_found: bool,
    pub elapsed: Duration,
}

struct OutputReader {
    stdout: ChildStdout,
    /// Bytes of an incomplete UTF-8 sequence.
    partial: Vec<u8>,
    /// Text read past the last marker, handed to the next read.
    carry: String,
}

impl OutputReader {
    fn new(stdout: ChildStdout) -> Self {
        Self {
            stdout,
            partial: Vec::new(),
            carry: String::new(),
        }
    }

    /// Next decoded chunk, `None` at end of output.
    async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<Option<String>> {
        let n = self.stdout.read(buf).await?;
        if n == 0 {
            return Ok(None);
        }
        self.partial.extend_from_slice(&buf[..n]);
        Ok(Some(self.take_decoded()))
    }

    fn take_decoded(&mut self) -> String {
        match std::str::from_utf8(&self.partial) {
            Ok(text) => {
                let text = text.to_string();
                self.partial.clear();
                text
            }
            // Incomplete trailing sequence: keep it for the next chunk.
            Err(e) if e.error_len().is_none() => {
                let tail = self.partial.split_off(e.valid_up_to());
                let text = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial = tail;
                text
            }
            Err(_) => {
                let text = String::from_utf8_lossy(&self.partial).into_owned();
                self.partial.clear();
                text
            }
        }
    }
}

struct Drain {
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<OutputReader>,
}

/// A child shell with stderr folded into stdout.
///
/// Commands are written to the shell's stdin; output is consumed by marker
/// reads or discarded by a background drain. The shell is killed when the
/// session is dropped.
pub struct ShellSession {
    name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    reader: Option<OutputReader>,
    drain: Option<Drain>,
    sentinel_seq: u64,
}

impl ShellSession {
    pub async fn spawn(name: impl Into<String>, program: &str) -> DriverResult<Self> {
        let name = name.into();
        let mut child = Command::new(program)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| DriverError::Spawn {
                program: program.to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or_else(|| closed_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| closed_pipe("stdout"))?;
        debug!(session = %name, program, "Spawned shell session");

        let mut session = Self {
            name,
            child,
            stdin: Some(stdin),
            reader: Some(OutputReader::new(stdout)),
            drain: None,
            sentinel_seq: 0,
        };
        session.execute("exec 2>&1").await?;
        Ok(session)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_draining(&self) -> bool {
        self.drain.is_some()
    }

    /// Send one command line without waiting for it.
    pub async fn execute(&mut self, command: &str) -> DriverResult<()> {
        debug!(session = %self.name, command, "Execute");
        let stdin = self.stdin.as_mut().ok_or_else(|| closed_pipe("stdin"))?;
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Start `command` as a background job of the shell.
    pub async fn execute_background(&mut self, command: &str) -> DriverResult<()> {
        self.execute(&format!("{command} &")).await
    }

    /// Read until `marker` appears or a limit passes. Hitting a limit is not
    /// an error; the capture reports whether the marker was seen.
    pub async fn capture_until(
        &mut self,
        marker: &str,
        limits: ReadLimits,
    ) -> DriverResult<Capture> {
        let reader = self.reader.as_mut().ok_or(DriverError::Draining)?;
        let started = Instant::now();
        let mut output = std::mem::take(&mut reader.carry);
        let mut buf = vec![0u8; READ_CHUNK];
        let mut search_from = 0;

        loop {
            if let Some(pos) = find_marker(&output, marker, search_from) {
                reader.carry = output.split_off(pos + marker.len());
                return Ok(Capture {
                    text: output,
                    marker_found: true,
                    elapsed: started.elapsed(),
                });
            }
            search_from = resume_offset(&output, marker);

            let elapsed = started.elapsed();
            if elapsed >= limits.overall {
                return Ok(Capture {
                    text: output,
                    marker_found: false,
                    elapsed,
                });
            }
            let wait = limits.per_read.min(limits.overall - elapsed);

            match timeout(wait, reader.read_chunk(&mut buf)).await {
                Ok(Ok(Some(text))) => output.push_str(&text),
                Ok(Ok(None)) => {
                    return Err(DriverError::OutputClosed {
                        marker: marker.to_string(),
                    })
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    debug!(session = %self.name, marker, ?wait, "No output within read limit");
                    return Ok(Capture {
                        text: output,
                        marker_found: false,
                        elapsed: started.elapsed(),
                    });
                }
            }
        }
    }

    /// Read until `marker` appears; a limit passing first is an error.
    pub async fn read_until(&mut self, marker: &str, limits: ReadLimits) -> DriverResult<String> {
        let capture = self.capture_until(marker, limits).await?;
        if capture.marker_found {
            Ok(capture.text)
        } else {
            Err(DriverError::Timeout {
                marker: marker.to_string(),
                waited_secs: capture.elapsed.as_secs(),
            })
        }
    }

    /// Run `command` and return its output once it finishes.
    pub async fn run_to_completion(
        &mut self,
        command: &str,
        limits: ReadLimits,
    ) -> DriverResult<String> {
        self.sentinel_seq += 1;
        let sentinel = format!("__servetune_done_{}__", self.sentinel_seq);
        self.execute(command).await?;
        self.execute(&format!("echo {sentinel}")).await?;

        let text = self.read_until(&sentinel, limits).await?;
        Ok(text
            .strip_suffix(sentinel.as_str())
            .unwrap_or(&text)
            .to_string())
    }

    /// Terminate the most recent background job and wait for it.
    pub async fn terminate_background(&mut self, limits: ReadLimits) -> DriverResult<()> {
        self.run_to_completion("kill -TERM $! 2>/dev/null; wait $! 2>/dev/null", limits)
            .await
            .map(|_| ())
    }

    /// Discard output in a background task until [`ShellSession::stop_drain`].
    pub fn start_drain(&mut self) -> DriverResult<()> {
        let mut reader = self.reader.take().ok_or(DriverError::Draining)?;
        reader.carry.clear();

        let (cancel, mut cancelled) = oneshot::channel();
        let name = self.name.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; READ_CHUNK];
            let mut discarded = 0usize;
            loop {
                tokio::select! {
                    _ = &mut cancelled => break,
                    read = reader.read_chunk(&mut buf) => {
                        match read {
                            Ok(Some(text)) => discarded += text.len(),
                            Ok(None) => {
                                debug!(session = %name, "Output closed while draining");
                                break;
                            }
                            Err(e) => {
                                warn!(session = %name, "Drain read failed: {}", e);
                                break;
                            }
                        }
                    }
                }
            }
            debug!(session = %name, discarded, "Drain stopped");
            reader.partial.clear();
            reader
        });

        self.drain = Some(Drain { cancel, handle });
        Ok(())
    }

    pub async fn stop_drain(&mut self) -> DriverResult<()> {
        let Some(drain) = self.drain.take() else {
            return Ok(());
        };
        // The task may already have finished on its own.
        let _ = drain.cancel.send(());
        let reader = drain
            .handle
            .await
            .map_err(|e| DriverError::Io(io::Error::new(io::ErrorKind::Other, e)))?;
        self.reader = Some(reader);
        Ok(())
    }

    /// Close stdin and wait up to `grace` for the shell to exit, then kill it.
    pub async fn close(mut self, grace: Duration) -> DriverResult<()> {
        self.stop_drain().await?;
        drop(self.stdin.take());

        match timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => debug!(session = %self.name, %status, "Session exited"),
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!(session = %self.name, "Killing session");
                self.child.kill().await?;
            }
        }
        Ok(())
    }
}

fn find_marker(text: &str, marker: &str, from: usize) -> Option<usize> {
    text[from..].find(marker).map(|pos| from + pos)
}

/// Where the next search must start so a marker split across reads is still
/// found: the last `marker.len() - 1` bytes of `text`, on a char boundary.
fn resume_offset(text: &str, marker: &str) -> usize {
    let mut offset = text.len().saturating_sub(marker.len().saturating_sub(1));
    while !text.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}

fn closed_pipe(which: &str) -> DriverError {
    DriverError::Io(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("session {which} is not available"),
    ))
}
