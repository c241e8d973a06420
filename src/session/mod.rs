//! Interactive session driver
//!
//! Drives a prompt-printing program as a scripted protocol: wait for one of
//! several expected outputs, then answer. Output is matched against a growing
//! buffer, not line by line, because prompts usually lack a newline.

mod pty;

pub use pty::spawn_pty;

use regex::Regex;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::error::NodeError;

/// Bound on the graceful wait in [`InteractiveSession::close`]
const GRACEFUL_EXIT_WAIT: Duration = Duration::from_secs(5);

/// Amount of unmatched output kept in error values
const PENDING_TAIL_LEN: usize = 512;

/// Session-level failures
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no expected output within {after:?} (last output: {pending:?})")]
    Timeout { after: Duration, pending: String },

    #[error("process closed its output (last output: {pending:?})")]
    Closed { pending: String },

    #[error("session I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to start session: {0}")]
    Spawn(String),
}

impl From<SessionError> for NodeError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::Timeout { after, pending } => {
                NodeError::timeout(format!("waiting for installer output after {:?}", pending), after)
            }
            SessionError::Closed { pending } => NodeError::ProcessExited(pending),
            SessionError::Io(e) => NodeError::Io(e),
            SessionError::Spawn(msg) => NodeError::EnvironmentUnavailable(msg),
        }
    }
}

/// Something to wait for
#[derive(Debug, Clone)]
pub enum Pattern {
    Literal(String),
    Regex(Regex),
    /// The process closed its output
    Eof,
}

impl Pattern {
    pub fn literal(text: impl Into<String>) -> Self {
        Pattern::Literal(text.into())
    }

    pub fn regex(pattern: &str) -> Result<Self, regex::Error> {
        Regex::new(pattern).map(Pattern::Regex)
    }

    /// Byte range of the first occurrence in `haystack`
    fn find(&self, haystack: &str) -> Option<(usize, usize)> {
        match self {
            Pattern::Literal(text) => haystack.find(text.as_str()).map(|s| (s, s + text.len())),
            Pattern::Regex(re) => re.find(haystack).map(|m| (m.start(), m.end())),
            Pattern::Eof => None,
        }
    }
}

/// Result of a successful [`InteractiveSession::expect_any`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Index into the pattern list
    pub index: usize,
    /// Output between the previous match and this one
    pub before: String,
    /// The matched text (empty for end-of-output)
    pub matched: String,
}

/// Live handle to one interactive program
pub struct InteractiveSession {
    label: String,
    output: mpsc::Receiver<Vec<u8>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    child: Option<Child>,
    pump: JoinHandle<()>,
    buffer: String,
    partial: Vec<u8>,
    eof: bool,
}

impl InteractiveSession {
    /// Build a session over an arbitrary byte stream pair.
    ///
    /// `child`, when given, is the process behind the streams and is reaped
    /// by [`close`](Self::close).
    pub fn from_stream<R, W>(label: impl Into<String>, reader: R, writer: W, child: Option<Child>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let label = label.into();
        let (tx, rx) = mpsc::channel(64);
        let pump = tokio::spawn(pump_output(label.clone(), reader, tx));

        Self {
            label,
            output: rx,
            writer: Box::new(writer),
            child,
            pump,
            buffer: String::new(),
            partial: Vec::new(),
            eof: false,
        }
    }

    /// Wait until one of `patterns` appears in the output.
    ///
    /// The earliest match in the buffer wins, ties go to the lower index.
    /// Everything up to and including the match is consumed. When the
    /// program closes its output, an [`Pattern::Eof`] entry matches with
    /// whatever is left as `before`; without one the call fails with
    /// [`SessionError::Closed`].
    pub async fn expect_any(&mut self, patterns: &[Pattern], timeout: Duration) -> Result<Match, SessionError> {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some(found) = self.take_match(patterns) {
                trace!("[{}] matched pattern {}", self.label, found.index);
                return Ok(found);
            }

            if self.eof {
                let eof_index = patterns.iter().position(|p| matches!(p, Pattern::Eof));
                return match eof_index {
                    Some(index) => Ok(Match {
                        index,
                        before: std::mem::take(&mut self.buffer),
                        matched: String::new(),
                    }),
                    None => Err(SessionError::Closed { pending: self.pending_tail() }),
                };
            }

            match tokio::time::timeout_at(deadline, self.output.recv()).await {
                Ok(Some(bytes)) => self.append(&bytes),
                Ok(None) => {
                    debug!("[{}] output closed", self.label);
                    self.flush_partial();
                    self.eof = true;
                }
                Err(_) => {
                    return Err(SessionError::Timeout {
                        after: timeout,
                        pending: self.pending_tail(),
                    })
                }
            }
        }
    }

    /// Convenience wrapper for a single pattern
    pub async fn expect(&mut self, pattern: Pattern, timeout: Duration) -> Result<Match, SessionError> {
        self.expect_any(std::slice::from_ref(&pattern), timeout).await
    }

    /// Write `line` followed by a newline
    pub async fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        debug!("[{}] send: {:?}", self.label, line);
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Terminate the session and return the exit code if one is known.
    ///
    /// Without `force` the program gets a bounded grace period to exit on
    /// its own before it is killed.
    pub async fn close(mut self, force: bool) -> Option<i32> {
        let _ = self.writer.shutdown().await;

        let code = match self.child.as_mut() {
            Some(child) => {
                if !force {
                    if let Ok(Ok(status)) = tokio::time::timeout(GRACEFUL_EXIT_WAIT, child.wait()).await {
                        self.pump.abort();
                        return status.code();
                    }
                    warn!("[{}] did not exit within {:?}, killing", self.label, GRACEFUL_EXIT_WAIT);
                }
                if let Err(e) = child.kill().await {
                    warn!("[{}] failed to kill process: {}", self.label, e);
                }
                child.try_wait().ok().flatten().and_then(|s| s.code())
            }
            None => None,
        };

        self.pump.abort();
        code
    }

    fn take_match(&mut self, patterns: &[Pattern]) -> Option<Match> {
        let mut best: Option<(usize, usize, usize)> = None;
        for (index, pattern) in patterns.iter().enumerate() {
            if let Some((start, end)) = pattern.find(&self.buffer) {
                if best.map_or(true, |(_, s, _)| start < s) {
                    best = Some((index, start, end));
                }
            }
        }

        let (index, start, end) = best?;
        let rest = self.buffer.split_off(end);
        let matched = self.buffer.split_off(start);
        let before = std::mem::replace(&mut self.buffer, rest);
        Some(Match { index, before, matched })
    }

    fn append(&mut self, bytes: &[u8]) {
        self.partial.extend_from_slice(bytes);
        match std::str::from_utf8(&self.partial) {
            Ok(text) => {
                self.buffer.push_str(text);
                self.partial.clear();
            }
            Err(e) => {
                let valid = e.valid_up_to();
                let tail = self.partial.split_off(valid);
                // valid_up_to guarantees this prefix decodes
                self.buffer.push_str(&String::from_utf8_lossy(&self.partial));
                self.partial = tail;
                if e.error_len().is_some() {
                    self.flush_partial();
                }
            }
        }
    }

    fn flush_partial(&mut self) {
        if !self.partial.is_empty() {
            self.buffer.push_str(&String::from_utf8_lossy(&self.partial));
            self.partial.clear();
        }
    }

    fn pending_tail(&self) -> String {
        let mut start = self.buffer.len().saturating_sub(PENDING_TAIL_LEN);
        while !self.buffer.is_char_boundary(start) {
            start += 1;
        }
        self.buffer[start..].to_string()
    }
}

impl Drop for InteractiveSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump_output<R>(label: String, mut reader: R, tx: mpsc::Sender<Vec<u8>>)
where
    R: AsyncRead + Send + Unpin,
{
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                trace!("[{}] recv: {:?}", label, String::from_utf8_lossy(&buf[..n]));
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            // A pty master reports EIO once the slave side is gone
            Err(e) if e.raw_os_error() == Some(libc::EIO) => break,
            Err(e) => {
                warn!("[{}] read error: {}", label, e);
                break;
            }
        }
    }
}
