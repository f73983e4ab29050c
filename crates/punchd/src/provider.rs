//! Out-of-process face detection and embedding.
//!
//! The helper reads, per frame, one JSON header line
//! `{"width":W,"height":H,"len":N}` followed by `N` raw grayscale bytes on
//! stdin, and answers with one JSON line on stdout: an array of
//! `{"region":{..},"embedding":[..],"landmarks":{..}}` objects.

use punch_core::{FaceObservation, FaceProvider, ProviderError, RawFrame};
use serde::Serialize;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::Duration;

#[derive(Serialize)]
struct FrameHeader {
    width: u32,
    height: u32,
    len: usize,
}

/// Provider used when no helper is configured: every frame has no faces.
pub struct NoFaces;

impl FaceProvider for NoFaces {
    fn detect_and_encode(&mut self, _frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
        Ok(Vec::new())
    }
}

type Reply = Result<Vec<FaceObservation>, ProviderError>;

/// A long-running helper process speaking the frame protocol.
///
/// The pipe exchange runs on a `punch-provider-io` thread so a reply can be
/// awaited with a deadline. A helper that misses the deadline is killed and
/// every later call fails fast.
pub struct SidecarProvider {
    child: Child,
    requests: Option<Sender<RawFrame>>,
    replies: Receiver<Reply>,
    timeout: Duration,
}

impl SidecarProvider {
    /// Spawn `command_line` (whitespace-separated program and arguments).
    pub fn spawn(command_line: &str, timeout: Duration) -> Result<Self, ProviderError> {
        let mut parts = command_line.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| ProviderError::Unavailable("empty provider command".into()))?;

        let mut child = Command::new(program)
            .args(parts)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| ProviderError::Unavailable(format!("{program}: {e}")))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProviderError::Unavailable("helper stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProviderError::Unavailable("helper stdout not captured".into()))?;

        let (request_tx, request_rx) = mpsc::channel::<RawFrame>();
        let (reply_tx, reply_rx) = mpsc::channel();
        let io = std::thread::Builder::new()
            .name("punch-provider-io".into())
            .spawn(move || run_exchange(stdin, BufReader::new(stdout), request_rx, reply_tx));
        if let Err(e) = io {
            let _ = child.kill();
            let _ = child.wait();
            return Err(ProviderError::Io(e));
        }

        tracing::info!(program, pid = child.id(), timeout = ?timeout, "face provider started");
        Ok(Self {
            child,
            requests: Some(request_tx),
            replies: reply_rx,
            timeout,
        })
    }

    fn kill(&mut self) {
        self.requests = None;
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "face provider already exited");
        }
        let _ = self.child.wait();
    }
}

impl FaceProvider for SidecarProvider {
    fn detect_and_encode(&mut self, frame: &RawFrame) -> Result<Vec<FaceObservation>, ProviderError> {
        let requests = self
            .requests
            .as_ref()
            .ok_or_else(|| ProviderError::Unavailable("helper was stopped".into()))?;
        if requests.send(frame.clone()).is_err() {
            return Err(ProviderError::Unavailable("helper exchange ended".into()));
        }

        match self.replies.recv_timeout(self.timeout) {
            Ok(reply) => reply,
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(pid = self.child.id(), timeout = ?self.timeout, "face provider hung; killing it");
                self.kill();
                Err(ProviderError::Timeout(self.timeout))
            }
            Err(RecvTimeoutError::Disconnected) => {
                self.requests = None;
                Err(ProviderError::Unavailable("helper exchange ended".into()))
            }
        }
    }
}

impl Drop for SidecarProvider {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Write each requested frame to the helper and forward its reply line.
fn run_exchange(
    mut stdin: ChildStdin,
    mut stdout: BufReader<ChildStdout>,
    requests: Receiver<RawFrame>,
    replies: Sender<Reply>,
) {
    let mut line = String::new();
    for frame in requests {
        let reply = exchange(&mut stdin, &mut stdout, &mut line, &frame);
        let fatal = matches!(reply, Err(ProviderError::Io(_) | ProviderError::Unavailable(_)));
        if replies.send(reply).is_err() || fatal {
            break;
        }
    }
    tracing::debug!("face provider exchange finished");
}

fn exchange(
    stdin: &mut ChildStdin,
    stdout: &mut BufReader<ChildStdout>,
    line: &mut String,
    frame: &RawFrame,
) -> Reply {
    let header = FrameHeader {
        width: frame.width,
        height: frame.height,
        len: frame.data.len(),
    };
    let mut header_line = serde_json::to_vec(&header).map_err(|e| ProviderError::Protocol(e.to_string()))?;
    header_line.push(b'\n');

    stdin.write_all(&header_line)?;
    stdin.write_all(&frame.data)?;
    stdin.flush()?;

    line.clear();
    if stdout.read_line(line)? == 0 {
        return Err(ProviderError::Unavailable("helper closed its output".into()));
    }
    parse_reply(line)
}

/// Decode one reply line into observations.
pub fn parse_reply(line: &str) -> Result<Vec<FaceObservation>, ProviderError> {
    serde_json::from_str(line.trim()).map_err(|e| ProviderError::Protocol(e.to_string()))
}

/// Build the configured provider: the helper when a command is set, else [`NoFaces`].
pub fn from_command(command_line: &str, timeout: Duration) -> Result<Box<dyn FaceProvider>, ProviderError> {
    if command_line.trim().is_empty() {
        tracing::warn!("no face provider configured; frames will have no faces");
        return Ok(Box::new(NoFaces));
    }
    Ok(Box::new(SidecarProvider::spawn(command_line, timeout)?))
}
