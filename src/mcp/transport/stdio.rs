//! Stdio transport: talk to an MCP server running as a child process.
//!
//! Frames are newline-delimited JSON over the child's stdin/stdout. The child's
//! stderr is diagnostic output only and is forwarded to the debug log.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::{EventSink, StateCell, Transport, TransportState};
use crate::error::{Error, Result};
use crate::mcp::protocol::Message;

/// Upper bound on a single buffered line.
pub const MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

const READ_CHUNK: usize = 8 * 1024;

/// How to launch a stdio MCP server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Host capability for starting child processes.
pub trait ProcessLauncher: Send + Sync {
    /// Spawn the process with piped stdin, stdout and stderr.
    fn spawn(&self, config: &StdioConfig) -> Result<Child>;
}

/// Launches processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessLauncher;

impl ProcessLauncher for TokioProcessLauncher {
    fn spawn(&self, config: &StdioConfig) -> Result<Child> {
        let mut command = Command::new(&config.command);
        command
            .args(&config.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &config.cwd {
            command.current_dir(cwd);
        }
        command.spawn().map_err(|e| {
            Error::Transport(format!("failed to spawn '{}': {}", config.command, e))
        })
    }
}

/// Splits a byte stream into newline-delimited JSON-RPC messages.
///
/// Partial lines stay buffered until their newline arrives.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete frame.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Result<Message>> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(frame) = Self::decode_line(&line[..line.len() - 1]) {
                frames.push(frame);
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            self.buffer.clear();
            frames.push(Err(Error::Transport(format!(
                "frame exceeds {} bytes without a newline",
                MAX_LINE_BYTES
            ))));
        }

        frames
    }

    /// Bytes held back waiting for a newline.
    pub fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }

    fn decode_line(line: &[u8]) -> Option<Result<Message>> {
        let text = match std::str::from_utf8(line) {
            Ok(text) => text.trim(),
            Err(e) => return Some(Err(Error::Transport(format!("frame is not UTF-8: {}", e)))),
        };
        if text.is_empty() {
            return None;
        }
        Some(Message::parse(text))
    }
}

/// Serialize one message as a newline-terminated frame.
pub fn encode_line(message: &Message) -> Result<Vec<u8>> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Client transport over a spawned child process.
pub struct StdioClientTransport {
    config: StdioConfig,
    launcher: Arc<dyn ProcessLauncher>,
    state: Arc<StateCell>,
    stdin: Mutex<Option<ChildStdin>>,
    shutdown: CancellationToken,
}

impl StdioClientTransport {
    pub fn new(config: StdioConfig, launcher: Arc<dyn ProcessLauncher>) -> Self {
        Self {
            config,
            launcher,
            state: Arc::new(StateCell::new()),
            stdin: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &StdioConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for StdioClientTransport {
    async fn start(&self, events: EventSink) -> Result<()> {
        self.state.begin_start()?;
        self.state.attach(events.clone());

        let mut child = match self.launcher.spawn(&self.config) {
            Ok(child) => child,
            Err(e) => {
                self.state.fail(e.to_string());
                return Err(e);
            }
        };

        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.start_kill();
                self.state.fail("child process stdio was not piped");
                return Err(Error::Transport("child process stdio was not piped".to_string()));
            }
        };

        if let Some(stderr) = child.stderr.take() {
            let command = self.config.command.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(target: "mcp_hub::child_stderr", command = %command, "{}", line);
                }
            });
        }

        info!(command = %self.config.command, pid = ?child.id(), "Spawned MCP server process");
        *self.stdin.lock().await = Some(stdin);
        self.state.set(TransportState::Connected);

        // Process exit shows up as EOF here, which closes the transport.
        let state = self.state.clone();
        let token = self.shutdown.clone();
        let sink = events;
        tokio::spawn(async move {
            let mut stdout = stdout;
            let mut decoder = LineDecoder::new();
            let mut buf = vec![0u8; READ_CHUNK];

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    read = stdout.read(&mut buf) => match read {
                        Ok(0) => {
                            debug!("EOF on child stdout, closing transport");
                            break;
                        }
                        Ok(n) => {
                            for frame in decoder.feed(&buf[..n]) {
                                match frame {
                                    Ok(message) => {
                                        trace!("Received: {:?}", message);
                                        sink.message(message);
                                    }
                                    Err(e) => {
                                        warn!("Dropping malformed frame: {}", e);
                                        sink.error(e.to_string());
                                    }
                                }
                            }
                        }
                        Err(e) => {
                            error!("Error reading child stdout: {}", e);
                            sink.error(format!("read failed: {}", e));
                            break;
                        }
                    }
                }
            }
            state.close();
        });

        let token = self.shutdown.clone();
        let command = self.config.command.clone();
        tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => match status {
                    Ok(status) => info!(command = %command, %status, "MCP server process exited"),
                    Err(e) => error!(command = %command, "Failed waiting on MCP server process: {}", e),
                },
                _ = token.cancelled() => {
                    if let Err(e) = child.kill().await {
                        debug!(command = %command, "Kill after close failed: {}", e);
                    }
                }
            }
        });

        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.state.ensure_connected()?;
        let bytes = encode_line(message)?;

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(Error::NotConnected)?;
        stdin.write_all(&bytes).await?;
        stdin.flush().await?;
        trace!("Sent {} bytes", bytes.len());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.shutdown.cancel();
        self.stdin.lock().await.take();
        if self.state.close() {
            debug!(command = %self.config.command, "Stdio transport closed");
        }
        Ok(())
    }

    fn state(&self) -> TransportState {
        self.state.get()
    }

    fn kind(&self) -> &'static str {
        "stdio"
    }
}
