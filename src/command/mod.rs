//! Diagnostic session server.
//!
//! Operators connect to a Unix socket (for example with `socat - UNIX:<path>`)
//! and type one command per line. Every answer is framed by a delimiter line.
//! Diagnose mode is switched on for the duration of a session.

use std::convert::Infallible;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;
use tracing::{debug, error, info, warn};

use crate::server::ServerError;
use crate::service::HttpCache;

pub const DELIMITER: &str = "=========================================";
pub const PROMPT: &str = ">> ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    TurnOnDiag,
    TurnOffDiag,
    DumpStats,
    ShowSummary,
    ShowCacheStats,
    ShowProxyStats,
    ShowBackendStats,
    Help,
}

impl Command {
    pub const ALL: [Command; 8] = [
        Command::TurnOnDiag,
        Command::TurnOffDiag,
        Command::DumpStats,
        Command::ShowSummary,
        Command::ShowCacheStats,
        Command::ShowProxyStats,
        Command::ShowBackendStats,
        Command::Help,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Command::TurnOnDiag => "turn-on-diag",
            Command::TurnOffDiag => "turn-off-diag",
            Command::DumpStats => "dump-stats",
            Command::ShowSummary => "show-summary",
            Command::ShowCacheStats => "show-cache-stats",
            Command::ShowProxyStats => "show-proxy-stats",
            Command::ShowBackendStats => "show-backend-stats",
            Command::Help => "help",
        }
    }
}

/// Parses the first word of a line. Anything unknown is [`Command::Help`].
impl FromStr for Command {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let word = s.split_whitespace().next().unwrap_or_default();
        Ok(Command::ALL
            .into_iter()
            .find(|c| c.name() == word)
            .unwrap_or(Command::Help))
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("error in marshaling stats: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("error in writing {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

pub struct CommandServer {
    service: Arc<HttpCache>,
    dump_file: PathBuf,
}

impl CommandServer {
    pub fn new(service: Arc<HttpCache>, dump_file: impl Into<PathBuf>) -> Self {
        Self {
            service,
            dump_file: dump_file.into(),
        }
    }

    /// Runs one command and returns its unframed output.
    pub async fn execute(&self, command: Command) -> Result<String, CommandError> {
        let svc = &self.service;
        let mut out = String::new();

        match command {
            Command::TurnOnDiag | Command::TurnOffDiag => {
                let on = command == Command::TurnOnDiag;
                if svc.diagnose() == on {
                    let _ = write!(out, "Diagnose status already {on}");
                } else {
                    svc.set_diagnose(on);
                    let _ = write!(out, "Switching Diagnose status {on}");
                }
            }
            Command::DumpStats => {
                let body = serde_json::to_vec_pretty(&svc.stats().snapshot())?;
                tokio::fs::write(&self.dump_file, body)
                    .await
                    .map_err(|source| CommandError::Write {
                        path: self.dump_file.clone(),
                        source,
                    })?;
                let _ = write!(out, "Stats have been dumped to {}", self.dump_file.display());
            }
            Command::ShowSummary => {
                let totals = svc.stats().totals();
                let _ = writeln!(out, "Total Items         - {}", svc.cache().bucket_count());
                let _ = writeln!(out, "Tracked Keys        - {}", svc.stats().tracked_keys());
                let _ = writeln!(out, "Total Invalidations - {}", totals.invalidations);
                let _ = write!(out, "Total Requests      - {}", totals.requests);
            }
            Command::ShowCacheStats => {
                let totals = svc.stats().totals();
                let _ = writeln!(out, "Total Cache Hit     - {}", totals.hits);
                let _ = writeln!(out, "Total Cache Miss    - {}", totals.misses);
                let _ = writeln!(out, "Total Cache Skipped - {}", totals.skipped);
                let _ = write!(out, "Total Cache Added   - {}", totals.cache_added);
            }
            Command::ShowProxyStats => {
                let totals = svc.stats().totals();
                let _ = writeln!(out, "Total Proxied       - {}", totals.proxied);
                let _ = writeln!(out, "Total Local Handled - {}", totals.local_handled);
                let _ = writeln!(out, "Total Rejected      - {}", totals.rejected);
                let dispatcher = svc.dispatcher();
                for worker in 0..dispatcher.worker_count() {
                    if let Some((inbound, outbound)) = dispatcher.queue_depth(worker) {
                        let _ = write!(
                            out,
                            "\nWorker {worker:<3} queues   - in {inbound}, out {outbound}"
                        );
                    }
                }
            }
            Command::ShowBackendStats => {
                let snapshot = svc.stats().snapshot();
                let failing: Vec<_> = snapshot
                    .by_api()
                    .into_iter()
                    .filter(|(_, s)| s.backend_failed > 0)
                    .collect();
                if failing.is_empty() {
                    out.push_str("No backend failures");
                }
                for (i, (api, s)) in failing.iter().enumerate() {
                    if i > 0 {
                        out.push('\n');
                    }
                    let _ = write!(out, "{api} - {}", s.backend_failed);
                }
            }
            Command::Help => {
                out.push_str("Following commands are available :\n");
                for c in Command::ALL {
                    let _ = write!(out, "\n{}", c.name());
                }
            }
        }

        Ok(out)
    }

    /// Parses and runs `line`, returning the framed answer. Failures are
    /// reported in the answer instead of ending the session.
    pub async fn run_command(&self, line: &str) -> String {
        let command = line.parse::<Command>().unwrap_or_else(|never| match never {});
        let output = match self.execute(command).await {
            Ok(output) => output,
            Err(e) => {
                warn!(command = command.name(), error = %e, "diagnostic command failed");
                e.to_string()
            }
        };
        format!("\n{DELIMITER}\n{output}\n{DELIMITER}\n\n")
    }

    /// Serves one operator session until the peer disconnects.
    pub async fn session<S>(&self, stream: S) -> Result<(), std::io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.service.set_diagnose(true);
        let result = self.session_loop(stream).await;
        self.service.set_diagnose(false);
        result
    }

    async fn session_loop<S>(&self, stream: S) -> Result<(), std::io::Error>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stream = BufReader::new(stream);
        stream.write_all(PROMPT.as_bytes()).await?;

        let mut line = String::new();
        loop {
            line.clear();
            if stream.read_line(&mut line).await? == 0 {
                return Ok(());
            }
            let cmd = line.trim();
            if !cmd.is_empty() {
                info!(command = cmd, "diagnostic command received");
                let answer = self.run_command(cmd).await;
                stream.write_all(answer.as_bytes()).await?;
            }
            stream.write_all(PROMPT.as_bytes()).await?;
        }
    }

    /// Accepts sessions on the Unix socket at `path`, replacing a stale
    /// socket file. Never returns once bound.
    pub async fn serve(self: Arc<Self>, path: impl AsRef<Path>) -> Result<(), ServerError> {
        let path = path.as_ref();
        let bind_err = |source| ServerError::Bind {
            addr: path.display().to_string(),
            source,
        };

        match tokio::fs::remove_file(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(bind_err(e)),
        }
        let listener = UnixListener::bind(path).map_err(bind_err)?;
        info!(socket = %path.display(), "diagnostic socket listening");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept diagnostic session");
                    continue;
                }
            };

            let server = Arc::clone(&self);
            tokio::spawn(async move {
                debug!("diagnostic session started");
                if let Err(e) = server.session(stream).await {
                    warn!(error = %e, "diagnostic session ended with error");
                }
            });
        }
    }
}
