//! Subprocess supervisor for `llama-server`.
//!
//! One [`LlamaServer`] owns at most one child process between `start()` and
//! `stop()`. Readiness is detected by scanning the child's combined output
//! for the listening banner; stop sends a graceful signal first and falls
//! back to a hard kill after a bounded grace window.

use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use crate::client::CompletionClient;
use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::installation::{Installation, SERVER_BINARY};

/// Upper bound on server start, matching the slowest observed model loads.
pub const DEFAULT_START_TIMEOUT: Duration = Duration::from_secs(60);

const STOP_GRACE: Duration = Duration::from_secs(5);

/// Cap on the output retained for start-failure diagnostics.
const CAPTURE_LIMIT: usize = 64 * 1024;

/// Receives every log line the server writes.
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Sink that drops all server output; used by detection probes.
pub fn noop_log_sink() -> LogSink {
    Arc::new(|_| {})
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerStatus {
    Absent,
    Starting,
    Running,
    Stopping,
    Stopped,
}

pub struct LlamaServer {
    installation: Installation,
    config: ServerConfig,
    /// Override for the readiness line; the default is derived from the
    /// bound host and port. Kept configurable because the upstream log
    /// format has drifted across releases.
    ready_marker: Option<String>,
    log_sink: Option<LogSink>,
    start_timeout: Duration,
    child: Option<Child>,
    port: Option<u16>,
    status: ServerStatus,
}

impl LlamaServer {
    pub fn new(installation: Installation, config: ServerConfig) -> Self {
        Self {
            installation,
            config,
            ready_marker: None,
            log_sink: None,
            start_timeout: DEFAULT_START_TIMEOUT,
            child: None,
            port: None,
            status: ServerStatus::Absent,
        }
    }

    pub fn with_log_sink(mut self, sink: LogSink) -> Self {
        self.log_sink = Some(sink);
        self
    }

    pub fn with_ready_marker(mut self, marker: impl Into<String>) -> Self {
        self.ready_marker = Some(marker.into());
        self
    }

    pub fn with_start_timeout(mut self, timeout: Duration) -> Self {
        self.start_timeout = timeout;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn installation(&self) -> &Installation {
        &self.installation
    }

    /// Bound port, available once the server is running.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Current status, refreshed against the child's liveness.
    pub fn status(&mut self) -> ServerStatus {
        if let Some(child) = &mut self.child {
            if let Ok(Some(_)) = child.try_wait() {
                self.child = None;
                self.port = None;
                self.status = ServerStatus::Stopped;
            }
        }
        self.status
    }

    /// Launch the server and wait until it reports readiness.
    ///
    /// Idempotent: a second call while a child is alive returns immediately.
    pub async fn start(&mut self) -> Result<()> {
        // Refresh first so a crashed child does not satisfy the check.
        if self.status() == ServerStatus::Running {
            return Ok(());
        }
        let server = self.installation.server_path().ok_or_else(|| {
            Error::NotFound(format!(
                "{SERVER_BINARY} in {}",
                self.installation.root().display()
            ))
        })?;
        if self.config.model_path.as_os_str().is_empty() {
            return Err(Error::InvalidArgument(
                "config has no model path".to_string(),
            ));
        }

        let port = match self.config.port {
            Some(p) if p > 0 => p,
            // Transient bind to grab a free port; the small window until the
            // server binds it again is a documented, accepted race.
            _ => pick_free_port()?,
        };
        let flash_enum = self.installation.flash_attn_takes_value().await?;
        let argv = self.config.to_args(port, flash_enum);
        log::debug!("starting {} {}", server.display(), argv.join(" "));

        let mut cmd = Command::new(&server);
        cmd.args(&argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(parent) = server.parent() {
            cmd.current_dir(parent);
        }
        let mut child = cmd.spawn()?;
        self.status = ServerStatus::Starting;

        let marker = self.ready_marker.clone().unwrap_or_else(|| {
            format!(
                "main: server is listening on http://{}:{} - starting the main loop",
                self.config.effective_host(),
                port
            )
        });
        let (ready_tx, mut ready_rx) = mpsc::channel::<()>(2);
        let capture = Arc::new(Mutex::new(String::new()));
        let mut scanners = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            scanners.push(scan_lines(
                stdout,
                marker.clone(),
                ready_tx.clone(),
                capture.clone(),
                self.log_sink.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            scanners.push(scan_lines(
                stderr,
                marker,
                ready_tx,
                capture.clone(),
                self.log_sink.clone(),
            ));
        }

        enum StartEvent {
            Ready,
            PipesClosed,
            Exited(std::io::Result<std::process::ExitStatus>),
            TimedOut,
        }

        let deadline = tokio::time::Instant::now() + self.start_timeout;
        let event = tokio::select! {
            ready = ready_rx.recv() => match ready {
                Some(()) => StartEvent::Ready,
                None => StartEvent::PipesClosed,
            },
            exit = child.wait() => StartEvent::Exited(exit),
            _ = tokio::time::sleep_until(deadline) => StartEvent::TimedOut,
        };
        let outcome = match event {
            StartEvent::Ready => Ok(()),
            StartEvent::PipesClosed => {
                // Both pipes closed without the banner: the child is on its
                // way out. Collect the exit code for the report.
                match tokio::time::timeout_at(deadline, child.wait()).await {
                    Ok(Ok(status)) => Err(Error::StartFailed {
                        code: status.code(),
                        output: captured(&capture),
                    }),
                    Ok(Err(e)) => Err(Error::Io(e)),
                    Err(_) => {
                        let _ = child.start_kill();
                        let _ = child.wait().await;
                        Err(Error::Timeout(self.start_timeout))
                    }
                }
            }
            StartEvent::Exited(Ok(status)) => {
                // Let the scanners drain the tail of the output before the
                // report is assembled.
                let drain = futures_util::future::join_all(scanners.drain(..));
                let _ = tokio::time::timeout(Duration::from_secs(2), drain).await;
                Err(Error::StartFailed {
                    code: status.code(),
                    output: captured(&capture),
                })
            }
            StartEvent::Exited(Err(e)) => Err(Error::Io(e)),
            StartEvent::TimedOut => {
                let _ = child.start_kill();
                let _ = child.wait().await;
                Err(Error::Timeout(self.start_timeout))
            }
        };

        match outcome {
            Ok(()) => {
                log::info!("llama-server ready on port {port}");
                self.child = Some(child);
                self.port = Some(port);
                self.status = ServerStatus::Running;
                Ok(())
            }
            Err(e) => {
                self.port = None;
                self.status = ServerStatus::Stopped;
                Err(e)
            }
        }
    }

    /// Stop the server. Graceful termination first; a hard kill after the
    /// grace window, or immediately when `force` is set. No-op when nothing
    /// is running.
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            self.port = None;
            self.status = ServerStatus::Absent;
            return Ok(());
        };
        self.status = ServerStatus::Stopping;
        terminate(&mut child);
        let grace = if force { Duration::ZERO } else { STOP_GRACE };
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        self.port = None;
        self.status = ServerStatus::Absent;
        Ok(())
    }

    pub async fn restart(&mut self) -> Result<()> {
        self.stop(false).await?;
        self.start().await
    }
}

/// Runtime handle for a started server: base URL, a bound HTTP client and
/// the per-process concurrency cap.
pub struct ServerProcess {
    server: LlamaServer,
    client: CompletionClient,
    base_url: String,
    pub concurrency: usize,
}

impl ServerProcess {
    /// Wrap a running supervisor.
    pub fn from_server(server: LlamaServer) -> Result<Self> {
        let port = server.port().ok_or_else(|| {
            Error::InvalidArgument("server has not been started".to_string())
        })?;
        let base_url = format!("http://localhost:{port}");
        let client = CompletionClient::new(base_url.clone())?;
        Ok(Self {
            server,
            client,
            base_url,
            concurrency: 1,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn client(&self) -> &CompletionClient {
        &self.client
    }

    pub fn port(&self) -> Option<u16> {
        self.server.port()
    }

    /// Stop the process and release the client.
    pub async fn close(&mut self, force: bool) -> Result<()> {
        self.server.stop(force).await
    }
}

fn scan_lines(
    stream: impl AsyncRead + Unpin + Send + 'static,
    marker: String,
    ready_tx: mpsc::Sender<()>,
    capture: Arc<Mutex<String>>,
    sink: Option<LogSink>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match &sink {
                Some(sink) => sink(&line),
                None => log::info!(target: "llama-server", "{line}"),
            }
            {
                let mut buf = capture.lock().unwrap();
                if buf.len() < CAPTURE_LIMIT {
                    buf.push_str(&line);
                    buf.push('\n');
                }
            }
            if line.contains(&marker) {
                let _ = ready_tx.try_send(());
            }
        }
    })
}

fn captured(capture: &Arc<Mutex<String>>) -> String {
    capture.lock().unwrap().clone()
}

/// Bind an ephemeral port, read it back and release it for the child.
fn pick_free_port() -> Result<u16> {
    let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

#[cfg(unix)]
fn terminate(child: &mut Child) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) {
    let _ = child.start_kill();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_before_start_is_a_noop() {
        let install = Installation::at("/nonexistent");
        let mut server = LlamaServer::new(install, ServerConfig::for_model("/m.gguf"));
        assert_eq!(server.status(), ServerStatus::Absent);
        server.stop(false).await.unwrap();
        server.stop(true).await.unwrap();
        assert_eq!(server.status(), ServerStatus::Absent);
        assert_eq!(server.port(), None);
    }

    #[tokio::test]
    async fn start_without_binaries_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let install = Installation::at(dir.path());
        let mut server = LlamaServer::new(install, ServerConfig::for_model("/m.gguf"));
        assert!(matches!(server.start().await, Err(Error::NotFound(_))));
        assert_eq!(server.status(), ServerStatus::Absent);
    }

    #[test]
    fn free_ports_are_distinct_enough_to_bind() {
        let port = pick_free_port().unwrap();
        assert!(port > 0);
        // The port is released and can be bound again.
        std::net::TcpListener::bind(("127.0.0.1", port)).unwrap();
    }
}
