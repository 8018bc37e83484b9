//! Testbed session
//!
//! Client side of the control protocol. A session owns one backend
//! subprocess: requests go to its stdin, status lines come back on its
//! stdout, and its stderr (build output, backend diagnostics) is drained by a
//! separate task so the backend never blocks on a full pipe while the session
//! waits for a status line.

use crate::config::RunnerConfig;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use reprotest_common::protocol::{Reply, Request, Response, RunRequest};
use reprotest_common::{
    CapabilitySet, CapturedOutput, Error, ExecutionResult, Invocation, Result, SessionState,
};
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Deadlines and limits of a session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub startup_timeout: Duration,
    pub operation_timeout: Duration,
    pub copy_timeout: Duration,
    pub kill_grace: Duration,
    pub output_limit: usize,
    /// How long to keep collecting auxiliary output after a status line
    pub drain_settle: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from_config(&RunnerConfig::default())
    }
}

impl SessionOptions {
    pub fn from_config(config: &RunnerConfig) -> Self {
        Self {
            startup_timeout: config.timeouts.startup(),
            operation_timeout: config.timeouts.operation(),
            copy_timeout: config.timeouts.copy(),
            kill_grace: config.timeouts.kill_grace(),
            output_limit: config.output_limit,
            drain_settle: Duration::from_millis(50),
        }
    }
}

/// Pipes of a running backend process
struct Channel {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    aux: mpsc::UnboundedReceiver<String>,
    drain: JoinHandle<()>,
}

/// One backend instance driven through the control protocol
pub struct TestbedSession {
    argv: Vec<String>,
    options: SessionOptions,
    cancel: CancellationToken,
    state: SessionState,
    channel: Option<Channel>,
    capabilities: CapabilitySet,
    session_id: Option<String>,
    scratch: Option<String>,
}

impl TestbedSession {
    /// Create a closed session for the backend started by `argv`
    pub fn new(argv: Vec<String>, options: SessionOptions, cancel: CancellationToken) -> Self {
        Self {
            argv,
            options,
            cancel,
            state: SessionState::Closed,
            channel: None,
            capabilities: CapabilitySet::default(),
            session_id: None,
            scratch: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.capabilities
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Scratch directory on the testbed side
    pub fn scratch(&self) -> Result<&str> {
        self.scratch
            .as_deref()
            .ok_or_else(|| Error::Internal("testbed session has no scratch directory".to_string()))
    }

    /// Spawn the backend, read its banner, negotiate capabilities and open
    /// a session, all within the startup deadline.
    pub async fn open(&mut self) -> Result<()> {
        self.transition(SessionState::Opening)?;
        info!("Opening testbed: {}", self.argv.join(" "));

        if let Err(e) = self.handshake().await {
            self.fail().await;
            return Err(match e {
                Error::TimedOut { operation, millis } => Error::BackendProtocol(format!(
                    "testbed did not answer `{}` within the startup deadline of {}ms",
                    operation, millis
                )),
                other => other,
            });
        }

        self.transition(SessionState::Open)?;
        info!(
            "Testbed session {} open in {} (capabilities: {})",
            self.session_id().unwrap_or("-"),
            self.scratch.as_deref().unwrap_or("-"),
            self.capabilities
        );
        Ok(())
    }

    async fn handshake(&mut self) -> Result<()> {
        self.spawn()?;
        let started = Instant::now();
        let budget = self.options.startup_timeout;
        let remaining = || Some(budget.saturating_sub(started.elapsed()));
        let mut output = CapturedOutput::default();

        match self.receive("startup", remaining(), &mut output).await? {
            Response::Ok(results) if results.is_empty() => {}
            other => {
                return Err(Error::BackendProtocol(format!(
                    "expected banner `ok`, got `{}`",
                    other.encode()
                )))
            }
        }

        let tokens = ok_results(
            self.exchange(&Request::Capabilities, remaining(), &mut output)
                .await?,
        )?;
        self.capabilities = CapabilitySet::from_tokens(tokens);

        let opened = ok_results(self.exchange(&Request::Open, remaining(), &mut output).await?)?;
        let mut opened = opened.into_iter();
        self.session_id = opened.next();
        self.scratch = opened.next();
        Ok(())
    }

    /// Run an invocation on the testbed.
    ///
    /// `deadline` bounds the whole command; on expiry the session is torn
    /// down and [`Error::TimedOut`] returned.
    pub async fn execute(
        &mut self,
        invocation: &Invocation,
        deadline: Option<Duration>,
    ) -> Result<ExecutionResult> {
        let mut run = RunRequest::new(invocation.argv.clone());
        run.cwd = Some(invocation.cwd.clone());
        run.env = invocation
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        self.run(run, deadline).await
    }

    /// Send a raw `run` request
    pub async fn run(&mut self, run: RunRequest, deadline: Option<Duration>) -> Result<ExecutionResult> {
        self.transition(SessionState::Executing)?;
        debug!("Executing on testbed: {}", run.argv.join(" "));
        self.discard_stale_output();

        let started = Instant::now();
        let mut output = CapturedOutput::default();
        let reply = self.request(Request::Run(run), deadline, &mut output).await;
        self.settle_output(&mut output).await;

        match reply {
            Ok(Reply::Exit(exit_code)) => {
                self.transition(SessionState::Open)?;
                Ok(ExecutionResult {
                    exit_code,
                    output,
                    duration: started.elapsed(),
                })
            }
            Ok(Reply::Ok(_)) => {
                self.fail().await;
                Err(Error::BackendProtocol(
                    "`run` was answered without a status line".to_string(),
                ))
            }
            Err(e) => {
                if self.state == SessionState::Executing {
                    self.transition(SessionState::Open)?;
                }
                Err(e)
            }
        }
    }

    /// Copy a host file or directory into the testbed
    pub async fn copy_in(&mut self, host: &Path, testbed: &str) -> Result<()> {
        self.ensure_open()?;
        let request = Request::CopyDown {
            host: host.display().to_string(),
            testbed: testbed.to_string(),
        };
        let deadline = Some(self.options.copy_timeout);
        self.request(request, deadline, &mut CapturedOutput::default())
            .await
            .map(|_| ())
    }

    /// Copy a testbed file or directory out to the host
    pub async fn copy_out(&mut self, testbed: &str, host: &Path) -> Result<()> {
        self.ensure_open()?;
        let request = Request::CopyUp {
            testbed: testbed.to_string(),
            host: host.display().to_string(),
        };
        let deadline = Some(self.options.copy_timeout);
        self.request(request, deadline, &mut CapturedOutput::default())
            .await
            .map(|_| ())
    }

    /// Reset the testbed to its pristine state.
    ///
    /// Only valid when the backend advertised `revert`.
    pub async fn revert(&mut self) -> Result<()> {
        self.ensure_open()?;
        if !self.capabilities.supports_revert() {
            return Err(Error::BackendFailure {
                verb: "revert".to_string(),
                message: "backend does not advertise the revert capability".to_string(),
            });
        }

        self.transition(SessionState::Reverting)?;
        let deadline = Some(self.options.operation_timeout);
        let reply = self
            .request(Request::Revert, deadline, &mut CapturedOutput::default())
            .await;

        match reply.and_then(ok_results) {
            Ok(results) => {
                self.scratch = results.into_iter().next();
                self.transition(SessionState::Open)?;
                info!("Testbed reverted");
                Ok(())
            }
            Err(e) => {
                if self.state == SessionState::Reverting {
                    self.transition(SessionState::Open)?;
                }
                Err(e)
            }
        }
    }

    /// Close the session and release the backend process. Idempotent.
    pub async fn close(&mut self) -> Result<()> {
        match self.state {
            SessionState::Closed | SessionState::Failed => return Ok(()),
            SessionState::Open => {}
            other => {
                warn!("Tearing down testbed session in state {}", other);
                self.fail().await;
                return Ok(());
            }
        }

        self.transition(SessionState::Closing)?;
        let deadline = Some(self.options.operation_timeout);
        let reply = self
            .request(Request::Close, deadline, &mut CapturedOutput::default())
            .await;

        match reply {
            Ok(_) => {
                self.teardown(true).await;
                self.transition(SessionState::Closed)?;
                debug!("Testbed session closed");
                Ok(())
            }
            Err(e) => {
                self.fail().await;
                Err(e)
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state == SessionState::Open {
            Ok(())
        } else {
            Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: SessionState::Open.to_string(),
            })
        }
    }

    fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidStateTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        trace!("Testbed session {} -> {}", self.state, next);
        self.state = next;
        Ok(())
    }

    fn spawn(&mut self) -> Result<()> {
        let (program, args) = self
            .argv
            .split_first()
            .ok_or_else(|| Error::InvalidConfig("empty backend command".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Own process group, so teardown also reaches the build processes.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::BackendProtocol(format!("Failed to spawn {}: {}", program, e)))?;

        let missing = |stream: &str| Error::Internal(format!("backend {} not captured", stream));
        let stdin = child.stdin.take().ok_or_else(|| missing("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing("stderr"))?;

        let (tx, aux) = mpsc::unbounded_channel();
        let drain = tokio::spawn(drain_auxiliary(stderr, tx));

        debug!("Spawned testbed backend pid {:?}", child.id());
        self.channel = Some(Channel {
            child,
            stdin,
            stdout: BufReader::new(stdout),
            aux,
            drain,
        });
        Ok(())
    }

    /// Exchange that tears the session down on fatal errors
    async fn request(
        &mut self,
        request: Request,
        deadline: Option<Duration>,
        output: &mut CapturedOutput,
    ) -> Result<Reply> {
        match self.exchange(&request, deadline, output).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                if e.is_session_fatal() {
                    warn!("Testbed `{}` failed: {}", request.verb(), e);
                    self.fail().await;
                }
                Err(e)
            }
        }
    }

    async fn exchange(
        &mut self,
        request: &Request,
        deadline: Option<Duration>,
        output: &mut CapturedOutput,
    ) -> Result<Reply> {
        let line = request.encode()?;
        debug!("testbed <- {}", line);
        self.send(&line).await?;
        self.receive(request.verb(), deadline, output)
            .await?
            .check(request)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        let channel = self.channel_mut()?;
        let write = async {
            channel.stdin.write_all(line.as_bytes()).await?;
            channel.stdin.write_all(b"\n").await?;
            channel.stdin.flush().await
        };
        write
            .await
            .map_err(|e| Error::BackendProtocol(format!("failed to write to the testbed: {}", e)))
    }

    /// Wait for the next control line, collecting auxiliary output meanwhile.
    async fn receive(
        &mut self,
        operation: &str,
        deadline: Option<Duration>,
        output: &mut CapturedOutput,
    ) -> Result<Response> {
        let limit = self.options.output_limit;
        let cancel = self.cancel.clone();
        let channel = self.channel_mut()?;

        let expiry = async {
            match deadline {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };

        let line = tokio::select! {
            line = read_control_line(&mut channel.stdout, &mut channel.aux, output, limit) => line?,
            _ = expiry => {
                return Err(Error::TimedOut {
                    operation: operation.to_string(),
                    millis: deadline.map(|d| d.as_millis() as u64).unwrap_or_default(),
                });
            }
            _ = cancel.cancelled() => return Err(Error::Cancelled),
        };

        debug!("testbed -> {}", line.trim_end());
        Response::parse(&line)
    }

    fn channel_mut(&mut self) -> Result<&mut Channel> {
        self.channel
            .as_mut()
            .ok_or_else(|| Error::BackendProtocol("testbed process is not running".to_string()))
    }

    fn discard_stale_output(&mut self) {
        if let Some(channel) = self.channel.as_mut() {
            while let Ok(line) = channel.aux.try_recv() {
                debug!(target: "testbed", "{}", line);
            }
        }
    }

    async fn settle_output(&mut self, output: &mut CapturedOutput) {
        let limit = self.options.output_limit;
        let settle = self.options.drain_settle;
        if let Some(channel) = self.channel.as_mut() {
            while let Ok(Some(line)) = tokio::time::timeout(settle, channel.aux.recv()).await {
                output.push_bounded(line, limit);
            }
        }
    }

    /// Tear down and mark the session failed
    async fn fail(&mut self) {
        self.teardown(false).await;
        if self.state != SessionState::Closed {
            self.state = SessionState::Failed;
        }
    }

    /// Stop the backend process group.
    ///
    /// With `graceful`, the backend first gets the grace period to exit on its
    /// own after stdin is closed.
    async fn teardown(&mut self, graceful: bool) {
        let Some(channel) = self.channel.take() else {
            return;
        };
        let Channel {
            mut child,
            stdin,
            drain,
            ..
        } = channel;
        drop(stdin);
        let grace = self.options.kill_grace;

        if graceful && tokio::time::timeout(grace, child.wait()).await.is_ok() {
            drain.abort();
            return;
        }

        if let Some(pid) = child.id() {
            let group = Pid::from_raw(pid as i32);
            let _ = killpg(group, Signal::SIGTERM);
            if tokio::time::timeout(grace, child.wait()).await.is_err() {
                warn!("Testbed backend {} ignored SIGTERM, killing", pid);
                let _ = killpg(group, Signal::SIGKILL);
                let _ = child.wait().await;
            }
        }
        drain.abort();
    }
}

impl Drop for TestbedSession {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.as_ref() {
            if let Some(pid) = channel.child.id() {
                warn!("Testbed session dropped while running, killing process group {}", pid);
                let _ = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL);
            }
        }
    }
}

fn ok_results(reply: Reply) -> Result<Vec<String>> {
    match reply {
        Reply::Ok(results) => Ok(results),
        Reply::Exit(code) => Err(Error::BackendProtocol(format!(
            "unexpected status line `exit {}`",
            code
        ))),
    }
}

/// Read one control line while collecting auxiliary output.
async fn read_control_line(
    stdout: &mut BufReader<ChildStdout>,
    aux: &mut mpsc::UnboundedReceiver<String>,
    output: &mut CapturedOutput,
    limit: usize,
) -> Result<String> {
    let mut line = String::new();
    let read = {
        let fut = stdout.read_line(&mut line);
        tokio::pin!(fut);
        loop {
            tokio::select! {
                res = &mut fut => break res,
                Some(aux_line) = aux.recv() => output.push_bounded(aux_line, limit),
            }
        }
    };

    match read {
        Ok(0) => Err(Error::BackendProtocol(
            "unexpected eof from the testbed".to_string(),
        )),
        Ok(_) => Ok(line),
        Err(e) => Err(Error::BackendProtocol(format!(
            "failed to read from the testbed: {}",
            e
        ))),
    }
}

/// Forward the backend's stderr line by line until it closes.
async fn drain_auxiliary(stderr: ChildStderr, tx: mpsc::UnboundedSender<String>) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                trace!(target: "testbed", "{}", line);
                // Keep draining even if nobody listens any more.
                let _ = tx.send(line);
            }
            Err(e) => {
                debug!("Auxiliary stream closed: {}", e);
                break;
            }
        }
    }
}
