//! Null testbed backend
//!
//! Serves the control protocol on a pair of streams and runs commands
//! directly on the host inside a per-session scratch directory.

use crate::fs::{copy_path, unmount_below};
use futures::StreamExt;
use reprotest_common::protocol::{Request, Response, RunRequest, BANNER};
use reprotest_common::{Error, Result};
use std::os::fd::AsFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::Command;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::{debug, info, warn};

/// Exit code reported when the program cannot be started
const EXIT_NOT_RUNNABLE: i32 = 127;

struct Session {
    id: String,
    scratch: TempDir,
}

impl Session {
    fn create() -> Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("reprotest-testbed-")
            .tempdir()?;
        Ok(Self {
            id: uuid::Uuid::new_v4().to_string(),
            scratch,
        })
    }

    fn scratch(&self) -> String {
        self.scratch.path().display().to_string()
    }

    fn destroy(self) {
        let path = self.scratch.path().to_path_buf();
        unmount_below(&path);
        if let Err(e) = self.scratch.close() {
            warn!("Failed to remove scratch directory {}: {}", path.display(), e);
        }
    }
}

/// Testbed that runs everything on the local host
#[derive(Default)]
pub struct NullBackend {
    session: Option<Session>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advertised capabilities
    pub fn capabilities(&self) -> Vec<String> {
        let mut caps = vec!["revert".to_string()];
        if nix::unistd::geteuid().is_root() {
            caps.push("root-on-testbed".to_string());
        }
        caps
    }

    /// Answer one request. Failures become `error` responses.
    pub async fn handle(&mut self, request: Request) -> Response {
        let verb = request.verb();
        match self.dispatch(request).await {
            Ok(response) => response,
            Err(e) => {
                debug!("{} failed: {}", verb, e);
                Response::Error(e.to_string())
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response> {
        match request {
            Request::Capabilities => Ok(Response::Ok(self.capabilities())),
            Request::Open => {
                if self.session.is_some() {
                    return Err(Error::BackendProtocol("session already open".to_string()));
                }
                let session = Session::create()?;
                info!("Opened session {} in {}", session.id, session.scratch());
                let response = Response::Ok(vec![session.id.clone(), session.scratch()]);
                self.session = Some(session);
                Ok(response)
            }
            Request::Run(run) => {
                let scratch = self.session()?.scratch.path().to_path_buf();
                execute(run, &scratch).await.map(Response::Exit)
            }
            Request::CopyDown { host, testbed } => {
                let dst = self.resolve(&testbed)?;
                copy(PathBuf::from(host), dst).await?;
                Ok(Response::ok())
            }
            Request::CopyUp { testbed, host } => {
                let src = self.resolve(&testbed)?;
                copy(src, PathBuf::from(host)).await?;
                Ok(Response::ok())
            }
            Request::Revert => {
                let old = self
                    .session
                    .take()
                    .ok_or_else(|| Error::BackendProtocol("no open session".to_string()))?;
                let id = old.id.clone();
                old.destroy();
                let mut fresh = Session::create()?;
                fresh.id = id;
                let scratch = fresh.scratch();
                info!("Reverted session {} to {}", fresh.id, scratch);
                self.session = Some(fresh);
                Ok(Response::Ok(vec![scratch]))
            }
            Request::Close => {
                self.shutdown();
                Ok(Response::ok())
            }
        }
    }

    /// Remove the session's scratch directory, if any
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            info!("Closing session {}", session.id);
            session.destroy();
        }
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::BackendProtocol("no open session".to_string()))
    }

    /// Testbed paths are absolute or relative to the scratch directory
    fn resolve(&self, testbed: &str) -> Result<PathBuf> {
        let scratch = self.session()?.scratch.path();
        Ok(scratch.join(testbed))
    }
}

impl Drop for NullBackend {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn copy(src: PathBuf, dst: PathBuf) -> Result<()> {
    debug!("Copying {} to {}", src.display(), dst.display());
    tokio::task::spawn_blocking(move || copy_path(&src, &dst))
        .await
        .map_err(|e| Error::Internal(format!("copy task failed: {}", e)))?
        .map_err(Error::from)
}

/// Run a command to completion and return its exit code.
async fn execute(run: RunRequest, scratch: &Path) -> Result<i32> {
    let (program, args) = run
        .argv
        .split_first()
        .ok_or_else(|| Error::BackendProtocol("`run` without a program".to_string()))?;
    let cwd = run
        .cwd
        .as_deref()
        .map(|c| scratch.join(c))
        .unwrap_or_else(|| scratch.to_path_buf());

    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(&cwd)
        .envs(run.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(match &run.stdin {
            Some(path) => Stdio::from(std::fs::File::open(scratch.join(path))?),
            None => Stdio::null(),
        })
        .stdout(output_stdio(run.stdout.as_deref(), scratch)?)
        .stderr(output_stdio(run.stderr.as_deref(), scratch)?)
        .kill_on_drop(true);

    debug!("Running {:?} in {}", run.argv, cwd.display());
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            eprintln!("{}: {}", program, e);
            return Ok(EXIT_NOT_RUNNABLE);
        }
    };

    let status = child.wait().await?;
    let code = status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(EXIT_NOT_RUNNABLE);
    debug!("{} exited with {}", program, code);
    Ok(code)
}

/// A named file on the testbed, or the auxiliary stream when absent
fn output_stdio(path: Option<&str>, scratch: &Path) -> Result<Stdio> {
    match path {
        Some(path) => Ok(Stdio::from(std::fs::File::create(scratch.join(path))?)),
        None => Ok(Stdio::from(std::io::stderr().as_fd().try_clone_to_owned()?)),
    }
}

/// Serve requests from `input` until `close` or end of input.
pub async fn serve<R, W>(input: R, mut output: W) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut backend = NullBackend::new();
    let mut lines = FramedRead::new(input, LinesCodec::new());
    write_line(&mut output, BANNER).await?;

    while let Some(line) = lines.next().await {
        let line = line.map_err(|e| Error::BackendProtocol(format!("reading request: {}", e)))?;
        debug!("<- {}", line);

        let (response, done) = match Request::parse(&line) {
            Ok(request) => {
                let done = matches!(request, Request::Close);
                (backend.handle(request).await, done)
            }
            Err(e) => (Response::Error(e.to_string()), false),
        };

        let encoded = response.encode();
        debug!("-> {}", encoded);
        write_line(&mut output, &encoded).await?;
        if done {
            return Ok(());
        }
    }

    debug!("End of input, shutting down");
    backend.shutdown();
    Ok(())
}

async fn write_line<W: AsyncWrite + Unpin>(output: &mut W, line: &str) -> Result<()> {
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await?;
    Ok(())
}
