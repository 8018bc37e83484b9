//! Testbed control protocol
//!
//! Line-oriented request/response grammar spoken between the testbed session
//! client and a backend subprocess. Requests travel on the backend's stdin,
//! responses on its stdout; the backend's stderr is the auxiliary stream.
//!
//! ```text
//! <- ok                                     (banner)
//! -> capabilities                           <- ok revert root-on-testbed
//! -> open                                   <- ok <session-id> <scratch>
//! -> run <argv> <cwd> <in> <out> <err> K=V  <- exit <code>
//! -> copydown <host> <testbed>              <- ok
//! -> copyup <testbed> <host>                <- ok
//! -> revert                                 <- ok <scratch>
//! -> close                                  <- ok
//! ```
//!
//! Every argument token is percent-encoded. Any request may be answered with
//! `error <message>` instead.

use crate::{Error, Result};

/// Placeholder token for an absent optional argument
pub const ABSENT: &str = "-";

/// Banner the backend writes once it is ready for requests
pub const BANNER: &str = "ok";

/// Percent-encode a single protocol token
pub fn quote(value: &str) -> String {
    urlencoding::encode(value).into_owned()
}

/// Decode a percent-encoded protocol token
pub fn unquote(token: &str) -> Result<String> {
    urlencoding::decode(token)
        .map(|s| s.into_owned())
        .map_err(|e| Error::BackendProtocol(format!("Invalid token `{}`: {}", token, e)))
}

fn quote_optional(value: Option<&str>) -> String {
    match value {
        Some(v) => quote(v),
        None => ABSENT.to_string(),
    }
}

fn unquote_optional(token: &str) -> Result<Option<String>> {
    if token == ABSENT {
        Ok(None)
    } else {
        unquote(token).map(Some)
    }
}

/// A `run` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub argv: Vec<String>,
    /// Working directory on the testbed; scratch dir when absent
    pub cwd: Option<String>,
    pub stdin: Option<String>,
    /// File on the testbed receiving stdout; auxiliary stream when absent
    pub stdout: Option<String>,
    /// File on the testbed receiving stderr; auxiliary stream when absent
    pub stderr: Option<String>,
    pub env: Vec<(String, String)>,
}

impl RunRequest {
    pub fn new(argv: Vec<String>) -> Self {
        Self {
            argv,
            cwd: None,
            stdin: None,
            stdout: None,
            stderr: None,
            env: Vec::new(),
        }
    }
}

/// Requests the client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Capabilities,
    Open,
    Run(RunRequest),
    CopyDown { host: String, testbed: String },
    CopyUp { testbed: String, host: String },
    Revert,
    Close,
}

/// Shape of the response a request must receive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// `ok` followed by exactly this many results, or any number when `None`
    Ok(Option<usize>),
    /// `exit <code>`
    Exit,
}

impl Request {
    pub fn verb(&self) -> &'static str {
        match self {
            Request::Capabilities => "capabilities",
            Request::Open => "open",
            Request::Run(_) => "run",
            Request::CopyDown { .. } => "copydown",
            Request::CopyUp { .. } => "copyup",
            Request::Revert => "revert",
            Request::Close => "close",
        }
    }

    pub fn expect(&self) -> Expect {
        match self {
            Request::Capabilities => Expect::Ok(None),
            Request::Open => Expect::Ok(Some(2)),
            Request::Revert => Expect::Ok(Some(1)),
            Request::Run(_) => Expect::Exit,
            Request::CopyDown { .. } | Request::CopyUp { .. } | Request::Close => {
                Expect::Ok(Some(0))
            }
        }
    }

    /// Encode as a single protocol line (without the trailing newline)
    pub fn encode(&self) -> Result<String> {
        let mut tokens = vec![self.verb().to_string()];
        match self {
            Request::Capabilities | Request::Open | Request::Revert | Request::Close => {}
            Request::Run(run) => {
                match run.argv.first() {
                    Some(program) if !program.is_empty() => {}
                    _ => {
                        return Err(Error::Internal(
                            "run request needs a non-empty program".to_string(),
                        ))
                    }
                }
                let argv: Vec<String> = run.argv.iter().map(|a| quote(a)).collect();
                tokens.push(argv.join(","));
                tokens.push(quote_optional(run.cwd.as_deref()));
                tokens.push(quote_optional(run.stdin.as_deref()));
                tokens.push(quote_optional(run.stdout.as_deref()));
                tokens.push(quote_optional(run.stderr.as_deref()));
                for (key, value) in &run.env {
                    if key.is_empty() || key.contains('=') {
                        return Err(Error::Internal(format!(
                            "invalid environment variable name `{}`",
                            key
                        )));
                    }
                    tokens.push(quote(&format!("{}={}", key, value)));
                }
            }
            Request::CopyDown { host, testbed } => {
                tokens.push(quote(host));
                tokens.push(quote(testbed));
            }
            Request::CopyUp { testbed, host } => {
                tokens.push(quote(testbed));
                tokens.push(quote(host));
            }
        }
        Ok(tokens.join(" "))
    }

    /// Parse a request line (backend side)
    pub fn parse(line: &str) -> Result<Self> {
        let tokens: Vec<&str> = line.trim_end_matches(['\r', '\n']).split(' ').collect();
        let (verb, args) = tokens
            .split_first()
            .ok_or_else(|| Error::BackendProtocol("empty request".to_string()))?;

        let arity = |n: usize| -> Result<()> {
            if args.len() == n {
                Ok(())
            } else {
                Err(Error::BackendProtocol(format!(
                    "`{}` takes {} arguments, got {}",
                    verb,
                    n,
                    args.len()
                )))
            }
        };

        match *verb {
            "capabilities" => arity(0).map(|_| Request::Capabilities),
            "open" => arity(0).map(|_| Request::Open),
            "revert" => arity(0).map(|_| Request::Revert),
            "close" => arity(0).map(|_| Request::Close),
            "copydown" => {
                arity(2)?;
                Ok(Request::CopyDown {
                    host: unquote(args[0])?,
                    testbed: unquote(args[1])?,
                })
            }
            "copyup" => {
                arity(2)?;
                Ok(Request::CopyUp {
                    testbed: unquote(args[0])?,
                    host: unquote(args[1])?,
                })
            }
            "run" => {
                if args.len() < 5 {
                    return Err(Error::BackendProtocol(format!(
                        "`run` takes at least 5 arguments, got {}",
                        args.len()
                    )));
                }
                let argv = args[0]
                    .split(',')
                    .map(unquote)
                    .collect::<Result<Vec<_>>>()?;
                if argv.first().map_or(true, |p| p.is_empty()) {
                    return Err(Error::BackendProtocol("`run` without a program".to_string()));
                }
                let mut env = Vec::new();
                for token in &args[5..] {
                    let pair = unquote(token)?;
                    let (key, value) = pair.split_once('=').ok_or_else(|| {
                        Error::BackendProtocol(format!("malformed environment entry `{}`", pair))
                    })?;
                    env.push((key.to_string(), value.to_string()));
                }
                Ok(Request::Run(RunRequest {
                    argv,
                    cwd: unquote_optional(args[1])?,
                    stdin: unquote_optional(args[2])?,
                    stdout: unquote_optional(args[3])?,
                    stderr: unquote_optional(args[4])?,
                    env,
                }))
            }
            other => Err(Error::BackendProtocol(format!("unknown request `{}`", other))),
        }
    }
}

/// Responses a backend may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok(Vec<String>),
    Exit(i32),
    Error(String),
}

impl Response {
    pub fn ok() -> Self {
        Response::Ok(Vec::new())
    }

    /// Encode as a single protocol line (without the trailing newline)
    pub fn encode(&self) -> String {
        match self {
            Response::Ok(results) if results.is_empty() => "ok".to_string(),
            Response::Ok(results) => {
                let quoted: Vec<String> = results.iter().map(|r| quote(r)).collect();
                format!("ok {}", quoted.join(" "))
            }
            Response::Exit(code) => format!("exit {}", code),
            Response::Error(message) => {
                let flat = message.replace(['\r', '\n'], " ");
                format!("error {}", flat)
            }
        }
    }

    /// Parse a response line. The line must still carry its `\n` terminator.
    pub fn parse(line: &str) -> Result<Self> {
        let body = line
            .strip_suffix('\n')
            .ok_or_else(|| Error::BackendProtocol("unterminated line from the testbed".to_string()))?;
        let body = body.strip_suffix('\r').unwrap_or(body);
        if body.trim().is_empty() {
            return Err(Error::BackendProtocol(
                "unexpected whitespace-only line from the testbed".to_string(),
            ));
        }

        let (keyword, rest) = match body.split_once(' ') {
            Some((k, r)) => (k, Some(r)),
            None => (body, None),
        };

        match keyword {
            "ok" => {
                let results = match rest {
                    Some(r) => r
                        .split(' ')
                        .filter(|t| !t.is_empty())
                        .map(unquote)
                        .collect::<Result<Vec<_>>>()?,
                    None => Vec::new(),
                };
                Ok(Response::Ok(results))
            }
            "exit" => {
                let code = rest
                    .map(str::trim)
                    .and_then(|c| c.parse::<i32>().ok())
                    .ok_or_else(|| {
                        Error::BackendProtocol(format!("malformed status line `{}`", body))
                    })?;
                Ok(Response::Exit(code))
            }
            "error" => Ok(Response::Error(rest.unwrap_or("").to_string())),
            _ => Err(Error::BackendProtocol(format!(
                "unexpected response `{}`",
                body
            ))),
        }
    }

    /// Check that this response is the one `request` must receive.
    ///
    /// Returns the `ok` results or the exit code; a backend `error` becomes
    /// [`Error::BackendFailure`], anything else [`Error::BackendProtocol`].
    pub fn check(self, request: &Request) -> Result<Reply> {
        match (request.expect(), self) {
            (_, Response::Error(message)) => Err(Error::BackendFailure {
                verb: request.verb().to_string(),
                message,
            }),
            (Expect::Ok(arity), Response::Ok(results)) => match arity {
                Some(n) if results.len() != n => Err(Error::BackendProtocol(format!(
                    "sent `{}`, got {} result parameters, expected {}",
                    request.verb(),
                    results.len(),
                    n
                ))),
                _ => Ok(Reply::Ok(results)),
            },
            (Expect::Exit, Response::Exit(code)) => Ok(Reply::Exit(code)),
            (_, other) => Err(Error::BackendProtocol(format!(
                "sent `{}`, got unexpected `{}`",
                request.verb(),
                other.encode()
            ))),
        }
    }
}

/// A validated response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Ok(Vec<String>),
    Exit(i32),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_request_encoding() {
        let mut run = RunRequest::new(vec![
            "sh".to_string(),
            "-ec".to_string(),
            "echo hello, world".to_string(),
        ]);
        run.cwd = Some("/tmp/scratch dir/build".to_string());
        run.env.push(("TZ".to_string(), "GMT+12".to_string()));

        let line = Request::Run(run.clone()).encode().unwrap();
        assert!(line.starts_with("run sh,-ec,echo%20hello%2C%20world "));
        assert!(!line.contains('\n'));
        assert_eq!(line.split(' ').count(), 7);

        assert_eq!(Request::parse(&line).unwrap(), Request::Run(run));
    }

    #[test]
    fn test_run_request_rejects_empty_program() {
        let run = RunRequest::new(vec![String::new()]);
        assert!(Request::Run(run).encode().is_err());
        assert!(Request::parse("run  - - - -").is_err());
    }

    #[test]
    fn test_response_parsing() {
        assert_eq!(Response::parse("ok\n").unwrap(), Response::ok());
        assert_eq!(
            Response::parse("ok abc %2Ftmp%2Fx\n").unwrap(),
            Response::Ok(vec!["abc".to_string(), "/tmp/x".to_string()])
        );
        assert_eq!(Response::parse("exit 3\n").unwrap(), Response::Exit(3));
        assert_eq!(
            Response::parse("error no such file\n").unwrap(),
            Response::Error("no such file".to_string())
        );
    }

    #[test]
    fn test_response_protocol_errors() {
        assert!(matches!(Response::parse("ok"), Err(Error::BackendProtocol(_))));
        assert!(matches!(Response::parse("  \n"), Err(Error::BackendProtocol(_))));
        assert!(matches!(Response::parse("exit zero\n"), Err(Error::BackendProtocol(_))));
        assert!(matches!(Response::parse("hello\n"), Err(Error::BackendProtocol(_))));
    }

    #[test]
    fn test_check_arity_and_kind() {
        let open = Request::Open;
        assert!(matches!(
            Response::Ok(vec!["id".to_string()]).check(&open),
            Err(Error::BackendProtocol(_))
        ));
        assert_eq!(
            Response::Ok(vec!["id".to_string(), "/s".to_string()])
                .check(&open)
                .unwrap(),
            Reply::Ok(vec!["id".to_string(), "/s".to_string()])
        );

        let run = Request::Run(RunRequest::new(vec!["true".to_string()]));
        assert!(matches!(
            Response::ok().check(&run),
            Err(Error::BackendProtocol(_))
        ));
        assert!(matches!(
            Response::Error("boom".to_string()).check(&run),
            Err(Error::BackendFailure { .. })
        ));
    }
}
