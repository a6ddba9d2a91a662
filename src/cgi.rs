//! CGI script execution.
//!
//! The script runs as a child process with the request body piped to its
//! stdin and its stdout captured. The child is confined to a 200 MiB address
//! space and the parent polls for its exit under a 5 second wall clock;
//! overruns are killed and reported as a gateway timeout.

use crate::request::{find, Request};
use crate::status;
use camino::Utf8Path;
use convert_case::{Case, Casing};
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// Wall-clock budget for one script run.
const TIMEOUT: Duration = Duration::from_secs(5);

/// Address-space ceiling applied to the child.
const MEMORY_LIMIT: libc::rlim_t = 200 * 1024 * 1024;

/// Interval between exit polls while the clock runs.
const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// What a successful script produced: its header lines and the body that
/// followed the blank-line terminator.
#[derive(Debug, PartialEq, Eq)]
pub struct CgiOutput {
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

/// Runs `script` for `request`. An `Err` carries the status code the error
/// pipeline should answer with.
pub fn execute(request: &Request, script: &Utf8Path) -> Result<CgiOutput, u16> {
    let dir = script.parent().unwrap_or(Utf8Path::new("."));

    let mut command = Command::new(script.as_std_path());
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .current_dir(dir.as_std_path())
        .env_clear()
        .envs(build_env(request, script));
    if let Some(path) = std::env::var_os("PATH") {
        command.env("PATH", path);
    }
    unsafe {
        command.pre_exec(|| {
            let limit = libc::rlimit {
                rlim_cur: MEMORY_LIMIT,
                rlim_max: MEMORY_LIMIT,
            };
            libc::setrlimit(libc::RLIMIT_AS, &limit);
            Ok(())
        });
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!(script = script.as_str(), error:err = e; "failed to spawn cgi script");
            return Err(status::INTERNAL_SERVER_ERROR);
        }
    };

    // Feed the body and close stdin so the script sees EOF. A script that
    // exits without reading gives a broken pipe, which is its business.
    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(&request.body);
    }

    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(exit)) => {
                if !exit.success() {
                    return Err(status::INTERNAL_SERVER_ERROR);
                }
                break;
            }
            Ok(None) => {
                if started.elapsed() > TIMEOUT {
                    let _ = child.kill();
                    let _ = child.wait();
                    log::warn!(script = script.as_str(); "cgi script timed out");
                    return Err(status::GATEWAY_TIMEOUT);
                }
                std::thread::sleep(POLL_INTERVAL);
            }
            Err(_) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(status::INTERNAL_SERVER_ERROR);
            }
        }
    }

    let mut raw = Vec::new();
    match child.stdout.take() {
        Some(mut stdout) => {
            if stdout.read_to_end(&mut raw).is_err() {
                return Err(status::INTERNAL_SERVER_ERROR);
            }
        }
        None => return Err(status::INTERNAL_SERVER_ERROR),
    }

    parse_output(&raw)
}

/// Splits the script output at the first blank line; everything before it is
/// `Name: value` lines, everything after is the body verbatim.
fn parse_output(raw: &[u8]) -> Result<CgiOutput, u16> {
    let Some(pos) = find(raw, b"\r\n\r\n") else {
        return Err(status::INTERNAL_SERVER_ERROR);
    };

    let head = String::from_utf8_lossy(&raw[..pos]);
    let body = raw[pos + 4..].to_vec();

    let mut headers = Vec::new();
    for line in head.lines() {
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }

    Ok(CgiOutput { headers, body })
}

/// Builds the environment the script runs with: the standard CGI
/// meta-variables plus one `HTTP_*` entry per request header. Headers with
/// several values are joined with `", "`.
fn build_env(request: &Request, script: &Utf8Path) -> Vec<(String, String)> {
    let query = request
        .uri
        .split_once('?')
        .map(|(_, q)| q)
        .unwrap_or("")
        .to_string();

    let mut env = vec![
        ("REQUEST_METHOD".to_string(), request.method.as_str().to_string()),
        ("SERVER_PROTOCOL".to_string(), request.version.clone()),
        ("CONTENT_LENGTH".to_string(), request.body.len().to_string()),
        (
            "CONTENT_TYPE".to_string(),
            request.header("content-type").unwrap_or("").to_string(),
        ),
        ("QUERY_STRING".to_string(), query),
        ("SCRIPT_FILENAME".to_string(), script.to_string()),
    ];

    for (name, values) in &request.headers {
        let key = format!("HTTP_{}", name.to_case(Case::UpperSnake));
        env.push((key, values.join(", ")));
    }

    env
}
