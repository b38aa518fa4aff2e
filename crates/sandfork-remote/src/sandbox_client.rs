//! Sandbox REST client
//!
//! Talks to the sandbox service:
//!
//! ```text
//! POST   /sandboxes                          create
//! DELETE /sandboxes/{id}                     kill
//! GET    /sandboxes/{id}/files/read?path=    read
//! POST   /sandboxes/{id}/files/write         write
//! POST   /sandboxes/{id}/commands/run        exec
//! ```
//!
//! Glob and grep have no endpoint of their own; they run `find` and `grep`
//! inside the sandbox and filter the output here.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use sandfork_core::config::SandboxEndpointConfig;
use sandfork_core::sandbox::{
    ExecOutput, GlobFilter, GrepMatch, GrepScope, SandboxError, SandboxProvisioner,
    SandboxResult, SandboxService,
};

use crate::error::{RemoteError, Result};

/// Cap on lines read back from `find` / `grep`.
const SEARCH_LINE_LIMIT: usize = 5000;

/// Sandbox service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxClientConfig {
    /// Service URL, e.g. `http://localhost:8000`
    pub base_url: String,
    /// Working directory for commands
    pub cwd: String,
    /// Lifetime requested for created sandboxes
    pub sandbox_timeout_secs: u64,
    /// Timeout for file and lifecycle requests; added to command timeouts
    pub request_timeout_secs: u64,
}

impl Default for SandboxClientConfig {
    fn default() -> Self {
        Self::from_endpoint(&SandboxEndpointConfig::default())
    }
}

impl SandboxClientConfig {
    /// Defaults with `SANDFORK_SANDBOX_URL` applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("SANDFORK_SANDBOX_URL") {
            config.base_url = url;
        }
        config
    }

    pub fn from_endpoint(endpoint: &SandboxEndpointConfig) -> Self {
        Self {
            base_url: endpoint.base_url.clone(),
            cwd: endpoint.cwd.clone(),
            sandbox_timeout_secs: endpoint.sandbox_timeout_secs,
            request_timeout_secs: endpoint.request_timeout_secs,
        }
    }
}

#[derive(Serialize)]
struct CreateRequest<'a> {
    template: &'a str,
    timeout: u64,
    metadata: HashMap<&'a str, &'a str>,
}

#[derive(Deserialize)]
struct CreateResponse {
    sandbox_id: String,
}

#[derive(Deserialize)]
struct ReadResponse {
    content: String,
}

#[derive(Serialize)]
struct WriteRequest<'a> {
    path: &'a str,
    data: &'a str,
}

#[derive(Serialize)]
struct RunRequest<'a> {
    cmd: &'a str,
    cwd: &'a str,
    timeout: u64,
}

#[derive(Deserialize)]
struct RunResponse {
    stdout: String,
    stderr: String,
    exit_code: i32,
    #[serde(default)]
    error: Option<String>,
}

/// HTTP implementation of [`SandboxService`] and [`SandboxProvisioner`].
pub struct HttpSandboxClient {
    config: SandboxClientConfig,
    http: reqwest::Client,
}

impl HttpSandboxClient {
    pub fn new(config: SandboxClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(concat!("sandfork/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Config(e.to_string()))?;
        Ok(Self { config, http })
    }

    pub fn config(&self) -> &SandboxClientConfig {
        &self.config
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs)
    }

    async fn run(&self, sandbox_id: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let body = RunRequest {
            cmd: command,
            cwd: &self.config.cwd,
            timeout: timeout_secs(timeout),
        };
        debug!(sandbox = %sandbox_id, command = %command, "running command");
        let response = self
            .http
            .post(self.url(&format!("/sandboxes/{sandbox_id}/commands/run")))
            .timeout(timeout + self.request_timeout())
            .json(&body)
            .send()
            .await?;
        let run: RunResponse = decode(response).await?;
        let mut stderr = run.stderr;
        if let Some(error) = run.error.filter(|e| !e.is_empty()) {
            if !stderr.is_empty() {
                stderr.push('\n');
            }
            stderr.push_str(&error);
        }
        Ok(ExecOutput {
            stdout: run.stdout,
            stderr,
            exit_code: run.exit_code,
        })
    }
}

/// Turn a response into `T`, or a `RemoteError::Status` carrying the
/// server's `detail` message.
async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }
    let body = response.text().await.unwrap_or_default();
    Err(RemoteError::Status {
        status: status.as_u16(),
        message: error_detail(&body),
    })
}

/// FastAPI-style `{"detail": "..."}` bodies, falling back to the raw text.
fn error_detail(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(str::to_string))
        .unwrap_or_else(|| body.trim().to_string())
}

/// The service accepts 1 to 3600 seconds.
fn timeout_secs(timeout: Duration) -> u64 {
    timeout.as_secs_f64().ceil().clamp(1.0, 3600.0) as u64
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Directory part of an absolute glob before the first wildcard.
fn literal_dir(pattern: &str) -> &str {
    let wildcard = pattern.find(['*', '?', '[', '{']).unwrap_or(pattern.len());
    match pattern[..wildcard].rfind('/') {
        Some(0) | None => "/",
        Some(i) => &pattern[..i],
    }
}

fn find_command(base: &str) -> String {
    format!(
        "find {} -type f -not -path '*/.git/*' 2>/dev/null | head -n {SEARCH_LINE_LIMIT}",
        shell_quote(base)
    )
}

fn grep_command(pattern: &str, path: &str) -> String {
    format!(
        "grep -rnIE --exclude-dir=.git -e {} -- {}",
        shell_quote(pattern),
        shell_quote(path)
    )
}

/// Parse `path:line:text` lines from `grep -rn`.
fn parse_grep_line(line: &str) -> Option<GrepMatch> {
    let (path, rest) = line.split_once(':')?;
    let (number, text) = rest.split_once(':')?;
    Some(GrepMatch {
        path: path.to_string(),
        line: number.parse().ok()?,
        text: text.to_string(),
    })
}

#[async_trait]
impl SandboxService for HttpSandboxClient {
    async fn read(&self, sandbox_id: &str, path: &str) -> SandboxResult<Vec<u8>> {
        let response = self
            .http
            .get(self.url(&format!("/sandboxes/{sandbox_id}/files/read")))
            .query(&[("path", path)])
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(RemoteError::from)?;
        let read: ReadResponse = decode(response).await?;
        Ok(read.content.into_bytes())
    }

    async fn write(&self, sandbox_id: &str, path: &str, data: &[u8]) -> SandboxResult<()> {
        let data = String::from_utf8_lossy(data);
        let response = self
            .http
            .post(self.url(&format!("/sandboxes/{sandbox_id}/files/write")))
            .timeout(self.request_timeout())
            .json(&WriteRequest { path, data: &data })
            .send()
            .await
            .map_err(RemoteError::from)?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }

    async fn exec(
        &self,
        sandbox_id: &str,
        command: &str,
        timeout: Duration,
    ) -> SandboxResult<ExecOutput> {
        match self.run(sandbox_id, command, timeout).await {
            Ok(out) => Ok(out),
            Err(RemoteError::Status { status: 408, .. }) => Err(SandboxError::Operation(format!(
                "command timed out after {} s",
                timeout_secs(timeout)
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn glob(&self, sandbox_id: &str, pattern: &str, base: &str) -> SandboxResult<Vec<String>> {
        let filter = GlobFilter::new(pattern, base)?;
        let search_root = if pattern.starts_with('/') {
            literal_dir(pattern)
        } else {
            base
        };
        let out = self
            .run(sandbox_id, &find_command(search_root), self.request_timeout())
            .await?;
        let mut paths: Vec<String> = out
            .stdout
            .lines()
            .filter(|p| filter.matches(p))
            .map(str::to_string)
            .collect();
        paths.sort();
        Ok(paths)
    }

    async fn grep(
        &self,
        sandbox_id: &str,
        pattern: &str,
        scope: &GrepScope,
    ) -> SandboxResult<Vec<GrepMatch>> {
        let filter = GlobFilter::new(&scope.glob, &scope.path)?;
        let out = self
            .run(sandbox_id, &grep_command(pattern, &scope.path), self.request_timeout())
            .await?;
        // grep exits 1 for "no match" and 2 for errors.
        if out.exit_code > 1 {
            return Err(SandboxError::Operation(format!(
                "grep failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(out
            .stdout
            .lines()
            .take(SEARCH_LINE_LIMIT)
            .filter_map(parse_grep_line)
            .filter(|m| m.path == scope.path || filter.matches(&m.path))
            .take(scope.max_matches)
            .collect())
    }
}

#[async_trait]
impl SandboxProvisioner for HttpSandboxClient {
    async fn create(&self, template: &str) -> SandboxResult<String> {
        let body = CreateRequest {
            template,
            timeout: self.config.sandbox_timeout_secs,
            metadata: HashMap::from([("created_by", "sandfork")]),
        };
        let response = self
            .http
            .post(self.url("/sandboxes"))
            .timeout(self.request_timeout())
            .json(&body)
            .send()
            .await
            .map_err(RemoteError::from)?;
        let created: CreateResponse = decode(response).await?;
        debug!(sandbox = %created.sandbox_id, template = %template, "sandbox created");
        Ok(created.sandbox_id)
    }

    async fn kill(&self, sandbox_id: &str) -> SandboxResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/sandboxes/{sandbox_id}")))
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(RemoteError::from)?;
        let _: serde_json::Value = decode(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joins_without_double_slash() {
        let client = HttpSandboxClient::new(SandboxClientConfig {
            base_url: "http://sandbox:8000/".to_string(),
            ..SandboxClientConfig::default()
        })
        .unwrap();
        assert_eq!(
            client.url("/sandboxes/abc/files/read"),
            "http://sandbox:8000/sandboxes/abc/files/read"
        );
    }

    #[test]
    fn test_timeout_is_clamped_to_service_range() {
        assert_eq!(timeout_secs(Duration::from_millis(10)), 1);
        assert_eq!(timeout_secs(Duration::from_millis(1500)), 2);
        assert_eq!(timeout_secs(Duration::from_secs(120)), 120);
        assert_eq!(timeout_secs(Duration::from_secs(10_000)), 3600);
    }

    #[test]
    fn test_parse_grep_line() {
        let m = parse_grep_line("/home/user/src/a.rs:12:let x = a::b;").unwrap();
        assert_eq!(m.path, "/home/user/src/a.rs");
        assert_eq!(m.line, 12);
        assert_eq!(m.text, "let x = a::b;");
        assert!(parse_grep_line("Binary file matches").is_none());
    }

    #[test]
    fn test_commands_quote_arguments() {
        assert_eq!(
            grep_command("fn main", "/home/user/src"),
            "grep -rnIE --exclude-dir=.git -e 'fn main' -- '/home/user/src'"
        );
        assert!(find_command("/home/user/it's").contains(r"'/home/user/it'\''s'"));
    }

    #[test]
    fn test_literal_dir_of_absolute_glob() {
        assert_eq!(literal_dir("/home/user/src/**/*.rs"), "/home/user/src");
        assert_eq!(literal_dir("/home/user/Cargo.toml"), "/home/user");
        assert_eq!(literal_dir("/*.txt"), "/");
    }

    #[test]
    fn test_error_detail_prefers_json_detail() {
        assert_eq!(error_detail(r#"{"detail": "Sandbox not found"}"#), "Sandbox not found");
        assert_eq!(error_detail(" plain failure \n"), "plain failure");
    }

    #[test]
    fn test_create_request_shape() {
        let body = CreateRequest {
            template: "python",
            timeout: 600,
            metadata: HashMap::from([("created_by", "sandfork")]),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["template"], "python");
        assert_eq!(json["timeout"], 600);
        assert_eq!(json["metadata"]["created_by"], "sandfork");
    }
}
