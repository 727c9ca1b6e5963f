//! cc-proxy adapter.
//!
//! Spawns the proxy binary, connects to its listen socket with
//! bounded retries, and speaks newline-delimited JSON frames for
//! registration and agent command forwarding.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

use vpod_shared::config::ProxyConfig;
use vpod_shared::{Error, Result};
use vpod_agent::{AgentCmd, AgentResponse, Proxy, ProxyStartParams, RegisterResult};

const CONNECT_RETRY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RETRY_LOG_PERIOD: Duration = Duration::from_secs(1);

pub struct CcProxy {
    path: PathBuf,
    debug: bool,
    pid: u32,
    url: String,
    channel: Option<BufReader<UnixStream>>,
}

impl CcProxy {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            path: config.path.clone(),
            debug: config.debug,
            pid: 0,
            url: String::new(),
            channel: None,
        }
    }

    fn socket_path(url: &str) -> &str {
        url.strip_prefix("unix://").unwrap_or(url)
    }

    /// Connect to the proxy socket, retrying while it comes up. Logs
    /// at most once per second while waiting.
    async fn connect_stream(url: &str) -> Result<UnixStream> {
        let path = Self::socket_path(url);
        let deadline = tokio::time::Instant::now() + CONNECT_TIMEOUT;
        let mut last_log: Option<tokio::time::Instant> = None;

        loop {
            match UnixStream::connect(path).await {
                Ok(stream) => return Ok(stream),
                Err(e) => {
                    let now = tokio::time::Instant::now();
                    if now >= deadline {
                        return Err(Error::ProxyFailure(format!(
                            "connect {url}: {e}"
                        )));
                    }
                    if last_log.is_none_or(|t| now - t >= RETRY_LOG_PERIOD) {
                        debug!(url = %url, error = %e, "Proxy not ready, retrying");
                        last_log = Some(now);
                    }
                    tokio::time::sleep(CONNECT_RETRY).await;
                }
            }
        }
    }

    async fn round_trip(&mut self, frame: serde_json::Value) -> Result<serde_json::Value> {
        let channel = self
            .channel
            .as_mut()
            .ok_or_else(|| Error::ProxyFailure("not connected".into()))?;

        let mut line = serde_json::to_vec(&frame)?;
        line.push(b'\n');
        channel
            .write_all(&line)
            .await
            .map_err(|e| Error::ProxyFailure(format!("send: {e}")))?;
        channel
            .flush()
            .await
            .map_err(|e| Error::ProxyFailure(format!("send: {e}")))?;

        let mut response = String::new();
        let n = channel
            .read_line(&mut response)
            .await
            .map_err(|e| Error::ProxyFailure(format!("recv: {e}")))?;
        if n == 0 {
            return Err(Error::ProxyFailure("channel closed".into()));
        }
        Ok(serde_json::from_str(&response)?)
    }
}

#[async_trait]
impl Proxy for CcProxy {
    async fn start(&mut self, params: &ProxyStartParams) -> Result<(u32, String)> {
        if self.path.as_os_str().is_empty() {
            return Err(Error::InvalidConfig("proxy path missing".into()));
        }

        let socket = params.run_dir.join("proxy.sock");
        let url = format!("unix://{}", socket.display());

        let mut cmd = Command::new(&self.path);
        cmd.arg("-listen-socket")
            .arg(&url)
            .arg("-mux-socket")
            .arg(&params.agent_url);
        if params.debug || self.debug {
            cmd.arg("-log").arg("debug");
            cmd.arg("-agent-logs-socket").arg(&params.console_path);
        }
        cmd.stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        info!(pod_id = %params.pod_id, cmd = ?cmd.as_std(), "Spawning proxy");
        let child = cmd
            .spawn()
            .map_err(|e| Error::ProxyFailure(format!("spawn: {e}")))?;
        let pid = child
            .id()
            .ok_or_else(|| Error::ProxyFailure("no pid for proxy".into()))?;

        // The proxy must outlive this handle; liveness is tracked by
        // pid from here on.
        drop(child);

        self.pid = pid;
        self.url = url.clone();
        info!(pod_id = %params.pod_id, pid, url = %url, "Proxy started");
        Ok((pid, url))
    }

    async fn register(&mut self, pod_id: &str, num_tokens: usize) -> Result<RegisterResult> {
        if self.channel.is_none() {
            let stream = Self::connect_stream(&self.url).await?;
            self.channel = Some(BufReader::new(stream));
        }

        let resp = self
            .round_trip(json!({
                "cmd": "register",
                "data": { "pod": pod_id, "containers": num_tokens },
            }))
            .await?;

        let tokens: Vec<String> = resp["tokens"]
            .as_array()
            .map(|a| {
                a.iter()
                    .filter_map(|t| t.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        if tokens.len() != num_tokens {
            return Err(Error::ProxyFailure(format!(
                "registered {} tokens, wanted {num_tokens}",
                tokens.len()
            )));
        }

        debug!(pod_id = %pod_id, tokens = tokens.len(), "Pod registered with proxy");
        Ok(RegisterResult {
            url: self.url.clone(),
            tokens,
        })
    }

    async fn connect(
        &mut self,
        pod_id: &str,
        url: &str,
        create_token: bool,
    ) -> Result<Option<String>> {
        if self.channel.is_none() {
            self.url = url.to_string();
            let stream = Self::connect_stream(url).await?;
            self.channel = Some(BufReader::new(stream));
        }

        let resp = self
            .round_trip(json!({
                "cmd": "attach",
                "data": { "pod": pod_id, "new_token": create_token },
            }))
            .await?;

        if create_token {
            let token = resp["token"].as_str().ok_or_else(|| {
                Error::ProxyFailure("attach returned no token".into())
            })?;
            Ok(Some(token.to_string()))
        } else {
            Ok(None)
        }
    }

    async fn unregister(&mut self, proxy_pid: u32) -> Result<()> {
        if self.channel.is_some() {
            // Best effort; the SIGKILL below is the guarantee.
            if let Err(e) = self.round_trip(json!({ "cmd": "unregister" })).await {
                warn!(error = %e, "Proxy unregister frame failed");
            }
            self.channel = None;
        }

        // Prefer the pid persisted in pod state; a re-fetched pod
        // never spawned the proxy itself.
        let pid = if proxy_pid != 0 { proxy_pid } else { self.pid };
        if pid != 0 {
            match nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid as i32),
                nix::sys::signal::Signal::SIGKILL,
            ) {
                Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
                Err(e) => {
                    return Err(Error::ProxyFailure(format!("kill proxy {pid}: {e}")));
                }
            }
            info!(pid, "Proxy terminated");
            self.pid = 0;
        }
        Ok(())
    }

    async fn send_cmd(&mut self, cmd: AgentCmd) -> Result<AgentResponse> {
        let resp = self
            .round_trip(json!({ "cmd": "hyper", "data": cmd }))
            .await?;
        Ok(serde_json::from_value(resp)?)
    }
}
