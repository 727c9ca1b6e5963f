//! Proxy that brokers nothing: tokens are minted in-process and
//! every agent command succeeds. Used for noop pods and tests.

use async_trait::async_trait;
use uuid::Uuid;

use vpod_shared::Result;
use vpod_agent::{AgentCmd, AgentResponse, Proxy, ProxyStartParams, RegisterResult};

#[derive(Debug, Default)]
pub struct NoopProxy {
    url: String,
    /// Commands seen, for tests that assert on agent traffic.
    pub sent: Vec<AgentCmd>,
}

impl NoopProxy {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Proxy for NoopProxy {
    async fn start(&mut self, params: &ProxyStartParams) -> Result<(u32, String)> {
        self.url = format!("noop://{}", params.pod_id);
        Ok((0, self.url.clone()))
    }

    async fn register(&mut self, _pod_id: &str, num_tokens: usize) -> Result<RegisterResult> {
        Ok(RegisterResult {
            url: self.url.clone(),
            tokens: (0..num_tokens)
                .map(|_| Uuid::new_v4().to_string())
                .collect(),
        })
    }

    async fn connect(
        &mut self,
        _pod_id: &str,
        url: &str,
        create_token: bool,
    ) -> Result<Option<String>> {
        if self.url.is_empty() {
            self.url = url.to_string();
        }
        Ok(create_token.then(|| Uuid::new_v4().to_string()))
    }

    async fn unregister(&mut self, _proxy_pid: u32) -> Result<()> {
        Ok(())
    }

    async fn send_cmd(&mut self, cmd: AgentCmd) -> Result<AgentResponse> {
        self.sent.push(cmd);
        Ok(AgentResponse::Ok)
    }
}
