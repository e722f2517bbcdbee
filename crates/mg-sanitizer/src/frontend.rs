//! Unprivileged relay from the sanitize queue to the privileged helper.
//!
//! The helper is started lazily, on the first request, so a clean run never
//! spawns it. Requests are sent one at a time; each waits for its final
//! result before the next goes out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mg_agent::{AgentConfig, PipelineError, SanitizeReport, SanitizeSink};
use mg_protocol::SanitizeRequest;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::client::{ClientConfig, ClientError, RpcClient};
use crate::launcher::{LaunchError, ServerLauncher, ServerProcess};

#[derive(Debug, Clone)]
pub struct FrontEndConfig {
    pub endpoint: String,
    pub dry_run: bool,
    pub client: ClientConfig,
    /// How long the helper gets to exit after `quit` before it is killed.
    pub server_exit_grace: Duration,
}

impl FrontEndConfig {
    pub fn from_agent(agent: &AgentConfig, endpoint: impl Into<String>, dry_run: bool) -> Self {
        Self {
            endpoint: endpoint.into(),
            dry_run,
            client: ClientConfig {
                connect_attempts: agent.connect_attempts,
                connect_timeout: agent.connect_timeout,
                control_timeout: agent.control_timeout,
                sanitize_timeout: agent.sanitize_timeout,
                ..ClientConfig::default()
            },
            server_exit_grace: agent.server_exit_grace,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum SessionError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error(transparent)]
    Client(#[from] ClientError),
}

struct HelperSession {
    client: RpcClient,
    process: Box<dyn ServerProcess>,
}

pub struct SanitizerFrontEnd {
    config: FrontEndConfig,
    launcher: Arc<dyn ServerLauncher>,
}

impl SanitizerFrontEnd {
    pub fn new(config: FrontEndConfig, launcher: Arc<dyn ServerLauncher>) -> Self {
        Self { config, launcher }
    }

    async fn open_session(&self) -> Result<HelperSession, SessionError> {
        let mut process = self.launcher.spawn(&self.config.endpoint)?;
        let client_id = Uuid::new_v4().to_string();
        let connected =
            RpcClient::connect(&self.config.endpoint, client_id, self.config.client.clone()).await;
        let client = match connected {
            Ok(client) => client,
            Err(e) => {
                let _ = process.kill().await;
                return Err(e.into());
            }
        };
        if let Err(e) = client.ping().await {
            client.close().await;
            let _ = process.kill().await;
            return Err(e.into());
        }
        info!(client = client.client_id(), "helper is alive");
        Ok(HelperSession { client, process })
    }

    async fn relay(&self, client: &RpcClient, req: &SanitizeRequest, report: &mut SanitizeReport) {
        match client.sanitize(req).await {
            Ok(resp) if resp.is_success() => {
                info!("{}", resp.additional_msg);
                report.sanitized += 1;
            }
            Ok(resp) => {
                warn!(
                    code = resp.result_code,
                    "failed to sanitize {}: {}", req.path, resp.additional_msg
                );
                report.failed += 1;
            }
            Err(e) => {
                error!("sanitize request for {} failed: {e}", req.path);
                report.failed += 1;
            }
        }
    }

    async fn finish(&self, session: HelperSession) {
        let HelperSession { client, mut process } = session;
        match client.quit().await {
            Ok(resp) => info!(code = resp.result_code, "helper acknowledged quit"),
            Err(e) => warn!("quit was not acknowledged: {e}"),
        }
        client.close().await;

        match tokio::time::timeout(self.config.server_exit_grace, process.wait()).await {
            Ok(Ok(code)) => info!(?code, "helper exited"),
            Ok(Err(e)) => warn!("waiting for helper failed: {e}"),
            Err(_) => {
                warn!(
                    pid = process.id(),
                    "helper still running after {:?}, killing it", self.config.server_exit_grace
                );
                if let Err(e) = process.kill().await {
                    error!("failed to kill helper: {e}");
                }
            }
        }
    }
}

#[async_trait]
impl SanitizeSink for SanitizerFrontEnd {
    async fn run(
        self: Box<Self>,
        mut requests: mpsc::Receiver<SanitizeRequest>,
    ) -> Result<SanitizeReport, PipelineError> {
        let mut report = SanitizeReport::default();

        if self.config.dry_run {
            while let Some(req) = requests.recv().await {
                info!(
                    detection = %req.detection_name,
                    module = %req.destination_module,
                    action = %req.action,
                    "dry run, would sanitize {}", req.path
                );
            }
            return Ok(report);
        }

        let Some(first) = requests.recv().await else {
            info!("nothing to sanitize, helper not started");
            return Ok(report);
        };

        let session = match self.open_session().await {
            Ok(session) => session,
            Err(e) => {
                error!("cannot reach the sanitize helper: {e}");
                // Keep consuming so upstream stages can finish.
                let mut dropped = 1;
                while requests.recv().await.is_some() {
                    dropped += 1;
                }
                warn!("{dropped} documents left unsanitized");
                return Err(PipelineError::Sanitizer(e.to_string()));
            }
        };

        let mut next = Some(first);
        while let Some(req) = next.take() {
            self.relay(&session.client, &req, &mut report).await;
            next = requests.recv().await;
        }

        self.finish(session).await;
        Ok(report)
    }
}
