//! Remote backend
//!
//! Forwards every runtime call as a JSON request to the control service of a
//! compute node. Worker-scoped calls live under `/media-nodes/{computeNodeId}`.

use super::{ContainerRuntime, RunSpec, RuntimeError, RuntimeResult};
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Reply of every control call that does not return data
#[derive(Debug, Deserialize)]
struct BasicResponse {
    success: bool,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct ImageAvailableResponse {
    available: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CommandRequest<'a> {
    command: &'a str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WaitRequest {
    seconds_of_wait: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest<'a> {
    image: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    seconds_of_wait: Option<u64>,
}

/// Runtime delegating to a remote control service
pub struct RemoteContainerRuntime {
    client: Client,
    base_url: String,
    compute_node_id: String,
}

impl RemoteContainerRuntime {
    pub fn new(base_url: &str, compute_node_id: &str) -> RuntimeResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| RuntimeError::Unavailable(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            compute_node_id: compute_node_id.to_string(),
        })
    }

    pub fn compute_node_id(&self) -> &str {
        &self.compute_node_id
    }

    fn node_url(&self, suffix: &str) -> String {
        format!(
            "{}/media-nodes/{}{}",
            self.base_url, self.compute_node_id, suffix
        )
    }

    fn service_url(&self, suffix: &str) -> String {
        format!("{}{}", self.base_url, suffix)
    }

    async fn send(&self, operation: &str, request: RequestBuilder) -> RuntimeResult<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| RuntimeError::Io(format!("{}: {}", operation, e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RuntimeError::Rejected {
                operation: operation.to_string(),
                message: format!("HTTP {} {}", status.as_u16(), body),
            });
        }

        Ok(response)
    }

    /// Send a call whose reply is a `BasicResponse`, failing on `success: false`
    async fn execute_and_check(&self, operation: &str, request: RequestBuilder) -> RuntimeResult<()> {
        let response: BasicResponse = self
            .send(operation, request)
            .await?
            .json()
            .await
            .map_err(|e| RuntimeError::Io(format!("{}: {}", operation, e)))?;

        if !response.success {
            return Err(RuntimeError::Rejected {
                operation: operation.to_string(),
                message: response.message,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for RemoteContainerRuntime {
    async fn run(&self, spec: RunSpec) -> RuntimeResult<String> {
        let request = self
            .client
            .request(Method::POST, self.node_url("/containers"))
            .json(&spec);

        let response = self.send("runContainer", request).await.map_err(|e| match e {
            RuntimeError::Rejected { message, .. } => RuntimeError::Launch(message),
            other => other,
        })?;

        let worker_id = response
            .text()
            .await
            .map_err(|e| RuntimeError::Io(e.to_string()))?
            .trim()
            .trim_matches('"')
            .to_string();

        if worker_id.is_empty() {
            return Err(RuntimeError::Launch(format!(
                "Control service returned no id for worker {}",
                spec.name
            )));
        }
        Ok(worker_id)
    }

    async fn exec_async(&self, worker_id: &str, command: &str) -> RuntimeResult<()> {
        let request = self
            .client
            .post(self.node_url(&format!("/containers/{}/exec-async", worker_id)))
            .json(&CommandRequest { command });
        self.execute_and_check("runCommandInContainerAsync", request)
            .await
    }

    async fn wait_for_stopped(&self, worker_id: &str, seconds_of_wait: u64) -> RuntimeResult<()> {
        let request = self
            .client
            .post(self.node_url(&format!("/containers/{}/wait-stopped", worker_id)))
            .timeout(Duration::from_secs(seconds_of_wait + 10))
            .json(&WaitRequest { seconds_of_wait });

        self.execute_and_check("waitForContainerStopped", request)
            .await
            .map_err(|e| match e {
                RuntimeError::Rejected { .. } => RuntimeError::Timeout {
                    worker_id: worker_id.to_string(),
                    seconds: seconds_of_wait,
                },
                other => other,
            })
    }

    async fn remove(&self, worker_id: &str, force: bool) -> RuntimeResult<()> {
        let (operation, suffix) = if force {
            ("removeContainerForced", format!("/containers/{}/force", worker_id))
        } else {
            ("removeContainer", format!("/containers/{}", worker_id))
        };
        let request = self.client.delete(self.node_url(&suffix));
        self.execute_and_check(operation, request).await
    }

    async fn image_exists_locally(&self, image: &str) -> RuntimeResult<bool> {
        let request = self
            .client
            .post(self.service_url("/images/available"))
            .json(&ImageRequest {
                image,
                seconds_of_wait: None,
            });
        let response: ImageAvailableResponse = self
            .send("checkImageAvailable", request)
            .await?
            .json()
            .await
            .map_err(|e| RuntimeError::Io(e.to_string()))?;
        Ok(response.available)
    }

    async fn ensure_image_available(&self, image: &str, seconds_of_wait: u64) -> RuntimeResult<()> {
        let request = self
            .client
            .post(self.service_url("/images/ensure"))
            .timeout(Duration::from_secs(seconds_of_wait + 10))
            .json(&ImageRequest {
                image,
                seconds_of_wait: Some(seconds_of_wait),
            });
        self.execute_and_check("ensureImageAvailable", request).await
    }

    async fn clean_stranded(&self, image: &str) -> RuntimeResult<()> {
        let request = self
            .client
            .post(self.service_url("/containers/clean-stranded"))
            .json(&ImageRequest {
                image,
                seconds_of_wait: None,
            });
        self.execute_and_check("cleanStrandedContainers", request)
            .await
    }
}
