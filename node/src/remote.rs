use async_trait::async_trait;
use common::wire::{
    self, CancelRequest, CancelResponse, DeleteRequest, DeleteResponse, ExistsResponse,
    SubmitJobRequest, ThrottleRequest, UpdateResponse,
};
use common::{
    AttemptId, AttemptStatus, ExecutorTask, JobId, JobStatus, NodeError, NodeId, NodeResult,
    NodeStatusSnapshot,
};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use crate::cluster::NodeService;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Cliente HTTP del servicio de otro nodo.
pub struct RemoteNode {
    base_url: String,
    client: Client,
}

impl RemoteNode {
    /// `addr` es `host:port`.
    pub fn new(addr: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            base_url: format!("http://{}", addr),
            client,
        }
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    async fn send(&self, req: RequestBuilder) -> NodeResult<Response> {
        let resp = req
            .send()
            .await
            .map_err(|e| NodeError::Unreachable(format!("{}: {}", self.base_url, e)))?;
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let message = resp.text().await.unwrap_or_default();
        Err(NodeError::Remote { status, message })
    }

    async fn json<T: DeserializeOwned>(&self, req: RequestBuilder) -> NodeResult<T> {
        let resp = self.send(req).await?;
        resp.json::<T>()
            .await
            .map_err(|e| NodeError::Unreachable(format!("respuesta ilegible de {}: {}", self.base_url, e)))
    }

    async fn post_json<B: Serialize, T: DeserializeOwned>(&self, route: &str, body: &B) -> NodeResult<T> {
        self.json(self.client.post(self.url(route)).json(body)).await
    }
}

#[async_trait]
impl NodeService for RemoteNode {
    async fn node_id(&self) -> NodeResult<NodeId> {
        self.json(self.client.get(self.url(wire::NODE_ID))).await
    }

    async fn submit_job(&self, jar: Vec<u8>, input: Vec<u8>) -> NodeResult<JobId> {
        self.post_json(wire::JOBS, &SubmitJobRequest { jar, input }).await
    }

    async fn job_ids(&self) -> NodeResult<Vec<JobId>> {
        self.json(self.client.get(self.url(wire::JOBS))).await
    }

    async fn job_status(&self, id: JobId) -> NodeResult<JobStatus> {
        let route = format!("{}/{}", wire::JOBS, id.qualified());
        self.json(self.client.get(self.url(&route))).await
    }

    async fn update_attempt_statuses(&self, statuses: Vec<AttemptStatus>) -> NodeResult<bool> {
        let resp: UpdateResponse = self.post_json(wire::ATTEMPT_STATUSES, &statuses).await?;
        Ok(resp.changed)
    }

    async fn update_node_status(&self, snapshot: NodeStatusSnapshot) -> NodeResult<bool> {
        let resp: UpdateResponse = self.post_json(wire::NODE_STATUS, &snapshot).await?;
        Ok(resp.changed)
    }

    async fn execute(&self, task: ExecutorTask) -> NodeResult<()> {
        self.send(self.client.post(self.url(wire::EXECUTE)).json(&task))
            .await?;
        Ok(())
    }

    async fn cancel(&self, id: AttemptId, timeout: Duration) -> NodeResult<bool> {
        let req = CancelRequest {
            attempt: id,
            timeout_ms: timeout.as_millis() as u64,
        };
        let resp: CancelResponse = self.post_json(wire::CANCEL, &req).await?;
        Ok(resp.canceled)
    }

    async fn delete(&self, id: AttemptId) -> NodeResult<bool> {
        let resp: DeleteResponse = self
            .post_json(wire::DELETE, &DeleteRequest { attempt: id })
            .await?;
        Ok(resp.deleted)
    }

    async fn set_throttle(&self, percent: f64) -> NodeResult<()> {
        self.send(
            self.client
                .post(self.url(wire::THROTTLE))
                .json(&ThrottleRequest { percent }),
        )
        .await?;
        Ok(())
    }

    async fn read(&self, path: &str) -> NodeResult<Vec<u8>> {
        let req = self.client.get(self.url(wire::FS)).query(&[("path", path)]);
        let resp = self.send(req).await?;
        let bytes = resp
            .bytes()
            .await
            .map_err(|e| NodeError::Unreachable(format!("{}: {}", self.base_url, e)))?;
        Ok(bytes.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> NodeResult<()> {
        let req = self
            .client
            .put(self.url(wire::FS))
            .query(&[("path", path)])
            .body(data);
        self.send(req).await?;
        Ok(())
    }

    async fn mkdir(&self, path: &str) -> NodeResult<()> {
        let req = self.client.post(self.url(wire::FS_MKDIR)).query(&[("path", path)]);
        self.send(req).await?;
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> NodeResult<bool> {
        let req = self.client.delete(self.url(wire::FS)).query(&[("path", path)]);
        let resp: DeleteResponse = self.json(req).await?;
        Ok(resp.deleted)
    }

    async fn exists(&self, path: &str) -> NodeResult<bool> {
        let req = self.client.get(self.url(wire::FS_EXISTS)).query(&[("path", path)]);
        let resp: ExistsResponse = self.json(req).await?;
        Ok(resp.exists)
    }

    async fn stop_node(&self) -> NodeResult<()> {
        self.send(self.client.post(self.url(wire::NODE_STOP))).await?;
        Ok(())
    }
}
