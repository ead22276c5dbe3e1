use async_trait::async_trait;
use common::{
    AttemptId, AttemptStatus, ExecutorTask, JobId, JobStatus, NodeError, NodeId, NodeResult,
    NodeStatusSnapshot,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;

use crate::config::NodeConfig;
use crate::node::Node;
use crate::remote::RemoteNode;

/// Superficie de servicio de un nodo, local o remoto.
#[async_trait]
pub trait NodeService: Send + Sync {
    async fn node_id(&self) -> NodeResult<NodeId>;

    /* --------- job manager --------- */

    async fn submit_job(&self, jar: Vec<u8>, input: Vec<u8>) -> NodeResult<JobId>;
    async fn job_ids(&self) -> NodeResult<Vec<JobId>>;
    async fn job_status(&self, id: JobId) -> NodeResult<JobStatus>;
    /// Lote de estados de attempts; se espera ordenado por TaskId.
    async fn update_attempt_statuses(&self, statuses: Vec<AttemptStatus>) -> NodeResult<bool>;

    /* --------- load balancer --------- */

    async fn update_node_status(&self, snapshot: NodeStatusSnapshot) -> NodeResult<bool>;

    /* --------- task executor --------- */

    async fn execute(&self, task: ExecutorTask) -> NodeResult<()>;
    async fn cancel(&self, id: AttemptId, timeout: Duration) -> NodeResult<bool>;
    async fn delete(&self, id: AttemptId) -> NodeResult<bool>;
    async fn set_throttle(&self, percent: f64) -> NodeResult<()>;

    /* --------- file system --------- */

    async fn read(&self, path: &str) -> NodeResult<Vec<u8>>;
    async fn write(&self, path: &str, data: Vec<u8>) -> NodeResult<()>;
    async fn mkdir(&self, path: &str) -> NodeResult<()>;
    async fn delete_path(&self, path: &str) -> NodeResult<bool>;
    async fn exists(&self, path: &str) -> NodeResult<bool>;

    async fn stop_node(&self) -> NodeResult<()>;
}

/// Directorio de nodos del cluster, inyectado en cada componente.
pub struct Cluster {
    local_id: NodeId,
    node_ids: Vec<NodeId>,
    local: Weak<Node>,
    peers: RwLock<HashMap<NodeId, Arc<dyn NodeService>>>,
}

impl Cluster {
    pub fn new(config: &NodeConfig, local: Weak<Node>) -> Self {
        let peers = config
            .peers
            .iter()
            .map(|p| {
                let svc: Arc<dyn NodeService> = Arc::new(RemoteNode::new(&p.addr));
                (p.id, svc)
            })
            .collect();
        Self {
            local_id: config.node_id,
            node_ids: config.node_ids(),
            local,
            peers: RwLock::new(peers),
        }
    }

    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// Todos los ids, incluido el local, en orden.
    pub fn node_ids(&self) -> &[NodeId] {
        &self.node_ids
    }

    pub fn local(&self) -> NodeResult<Arc<Node>> {
        self.local
            .upgrade()
            .ok_or_else(|| NodeError::Internal("el nodo local ya no existe".into()))
    }

    /// Reemplaza (o agrega) el servicio con que se habla a un nodo.
    pub fn register_peer(&self, id: NodeId, service: Arc<dyn NodeService>) {
        self.peers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, service);
    }

    pub fn service(&self, id: NodeId) -> NodeResult<Arc<dyn NodeService>> {
        if let Some(svc) = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
        {
            return Ok(svc.clone());
        }
        if id == self.local_id {
            let local: Arc<dyn NodeService> = self.local()?;
            return Ok(local);
        }
        Err(NodeError::UnknownNode(id))
    }
}
