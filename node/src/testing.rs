//! Nodo falso en memoria para probar job manager y load balancer sin red.

use async_trait::async_trait;
use common::{
    AttemptId, AttemptStatus, ExecutorTask, JobId, JobStatus, NodeError, NodeId, NodeResult,
    NodeStatusSnapshot,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::cluster::NodeService;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Write(String),
    Execute(AttemptId),
    Cancel(AttemptId),
    Delete(AttemptId),
}

/// Registro compartido entre nodos: (nodo, llamada) en orden global.
pub type CallLog = Arc<Mutex<Vec<(NodeId, Call)>>>;

pub struct FakeNode {
    id: NodeId,
    log: CallLog,
    files: Mutex<HashMap<String, Vec<u8>>>,
    cancel_result: AtomicBool,
    pub received: Mutex<Vec<AttemptStatus>>,
    pub heartbeats: Mutex<Vec<NodeStatusSnapshot>>,
}

impl FakeNode {
    pub fn new(id: NodeId, log: &CallLog) -> Arc<Self> {
        Arc::new(Self {
            id,
            log: log.clone(),
            files: Mutex::new(HashMap::new()),
            cancel_result: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
            heartbeats: Mutex::new(Vec::new()),
        })
    }

    pub fn set_cancel_result(&self, canceled: bool) {
        self.cancel_result.store(canceled, Ordering::SeqCst);
    }

    pub fn has(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    fn record(&self, call: Call) {
        self.log.lock().unwrap().push((self.id, call));
    }
}

pub fn calls_on(log: &CallLog, node: NodeId) -> Vec<Call> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(n, _)| *n == node)
        .map(|(_, c)| c.clone())
        .collect()
}

fn unsupported<T>() -> NodeResult<T> {
    Err(NodeError::Internal("no soportado por el nodo falso".into()))
}

#[async_trait]
impl NodeService for FakeNode {
    async fn node_id(&self) -> NodeResult<NodeId> {
        Ok(self.id)
    }

    async fn submit_job(&self, _jar: Vec<u8>, _input: Vec<u8>) -> NodeResult<JobId> {
        unsupported()
    }

    async fn job_ids(&self) -> NodeResult<Vec<JobId>> {
        Ok(Vec::new())
    }

    async fn job_status(&self, id: JobId) -> NodeResult<JobStatus> {
        Err(NodeError::UnknownJob(id.qualified()))
    }

    async fn update_attempt_statuses(&self, statuses: Vec<AttemptStatus>) -> NodeResult<bool> {
        self.received.lock().unwrap().extend(statuses);
        Ok(true)
    }

    async fn update_node_status(&self, snapshot: NodeStatusSnapshot) -> NodeResult<bool> {
        self.heartbeats.lock().unwrap().push(snapshot);
        Ok(true)
    }

    async fn execute(&self, task: ExecutorTask) -> NodeResult<()> {
        self.record(Call::Execute(task.attempt));
        Ok(())
    }

    async fn cancel(&self, id: AttemptId, _timeout: Duration) -> NodeResult<bool> {
        self.record(Call::Cancel(id));
        Ok(self.cancel_result.load(Ordering::SeqCst))
    }

    async fn delete(&self, id: AttemptId) -> NodeResult<bool> {
        self.record(Call::Delete(id));
        Ok(true)
    }

    async fn set_throttle(&self, _percent: f64) -> NodeResult<()> {
        Ok(())
    }

    async fn read(&self, path: &str) -> NodeResult<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| NodeError::InvalidArgument(format!("no existe {}", path)))
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> NodeResult<()> {
        self.record(Call::Write(path.to_string()));
        self.files.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    async fn mkdir(&self, _path: &str) -> NodeResult<()> {
        Ok(())
    }

    async fn delete_path(&self, path: &str) -> NodeResult<bool> {
        Ok(self.files.lock().unwrap().remove(path).is_some())
    }

    async fn exists(&self, path: &str) -> NodeResult<bool> {
        Ok(self.has(path))
    }

    async fn stop_node(&self) -> NodeResult<()> {
        unsupported()
    }
}
