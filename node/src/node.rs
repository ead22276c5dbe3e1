use async_trait::async_trait;
use common::api::PluginRegistry;
use common::{
    AttemptId, AttemptStatus, ExecutorTask, JobId, JobStatus, NodeId, NodeResult,
    NodeStatusSnapshot,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cluster::{Cluster, NodeService};
use crate::config::NodeConfig;
use crate::cpu::{CpuProbe, SysinfoCpuProbe};
use crate::executor::TaskExecutor;
use crate::fs::LocalFileSystem;
use crate::handlers;
use crate::job_manager::JobManager;
use crate::load_balancer::{BalancePolicies, LoadBalancer};

/// Un nodo del cluster: job manager, task executor y load balancer sobre un
/// file system local.
pub struct Node {
    config: NodeConfig,
    cluster: Arc<Cluster>,
    fs: LocalFileSystem,
    executor: Arc<TaskExecutor>,
    jobs: Arc<JobManager>,
    balancer: Arc<LoadBalancer>,
    timers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
}

impl Node {
    pub fn new(config: NodeConfig, plugins: PluginRegistry, cpu: Arc<dyn CpuProbe>) -> Arc<Self> {
        let plugins = Arc::new(plugins);
        Arc::new_cyclic(|local| {
            let cluster = Arc::new(Cluster::new(&config, local.clone()));
            let fs = LocalFileSystem::new(config.root_dir());
            let executor = Arc::new(TaskExecutor::new(
                cluster.clone(),
                fs.clone(),
                plugins.clone(),
                config.te_num_threads,
            ));
            if let Err(e) = executor.set_throttle(config.te_throttle) {
                warn!("throttle inicial ignorado: {}", e);
            }
            let jobs = Arc::new(JobManager::new(
                cluster.clone(),
                plugins,
                config.lb_bootstrap_policy,
                config.lb_migration_cancel_timeout(),
            ));
            let balancer = Arc::new(LoadBalancer::new(
                cluster.clone(),
                executor.clone(),
                jobs.clone(),
                cpu,
                BalancePolicies {
                    transfer: config.lb_transfer_policy,
                    location: config.lb_location_policy,
                    selection: config.lb_selection_policy,
                },
            ));
            let (shutdown, _) = watch::channel(false);
            Node {
                config,
                cluster,
                fs,
                executor,
                jobs,
                balancer,
                timers: Mutex::new(Vec::new()),
                shutdown,
            }
        })
    }

    /// Nodo con los plugins incluidos y CPU medida con sysinfo.
    pub fn with_defaults(config: NodeConfig) -> Arc<Self> {
        Self::new(
            config,
            PluginRegistry::with_builtins(),
            Arc::new(SysinfoCpuProbe::new()),
        )
    }

    pub fn id(&self) -> NodeId {
        self.cluster.local_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }

    pub fn fs(&self) -> &LocalFileSystem {
        &self.fs
    }

    pub fn executor(&self) -> &Arc<TaskExecutor> {
        &self.executor
    }

    pub fn job_manager(&self) -> &Arc<JobManager> {
        &self.jobs
    }

    pub fn load_balancer(&self) -> &Arc<LoadBalancer> {
        &self.balancer
    }

    /// Lanza el envío periódico de estados y de heartbeats.
    pub fn start(&self) {
        let te_interval = self.config.te_status_update_interval();
        let lb_interval = self.config.lb_status_update_interval();
        let mut timers = self.timers.lock().unwrap_or_else(PoisonError::into_inner);
        timers.push(tokio::spawn(self.executor.clone().status_loop(te_interval)));
        timers.push(tokio::spawn(self.balancer.clone().heartbeat_loop(lb_interval)));
        info!(
            "nodo {}: status cada {:?}, heartbeat cada {:?}",
            self.id(),
            te_interval,
            lb_interval
        );
    }

    /// Detiene los timers y pide el cierre del servidor HTTP.
    pub fn stop(&self) {
        for timer in self
            .timers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            timer.abort();
        }
        self.shutdown.send_replace(true);
        info!("nodo {}: deteniéndose", self.id());
    }

    pub async fn stopped(&self) {
        let mut shutdown = self.shutdown.subscribe();
        let _ = shutdown.wait_for(|s| *s).await;
    }

    /// Arranca timers y servidor, espera la barrera de arranque y atiende
    /// hasta que alguien llame a `stop_node`.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> anyhow::Result<()> {
        let app = handlers::build_router(self.clone());
        info!("nodo {} escuchando en {}", self.id(), listener.local_addr()?);
        self.start();

        let stopping = self.clone();
        let server = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { stopping.stopped().await })
                .await
        });

        tokio::select! {
            _ = self.balancer.wait_until_ready() => {
                info!("nodo {} listo", self.id());
            }
            _ = self.stopped() => {}
        }

        server.await??;
        info!("nodo {} detenido", self.id());
        Ok(())
    }
}

#[async_trait]
impl NodeService for Node {
    async fn node_id(&self) -> NodeResult<NodeId> {
        Ok(self.id())
    }

    async fn submit_job(&self, jar: Vec<u8>, input: Vec<u8>) -> NodeResult<JobId> {
        let statuses = self.balancer.node_statuses();
        self.jobs.submit_job(jar, input, &statuses).await
    }

    async fn job_ids(&self) -> NodeResult<Vec<JobId>> {
        Ok(self.jobs.job_ids())
    }

    async fn job_status(&self, id: JobId) -> NodeResult<JobStatus> {
        self.jobs.job_status(id)
    }

    async fn update_attempt_statuses(&self, statuses: Vec<AttemptStatus>) -> NodeResult<bool> {
        Ok(self.jobs.update_attempt_statuses(statuses))
    }

    async fn update_node_status(&self, snapshot: NodeStatusSnapshot) -> NodeResult<bool> {
        Ok(self.balancer.update_status(snapshot))
    }

    async fn execute(&self, task: ExecutorTask) -> NodeResult<()> {
        self.executor.execute(task)
    }

    async fn cancel(&self, id: AttemptId, timeout: Duration) -> NodeResult<bool> {
        self.executor.cancel(id, timeout).await
    }

    async fn delete(&self, id: AttemptId) -> NodeResult<bool> {
        self.executor.delete(id).await
    }

    async fn set_throttle(&self, percent: f64) -> NodeResult<()> {
        self.executor.set_throttle(percent)
    }

    async fn read(&self, path: &str) -> NodeResult<Vec<u8>> {
        self.fs.read(path).await
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> NodeResult<()> {
        self.fs.write(path, &data).await
    }

    async fn mkdir(&self, path: &str) -> NodeResult<()> {
        self.fs.mkdir(path).await
    }

    async fn delete_path(&self, path: &str) -> NodeResult<bool> {
        self.fs.delete(path).await
    }

    async fn exists(&self, path: &str) -> NodeResult<bool> {
        self.fs.exists(path).await
    }

    async fn stop_node(&self) -> NodeResult<()> {
        self.stop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::FixedCpuProbe;
    use common::{JobDescriptor, Phase, State};

    fn single_node(dir: &std::path::Path) -> Arc<Node> {
        let config = NodeConfig {
            fs_root_dir: Some(dir.to_path_buf()),
            te_status_update_interval_ms: 20,
            lb_status_update_interval_ms: 20,
            ..Default::default()
        };
        Node::new(
            config,
            PluginRegistry::with_builtins(),
            Arc::new(FixedCpuProbe(0.0)),
        )
    }

    #[tokio::test]
    async fn local_service_resolves_to_the_node_itself() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());
        let svc = node.cluster().service(node.id()).unwrap();
        assert_eq!(svc.node_id().await.unwrap(), NodeId(1));
    }

    #[test]
    fn configured_throttle_reaches_the_executor() {
        let dir = tempfile::tempdir().unwrap();
        let config = NodeConfig {
            fs_root_dir: Some(dir.path().to_path_buf()),
            te_throttle: 40.0,
            ..Default::default()
        };
        let node = Node::new(
            config,
            PluginRegistry::with_builtins(),
            Arc::new(FixedCpuProbe(0.0)),
        );
        assert_eq!(node.executor().throttle(), 40.0);
    }

    #[tokio::test]
    async fn single_node_runs_wordcount_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let node = single_node(dir.path());
        node.start();

        let mut descriptor = JobDescriptor {
            mapper: "wordcount".into(),
            combiner: Some("wordcount".into()),
            reducer: "wordcount".into(),
            input_format: "text".into(),
            output_format: "text".into(),
            properties: Default::default(),
        };
        descriptor
            .properties
            .insert("text.input.format.lines.per.split".into(), "2".into());
        let id = node
            .submit_job(descriptor.to_package(), b"hola mundo\nhola\nchau mundo\n".to_vec())
            .await
            .unwrap();

        let mut status = node.job_status(id).await.unwrap();
        for _ in 0..500 {
            if status.state().is_end_state() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            status = node.job_status(id).await.unwrap();
        }
        assert_eq!(status.state(), State::Succeeded);
        assert_eq!(status.phase(), Phase::Reduce);
        assert_eq!(status.map_tasks.len(), 2);

        let result = node
            .read(&format!("{}/output/result", id.qualified()))
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(result).unwrap(),
            "chau,1\nhola,2\nmundo,2\n"
        );
        node.stop();
    }
}
