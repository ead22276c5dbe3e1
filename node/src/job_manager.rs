//! Job manager: parte la entrada en tareas MAP, las reparte en el cluster,
//! agrega los estados que reportan los executors y lanza el REDUCE.

use common::api::PluginRegistry;
use common::policy::BootstrapPolicy;
use common::{
    AttemptStatus, ExecutorTask, JobDescriptor, JobId, JobStatus, NodeError, NodeId, NodeResult,
    NodeStatus,
};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cluster::Cluster;
use crate::job::Job;

pub struct JobManager {
    cluster: Arc<Cluster>,
    plugins: Arc<PluginRegistry>,
    bootstrap: BootstrapPolicy,
    cancel_timeout: Duration,
    jobs: Mutex<BTreeMap<JobId, Arc<Job>>>,
    next_job: AtomicU32,
}

impl JobManager {
    pub fn new(
        cluster: Arc<Cluster>,
        plugins: Arc<PluginRegistry>,
        bootstrap: BootstrapPolicy,
        cancel_timeout: Duration,
    ) -> Self {
        Self {
            cluster,
            plugins,
            bootstrap,
            cancel_timeout,
            jobs: Mutex::new(BTreeMap::new()),
            next_job: AtomicU32::new(1),
        }
    }

    fn jobs(&self) -> MutexGuard<'_, BTreeMap<JobId, Arc<Job>>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn job(&self, id: JobId) -> NodeResult<Arc<Job>> {
        self.jobs()
            .get(&id)
            .cloned()
            .ok_or_else(|| NodeError::UnknownJob(id.qualified()))
    }

    async fn dispatch(&self, task: ExecutorTask) -> NodeResult<()> {
        debug!(
            "despachando {} al nodo {}",
            task.attempt.qualified(),
            task.target
        );
        self.cluster.service(task.target)?.execute(task).await
    }

    /// Parte la entrada y reparte las tareas MAP.
    ///
    /// Cada attempt se despacha recién cuando el siguiente ya quedó registrado:
    /// así el job no puede verse con todas sus tareas terminadas antes de que
    /// el splitter llegue al final de la entrada.
    pub async fn submit_job(
        &self,
        jar: Vec<u8>,
        input: Vec<u8>,
        statuses: &BTreeMap<NodeId, NodeStatus>,
    ) -> NodeResult<JobId> {
        let descriptor = JobDescriptor::from_package(&jar)?;
        self.plugins.validate(&descriptor)?;
        let input_format = self.plugins.input_format(&descriptor.input_format)?;
        let mut splitter = input_format
            .splitter(&input, &descriptor.properties)
            .map_err(|e| NodeError::Descriptor(format!("{:#}", e)))?;

        let local = self.cluster.local_id();
        let id = JobId::new(local, self.next_job.fetch_add(1, Ordering::SeqCst));
        let job = Arc::new(Job::new(id, descriptor));
        self.jobs().insert(id, job.clone());
        info!("job {} recibido ({} bytes de entrada)", id.qualified(), input.len());

        let mut seeded: HashSet<NodeId> = HashSet::new();
        let mut pending: Option<ExecutorTask> = None;
        let mut seq: u32 = 0;
        loop {
            let mut buf = Vec::new();
            let split = splitter
                .write_split(&mut buf)
                .map_err(|e| NodeError::InvalidArgument(format!("no se pudo partir la entrada: {:#}", e)))?;
            let Some(split) = split else {
                break;
            };

            let target = self
                .bootstrap
                .select_node(local, seq, self.cluster.node_ids(), statuses);
            let svc = self.cluster.service(target)?;
            if seeded.insert(target) {
                svc.write(job.jar_path(), jar.clone()).await?;
            }
            svc.write(&job.split_path(seq), buf).await?;

            let task = job.add_map_task(split, target)?;
            if let Some(previous) = pending.replace(task) {
                self.dispatch(previous).await?;
            }
            seq += 1;
        }
        if let Some(last) = pending {
            self.dispatch(last).await?;
        }

        info!("job {}: {} tareas MAP despachadas", id.qualified(), seq);
        Ok(id)
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.jobs().keys().copied().collect()
    }

    pub fn job_status(&self, id: JobId) -> NodeResult<JobStatus> {
        Ok(self.job(id)?.snapshot())
    }

    /// Snapshots de todos los jobs, del más viejo al más nuevo.
    pub fn job_statuses(&self) -> Vec<JobStatus> {
        let jobs: Vec<Arc<Job>> = self.jobs().values().cloned().collect();
        jobs.iter().map(|j| j.snapshot()).collect()
    }

    /// Aplica un lote de estados. El lote se reordena por TaskId antes de
    /// agrupar, así un emisor desordenado no rompe la agregación.
    pub fn update_attempt_statuses(self: &Arc<Self>, mut statuses: Vec<AttemptStatus>) -> bool {
        statuses.sort_by_key(|s| s.task_id());

        let mut changed = false;
        let mut start = 0;
        while start < statuses.len() {
            let job_id = statuses[start].id().job();
            let run = statuses[start..]
                .iter()
                .take_while(|s| s.id().job() == job_id)
                .count();
            let batch = &statuses[start..start + run];
            start += run;

            let job = match self.job(job_id) {
                Ok(job) => job,
                Err(_) => {
                    warn!("estados de un job desconocido: {}", job_id.qualified());
                    continue;
                }
            };
            let applied = job.apply(batch);
            changed |= applied.changed;
            if applied.reduce_ready {
                self.spawn_reduce(job);
            }
        }
        changed
    }

    fn spawn_reduce(self: &Arc<Self>, job: Arc<Job>) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.submit_reduce(&job).await {
                error!(
                    "no se pudo lanzar el REDUCE del job {}: {}",
                    job.id().qualified(),
                    e
                );
            }
        });
    }

    async fn submit_reduce(&self, job: &Job) -> NodeResult<()> {
        let task = job.create_reduce_task(self.cluster.local_id())?;
        info!("job {}: lanzando REDUCE", job.id().qualified());
        self.dispatch(task).await
    }

    /// Mueve un attempt MAP a `target`: copia paquete y split si faltan,
    /// despacha un attempt nuevo y cancela el original.
    ///
    /// Si el original no termina dentro del timeout sigue corriendo: ambos
    /// attempts pueden completar.
    pub async fn migrate_task(&self, target: NodeId, attempt: &AttemptStatus) -> NodeResult<()> {
        let source = attempt.target;
        let job = self.job(attempt.id().job())?;
        let src = self.cluster.service(source)?;
        let dst = self.cluster.service(target)?;

        if !dst.exists(job.jar_path()).await? {
            let jar = src.read(job.jar_path()).await?;
            dst.write(job.jar_path(), jar).await?;
        }
        let input_path = job.input_path(attempt.task_id())?;
        if !dst.exists(&input_path).await? {
            let split = src.read(&input_path).await?;
            dst.write(&input_path, split).await?;
        }

        let task = job.new_attempt(attempt.task_id(), target)?;
        info!(
            "migrando {} del nodo {} al nodo {} como {}",
            attempt.id().qualified(),
            source,
            target,
            task.attempt.qualified()
        );
        dst.execute(task).await?;

        match src.cancel(attempt.id(), self.cancel_timeout).await {
            Ok(true) => {
                // si el job ya lo tenía terminado, su salida puede ser la que lea el REDUCE
                if !job.cancel_attempt(attempt.id()) {
                    info!(
                        "{} ya había terminado; se conserva su salida",
                        attempt.id().qualified()
                    );
                    return Ok(());
                }
                match src.delete(attempt.id()).await {
                    Ok(true) => {}
                    Ok(false) => warn!("el nodo {} no borró {}", source, attempt.id().qualified()),
                    Err(e) => warn!("error borrando {}: {}", attempt.id().qualified(), e),
                }
            }
            Ok(false) => warn!(
                "{} no se canceló a tiempo; ambos attempts pueden correr",
                attempt.id().qualified()
            ),
            Err(e) => warn!("error cancelando {}: {}", attempt.id().qualified(), e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PeerConfig};
    use crate::testing::{calls_on, Call, CallLog, FakeNode};
    use common::{Phase, State};
    use std::sync::Weak;

    const A: NodeId = NodeId(1);
    const B: NodeId = NodeId(2);
    const C: NodeId = NodeId(3);

    struct Harness {
        manager: Arc<JobManager>,
        log: CallLog,
        nodes: BTreeMap<NodeId, Arc<FakeNode>>,
    }

    fn harness(ids: &[NodeId]) -> Harness {
        let config = NodeConfig {
            node_id: A,
            peers: ids
                .iter()
                .filter(|id| **id != A)
                .map(|id| PeerConfig {
                    id: *id,
                    addr: format!("localhost:{}", 60000 + id.0),
                })
                .collect(),
            ..Default::default()
        };
        let cluster = Arc::new(Cluster::new(&config, Weak::new()));
        let log = CallLog::default();
        let mut nodes = BTreeMap::new();
        for id in ids {
            let node = FakeNode::new(*id, &log);
            cluster.register_peer(*id, node.clone());
            nodes.insert(*id, node);
        }
        let manager = Arc::new(JobManager::new(
            cluster,
            Arc::new(PluginRegistry::with_builtins()),
            BootstrapPolicy::RoundRobin,
            Duration::from_millis(50),
        ));
        Harness {
            manager,
            log,
            nodes,
        }
    }

    fn package() -> Vec<u8> {
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
            .insert("text.input.format.lines.per.split".into(), "1".into());
        descriptor.to_package()
    }

    async fn submit(h: &Harness, lines: &str) -> JobId {
        h.manager
            .submit_job(package(), lines.as_bytes().to_vec(), &BTreeMap::new())
            .await
            .unwrap()
    }

    fn report(status: &JobStatus, seq: u32, state: State) -> AttemptStatus {
        let mut attempt = status.task(seq, true).unwrap().attempts[0].clone();
        attempt.status.set_state(state);
        attempt
    }

    fn position(log: &CallLog, node: NodeId, call: &Call) -> usize {
        log.lock()
            .unwrap()
            .iter()
            .position(|(n, c)| *n == node && c == call)
            .unwrap()
    }

    #[tokio::test]
    async fn splits_are_placed_round_robin_and_jar_written_once_per_node() {
        let h = harness(&[A, B]);
        let id = submit(&h, "a\nb\nc\nd\n").await;
        let status = h.manager.job_status(id).unwrap();

        let targets: Vec<NodeId> = status
            .map_tasks
            .iter()
            .map(|t| t.attempts[0].target)
            .collect();
        assert_eq!(targets, vec![A, B, A, B]);

        let jar = format!("{}/job.jar", id.qualified());
        for node in [A, B] {
            let jar_writes = calls_on(&h.log, node)
                .into_iter()
                .filter(|c| *c == Call::Write(jar.clone()))
                .count();
            assert_eq!(jar_writes, 1);
        }
        assert!(h.nodes[&B].has(&format!("{}/input/split-00003", id.qualified())));
    }

    #[tokio::test]
    async fn each_attempt_is_dispatched_after_the_next_split_is_registered() {
        let h = harness(&[A, B]);
        let id = submit(&h, "a\nb\nc\nd\n").await;
        let status = h.manager.job_status(id).unwrap();

        for seq in 0..3u32 {
            let task = status.task(seq, true).unwrap();
            let next = status.task(seq + 1, true).unwrap();
            let dispatch = Call::Execute(task.attempts[0].id());
            let executed = position(&h.log, task.attempts[0].target, &dispatch);
            let next_split = Call::Write(next.input_path.clone().unwrap());
            let written = position(&h.log, next.attempts[0].target, &next_split);
            assert!(written < executed, "tarea {} despachada antes de tiempo", seq);
        }
        // la última se despacha al final de la entrada
        let last = status.task(3, true).unwrap();
        assert!(calls_on(&h.log, B).contains(&Call::Execute(last.attempts[0].id())));
    }

    #[tokio::test]
    async fn invalid_package_is_rejected() {
        let h = harness(&[A]);
        let err = h
            .manager
            .submit_job(b"{}".to_vec(), b"a\n".to_vec(), &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_validation());
        assert!(h.manager.job_ids().is_empty());
    }

    #[tokio::test]
    async fn reduce_waits_for_every_map_task() {
        let h = harness(&[A, B]);
        let id = submit(&h, "a\nb\nc\nd\n").await;
        let status = h.manager.job_status(id).unwrap();

        let batch = vec![
            report(&status, 0, State::Succeeded),
            report(&status, 1, State::Succeeded),
            report(&status, 2, State::Succeeded),
            report(&status, 3, State::Running),
        ];
        assert!(h.manager.update_attempt_statuses(batch));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = h.manager.job_status(id).unwrap();
        assert_eq!(status.phase(), Phase::Map);
        assert_eq!(status.state(), State::Running);
        assert!(status.reduce_tasks.is_empty());

        assert!(h
            .manager
            .update_attempt_statuses(vec![report(&status, 3, State::Succeeded)]));

        let mut reduce = None;
        for _ in 0..200 {
            let status = h.manager.job_status(id).unwrap();
            if let Some(task) = status.reduce_tasks.first() {
                reduce = Some(task.clone());
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let reduce = reduce.expect("no se creó la tarea REDUCE");
        assert_eq!(h.manager.job_status(id).unwrap().phase(), Phase::Reduce);
        assert_eq!(reduce.inputs.len(), 4);
        let nodes: Vec<NodeId> = reduce.inputs.iter().map(|p| p.node).collect();
        assert_eq!(nodes, vec![A, B, A, B]);
        assert_eq!(reduce.attempts[0].target, A);
    }

    #[tokio::test]
    async fn unsorted_batches_are_grouped_by_task() {
        let h = harness(&[A, B]);
        let id = submit(&h, "a\nb\n").await;
        let status = h.manager.job_status(id).unwrap();

        let batch = vec![
            report(&status, 1, State::Running),
            report(&status, 0, State::Running),
        ];
        assert!(h.manager.update_attempt_statuses(batch));
        let status = h.manager.job_status(id).unwrap();
        assert!(status.map_tasks.iter().all(|t| t.state() == State::Running));
    }

    #[tokio::test]
    async fn statuses_of_unknown_jobs_are_ignored() {
        let h = harness(&[A]);
        let id = submit(&h, "a\n").await;
        let mut stray = report(&h.manager.job_status(id).unwrap(), 0, State::Running);
        stray.status = common::Status::new(common::AttemptId::new(
            common::TaskId::new(JobId::new(B, 7), 0, true),
            1,
        ));
        assert!(!h.manager.update_attempt_statuses(vec![stray]));
    }

    #[tokio::test]
    async fn migration_copies_inputs_and_cancels_the_original() {
        let h = harness(&[A, B, C]);
        let id = submit(&h, "a\nb\n").await;
        let status = h.manager.job_status(id).unwrap();
        let original = status.task(1, true).unwrap().attempts[0].clone();
        assert_eq!(original.target, B);

        h.manager.migrate_task(C, &original).await.unwrap();

        let root = id.qualified();
        assert!(h.nodes[&C].has(&format!("{}/job.jar", root)));
        assert!(h.nodes[&C].has(&format!("{}/input/split-00001", root)));

        let task = h.manager.job_status(id).unwrap().task(1, true).unwrap().clone();
        let moved = task.attempt(2).unwrap();
        assert_eq!(moved.target, C);
        assert!(calls_on(&h.log, C).contains(&Call::Execute(moved.id())));
        assert_eq!(
            calls_on(&h.log, B)
                .into_iter()
                .filter(|c| matches!(c, Call::Cancel(_) | Call::Delete(_)))
                .collect::<Vec<_>>(),
            vec![Call::Cancel(original.id()), Call::Delete(original.id())]
        );
        assert_eq!(task.attempt(1).unwrap().state(), State::Canceled);
    }

    #[tokio::test]
    async fn migration_cancel_timeout_leaves_both_attempts_running() {
        let h = harness(&[A, B, C]);
        h.nodes[&B].set_cancel_result(false);
        let id = submit(&h, "a\nb\n").await;
        let original = h.manager.job_status(id).unwrap().task(1, true).unwrap().attempts[0].clone();

        h.manager.migrate_task(C, &original).await.unwrap();

        let b_calls = calls_on(&h.log, B);
        assert!(b_calls.contains(&Call::Cancel(original.id())));
        assert!(!b_calls.contains(&Call::Delete(original.id())));

        // los dos attempts siguen vivos y ambos pueden terminar bien
        let status = h.manager.job_status(id).unwrap();
        let task = status.task(1, true).unwrap();
        assert_eq!(task.attempts.len(), 2);
        assert!(task.attempts.iter().all(|a| !a.status.is_done()));

        let mut first = task.attempt(1).unwrap().clone();
        let mut second = task.attempt(2).unwrap().clone();
        first.status.set_state(State::Succeeded);
        second.status.set_state(State::Succeeded);
        h.manager.update_attempt_statuses(vec![first, second]);
        let task = h.manager.job_status(id).unwrap().task(1, true).unwrap().clone();
        assert_eq!(task.state(), State::Succeeded);
        assert!(task.attempts.iter().all(|a| a.state() == State::Succeeded));
    }

    #[tokio::test]
    async fn migration_keeps_the_output_of_an_attempt_that_already_succeeded() {
        let h = harness(&[A, B, C]);
        let id = submit(&h, "a\nb\n").await;
        let status = h.manager.job_status(id).unwrap();
        // elegido mientras esperaba; el estado SUCCEEDED llega antes de cancelar
        let stale = status.task(1, true).unwrap().attempts[0].clone();
        assert!(h
            .manager
            .update_attempt_statuses(vec![report(&status, 1, State::Succeeded)]));

        h.manager.migrate_task(C, &stale).await.unwrap();

        let b_calls = calls_on(&h.log, B);
        assert!(b_calls.contains(&Call::Cancel(stale.id())));
        assert!(!b_calls.contains(&Call::Delete(stale.id())));

        let task = h.manager.job_status(id).unwrap().task(1, true).unwrap().clone();
        assert_eq!(task.state(), State::Succeeded);
        assert_eq!(task.attempt(1).unwrap().state(), State::Succeeded);
    }
}
