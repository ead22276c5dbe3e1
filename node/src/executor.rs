//! Task executor: pool fijo de workers que corre attempts MAP/REDUCE.

use common::api::{Interrupted, PluginRegistry};
use common::{AttemptId, AttemptStatus, ExecutorTask, NodeError, NodeId, NodeResult, State, Status};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::cluster::Cluster;
use crate::fs::LocalFileSystem;
use crate::runner;

/// Cantidad de duraciones recientes que se promedian para el throttle.
const RUNTIME_HISTORY: usize = 10;

struct Execution {
    task: ExecutorTask,
    status: Mutex<AttemptStatus>,
    interrupt: Arc<AtomicBool>,
    done: watch::Sender<bool>,
}

impl Execution {
    fn status(&self) -> MutexGuard<'_, AttemptStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }
}

/// Ventana circular de duraciones y el porcentaje de throttle vigente.
#[derive(Debug, Default)]
struct Throttle {
    percent: f64,
    runtimes: [u64; RUNTIME_HISTORY],
    next: usize,
    filled: usize,
}

impl Throttle {
    /// Registra una duración y devuelve la pausa que corresponde antes de
    /// liberar el worker.
    fn record(&mut self, runtime: Duration) -> Duration {
        self.runtimes[self.next] = runtime.as_millis() as u64;
        self.next = (self.next + 1) % RUNTIME_HISTORY;
        self.filled = (self.filled + 1).min(RUNTIME_HISTORY);
        self.pause()
    }

    /// media * (100/throttle - 1); throttle 0 = sin pausa.
    fn pause(&self) -> Duration {
        if self.percent <= 0.0 || self.filled == 0 {
            return Duration::ZERO;
        }
        let total: u64 = self.runtimes[..self.filled].iter().sum();
        let mean = total as f64 / self.filled as f64;
        let millis = mean * (100.0 / self.percent - 1.0);
        Duration::from_micros((millis.max(0.0) * 1000.0).round() as u64)
    }
}

pub struct TaskExecutor {
    cluster: Arc<Cluster>,
    fs: LocalFileSystem,
    plugins: Arc<PluginRegistry>,
    num_threads: usize,
    permits: Arc<Semaphore>,
    executions: Mutex<BTreeMap<AttemptId, Arc<Execution>>>,
    throttle: Mutex<Throttle>,
}

impl TaskExecutor {
    pub fn new(
        cluster: Arc<Cluster>,
        fs: LocalFileSystem,
        plugins: Arc<PluginRegistry>,
        num_threads: usize,
    ) -> Self {
        let num_threads = num_threads.max(1);
        Self {
            cluster,
            fs,
            plugins,
            num_threads,
            permits: Arc::new(Semaphore::new(num_threads)),
            executions: Mutex::new(BTreeMap::new()),
            throttle: Mutex::new(Throttle::default()),
        }
    }

    fn executions(&self) -> MutexGuard<'_, BTreeMap<AttemptId, Arc<Execution>>> {
        self.executions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn throttle_state(&self) -> MutexGuard<'_, Throttle> {
        self.throttle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get(&self, id: AttemptId) -> Option<Arc<Execution>> {
        self.executions().get(&id).cloned()
    }

    /// Encola el attempt: queda WAITING hasta que un worker lo toma.
    pub fn execute(self: &Arc<Self>, task: ExecutorTask) -> NodeResult<()> {
        let id = task.attempt;
        let mut status = AttemptStatus {
            status: Status::new(id),
            target: task.target,
            message: None,
        };
        status.status.set_state(State::Waiting);
        let (done, _) = watch::channel(false);
        let execution = Arc::new(Execution {
            task,
            status: Mutex::new(status),
            interrupt: Arc::new(AtomicBool::new(false)),
            done,
        });

        {
            let mut executions = self.executions();
            if executions.contains_key(&id) {
                return Err(NodeError::InvalidArgument(format!(
                    "el attempt {} ya está registrado",
                    id.qualified()
                )));
            }
            executions.insert(id, execution.clone());
        }

        debug!("attempt {} encolado", id.qualified());
        tokio::spawn(self.clone().work(execution));
        Ok(())
    }

    async fn work(self: Arc<Self>, execution: Arc<Execution>) {
        let id = execution.task.attempt;
        let permit = match self.permits.clone().acquire_owned().await {
            Ok(p) => p,
            Err(_) => return,
        };

        {
            let mut status = execution.status();
            // cancelado mientras esperaba un worker
            if status.state() != State::Waiting {
                return;
            }
            status.status.set_state(State::Running);
        }

        info!("ejecutando attempt {}", id.qualified());
        let started = Instant::now();
        let result = runner::run(
            &execution.task,
            &self.fs,
            &self.cluster,
            &self.plugins,
            execution.interrupt.clone(),
        )
        .await;

        {
            let mut status = execution.status();
            match result {
                Ok(()) => {
                    status.status.set_state(State::Succeeded);
                    info!("attempt {} terminó bien", id.qualified());
                }
                Err(e) if e.downcast_ref::<Interrupted>().is_some() => {
                    status.status.set_state(State::Canceled);
                    info!("attempt {} interrumpido", id.qualified());
                }
                Err(e) => {
                    status.message = Some(format!("{:#}", e));
                    status.status.set_state(State::Failed);
                    warn!("attempt {} falló: {:#}", id.qualified(), e);
                }
            }
        }
        execution.done.send_replace(true);

        let pause = self.throttle_state().record(started.elapsed());
        if !pause.is_zero() {
            debug!("throttle: pausa de {:?}", pause);
            tokio::time::sleep(pause).await;
        }
        drop(permit);
    }

    /// Devuelve true si el attempt quedó terminado dentro de `timeout`.
    /// Los attempts que todavía no corren se cancelan sin esperar.
    pub async fn cancel(&self, id: AttemptId, timeout: Duration) -> NodeResult<bool> {
        let Some(execution) = self.get(id) else {
            return Ok(false);
        };
        let mut done = execution.done.subscribe();

        {
            let mut status = execution.status();
            match status.state() {
                State::Created | State::Waiting => {
                    status.status.set_state(State::Canceled);
                    drop(status);
                    execution.done.send_replace(true);
                    info!("attempt {} cancelado antes de correr", id.qualified());
                    return Ok(true);
                }
                state if state.is_end_state() => return Ok(true),
                _ => {}
            }
        }

        execution.interrupt.store(true, Ordering::Relaxed);
        let finished = matches!(
            tokio::time::timeout(timeout, done.wait_for(|d| *d)).await,
            Ok(Ok(_))
        );
        if !finished {
            info!("attempt {} no terminó en {:?}", id.qualified(), timeout);
        }
        Ok(finished)
    }

    /// Borra la salida y el registro de un attempt cancelado o fallido.
    /// Un attempt SUCCEEDED nunca se borra: su salida puede estar en uso.
    pub async fn delete(&self, id: AttemptId) -> NodeResult<bool> {
        let Some(execution) = self.get(id) else {
            return Ok(true);
        };
        if !execution.is_done() {
            return Ok(false);
        }
        if execution.status().state() == State::Succeeded {
            info!("attempt {} terminó bien, no se borra", id.qualified());
            return Ok(false);
        }
        if let Err(e) = self.fs.delete(&execution.task.output_path).await {
            warn!(
                "no se pudo borrar la salida de {}: {}",
                id.qualified(),
                e
            );
            return Ok(false);
        }
        self.executions().remove(&id);
        Ok(true)
    }

    pub fn set_throttle(&self, percent: f64) -> NodeResult<()> {
        if !(0.0..=100.0).contains(&percent) {
            return Err(NodeError::InvalidArgument(format!(
                "throttle fuera de [0,100]: {}",
                percent
            )));
        }
        self.throttle_state().percent = percent;
        info!("throttle = {}%", percent);
        Ok(())
    }

    pub fn throttle(&self) -> f64 {
        self.throttle_state().percent
    }

    pub fn num_threads(&self) -> usize {
        self.num_threads
    }

    fn count(&self, state: State) -> usize {
        self.executions()
            .values()
            .filter(|e| e.status().state() == state)
            .count()
    }

    /// Attempts esperando un worker.
    pub fn queue_length(&self) -> usize {
        self.count(State::Waiting)
    }

    pub fn active_count(&self) -> usize {
        self.count(State::Running)
    }

    pub fn attempt_status(&self, id: AttemptId) -> Option<AttemptStatus> {
        self.get(id).map(|e| e.status().clone())
    }

    /// Snapshots de todos los attempts, ordenados por id.
    pub fn statuses(&self) -> Vec<AttemptStatus> {
        self.executions()
            .values()
            .map(|e| e.status().clone())
            .collect()
    }

    /// Envía los estados al job manager dueño de cada attempt.
    pub async fn push_statuses(&self) {
        let mut batches: BTreeMap<NodeId, Vec<AttemptStatus>> = BTreeMap::new();
        for status in self.statuses() {
            batches.entry(status.id().owner()).or_default().push(status);
        }

        for (owner, batch) in batches {
            let len = batch.len();
            let result = match self.cluster.service(owner) {
                Ok(svc) => svc.update_attempt_statuses(batch).await,
                Err(e) => Err(e),
            };
            match result {
                Ok(_) => debug!("{} estados enviados al nodo {}", len, owner),
                Err(e) if e.is_unreachable() => {
                    info!("nodo {} inalcanzable para status: {}", owner, e)
                }
                Err(e) => warn!("error enviando estados al nodo {}: {}", owner, e),
            }
        }
    }

    pub async fn status_loop(self: Arc<Self>, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.push_statuses().await;
        }
    }
}
