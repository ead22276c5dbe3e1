//! Modelo vivo de un job en su nodo dueño: tareas, attempts y estados derivados.

use common::api::Split;
use common::status::{derive_phase_state, derive_task_state};
use common::{
    AttemptId, AttemptStatus, ExecutorTask, JobDescriptor, JobId, JobStatus, NodeError, NodeId,
    NodeResult, Phase, PhasedStatus, QualifiedPath, State, Status, TaskId, TaskInput, TaskStatus,
};
use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

struct Attempt {
    status: AttemptStatus,
    output_path: String,
}

struct Task {
    status: Status<TaskId>,
    split: Option<Split>,
    input_path: Option<String>,
    inputs: Vec<QualifiedPath>,
    output_path: String,
    attempts: BTreeMap<u32, Attempt>,
    next_attempt: u32,
}

impl Task {
    fn new(id: TaskId, output_path: String) -> Self {
        Self {
            status: Status::new(id),
            split: None,
            input_path: None,
            inputs: Vec::new(),
            output_path,
            attempts: BTreeMap::new(),
            next_attempt: 0,
        }
    }

    fn id(&self) -> TaskId {
        *self.status.id()
    }

    fn new_attempt(&mut self, target: NodeId) -> AttemptId {
        self.next_attempt += 1;
        let id = AttemptId::new(self.id(), self.next_attempt);
        self.attempts.insert(
            id.seq,
            Attempt {
                status: AttemptStatus {
                    status: Status::new(id),
                    target,
                    message: None,
                },
                output_path: self.output_path.clone(),
            },
        );
        self.refresh();
        id
    }

    /// Aplica una corrida de estados de esta tarea.
    fn apply(&mut self, statuses: &[AttemptStatus]) -> bool {
        let mut changed = false;
        for snapshot in statuses {
            let Some(attempt) = self.attempts.get_mut(&snapshot.id().seq) else {
                warn!("attempt desconocido: {}", snapshot.id().qualified());
                continue;
            };
            if attempt.status.status.update(&snapshot.status) {
                attempt.status.message = snapshot.message.clone();
                changed = true;
            }
        }
        self.refresh();
        changed
    }

    fn refresh(&mut self) -> bool {
        let state = derive_task_state(self.attempts.values().map(|a| a.status.state()));
        self.status.set_state(state)
    }

    fn succeeded_output(&self) -> Option<QualifiedPath> {
        self.attempts
            .values()
            .find(|a| a.status.state() == State::Succeeded)
            .map(|a| QualifiedPath {
                node: a.status.target,
                path: a.output_path.clone(),
            })
    }

    fn snapshot(&self) -> TaskStatus {
        TaskStatus {
            status: self.status.clone(),
            input_path: self.input_path.clone(),
            inputs: self.inputs.clone(),
            attempts: self.attempts.values().map(|a| a.status.clone()).collect(),
        }
    }

    fn executor_task(&self, id: AttemptId, jar_path: &str) -> NodeResult<ExecutorTask> {
        let attempt = self
            .attempts
            .get(&id.seq)
            .ok_or_else(|| NodeError::UnknownAttempt(id.qualified()))?;
        let input = match (self.split, &self.input_path) {
            (Some(split), Some(input_path)) => TaskInput::Map {
                split,
                input_path: input_path.clone(),
            },
            _ => TaskInput::Reduce {
                inputs: self.inputs.clone(),
            },
        };
        Ok(ExecutorTask {
            attempt: id,
            target: attempt.status.target,
            jar_path: jar_path.to_string(),
            output_path: attempt.output_path.clone(),
            input,
        })
    }
}

struct JobState {
    status: PhasedStatus<JobId>,
    map_tasks: BTreeMap<u32, Task>,
    reduce_task: Option<Task>,
}

impl JobState {
    fn task_mut(&mut self, id: TaskId) -> Option<&mut Task> {
        if id.map {
            self.map_tasks.get_mut(&id.seq)
        } else {
            self.reduce_task.as_mut().filter(|t| t.id() == id)
        }
    }

    fn task(&self, id: TaskId) -> Option<&Task> {
        if id.map {
            self.map_tasks.get(&id.seq)
        } else {
            self.reduce_task.as_ref().filter(|t| t.id() == id)
        }
    }

    /// Recalcula el estado de la fase en curso. Una vez terminado, el job no cambia más.
    fn refresh(&mut self) -> bool {
        if self.status.overall().is_done() {
            return false;
        }
        let state = match self.status.phase() {
            Phase::Map => derive_phase_state(self.map_tasks.values().map(|t| t.status.state())),
            Phase::Reduce => derive_phase_state(self.reduce_task.iter().map(|t| t.status.state())),
        };
        self.status.set_state(state)
    }
}

/// Resultado de aplicar un lote de estados a un job.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Applied {
    pub changed: bool,
    /// La fase MAP acaba de completarse: hay que lanzar el reduce.
    pub reduce_ready: bool,
}

pub struct Job {
    id: JobId,
    root: String,
    jar_path: String,
    descriptor: JobDescriptor,
    state: Mutex<JobState>,
}

impl Job {
    pub fn new(id: JobId, descriptor: JobDescriptor) -> Self {
        let root = id.qualified();
        Self {
            id,
            jar_path: format!("{}/job.jar", root),
            root,
            descriptor,
            state: Mutex::new(JobState {
                status: PhasedStatus::new(id),
                map_tasks: BTreeMap::new(),
                reduce_task: None,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn jar_path(&self) -> &str {
        &self.jar_path
    }

    pub fn descriptor(&self) -> &JobDescriptor {
        &self.descriptor
    }

    pub fn split_path(&self, seq: u32) -> String {
        format!("{}/input/split-{:05}", self.root, seq)
    }

    fn map_output_path(&self, seq: u32) -> String {
        format!("{}/output/split-{:05}", self.root, seq)
    }

    fn result_path(&self) -> String {
        format!("{}/output/result", self.root)
    }

    /// Registra la siguiente tarea MAP con su primer attempt y devuelve lo
    /// necesario para despacharlo.
    pub fn add_map_task(&self, split: Split, target: NodeId) -> NodeResult<ExecutorTask> {
        let mut state = self.state();
        let seq = state.map_tasks.len() as u32;
        let mut task = Task::new(TaskId::new(self.id, seq, true), self.map_output_path(seq));
        task.split = Some(split);
        task.input_path = Some(self.split_path(seq));
        let attempt = task.new_attempt(target);
        let exec = task.executor_task(attempt, &self.jar_path)?;
        state.map_tasks.insert(seq, task);
        state.refresh();
        Ok(exec)
    }

    /// Attempt nuevo de una tarea existente, usado al migrar.
    pub fn new_attempt(&self, task: TaskId, target: NodeId) -> NodeResult<ExecutorTask> {
        let mut state = self.state();
        let t = state
            .task_mut(task)
            .ok_or_else(|| NodeError::UnknownAttempt(task.qualified()))?;
        let attempt = t.new_attempt(target);
        let exec = t.executor_task(attempt, &self.jar_path)?;
        state.refresh();
        Ok(exec)
    }

    /// Ruta del split de una tarea MAP.
    pub fn input_path(&self, task: TaskId) -> NodeResult<String> {
        self.state()
            .task(task)
            .and_then(|t| t.input_path.clone())
            .ok_or_else(|| NodeError::InvalidArgument(format!("{} no es una tarea MAP", task)))
    }

    /// Marca un attempt como cancelado sin esperar al próximo reporte de su executor.
    pub fn cancel_attempt(&self, id: AttemptId) -> bool {
        let mut state = self.state();
        let Some(task) = state.task_mut(id.task) else {
            return false;
        };
        let changed = match task.attempts.get_mut(&id.seq) {
            Some(a) if !a.status.status.is_done() => a.status.status.set_state(State::Canceled),
            _ => false,
        };
        task.refresh();
        state.refresh();
        changed
    }

    /// Aplica estados de attempts de este job, ordenados por TaskId.
    pub fn apply(&self, statuses: &[AttemptStatus]) -> Applied {
        let mut state = self.state();
        let phase_before = state.status.phase();
        let mut changed = false;

        let mut start = 0;
        while start < statuses.len() {
            let task_id = statuses[start].task_id();
            let run = statuses[start..]
                .iter()
                .take_while(|s| s.task_id() == task_id)
                .count();
            match state.task_mut(task_id) {
                Some(task) => changed |= task.apply(&statuses[start..start + run]),
                None => warn!("tarea desconocida: {}", task_id.qualified()),
            }
            start += run;
        }

        changed |= state.refresh();
        let reduce_ready = phase_before == Phase::Map && state.status.phase() == Phase::Reduce;
        if reduce_ready {
            debug!("job {}: fase MAP completa", self.id.qualified());
        }
        Applied {
            changed,
            reduce_ready,
        }
    }

    /// Crea la única tarea REDUCE a partir de la salida exitosa de cada MAP.
    pub fn create_reduce_task(&self, local: NodeId) -> NodeResult<ExecutorTask> {
        let mut state = self.state();
        if state.reduce_task.is_some() {
            return Err(NodeError::Internal(format!(
                "el job {} ya tiene tarea REDUCE",
                self.id.qualified()
            )));
        }
        let mut inputs = Vec::with_capacity(state.map_tasks.len());
        for task in state.map_tasks.values() {
            let output = task.succeeded_output().ok_or_else(|| {
                NodeError::Internal(format!(
                    "la tarea {} no tiene attempt exitoso",
                    task.id().qualified()
                ))
            })?;
            inputs.push(output);
        }

        let mut task = Task::new(TaskId::new(self.id, 0, false), self.result_path());
        task.inputs = inputs;
        let attempt = task.new_attempt(local);
        let exec = task.executor_task(attempt, &self.jar_path)?;
        state.reduce_task = Some(task);
        state.refresh();
        Ok(exec)
    }

    pub fn snapshot(&self) -> JobStatus {
        let state = self.state();
        JobStatus {
            status: state.status.clone(),
            map_tasks: state.map_tasks.values().map(Task::snapshot).collect(),
            reduce_tasks: state.reduce_task.iter().map(Task::snapshot).collect(),
        }
    }
}
