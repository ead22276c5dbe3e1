use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum State {
    Created,
    Waiting,
    Running,
    Canceled,
    Failed,
    Succeeded,
}

impl State {
    /// CANCELED, FAILED y SUCCEEDED son terminales.
    pub fn is_end_state(&self) -> bool {
        matches!(self, State::Canceled | State::Failed | State::Succeeded)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Created => "Created",
            State::Waiting => "Waiting",
            State::Running => "Running",
            State::Canceled => "Canceled",
            State::Failed => "Failed",
            State::Succeeded => "Succeeded",
        };
        f.write_str(s)
    }
}

pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Estado de una entidad con la marca de tiempo de entrada a cada estado.
/// Un clon es el snapshot inmutable que cruza la frontera entre nodos.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Status<I> {
    id: I,
    state: State,
    created_at: Option<i64>,
    waiting_since: Option<i64>,
    running_since: Option<i64>,
    done_at: Option<i64>,
}

impl<I: Clone> Status<I> {
    pub fn new(id: I) -> Self {
        Self {
            id,
            state: State::Created,
            created_at: Some(now_millis()),
            waiting_since: None,
            running_since: None,
            done_at: None,
        }
    }

    pub fn id(&self) -> &I {
        &self.id
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state.is_end_state()
    }

    pub fn created_at(&self) -> Option<i64> {
        self.created_at
    }

    pub fn waiting_since(&self) -> Option<i64> {
        self.waiting_since
    }

    pub fn running_since(&self) -> Option<i64> {
        self.running_since
    }

    pub fn done_at(&self) -> Option<i64> {
        self.done_at
    }

    /// Cambia de estado y marca la hora de entrada. Devuelve false si ya estaba en `state`.
    pub fn set_state(&mut self, state: State) -> bool {
        if self.state == state {
            return false;
        }
        self.state = state;
        let now = Some(now_millis());
        match state {
            State::Created => self.created_at = now,
            State::Waiting => self.waiting_since = now,
            State::Running => self.running_since = now,
            State::Canceled | State::Failed | State::Succeeded => self.done_at = now,
        }
        true
    }

    /// Aplica un snapshot remoto. Sólo sobrescribe si el estado difiere, así los
    /// heartbeats repetidos no tocan las marcas de tiempo.
    pub fn update(&mut self, snapshot: &Status<I>) -> bool {
        if snapshot.state == self.state {
            return false;
        }
        self.state = snapshot.state;
        self.created_at = snapshot.created_at;
        self.waiting_since = snapshot.waiting_since;
        self.running_since = snapshot.running_since;
        self.done_at = snapshot.done_at;
        true
    }
}

/// Regla de derivación del estado de una tarea a partir de sus attempts.
/// El orden de los chequeos importa: SUCCEEDED > RUNNING > WAITING > CREATED,
/// y si todos terminaron mal gana el último iterado.
pub fn derive_task_state<T>(states: T) -> State
where
    T: IntoIterator<Item = State>,
{
    let mut last = None;
    let (mut running, mut waiting, mut created) = (false, false, false);
    for state in states {
        match state {
            State::Succeeded => return State::Succeeded,
            State::Running => running = true,
            State::Waiting => waiting = true,
            State::Created => created = true,
            State::Canceled | State::Failed => {}
        }
        last = Some(state);
    }
    if running {
        State::Running
    } else if waiting {
        State::Waiting
    } else if created {
        State::Created
    } else {
        last.unwrap_or(State::Created)
    }
}

/// Regla de derivación del estado de una fase a partir de sus tareas.
pub fn derive_phase_state<T>(states: T) -> State
where
    T: IntoIterator<Item = State>,
{
    let mut empty = true;
    let mut non_canceled = false;
    let mut non_succeeded = false;
    let mut running_or_succeeded = false;
    let mut waiting = false;

    for state in states {
        empty = false;
        match state {
            State::Failed => return State::Failed,
            State::Canceled => non_succeeded = true,
            State::Succeeded => {
                running_or_succeeded = true;
                non_canceled = true;
            }
            State::Running => {
                running_or_succeeded = true;
                non_succeeded = true;
                non_canceled = true;
            }
            State::Waiting => {
                waiting = true;
                non_succeeded = true;
                non_canceled = true;
            }
            State::Created => {
                non_succeeded = true;
                non_canceled = true;
            }
        }
    }

    if empty {
        State::Created
    } else if !non_succeeded {
        State::Succeeded
    } else if !non_canceled {
        State::Canceled
    } else if running_or_succeeded {
        State::Running
    } else if waiting {
        State::Waiting
    } else {
        State::Created
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Map,
    Reduce,
}

impl Phase {
    pub const ALL: [Phase; 2] = [Phase::Map, Phase::Reduce];

    pub fn index(&self) -> usize {
        match self {
            Phase::Map => 0,
            Phase::Reduce => 1,
        }
    }

    pub fn is_last(&self) -> bool {
        self.index() == Self::ALL.len() - 1
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => f.write_str("Map"),
            Phase::Reduce => f.write_str("Reduce"),
        }
    }
}

/// Estado global más un sub-estado por fase (MAP -> REDUCE).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhasedStatus<I> {
    overall: Status<I>,
    phase: Phase,
    phases: Vec<Option<Status<I>>>,
}

impl<I: Clone> PhasedStatus<I> {
    pub fn new(id: I) -> Self {
        let mut phases = vec![None; Phase::ALL.len()];
        phases[0] = Some(Status::new(id.clone()));
        Self {
            overall: Status::new(id),
            phase: Phase::ALL[0],
            phases,
        }
    }

    pub fn overall(&self) -> &Status<I> {
        &self.overall
    }

    pub fn state(&self) -> State {
        self.overall.state()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn phase_status(&self, phase: Phase) -> Option<&Status<I>> {
        self.phases[phase.index()].as_ref()
    }

    /// Estado de la fase en curso.
    pub fn phase_state(&self) -> State {
        self.phase_status(self.phase)
            .map(|s| s.state())
            .unwrap_or(State::Created)
    }

    /// Aplica un estado a la fase actual:
    /// - FAILED/CANCELED en cualquier fase termina la entidad entera
    /// - SUCCEEDED avanza a la siguiente fase, o termina la entidad si era la última
    /// - el resto sólo se propaga al estado global mientras estamos en la primera fase
    pub fn set_state(&mut self, state: State) -> bool {
        let idx = self.phase.index();
        let current = self.phases[idx].get_or_insert_with(|| Status::new(self.overall.id().clone()));
        if !current.set_state(state) {
            return false;
        }
        match state {
            State::Failed | State::Canceled => {
                self.overall.set_state(state);
            }
            State::Succeeded => {
                if self.phase.is_last() {
                    self.overall.set_state(State::Succeeded);
                } else {
                    let next = Phase::ALL[idx + 1];
                    self.phase = next;
                    self.phases[next.index()] = Some(Status::new(self.overall.id().clone()));
                }
            }
            State::Created | State::Waiting | State::Running => {
                if idx == 0 {
                    self.overall.set_state(state);
                }
            }
        }
        true
    }
}
