use anyhow::{bail, Context, Result};
use clap::error::ErrorKind;
use clap::{Parser, Subcommand};
use common::status::now_millis;
use common::wire::{self, SubmitJobRequest, ThrottleRequest};
use common::{AttemptStatus, JobId, JobStatus, Phase, Status, TaskStatus};
use reqwest::{Client, Response};
use std::fmt::Display;
use std::str::FromStr;

const DEFAULT_NODE: &str = "localhost:60001";

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para hablar con un nodo del cluster MapReduce")]
struct Cli {
    /// Nodo al que se envían los comandos
    #[arg(short = 'n', long = "node", value_name = "HOST:PUERTO", default_value = DEFAULT_NODE, global = true)]
    node: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Envía un job: paquete del job y archivo de entrada
    SubmitJob {
        #[arg(value_name = "JAR")]
        jar: String,
        #[arg(value_name = "INPUT")]
        input: String,
    },
    /// Sin argumentos lista los jobs; con id muestra job, tarea o attempt
    Status {
        #[arg(value_name = "JOB_ID")]
        job: Option<String>,
        /// Número de tarea: "m3", "r0" o sólo el número (map)
        #[arg(value_name = "TAREA")]
        task: Option<TaskArg>,
        #[arg(value_name = "ATTEMPT")]
        attempt: Option<u32>,
    },
    /// Fija el porcentaje de throttling del task executor
    Throttle {
        #[arg(value_name = "0-100", value_parser = parse_percent)]
        percent: f64,
    },
    /// Detiene el nodo
    StopNode,
}

/// Referencia a una tarea dentro de un job.
#[derive(Debug, Clone, Copy, PartialEq)]
struct TaskArg {
    seq: u32,
    map: bool,
}

impl FromStr for TaskArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (digits, map) = match s.chars().next() {
            Some('m') | Some('M') => (&s[1..], true),
            Some('r') | Some('R') => (&s[1..], false),
            _ => (s, true),
        };
        let seq = digits
            .parse()
            .map_err(|_| format!("tarea inválida: {} (usar m3, r0 o 3)", s))?;
        Ok(TaskArg { seq, map })
    }
}

fn parse_percent(s: &str) -> Result<f64, String> {
    let percent: f64 = s.parse().map_err(|_| format!("no es un número: {}", s))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(format!("fuera de rango: {} (0-100)", percent));
    }
    Ok(percent)
}

/// Errores de argumentos terminan con código 1; la ayuda y la versión con 0.
fn parse_args() -> Cli {
    match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            std::process::exit(code);
        }
    }
}

pub async fn run() -> Result<()> {
    let cli = parse_args();
    let client = Client::new();
    let base_url = format!("http://{}", cli.node);

    match cli.command {
        Commands::SubmitJob { jar, input } => {
            let jar = std::fs::read(&jar)
                .with_context(|| format!("no se pudo leer el paquete {}", jar))?;
            let input = std::fs::read(&input)
                .with_context(|| format!("no se pudo leer la entrada {}", input))?;

            let url = format!("{}{}", base_url, wire::JOBS);
            let resp = send(client.post(&url).json(&SubmitJobRequest { jar, input }), &cli.node).await?;
            let id: JobId = resp.json().await?;
            println!("Job enviado: {}", id.qualified());
        }

        Commands::Status { job: None, .. } => {
            let url = format!("{}{}", base_url, wire::JOBS);
            let ids: Vec<JobId> = send(client.get(&url), &cli.node).await?.json().await?;
            if ids.is_empty() {
                println!("No hay jobs en este nodo.");
            } else {
                println!("Jobs:");
                for id in ids {
                    println!("  {}", id.qualified());
                }
            }
        }

        Commands::Status {
            job: Some(job),
            task,
            attempt,
        } => {
            let id: JobId = job.parse()?;
            let url = format!("{}{}/{}", base_url, wire::JOBS, id.qualified());
            let status: JobStatus = send(client.get(&url), &cli.node).await?.json().await?;

            match (task, attempt) {
                (None, _) => print_job(&status),
                (Some(t), None) => print_task(find_task(&status, t)?, ""),
                (Some(t), Some(seq)) => {
                    let task = find_task(&status, t)?;
                    let Some(attempt) = task.attempt(seq) else {
                        bail!("la tarea {} no tiene attempt {}", task.id().qualified(), seq);
                    };
                    print_attempt(attempt, "");
                }
            }
        }

        Commands::Throttle { percent } => {
            let url = format!("{}{}", base_url, wire::THROTTLE);
            send(client.post(&url).json(&ThrottleRequest { percent }), &cli.node).await?;
            println!("Throttle en {}: {}%", cli.node, percent);
        }

        Commands::StopNode => {
            let url = format!("{}{}", base_url, wire::NODE_STOP);
            send(client.post(&url), &cli.node).await?;
            println!("Nodo {} detenido.", cli.node);
        }
    }

    Ok(())
}

/// Envía el pedido; un error de conexión o una respuesta no exitosa es fatal.
async fn send(req: reqwest::RequestBuilder, node: &str) -> Result<Response> {
    let resp = req
        .send()
        .await
        .with_context(|| format!("no se pudo conectar con {}", node))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        bail!("el nodo respondió {}: {}", status, body);
    }
    Ok(resp)
}

fn find_task(job: &JobStatus, arg: TaskArg) -> Result<&TaskStatus> {
    match job.task(arg.seq, arg.map) {
        Some(task) => Ok(task),
        None => bail!(
            "el job {} no tiene la tarea {}{}",
            job.id().qualified(),
            if arg.map { 'm' } else { 'r' },
            arg.seq
        ),
    }
}

/* ---------------- impresión ---------------- */

/// Tiempos total, en espera y corriendo; lo que sigue abierto se mide contra `now`.
fn durations<I: Clone>(status: &Status<I>, now: i64) -> (Option<i64>, Option<i64>, Option<i64>) {
    let end = status.done_at().unwrap_or(now);
    let total = status.created_at().map(|c| end - c);
    let waiting = status
        .waiting_since()
        .map(|w| status.running_since().unwrap_or(end) - w);
    let running = status.running_since().map(|r| end - r);
    (total, waiting, running)
}

fn millis(value: Option<i64>) -> String {
    match value {
        Some(ms) => format!("{} ms", ms.max(0)),
        None => "-".to_string(),
    }
}

fn print_times<I: Clone>(status: &Status<I>, indent: &str) {
    let (total, waiting, running) = durations(status, now_millis());
    println!(
        "{}  tiempos: total={}, espera={}, ejecución={}",
        indent,
        millis(total),
        millis(waiting),
        millis(running)
    );
}

fn print_job(job: &JobStatus) {
    println!("Job {}", job.id().qualified());
    println!("  estado: {}", job.state());
    println!("  fase: {}", job.phase());
    print_times(job.status.overall(), "");
    for phase in Phase::ALL {
        if let Some(status) = job.status.phase_status(phase) {
            println!("  fase {}: {}", phase, status.state());
        }
    }

    print_tasks("Tareas map", &job.map_tasks);
    print_tasks("Tareas reduce", &job.reduce_tasks);
}

fn print_tasks(title: &str, tasks: &[TaskStatus]) {
    if tasks.is_empty() {
        return;
    }
    println!("  {}:", title);
    for task in tasks {
        print_task(task, "    ");
    }
}

fn print_task(task: &TaskStatus, indent: &str) {
    println!("{}Tarea {}: {}", indent, task.id().qualified(), task.state());
    print_times(&task.status, indent);
    let nested = format!("{}    ", indent);
    for attempt in &task.attempts {
        print_attempt(attempt, &nested);
    }
}

fn print_attempt(attempt: &AttemptStatus, indent: &str) {
    println!(
        "{}Attempt {}: {} en nodo {}",
        indent,
        attempt.id().qualified(),
        attempt.state(),
        attempt.target
    );
    if let Some(message) = &attempt.message {
        print_labeled(indent, "mensaje", message);
    }
    print_times(&attempt.status, indent);
}

fn print_labeled(indent: &str, label: &str, value: impl Display) {
    println!("{}  {}: {}", indent, label, value);
}
