use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use common::{
    build, BuildOptions, CleanupSummary, Job, SubmitResponse, WorkerMetrics, WorkflowRequest,
    WorkflowType,
};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde_json::Value;
use std::env;
use std::path::{Path, PathBuf};

/// Igual que en el worker:
/// - En Docker: MASTER_URL=http://master:8080
/// - Local: default http://localhost:8080
fn master_base_url() -> String {
    env::var("MASTER_URL")
        .unwrap_or_else(|_| "http://localhost:8080".to_string())
        .trim_end_matches('/')
        .to_string()
}

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "CLI para enviar y seguir workflows solares / EEMT en el master")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum Workflow {
    Sol,
    Eemt,
}

impl From<Workflow> for WorkflowType {
    fn from(w: Workflow) -> Self {
        match w {
            Workflow::Sol => WorkflowType::Sol,
            Workflow::Eemt => WorkflowType::Eemt,
        }
    }
}

/// Parámetros del workflow, compartidos por `submit` y `dag`.
#[derive(clap::Args)]
struct WorkflowArgs {
    /// Tipo de workflow
    #[arg(value_enum)]
    workflow: Workflow,

    /// DEM en GeoTIFF
    #[arg(value_name = "DEM")]
    dem: PathBuf,

    #[arg(long)]
    start_year: Option<i32>,
    #[arg(long)]
    end_year: Option<i32>,

    /// Paso temporal de r.sun en minutos
    #[arg(long, default_value_t = WorkflowRequest::DEFAULT_STEP)]
    step: f64,
    #[arg(long, default_value_t = WorkflowRequest::DEFAULT_LINKE)]
    linke_value: f64,
    #[arg(long, default_value_t = WorkflowRequest::DEFAULT_ALBEDO)]
    albedo_value: f64,
    #[arg(long, default_value_t = WorkflowRequest::DEFAULT_THREADS)]
    num_threads: u32,
}

impl WorkflowArgs {
    fn request(&self) -> WorkflowRequest {
        let mut req = WorkflowRequest::new(self.workflow.into(), self.dem.to_string_lossy());
        req.step = self.step;
        req.linke_value = self.linke_value;
        req.albedo_value = self.albedo_value;
        req.num_threads = self.num_threads;
        if let Some(y) = self.start_year {
            req.start_year = y;
        }
        if let Some(y) = self.end_year {
            req.end_year = y;
        }
        req
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Sube un DEM y envía un job nuevo
    Submit(WorkflowArgs),

    /// Consulta el estado de un job
    Status {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Lista jobs, más nuevos primero
    Jobs {
        /// pending | running | completed | failed
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Descarga el zip de resultados de un job completado
    Results {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Archivo destino (default: <JOB_ID>_results.zip)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Últimas líneas de la salida de las tareas de un job
    Logs {
        #[arg(value_name = "JOB_ID")]
        id: String,
        /// Líneas por tarea (0 = todas)
        #[arg(long, default_value_t = 50)]
        tail: usize,
    },

    /// Cancela un job pendiente o en curso
    Cancel {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Borra un job terminado y sus datos
    Delete {
        #[arg(value_name = "JOB_ID")]
        id: String,
    },

    /// Corre la limpieza por retención
    Cleanup {
        /// Sólo informa qué se borraría
        #[arg(long)]
        dry_run: bool,
        #[arg(long)]
        success_retention_days: Option<i64>,
        #[arg(long)]
        failed_retention_hours: Option<i64>,
    },

    /// Métricas de los workers registrados
    Workers,

    /// Estado general del master
    System,

    /// Imprime el grafo de tareas en formato Make, sin hablar con el master
    Dag {
        #[command(flatten)]
        workflow: WorkflowArgs,

        /// Directorio raíz de las salidas
        #[arg(long, default_value = "results/preview")]
        output_root: PathBuf,
    },
}

/// Convierte una respuesta de error `{error, code}` en un `anyhow::Error`.
async fn error_from(resp: Response) -> anyhow::Error {
    let status = resp.status();
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    match body.get("error").and_then(|e| e.as_str()) {
        Some(msg) => anyhow::anyhow!("master respondió {status}: {msg}"),
        None => anyhow::anyhow!("master respondió {status}"),
    }
}

fn print_job(job: &Job) {
    println!("Job:");
    println!("  id          : {}", job.id);
    println!("  workflow    : {}", job.workflow_type);
    println!("  estado      : {}", job.status);
    println!("  progreso    : {}%", job.progress);
    println!("  dem         : {}", job.dem_filename);
    println!(
        "  años        : {}-{}",
        job.parameters.start_year, job.parameters.end_year
    );
    println!("  creado      : {}", job.created_at);
    if let Some(started) = job.started_at {
        println!("  iniciado    : {}", started);
    }
    if let Some(done) = job.completed_at {
        println!("  finalizado  : {}", done);
    }
    if let Some(err) = &job.error_message {
        println!("  error       : {}", err);
    }
    if let Some(cleaned) = job.data_cleaned_at {
        println!("  datos borrados: {}", cleaned);
    }
}

async fn submit(client: &Client, base_url: &str, args: &WorkflowArgs) -> Result<()> {
    // validar antes de subir el archivo
    let req = args.request();
    req.validate()?;

    let file_name = args
        .dem
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .context("la ruta del DEM no tiene nombre de archivo")?;
    let bytes = tokio::fs::read(&args.dem)
        .await
        .with_context(|| format!("no se pudo leer {}", args.dem.display()))?;

    let form = Form::new()
        .text("workflow_type", req.workflow_type.to_string())
        .text("step", req.step.to_string())
        .text("linke_value", req.linke_value.to_string())
        .text("albedo_value", req.albedo_value.to_string())
        .text("num_threads", req.num_threads.to_string())
        .text("start_year", req.start_year.to_string())
        .text("end_year", req.end_year.to_string())
        .part(
            "dem_file",
            Part::bytes(bytes).file_name(file_name).mime_str("image/tiff")?,
        );

    let resp = client
        .post(format!("{base_url}/api/submit-job"))
        .multipart(form)
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }

    let created: SubmitResponse = resp.json().await?;
    println!("Job enviado:");
    println!("  id    : {}", created.job_id);
    println!("  estado: {}", created.status);
    Ok(())
}

async fn download_results(client: &Client, base_url: &str, id: &str, output: Option<PathBuf>) -> Result<()> {
    let resp = client
        .get(format!("{base_url}/api/jobs/{id}/results"))
        .send()
        .await?;
    if !resp.status().is_success() {
        return Err(error_from(resp).await);
    }

    let target = output.unwrap_or_else(|| PathBuf::from(format!("{id}_results.zip")));
    let bytes = resp.bytes().await?;
    tokio::fs::write(&target, &bytes)
        .await
        .with_context(|| format!("no se pudo escribir {}", target.display()))?;
    println!("Resultados guardados en {} ({} bytes)", target.display(), bytes.len());
    Ok(())
}

fn print_cleanup(summary: &CleanupSummary) {
    println!(
        "Limpieza{}: {} completados, {} fallidos, {} bytes liberados",
        if summary.dry_run { " (dry run)" } else { "" },
        summary.successful_jobs_processed,
        summary.failed_jobs_processed,
        summary.bytes_freed
    );
    for job in &summary.jobs {
        println!("  - {} ({}) {} bytes", job.job_id, job.status, job.bytes_freed);
        for dir in &job.directories_deleted {
            println!("      dir : {}", dir);
        }
        for file in &job.files_deleted {
            println!("      file: {}", file);
        }
        if let Some(err) = &job.error {
            println!("      error: {}", err);
        }
    }
    for err in &summary.errors {
        eprintln!("error: {}", err);
    }
}

fn print_workers(workers: Vec<WorkerMetrics>) {
    if workers.is_empty() {
        println!("No hay workers registrados.");
        return;
    }
    for w in workers {
        println!("Worker {}", w.worker_id);
        println!("  host           : {}", w.hostname);
        println!("  dead           : {}", w.dead);
        println!("  last_heartbeat : {} s ago", w.last_heartbeat_secs_ago);
        println!(
            "  capacidad      : cores={} mem={}MB disk={}MB",
            w.capacity.cores, w.capacity.memory_mb, w.capacity.disk_mb
        );
        println!(
            "  tareas         : started={}, ok={}, failed={}",
            w.tasks_started, w.tasks_succeeded, w.tasks_failed
        );
        match w.avg_task_ms {
            Some(avg) => println!("  avg_task_ms    : {:.1}", avg),
            None => println!("  avg_task_ms    : (sin datos)"),
        }
        match w.last_cpu_percent {
            Some(cpu) => println!("  cpu_percent    : {:.1}%", cpu),
            None => println!("  cpu_percent    : (sin datos)"),
        }
        match w.last_mem_bytes {
            Some(mem) => println!("  mem_bytes      : {}", mem),
            None => println!("  mem_bytes      : (sin datos)"),
        }
        println!();
    }
}

/// Query string de `POST /api/cleanup`.
fn cleanup_query(dry_run: bool, days: Option<i64>, hours: Option<i64>) -> String {
    let mut query = format!("dry_run={dry_run}");
    if let Some(d) = days {
        query.push_str(&format!("&success_retention_days={d}"));
    }
    if let Some(h) = hours {
        query.push_str(&format!("&failed_retention_hours={h}"));
    }
    query
}

fn preview_dag(workflow: &WorkflowArgs, output_root: &Path) -> Result<String> {
    let opts = BuildOptions::new(output_root);
    let graph = build(&workflow.request(), &opts)?;
    eprintln!("{} tareas, {} dependencias", graph.len(), graph.edges.len());
    Ok(graph.to_makeflow())
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let client = Client::new();
    let base_url = master_base_url();

    match cli.command {
        Commands::Submit(args) => submit(&client, &base_url, &args).await?,

        Commands::Status { id } => {
            let resp = client.get(format!("{base_url}/api/jobs/{id}")).send().await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let job: Job = resp.json().await?;
            print_job(&job);
        }

        Commands::Jobs { status, limit } => {
            let mut url = format!("{base_url}/api/jobs");
            let mut params = Vec::new();
            if let Some(s) = status {
                params.push(format!("status={s}"));
            }
            if let Some(l) = limit {
                params.push(format!("limit={l}"));
            }
            if !params.is_empty() {
                url.push('?');
                url.push_str(&params.join("&"));
            }

            let resp = client.get(url).send().await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let jobs: Vec<Job> = resp.json().await?;
            if jobs.is_empty() {
                println!("No hay jobs.");
            }
            for job in jobs {
                println!(
                    "{}  {:<5} {:<10} {:>3}%  {}",
                    job.id,
                    job.workflow_type.to_string(),
                    job.status.to_string(),
                    job.progress,
                    job.created_at
                );
            }
        }

        Commands::Results { id, output } => download_results(&client, &base_url, &id, output).await?,

        Commands::Logs { id, tail } => {
            let resp = client
                .get(format!("{base_url}/api/jobs/{id}/logs?tail={tail}"))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            println!("{}", resp.text().await?);
        }

        Commands::Cancel { id } => {
            let resp = client
                .post(format!("{base_url}/api/jobs/{id}/cancel"))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let job: Job = resp.json().await?;
            println!("Cancelación pedida; el job termina cuando drenen sus tareas.");
            print_job(&job);
        }

        Commands::Delete { id } => {
            let resp = client.delete(format!("{base_url}/api/jobs/{id}")).send().await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            println!("Job {id} borrado.");
        }

        Commands::Cleanup {
            dry_run,
            success_retention_days,
            failed_retention_hours,
        } => {
            let query = cleanup_query(dry_run, success_retention_days, failed_retention_hours);
            let resp = client
                .post(format!("{base_url}/api/cleanup?{query}"))
                .send()
                .await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let summary: CleanupSummary = resp.json().await?;
            print_cleanup(&summary);
        }

        Commands::Workers => {
            let resp = client.get(format!("{base_url}/api/v1/workers")).send().await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            print_workers(resp.json().await?);
        }

        Commands::System => {
            let resp = client.get(format!("{base_url}/api/system/status")).send().await?;
            if !resp.status().is_success() {
                return Err(error_from(resp).await);
            }
            let status: Value = resp.json().await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }

        Commands::Dag {
            workflow,
            output_root,
        } => {
            let text = preview_dag(&workflow, &output_root)?;
            print!("{text}");
        }
    }

    Ok(())
}
