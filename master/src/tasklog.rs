//! Salida capturada de cada intento, en `results/<job_id>/logs/<task_id>.log`.
//!
//! Los archivos viven dentro del directorio de resultados del job: viajan en
//! el zip y se van con la limpieza o el borrado del job.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use common::TaskCompleteRequest;

use crate::cleanup::is_valid_job_id;
use crate::config::MasterConfig;

/// Líneas por archivo si el pedido no dice otra cosa.
pub const DEFAULT_TAIL: usize = 50;

pub const NO_LOGS_MESSAGE: &str = "No logs available yet. Please wait for workflow to start...";

pub fn logs_dir(config: &MasterConfig, job_id: &str) -> PathBuf {
    config.results_dir().join(job_id).join("logs")
}

/// Ids de tarea generados por el builder: letras, dígitos, '-' y '_'.
fn is_safe_task_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Agrega el intento reportado al log de su tarea.
pub fn append_attempt(config: &MasterConfig, report: &TaskCompleteRequest) -> io::Result<PathBuf> {
    if !is_valid_job_id(&report.job_id) || !is_safe_task_id(&report.task_id) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("refusing to log {}/{}", report.job_id, report.task_id),
        ));
    }

    let dir = logs_dir(config, &report.job_id);
    fs::create_dir_all(&dir)?;
    let path = dir.join(format!("{}.log", report.task_id));

    let outcome = &report.outcome;
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(
        file,
        "=== attempt {} on {} at {}: {} (exit {}) ===",
        report.attempt,
        report.worker_id,
        Utc::now().to_rfc3339(),
        if outcome.success { "succeeded" } else { "failed" },
        outcome.exit_code
    )?;
    if !outcome.output.is_empty() {
        writeln!(file, "{}", outcome.output.trim_end())?;
    }
    Ok(path)
}

/// Últimas `tail` líneas de cada log del job (todas si `tail == 0`), con
/// un encabezado por archivo.
pub fn read_tail(config: &MasterConfig, job_id: &str, tail: usize) -> io::Result<String> {
    let dir = logs_dir(config, job_id);
    if !dir.is_dir() {
        return Ok(NO_LOGS_MESSAGE.to_string());
    }

    let pattern = format!("{}/*.log", glob::Pattern::escape(&dir.to_string_lossy()));
    let mut files: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?
        .flatten()
        .collect();
    files.sort();

    let mut out = String::new();
    for file in &files {
        let text = fs::read_to_string(file)?;
        let lines: Vec<&str> = text.lines().collect();
        let from = if tail == 0 { 0 } else { lines.len().saturating_sub(tail) };

        out.push_str(&format!("\n--- {} ---\n", file_name(file)));
        for line in &lines[from..] {
            out.push_str(line);
            out.push('\n');
        }
    }

    if out.is_empty() {
        return Ok(NO_LOGS_MESSAGE.to_string());
    }
    Ok(out)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::TaskOutcome;
    use uuid::Uuid;

    fn report(job_id: &str, task_id: &str, attempt: u32, outcome: TaskOutcome) -> TaskCompleteRequest {
        TaskCompleteRequest {
            worker_id: "w1".into(),
            job_id: job_id.into(),
            task_id: task_id.into(),
            attempt,
            outcome,
        }
    }

    #[test]
    fn acumula_intentos_y_devuelve_la_cola() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig::with_data_dir(dir.path());
        let id = Uuid::new_v4().to_string();

        assert_eq!(read_tail(&config, &id, 10).unwrap(), NO_LOGS_MESSAGE);

        append_attempt(&config, &report(&id, "sol-day-001", 1, TaskOutcome::failed(1, "linea 1\nlinea 2"))).unwrap();
        append_attempt(
            &config,
            &report(&id, "sol-day-001", 2, TaskOutcome::succeeded().with_output("listo")),
        )
        .unwrap();

        let all = read_tail(&config, &id, 0).unwrap();
        assert!(all.contains("--- sol-day-001.log ---"));
        assert!(all.contains("attempt 1 on w1"));
        assert!(all.contains("failed (exit 1)"));
        assert!(all.contains("linea 2"));

        let last = read_tail(&config, &id, 2).unwrap();
        assert!(!last.contains("linea 1"));
        assert!(last.contains("attempt 2 on w1"));
        assert!(last.contains("listo"));
    }

    #[test]
    fn ids_raros_no_escriben_fuera_de_resultados() {
        let dir = tempfile::tempdir().unwrap();
        let config = MasterConfig::with_data_dir(dir.path());
        let id = Uuid::new_v4().to_string();

        assert!(append_attempt(&config, &report("../x", "a", 1, TaskOutcome::succeeded())).is_err());
        assert!(append_attempt(&config, &report(&id, "../../jobs", 1, TaskOutcome::succeeded())).is_err());
        assert!(!config.results_dir().exists());
    }
}
