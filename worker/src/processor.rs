//! Adaptador hacia el procesador raster externo.
//!
//! El worker no sabe nada de GIS: le pasa al procesador la línea de
//! comando de la tarea junto con sus rutas y parámetros, y sólo mira el
//! código de salida y lo que escribió por stdout/stderr.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use common::Task;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Cuánto de la salida capturada se reporta al master.
pub const MAX_REPORTED_OUTPUT: usize = 4096;

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("could not start processor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("could not prepare output directory {path}: {source}")]
    OutputDir {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("processor exited with code {exit_code}")]
    Failed { exit_code: i32, output: String },

    #[error("processor finished but did not write: {}", .0.join(", "))]
    MissingOutputs(Vec<String>),
}

impl ProcessorError {
    /// Código de salida que se reporta al master.
    pub fn exit_code(&self) -> i32 {
        match self {
            ProcessorError::Failed { exit_code, .. } => *exit_code,
            _ => -1,
        }
    }

    /// Texto de diagnóstico que se reporta al master.
    pub fn diagnostic(&self) -> String {
        match self {
            ProcessorError::Failed { output, .. } if !output.is_empty() => output.clone(),
            other => other.to_string(),
        }
    }
}

#[async_trait]
pub trait RasterProcessor: Send + Sync {
    /// Ejecuta una tarea. `Ok` sólo si salió con 0 y escribió sus salidas;
    /// trae la salida capturada (recortada).
    async fn run(
        &self,
        command: &str,
        inputs: &[String],
        outputs: &[String],
        params: &BTreeMap<String, String>,
    ) -> Result<String, ProcessorError>;

    async fn run_task(&self, task: &Task) -> Result<String, ProcessorError> {
        self.run(&task.command, &task.inputs, &task.outputs, &task.params)
            .await
    }
}

/// Corre la línea de comando con `sh -c`.
///
/// Las rutas y parámetros también van por entorno (`EEMT_INPUTS`,
/// `EEMT_OUTPUTS`, `EEMT_PARAM_<NOMBRE>`).
#[derive(Debug, Clone)]
pub struct CommandProcessor {
    work_dir: PathBuf,
}

impl CommandProcessor {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let p = Path::new(path);
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.work_dir.join(p)
        }
    }
}

#[async_trait]
impl RasterProcessor for CommandProcessor {
    async fn run(
        &self,
        command: &str,
        inputs: &[String],
        outputs: &[String],
        params: &BTreeMap<String, String>,
    ) -> Result<String, ProcessorError> {
        for out in outputs {
            if let Some(parent) = self.resolve(out).parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|source| ProcessorError::OutputDir {
                        path: parent.display().to_string(),
                        source,
                    })?;
            }
        }

        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&self.work_dir)
            .env("EEMT_INPUTS", inputs.join(" "))
            .env("EEMT_OUTPUTS", outputs.join(" "))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in params {
            cmd.env(format!("EEMT_PARAM_{}", key.to_ascii_uppercase()), value);
        }

        debug!(cmd = %command, "lanzando procesador");
        let output = cmd.output().await.map_err(ProcessorError::Spawn)?;
        let exit_code = output.status.code().unwrap_or(-1);
        info!(exit_code, success = output.status.success(), "procesador terminó");

        if !output.status.success() {
            let mut text = String::from_utf8_lossy(&output.stderr).to_string();
            let stdout = String::from_utf8_lossy(&output.stdout);
            if text.trim().is_empty() {
                text = stdout.to_string();
            }
            return Err(ProcessorError::Failed {
                exit_code,
                output: tail(text.trim(), MAX_REPORTED_OUTPUT),
            });
        }

        let missing: Vec<String> = outputs
            .iter()
            .filter(|o| !self.resolve(o).exists())
            .cloned()
            .collect();
        if !missing.is_empty() {
            return Err(ProcessorError::MissingOutputs(missing));
        }

        let mut text = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !text.is_empty() {
                text.push('\n');
            }
            text.push_str(stderr.trim_end());
        }
        Ok(tail(text.trim(), MAX_REPORTED_OUTPUT))
    }
}

/// Últimos `max` bytes de `text`, cortando en un límite de carácter.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> BTreeMap<String, String> {
        BTreeMap::from([("day".to_string(), "17".to_string())])
    }

    #[tokio::test]
    async fn exito_crea_directorios_de_salida() {
        let dir = tempfile::tempdir().unwrap();
        let proc = CommandProcessor::new(dir.path());
        let outputs = vec!["global/daily/total_sun_day_017.tif".to_string()];

        proc.run(
            "echo \"$EEMT_PARAM_DAY\" > \"$EEMT_OUTPUTS\"",
            &["dem.tif".to_string()],
            &outputs,
            &params(),
        )
        .await
        .unwrap();

        let written = std::fs::read_to_string(dir.path().join(&outputs[0])).unwrap();
        assert_eq!(written.trim(), "17");
    }

    #[tokio::test]
    async fn exito_devuelve_stdout_y_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let proc = CommandProcessor::new(dir.path());

        let output = proc
            .run("echo 'r.sun: 100%'; echo 'WARNING: sin proyección' >&2", &[], &[], &BTreeMap::new())
            .await
            .unwrap();
        assert_eq!(output, "r.sun: 100%\nWARNING: sin proyección");
    }

    #[tokio::test]
    async fn falla_reporta_codigo_y_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let proc = CommandProcessor::new(dir.path());

        let err = proc
            .run("echo 'raster corrupto' >&2; exit 3", &[], &[], &BTreeMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.exit_code(), 3);
        assert_eq!(err.diagnostic(), "raster corrupto");
    }

    #[tokio::test]
    async fn salida_faltante_es_falla() {
        let dir = tempfile::tempdir().unwrap();
        let proc = CommandProcessor::new(dir.path());

        let err = proc
            .run("true", &[], &["nunca.tif".to_string()], &BTreeMap::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ProcessorError::MissingOutputs(ref m) if m == &["nunca.tif".to_string()]));
        assert_eq!(err.exit_code(), -1);
    }

    #[test]
    fn tail_respeta_limites_de_caracter() {
        assert_eq!(tail("hola", 10), "hola");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ñandú", 3), "dú");
    }
}
