//! Empaquetado de `results/<job_id>/` en `results/<job_id>_results.zip`.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("results directory {0} does not exist")]
    Missing(PathBuf),

    #[error("I/O error while archiving: {0}")]
    Io(#[from] io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("bad glob pattern: {0}")]
    Pattern(#[from] glob::PatternError),
}

/// Escribe el zip (si no existe ya) y devuelve su ruta.
pub fn ensure_archive(results_dir: &Path, archive: &Path) -> Result<PathBuf, ArchiveError> {
    if archive.is_file() {
        return Ok(archive.to_path_buf());
    }
    if !results_dir.is_dir() {
        return Err(ArchiveError::Missing(results_dir.to_path_buf()));
    }

    // temporal único por llamada: pedidos concurrentes no se pisan y nunca
    // queda un zip a medias con el nombre final
    let parent = archive
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let tmp = tempfile::Builder::new()
        .prefix(".results-")
        .suffix(".zip.tmp")
        .tempfile_in(parent)?;
    let entries = write_zip(results_dir, tmp.as_file())?;
    tmp.persist(archive).map_err(|err| err.error)?;

    info!("zip de resultados creado: {} ({} archivos)", archive.display(), entries);
    Ok(archive.to_path_buf())
}

fn write_zip(results_dir: &Path, target: &File) -> Result<usize, ArchiveError> {
    let pattern = format!(
        "{}/**/*",
        glob::Pattern::escape(&results_dir.to_string_lossy())
    );
    let mut files: Vec<PathBuf> = glob::glob(&pattern)?
        .flatten()
        .filter(|p| p.is_file())
        .collect();
    files.sort();

    let mut zip = ZipWriter::new(target);
    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

    for path in &files {
        let Ok(relative) = path.strip_prefix(results_dir) else {
            continue;
        };
        // nombres de entrada siempre con '/'
        let name = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");

        zip.start_file(name, options)?;
        let mut source = File::open(path)?;
        io::copy(&mut source, &mut zip)?;
    }

    zip.finish()?;
    Ok(files.len())
}
