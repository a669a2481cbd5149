//! Workbook to per-sheet CSV conversion through an external converter.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("workbook not found: {0}")]
    WorkbookNotFound(PathBuf),
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} exited with {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("io error in {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Turns a multi-sheet workbook into one CSV per sheet named after the sheet.
pub trait SpreadsheetConverter {
    fn name(&self) -> &'static str;
    fn convert(&self, workbook: &Path, output_dir: &Path) -> Result<Vec<PathBuf>, ConvertError>;
}

/// Gnumeric's `ssconvert`, run with `-S` so every sheet lands in its own file.
#[derive(Debug, Clone)]
pub struct SsconvertConverter {
    program: String,
}

impl Default for SsconvertConverter {
    fn default() -> Self {
        Self {
            program: "ssconvert".to_string(),
        }
    }
}

impl SsconvertConverter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn command(&self, workbook: &Path, output_dir: &Path) -> Command {
        let mut target = OsString::from(output_dir.as_os_str());
        target.push(std::path::MAIN_SEPARATOR_STR);
        target.push("%s.csv");

        let mut cmd = Command::new(&self.program);
        cmd.arg("-S").arg(workbook).arg(target);
        cmd
    }
}

fn csv_files(dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
    let io_err = |source| ConvertError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut files = std::fs::read_dir(dir)
        .map_err(io_err)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
        .collect::<Vec<_>>();
    files.sort();
    Ok(files)
}

impl SpreadsheetConverter for SsconvertConverter {
    fn name(&self) -> &'static str {
        "ssconvert"
    }

    fn convert(&self, workbook: &Path, output_dir: &Path) -> Result<Vec<PathBuf>, ConvertError> {
        if !workbook.is_file() {
            return Err(ConvertError::WorkbookNotFound(workbook.to_path_buf()));
        }
        std::fs::create_dir_all(output_dir).map_err(|source| ConvertError::Io {
            path: output_dir.to_path_buf(),
            source,
        })?;
        let before = csv_files(output_dir)?;

        let mut cmd = self.command(workbook, output_dir);
        debug!(?cmd, "running converter");
        let output = cmd.output().map_err(|source| ConvertError::Launch {
            program: self.program.clone(),
            source,
        })?;
        if !output.status.success() {
            return Err(ConvertError::Failed {
                program: self.program.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let written = csv_files(output_dir)?;
        info!(
            workbook = %workbook.display(),
            sheets = written.len().saturating_sub(before.len()),
            "converted workbook"
        );
        Ok(written)
    }
}
