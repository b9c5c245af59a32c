use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use telemat::mat::{read, MatVar, NumericData};

/// Reads a written log file and returns its single top-level variable.
pub fn read_only_var(path: &Path) -> Result<(String, MatVar)> {
    let mut vars = read::read_file(path).with_context(|| format!("reading {}", path.display()))?;
    if vars.len() != 1 {
        bail!("expected one top-level variable, found {}", vars.len());
    }
    Ok(vars.remove(0))
}

pub fn field<'a>(var: &'a MatVar, name: &str) -> Result<&'a MatVar> {
    var.field(name)
        .with_context(|| format!("missing struct field `{name}`"))
}

pub fn numeric(var: &MatVar) -> Result<(Vec<usize>, &NumericData)> {
    match var {
        MatVar::Numeric { dims, data } => Ok((dims.clone(), data)),
        other => bail!("expected a numeric array, got {other:?}"),
    }
}

pub fn text(var: &MatVar) -> Result<&str> {
    match var {
        MatVar::Char { text } => Ok(text),
        other => bail!("expected a char array, got {other:?}"),
    }
}

/// The `.mat` files under `dir`, sorted by name.
pub fn mat_files_in(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.extension().is_some_and(|ext| ext == "mat"))
        .collect();
    files.sort();
    Ok(files)
}
