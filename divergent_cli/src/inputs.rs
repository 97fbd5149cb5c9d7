use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A statement read from disk, remembered with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedStatement {
    pub origin: PathBuf,
    pub statement: String,
}

/// Reads statements from files and directories.
///
/// Each file holds one statement. Directories are read one level deep and
/// only `.sql` files in them are used; files named explicitly are taken
/// regardless of extension. Blank files are skipped.
pub fn load_statements(paths: &[PathBuf]) -> Result<Vec<LoadedStatement>, anyhow::Error> {
    let mut loaded = Vec::new();
    for path in paths {
        if path.is_file() {
            push_file(&mut loaded, path)?;
        } else if path.is_dir() {
            let mut files = Vec::new();
            for entry in std::fs::read_dir(path)
                .map_err(|e| anyhow::anyhow!("Failed to list input directory {:?}: {}", path, e))?
            {
                let file_path = entry?.path();
                if file_path.is_file() && is_sql(&file_path) {
                    files.push(file_path);
                }
            }
            files.sort();
            debug!(dir = %path.display(), files = files.len(), "scanned input directory");
            for file_path in files {
                push_file(&mut loaded, &file_path)?;
            }
        } else {
            anyhow::bail!("Input path {:?} does not exist", path);
        }
    }
    Ok(loaded)
}

fn is_sql(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"))
}

fn push_file(loaded: &mut Vec<LoadedStatement>, path: &Path) -> Result<(), anyhow::Error> {
    let statement = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read input {:?}: {}", path, e))?;
    if statement.trim().is_empty() {
        warn!(path = %path.display(), "skipping empty input");
        return Ok(());
    }
    loaded.push(LoadedStatement {
        origin: path.to_path_buf(),
        statement,
    });
    Ok(())
}
