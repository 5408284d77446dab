use std::io::ErrorKind;
use std::path::Path;

use tracing::debug;
use verlay_sandbox::{Exports, ImportContext, Sandbox, SourceUnit};

use crate::error::VerlayError;
use crate::fs::SourceFs;

/// Builds the exports of a versioned module.
/// 建立版本化模組的匯出內容。
///
/// The base source and the override source are combined, base first, and
/// executed as if they were the file at `override_path`, so relative imports
/// resolve inside the version directory. A missing base loads the override
/// alone; a missing override runs the base source at `override_path`.
pub fn build_versioned_file(
    fs: &dyn SourceFs,
    sandbox: &Sandbox,
    base_path: &Path,
    override_path: &Path,
    imports: &ImportContext,
) -> Result<Exports, VerlayError> {
    let base = read_source(fs, base_path)?;
    let overlay = read_source(fs, override_path)?;

    let unit = match (base, overlay) {
        (Some(base), Some(overlay)) => {
            let base = sandbox.compile(&base, base_path)?;
            let overlay = sandbox.compile(&overlay, override_path)?;
            SourceUnit::combine(&base, &overlay)
        }
        (None, Some(overlay)) => {
            debug!(
                target: "verlay::build",
                module = %override_path.display(),
                "no base counterpart, loading override alone"
            );
            sandbox.compile(&overlay, override_path)?
        }
        (Some(base), None) => sandbox.compile(&base, base_path)?,
        (None, None) => return Err(VerlayError::ModuleNotFound(override_path.to_path_buf())),
    };

    Ok(sandbox.run(&unit, override_path, imports)?)
}

fn read_source(fs: &dyn SourceFs, path: &Path) -> Result<Option<String>, VerlayError> {
    match fs.read_to_string(path) {
        Ok(text) => Ok(Some(text)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(source) => Err(VerlayError::io(path, source)),
    }
}
