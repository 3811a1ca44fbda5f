use std::path::Path;

use anyhow::bail;
use reservoir_core::ReservoirConfig;

pub fn init(path: &str, url: &str) -> anyhow::Result<()> {
    let output = write_scaffold(Path::new(path), url)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}

/// Write `reservoir.toml` into `dir`; refuses to overwrite an existing file.
pub fn write_scaffold(dir: &Path, url: &str) -> anyhow::Result<std::path::PathBuf> {
    let output = dir.join("reservoir.toml");
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    let config = ReservoirConfig::scaffold("memory", url);
    std::fs::write(&output, config.to_toml_string()?)?;
    Ok(output)
}
