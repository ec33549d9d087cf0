use std::path::Path;

use casegrid_core::CasegridConfig;

pub const CONFIG_FILE: &str = "casegrid.toml";

/// Write a `casegrid.toml` with every default spelled out.
pub fn init(path: &Path) -> anyhow::Result<()> {
    let output = path.join(CONFIG_FILE);
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }

    let name = path
        .canonicalize()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "driver".to_string());
    let config = CasegridConfig::scaffold(&name);

    std::fs::create_dir_all(path)?;
    std::fs::write(&output, config.to_toml_string()?)?;
    println!("✓ Generated {}", output.display());
    Ok(())
}
