use anyhow::{bail, Context, Result};
use qlink_types::MappingFile;
use std::path::Path;

/// Load the link mapping. `.toml` files are TOML, everything else YAML.
pub fn load_mapping(path: &Path) -> Result<MappingFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let mapping: MappingFile = match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?,
        _ => serde_yaml_ng::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))?,
    };
    if mapping.links.is_empty() {
        bail!("no 'links' provided in {}", path.display());
    }
    Ok(mapping)
}
