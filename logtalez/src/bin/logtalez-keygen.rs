use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use clap::Parser;
use logtalez_common::{
    curve::{self, CurveCert},
    TracingConfiguration,
};

/// Generate a CURVE certificate pair: `<path>` (public) and `<path>_secret`.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Where to write the public certificate
    path: PathBuf,

    /// Metadata entries stored in the certificate, as name=value
    #[arg(long = "meta", value_parser = parse_metadata)]
    metadata: Vec<(String, String)>,

    /// Replace existing certificate files
    #[arg(long)]
    force: bool,
}

fn parse_metadata(entry: &str) -> Result<(String, String), String> {
    entry
        .split_once('=')
        .map(|(name, value)| (name.trim().to_owned(), value.trim().to_owned()))
        .ok_or_else(|| format!("expected name=value, got '{entry}'"))
}

/// Certificate files that saving to `path` would overwrite.
fn existing_files(path: &Path) -> Vec<PathBuf> {
    [path.to_owned(), curve::secret_path(path)]
        .into_iter()
        .filter(|p| p.exists())
        .collect()
}

fn main() -> Result<()> {
    let args = Args::parse();
    let _config = TracingConfiguration::new(false)?;

    if !args.force {
        if let Some(existing) = existing_files(&args.path).first() {
            anyhow::bail!(
                "{} already exists, use --force to replace it",
                existing.display()
            );
        }
    }

    let mut cert = CurveCert::generate()?;
    cert.metadata.extend(args.metadata);
    cert.save(&args.path)
        .with_context(|| format!("Failed to save certificate to {}", args.path.display()))?;

    tracing::info!(path = %args.path.display(), key = %cert.public_text(), "Generated certificate");
    println!("{}", cert.public_text());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nothing_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        assert!(existing_files(&dir.path().join("client")).is_empty());
    }

    #[test]
    fn lone_secret_file_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client");
        std::fs::write(dir.path().join("client_secret"), "curve\n").unwrap();
        assert_eq!(existing_files(&path), [dir.path().join("client_secret")]);
    }

    #[test]
    fn both_halves_are_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client");
        std::fs::write(&path, "curve\n").unwrap();
        std::fs::write(curve::secret_path(&path), "curve\n").unwrap();
        assert_eq!(existing_files(&path).len(), 2);
    }
}
