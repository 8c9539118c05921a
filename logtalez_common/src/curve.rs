//! CURVE certificates in the ZPL text format written by CZMQ.
//!
//! A certificate pair is stored as two files: `<name>` holds the public key
//! and is safe to hand out, `<name>_secret` additionally holds the secret key.

use std::{
    collections::{BTreeMap, HashSet},
    path::{Path, PathBuf},
};

use anyhow::{anyhow, bail, Context as _, Result};

pub type CurveKey = [u8; 32];

const SECRET_SUFFIX: &str = "_secret";
const CURVE_SECTION: &str = "curve";
const METADATA_SECTION: &str = "metadata";
const PUBLIC_KEY: &str = "public-key";
const SECRET_KEY: &str = "secret-key";

#[derive(Clone, PartialEq, Eq)]
pub struct CurveCert {
    pub public_key: CurveKey,
    pub secret_key: Option<CurveKey>,
    pub metadata: BTreeMap<String, String>,
}

impl std::fmt::Debug for CurveCert {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct(stringify!(CurveCert))
            .field("public_key", &self.public_text())
            .field("has_secret_key", &self.secret_key.is_some())
            .field("metadata", &self.metadata)
            .finish()
    }
}

impl CurveCert {
    /// Generate a fresh key pair. Fails if libzmq was built without CURVE support.
    pub fn generate() -> Result<Self> {
        ensure_curve_support()?;
        let pair = zmq::CurveKeyPair::new().context("Failed to generate CURVE key pair")?;
        Ok(Self {
            public_key: pair.public_key,
            secret_key: Some(pair.secret_key),
            metadata: BTreeMap::new(),
        })
    }

    /// Load a certificate the way CZMQ does: prefer `<path>_secret` if it exists,
    /// otherwise read `<path>` which only carries the public key.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let secret_path = secret_path(path);
        let source = if secret_path.is_file() {
            secret_path
        } else {
            path.to_owned()
        };

        let text = std::fs::read_to_string(&source)
            .with_context(|| format!("Failed to read certificate {}", source.display()))?;
        Self::parse(&text)
            .with_context(|| format!("Failed to parse certificate {}", source.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let sections = parse_zpl(text)?;
        let curve = sections
            .get(CURVE_SECTION)
            .ok_or_else(|| anyhow!("Missing '{CURVE_SECTION}' section"))?;

        let public_key = curve
            .get(PUBLIC_KEY)
            .ok_or_else(|| anyhow!("Missing {PUBLIC_KEY}"))
            .and_then(|key| decode_key(key))
            .with_context(|| format!("Invalid {PUBLIC_KEY}"))?;
        let secret_key = curve
            .get(SECRET_KEY)
            .map(|key| decode_key(key))
            .transpose()
            .with_context(|| format!("Invalid {SECRET_KEY}"))?;

        Ok(Self {
            public_key,
            secret_key,
            metadata: sections.get(METADATA_SECTION).cloned().unwrap_or_default(),
        })
    }

    /// Write the public certificate to `path` and the secret one to `<path>_secret`.
    #[tracing::instrument(level = "debug", skip_all, fields(path = %path.as_ref().display()))]
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.render(false))
            .with_context(|| format!("Failed to write certificate {}", path.display()))?;

        if self.secret_key.is_some() {
            let secret_path = secret_path(path);
            std::fs::write(&secret_path, self.render(true)).with_context(|| {
                format!("Failed to write certificate {}", secret_path.display())
            })?;
            restrict_permissions(&secret_path)?;
        }
        Ok(())
    }

    pub fn public_text(&self) -> String {
        encode_key(&self.public_key)
    }

    pub fn secret_text(&self) -> Option<String> {
        self.secret_key.as_ref().map(encode_key)
    }

    pub fn require_secret_key(&self) -> Result<&CurveKey> {
        self.secret_key
            .as_ref()
            .ok_or_else(|| anyhow!("Certificate {} has no secret key", self.public_text()))
    }

    fn render(&self, with_secret: bool) -> String {
        let mut out = String::new();
        out.push_str("#   ****  Generated by logtalez  ****\n");
        if with_secret {
            out.push_str("#   ZeroMQ CURVE **Secret** Certificate\n");
            out.push_str("#   DO NOT PROVIDE THIS FILE TO OTHER USERS nor change its permissions.\n");
        } else {
            out.push_str("#   ZeroMQ CURVE Public Certificate\n");
            out.push_str("#   Exchange securely, or use a secure mechanism to verify the contents\n");
            out.push_str("#   of this file after exchange.\n");
        }
        out.push('\n');

        out.push_str(METADATA_SECTION);
        out.push('\n');
        for (name, value) in &self.metadata {
            out.push_str(&format!("    {name} = \"{value}\"\n"));
        }

        out.push_str(CURVE_SECTION);
        out.push('\n');
        out.push_str(&format!("    {PUBLIC_KEY} = \"{}\"\n", self.public_text()));
        if let (true, Some(secret)) = (with_secret, self.secret_text()) {
            out.push_str(&format!("    {SECRET_KEY} = \"{secret}\"\n"));
        }
        out
    }
}

/// Collect the public keys of all certificates in `dir`. Files that do not
/// parse as certificates are skipped.
#[tracing::instrument(skip_all, fields(dir = %dir.as_ref().display()))]
pub fn load_public_keys(dir: impl AsRef<Path>) -> Result<HashSet<CurveKey>> {
    let dir = dir.as_ref();
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read certificate directory {}", dir.display()))?;

    let mut keys = HashSet::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("Failed to list certificate directory {}", dir.display()))?
            .path();
        if !path.is_file() {
            continue;
        }
        let parsed = std::fs::read_to_string(&path)
            .context("Failed to read file")
            .and_then(|text| CurveCert::parse(&text));
        match parsed {
            Ok(cert) => {
                tracing::debug!(path = %path.display(), key = %cert.public_text(), "Loaded public key");
                keys.insert(cert.public_key);
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "Skipping certificate: {e:#}");
            }
        }
    }
    tracing::info!("Loaded {} public keys", keys.len());
    Ok(keys)
}

pub fn ensure_curve_support() -> Result<()> {
    match zmq::has("curve") {
        Some(true) => Ok(()),
        _ => bail!("libzmq was built without CURVE support"),
    }
}

pub fn encode_key(key: &CurveKey) -> String {
    // Z85 encoding of 32 bytes cannot fail: the length is a multiple of 4.
    zmq::z85_encode(key).unwrap_or_default()
}

pub fn decode_key(text: &str) -> Result<CurveKey> {
    let bytes = zmq::z85_decode(text).map_err(|e| anyhow!("Invalid Z85 text: {e:?}"))?;
    CurveKey::try_from(bytes.as_slice())
        .map_err(|_| anyhow!("Expected 32 byte key, got {} bytes", bytes.len()))
}

/// Where the secret half of the certificate at `path` lives.
pub fn secret_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(SECRET_SUFFIX);
    PathBuf::from(name)
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt as _;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions of {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> Result<()> {
    Ok(())
}

type Sections = BTreeMap<String, BTreeMap<String, String>>;

/// Minimal ZPL reader: top-level section names and one level of `name = value` pairs.
fn parse_zpl(text: &str) -> Result<Sections> {
    let mut sections = Sections::new();
    let mut current: Option<String> = None;

    for (number, line) in text.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let indented = line.starts_with(char::is_whitespace);
        if !indented {
            let name = trimmed.split('=').next().unwrap_or(trimmed).trim();
            sections.entry(name.to_owned()).or_default();
            current = Some(name.to_owned());
            continue;
        }

        let section = current
            .as_ref()
            .ok_or_else(|| anyhow!("Line {}: property outside of a section", number + 1))?;
        let (name, value) = trimmed
            .split_once('=')
            .ok_or_else(|| anyhow!("Line {}: expected 'name = value'", number + 1))?;
        let value = value.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
            .unwrap_or(value);

        sections
            .entry(section.clone())
            .or_default()
            .insert(name.trim().to_owned(), value.to_owned());
    }
    Ok(sections)
}
