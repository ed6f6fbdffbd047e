//! Local certificate cache.
//!
//! The last issued certificate of each domain group is kept on disk so the next pass can decide
//! renewal without asking the CA, and so it can be republished if the cluster lost it.
//!
//! # Directory Structure
//!
//! ```text
//! <persist dir>/
//! ├── example.com.crt     # certificate chain (PEM)
//! ├── example.com.key     # private key (PEM, 0600)
//! └── example.com.json    # domains covered, generation last published
//! ```
//!
//! Files are named after the group's primary domain.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use eyre::WrapErr as _;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::{
    cert::Certificate,
    naming::{DomainGroup, Generation},
};

/// Bookkeeping stored next to a cached certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMeta {
    /// Domains the cached certificate was issued for.
    pub domains: Vec<String>,

    /// Generation under which the cached material was last published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<String>,
}

impl CacheMeta {
    pub fn generation(&self) -> Option<Generation> {
        self.generation.as_deref().and_then(Generation::parse)
    }
}

#[derive(Debug, Clone)]
pub struct CertCache {
    dir: PathBuf,
}

impl CertCache {
    pub fn new(dir: impl Into<PathBuf>) -> CertCache {
        CertCache { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn cert_path(&self, group: &DomainGroup) -> PathBuf {
        self.path(group, "crt")
    }

    pub fn key_path(&self, group: &DomainGroup) -> PathBuf {
        self.path(group, "key")
    }

    fn meta_path(&self, group: &DomainGroup) -> PathBuf {
        self.path(group, "json")
    }

    fn path(&self, group: &DomainGroup, ext: &str) -> PathBuf {
        self.dir.join(format!("{}.{ext}", group.primary_domain()))
    }

    /// Loads the cached pair, or `None` if either half is missing or empty.
    pub fn load(&self, group: &DomainGroup) -> Option<Certificate> {
        let certificate = read_non_empty(&self.cert_path(group))?;
        let private_key = Zeroizing::new(read_non_empty(&self.key_path(group))?);

        Some(Certificate::new(private_key, certificate))
    }

    pub fn load_meta(&self, group: &DomainGroup) -> Option<CacheMeta> {
        let path = self.meta_path(group);
        let content = read_non_empty(&path)?;

        serde_json::from_str(&content)
            .map_err(|err| log::debug!("ignoring cache metadata {}: {err}", path.display()))
            .ok()
    }

    /// Writes the pair with owner-only permissions.
    ///
    /// The metadata is dropped first: whatever it records belongs to the previous pair. If
    /// writing the pair fails halfway, the certificate is removed so the group reads as due.
    pub fn store(&self, group: &DomainGroup, cert: &Certificate) -> eyre::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;

        remove_if_exists(&self.meta_path(group))?;

        let written = write_private(&self.cert_path(group), cert.certificate().as_bytes())
            .and_then(|()| write_private(&self.key_path(group), cert.private_key().as_bytes()));

        if let Err(err) = written {
            if let Err(cleanup) = remove_if_exists(&self.cert_path(group)) {
                log::warn!("{cleanup:#}");
            }
            return Err(err);
        }

        log::debug!("cached certificate for group {}", group.id());
        Ok(())
    }

    pub fn store_meta(&self, group: &DomainGroup, meta: &CacheMeta) -> eyre::Result<()> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("create {}", self.dir.display()))?;

        let content = serde_json::to_string_pretty(meta)?;
        write_private(&self.meta_path(group), content.as_bytes())
    }
}

fn read_non_empty(path: &Path) -> Option<String> {
    match fs::read_to_string(path) {
        Ok(content) if !content.trim().is_empty() => Some(content),
        Ok(_) => None,
        Err(err) => {
            log::trace!("cannot read {}: {err}", path.display());
            None
        }
    }
}

fn remove_if_exists(path: &Path) -> eyre::Result<()> {
    match fs::remove_file(path) {
        Err(err) if err.kind() != io::ErrorKind::NotFound => {
            Err(err).with_context(|| format!("remove {}", path.display()))
        }
        _ => Ok(()),
    }
}

fn write_private(path: &Path, content: &[u8]) -> eyre::Result<()> {
    fs::write(path, content).with_context(|| format!("write {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("restrict {}", path.display()))?;
    }

    Ok(())
}
