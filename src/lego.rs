//! Certificate issuance through the `lego` ACME client.
//!
//! Each call runs `lego ... run` with a DNS-01 provider and reads the resulting PEM files from
//! its working directory:
//!
//! ```text
//! <work dir>/
//! ├── accounts/                     # ACME account registrations, managed by lego
//! └── certificates/
//!     ├── _.example.com.crt         # chain, named after the first domain ('*' becomes '_')
//!     └── _.example.com.key
//! ```

use std::{
    fmt, fs,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use eyre::{bail, eyre, WrapErr as _};
use tokio::process::Command;
use zeroize::Zeroizing;

use crate::{
    cert::Certificate,
    cluster::{AcmeAccount, CertificateIssuer},
};

/// Private key algorithm of issued certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum KeyType {
    #[default]
    Ec256,
    Ec384,
    Rsa2048,
    Rsa4096,
}

impl KeyType {
    /// Parses a key set name, falling back to EC P-256 for anything unknown.
    pub fn parse(name: &str) -> KeyType {
        match name.trim().to_ascii_lowercase().as_str() {
            "ec384" => KeyType::Ec384,
            "rsa2048" => KeyType::Rsa2048,
            "rsa4096" => KeyType::Rsa4096,
            _ => KeyType::Ec256,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KeyType::Ec256 => "ec256",
            KeyType::Ec384 => "ec384",
            KeyType::Rsa2048 => "rsa2048",
            KeyType::Rsa4096 => "rsa4096",
        }
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Runs the `lego` binary to obtain certificates via DNS-01.
#[derive(Debug, Clone)]
pub struct LegoIssuer {
    bin: PathBuf,
    dns_provider: String,
    key_type: KeyType,
    work_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl LegoIssuer {
    pub fn new(
        bin: impl Into<PathBuf>,
        dns_provider: impl Into<String>,
        key_type: KeyType,
        work_dir: impl Into<PathBuf>,
    ) -> LegoIssuer {
        LegoIssuer {
            bin: bin.into(),
            dns_provider: dns_provider.into(),
            key_type,
            work_dir: work_dir.into(),
            env: Vec::new(),
        }
    }

    /// Adds variables to the child environment only, typically DNS provider credentials.
    pub fn with_env(mut self, env: Vec<(String, String)>) -> LegoIssuer {
        self.env.extend(env);
        self
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    fn args(&self, account: &AcmeAccount, domains: &[String]) -> Vec<String> {
        let mut args = vec![
            "--accept-tos".to_owned(),
            "--email".to_owned(),
            account.email.clone(),
            "--dns".to_owned(),
            self.dns_provider.clone(),
            "--path".to_owned(),
            self.work_dir.display().to_string(),
            "--key-type".to_owned(),
            self.key_type.to_string(),
        ];

        if let Some(server) = &account.server {
            args.extend(["--server".to_owned(), server.clone()]);
        }

        if let Some(eab) = &account.external_binding {
            args.extend([
                "--eab".to_owned(),
                "--kid".to_owned(),
                eab.key_id.clone(),
                "--hmac".to_owned(),
                eab.hmac_key.clone(),
            ]);
        }

        for domain in domains {
            args.extend(["--domains".to_owned(), domain.clone()]);
        }

        args.push("run".to_owned());
        args
    }

    fn output_path(&self, primary: &str, ext: &str) -> PathBuf {
        self.work_dir
            .join("certificates")
            .join(format!("{}.{ext}", primary.replace('*', "_")))
    }
}

#[async_trait]
impl CertificateIssuer for LegoIssuer {
    async fn obtain(
        &self,
        account: &AcmeAccount,
        domains: &[String],
    ) -> eyre::Result<Certificate> {
        let primary = domains
            .first()
            .ok_or_else(|| eyre!("no domains to issue for"))?;

        fs::create_dir_all(&self.work_dir)
            .with_context(|| format!("create {}", self.work_dir.display()))?;

        log::debug!("running {} for {}", self.bin.display(), domains.join(","));

        let output = Command::new(&self.bin)
            .args(self.args(account, domains))
            .envs(self.env.iter().map(|(key, value)| (key, value)))
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("spawn {}", self.bin.display()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("lego {}: {}", output.status, stderr.trim());
        }

        let cert_path = self.output_path(primary, "crt");
        let key_path = self.output_path(primary, "key");

        let certificate = fs::read_to_string(&cert_path)
            .with_context(|| format!("read {}", cert_path.display()))?;
        let private_key = Zeroizing::new(
            fs::read_to_string(&key_path)
                .with_context(|| format!("read {}", key_path.display()))?,
        );

        Certificate::parse(private_key, certificate)
            .with_context(|| format!("certificate issued for {primary}"))
    }
}
