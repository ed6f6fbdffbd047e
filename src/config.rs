//! Runtime configuration.
//!
//! Read once at startup from the environment; every component receives what it needs from the
//! resulting [`Config`] value.

use std::{fs, path::PathBuf, time::Duration};

use eyre::{bail, eyre};

use crate::{
    cert::DEFAULT_RENEW_DAYS,
    cluster::{AcmeAccount, ExternalAccountBinding},
    lego::KeyType,
    naming::{ConfigFamily, DomainGroup},
};

const DEFAULT_LABELS: &str = "edge.traefik.service=true";
const DEFAULT_INTERVAL: Duration = Duration::from_secs(12 * 3600);
const DEFAULT_RETAIN: usize = 2;
const DEFAULT_PERSIST_DIR: &str = "/data/.lego";
const DEFAULT_TLS_CONFIG_PREFIX: &str = "prod-edge-traefik-certs";
const DEFAULT_TLS_CONFIG_TARGET: &str = "/etc/traefik/dynamic/certs.yml";
const DEFAULT_DOCKER_HOST: &str = "unix:///var/run/docker.sock";
const DEFAULT_LEGO_BIN: &str = "lego";

/// How configured domains are grouped into certificates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CertMode {
    /// One certificate carrying every domain as a SAN.
    #[default]
    San,

    /// One certificate per domain.
    Split,
}

impl CertMode {
    /// Parses a mode name; anything but `split` means san.
    pub fn parse(mode: &str) -> CertMode {
        if mode.trim().eq_ignore_ascii_case("split") {
            CertMode::Split
        } else {
            CertMode::San
        }
    }
}

/// Emission of the dynamic TLS config artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsConfigOptions {
    pub family: ConfigFamily,

    /// Path of the document inside the container.
    pub target: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `key=value` labels selecting target services.
    pub labels: Vec<(String, String)>,
    pub domains: Vec<String>,
    pub mode: CertMode,
    pub account: AcmeAccount,
    pub dns_provider: String,
    pub key_type: KeyType,
    pub renew_days: i64,

    /// Unreferenced generations kept per group.
    pub retain: usize,
    pub persist_dir: PathBuf,
    pub tls_config: Option<TlsConfigOptions>,
    pub interval: Duration,

    /// Extra environment for the issuer, loaded from secret files.
    pub provider_env: Vec<(String, String)>,
    pub docker_host: String,
    pub lego_bin: PathBuf,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> eyre::Result<Config> {
        Config::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, which maps variable names to values.
    ///
    /// Empty values count as unset. Fails only when a required variable is missing or the
    /// domain list is empty.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> eyre::Result<Config> {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());
        let required = |key: &str| var(key).ok_or_else(|| eyre!("missing env {key}"));

        let domains = parse_csv(&required("DOMAINS")?);
        if domains.is_empty() {
            bail!("no domains provided in DOMAINS");
        }

        let labels = var("EDGE_SERVICE_LABELS")
            .or_else(|| var("EDGE_SERVICE_LABEL"))
            .unwrap_or_else(|| DEFAULT_LABELS.to_owned());

        let external_binding = match (var("EAB_KID"), var("EAB_HMAC")) {
            (Some(key_id), Some(hmac_key)) => Some(ExternalAccountBinding { key_id, hmac_key }),
            _ => None,
        };

        let tls_config = var("TLS_CONFIG_ENABLE")
            .is_some_and(|enable| enable.trim().eq_ignore_ascii_case("true"))
            .then(|| TlsConfigOptions {
                family: ConfigFamily::new(
                    var("TLS_CONFIG_NAME_PREFIX")
                        .unwrap_or_else(|| DEFAULT_TLS_CONFIG_PREFIX.to_owned()),
                ),
                target: var("TLS_CONFIG_TARGET")
                    .unwrap_or_else(|| DEFAULT_TLS_CONFIG_TARGET.to_owned())
                    .into(),
            });

        Ok(Config {
            labels: parse_labels(&labels),
            domains,
            mode: var("CERT_MODE").map_or(CertMode::San, |mode| CertMode::parse(&mode)),
            account: AcmeAccount {
                email: required("LEGO_EMAIL")?,
                server: var("ACME_SERVER"),
                external_binding,
            },
            dns_provider: required("DNS_PROVIDER")?,
            key_type: var("KEY_SET").map_or(KeyType::default(), |key| KeyType::parse(&key)),
            renew_days: var("RENEW_DAYS")
                .and_then(|days| days.trim().parse().ok())
                .unwrap_or(DEFAULT_RENEW_DAYS),
            retain: var("RETAIN_GENERATIONS")
                .and_then(|n| n.trim().parse().ok())
                .filter(|&n| n > 0)
                .unwrap_or(DEFAULT_RETAIN),
            persist_dir: var("PERSIST_DIR")
                .unwrap_or_else(|| DEFAULT_PERSIST_DIR.to_owned())
                .into(),
            tls_config,
            interval: var("LOOP_INTERVAL")
                .and_then(|interval| parse_duration(&interval))
                .filter(|interval| !interval.is_zero())
                .unwrap_or(DEFAULT_INTERVAL),
            provider_env: var("PROVIDER_ENV_FILES")
                .map(|files| load_env_files(&files))
                .unwrap_or_default(),
            docker_host: var("DOCKER_HOST").unwrap_or_else(|| DEFAULT_DOCKER_HOST.to_owned()),
            lego_bin: var("LEGO_BIN")
                .unwrap_or_else(|| DEFAULT_LEGO_BIN.to_owned())
                .into(),
        })
    }

    /// Domain groups processed on every pass, in configuration order.
    pub fn domain_groups(&self) -> Vec<DomainGroup> {
        match self.mode {
            CertMode::San => vec![DomainGroup::san(self.domains.clone())],
            CertMode::Split => self
                .domains
                .iter()
                .map(|domain| DomainGroup::single(domain))
                .collect(),
        }
    }

    pub fn config_family(&self) -> Option<&ConfigFamily> {
        self.tls_config.as_ref().map(|options| &options.family)
    }
}

fn parse_csv(csv: &str) -> Vec<String> {
    csv.split(',')
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parses `k=v,k2=v2`, skipping malformed entries.
fn parse_labels(csv: &str) -> Vec<(String, String)> {
    parse_csv(csv)
        .into_iter()
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((key.trim().to_owned(), value.trim().to_owned()))
        })
        .collect()
}

/// Reads `VAR=/path/to/file` pairs into `(VAR, trimmed file content)`.
///
/// Unreadable files are logged and skipped.
fn load_env_files(csv: &str) -> Vec<(String, String)> {
    parse_labels(csv)
        .into_iter()
        .filter_map(|(key, path)| match fs::read_to_string(&path) {
            Ok(content) => Some((key, content.trim().to_owned())),
            Err(err) => {
                log::warn!("env file read {path}: {err}");
                None
            }
        })
        .collect()
}

/// Parses durations such as `12h`, `90m`, `1h30m` or `45s`.
fn parse_duration(input: &str) -> Option<Duration> {
    humantime::parse_duration(input.trim())
        .map_err(|err| log::warn!("ignoring LOOP_INTERVAL {input:?}: {err}"))
        .ok()
}
