//! Artifact naming scheme.
//!
//! Every secret this crate creates is named
//!
//! ```text
//! edge_tls_<crt|key>_<generation>            (san mode, one group)
//! edge_tls_<crt|key>_<group>_<generation>    (split mode, one group per domain)
//! ```
//!
//! The `edge_tls_crt_` / `edge_tls_key_` prefixes mark the managed namespace: any secret or
//! service reference carrying one of them is owned by the rotator, everything else belongs to
//! somebody else and is never touched. Dynamic config artifacts use a configurable prefix instead,
//! see [`ConfigFamily`].
//!
//! # Generations
//!
//! A [`Generation`] is a fixed-width `YYYYMMDDHHMM` UTC timestamp. Retention relies on lexical
//! order of generation strings being chronological order, so the width must never change.

use std::fmt;

use time::{macros::format_description, OffsetDateTime};

/// Name prefix of managed certificate secrets.
pub const CERT_PREFIX: &str = "edge_tls_crt_";

/// Name prefix of managed private key secrets.
pub const KEY_PREFIX: &str = "edge_tls_key_";

/// Group identifier used when all domains share one certificate.
pub const SAN_GROUP: &str = "san";

/// In-container mount name of the certificate in san mode.
pub const SAN_CERT_MOUNT: &str = "edge_tls_crt";

/// In-container mount name of the private key in san mode.
pub const SAN_KEY_MOUNT: &str = "edge_tls_key";

/// Directory under which the orchestrator mounts secrets inside containers.
pub const SECRETS_DIR: &str = "/run/secrets";

/// Generations shorter than this are not recognized.
const MIN_GENERATION_LEN: usize = 8;

/// Returns true if `name` lies in the managed certificate/key namespace.
pub fn is_managed_secret(name: &str) -> bool {
    name.starts_with(CERT_PREFIX) || name.starts_with(KEY_PREFIX)
}

/// Kind of material held by a managed secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ArtifactKind {
    Cert,
    Key,
}

impl ArtifactKind {
    pub const ALL: [ArtifactKind; 2] = [ArtifactKind::Cert, ArtifactKind::Key];

    pub fn prefix(self) -> &'static str {
        match self {
            ArtifactKind::Cert => CERT_PREFIX,
            ArtifactKind::Key => KEY_PREFIX,
        }
    }

    fn san_mount(self) -> &'static str {
        match self {
            ArtifactKind::Cert => SAN_CERT_MOUNT,
            ArtifactKind::Key => SAN_KEY_MOUNT,
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ArtifactKind::Cert => "crt",
            ArtifactKind::Key => "key",
        })
    }
}

/// Rotation cycle label.
///
/// Always ASCII digits, at least eight of them. Derived `Ord` is lexical, which matches
/// chronological order for equal-width labels.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(String);

impl Generation {
    /// Generation label for `at`, with minute resolution.
    pub fn at(at: OffsetDateTime) -> Generation {
        let at = at.to_offset(time::UtcOffset::UTC);
        let fmt = format_description!("[year][month][day][hour][minute]");

        // only fails for years outside 0..=9999
        let label = at.format(&fmt).unwrap_or_else(|_| {
            format!(
                "{:04}{:02}{:02}{:02}{:02}",
                at.year().clamp(0, 9999),
                u8::from(at.month()),
                at.day(),
                at.hour(),
                at.minute()
            )
        });

        Generation(label)
    }

    /// Parses a generation label, rejecting short or non-numeric input.
    pub fn parse(label: &str) -> Option<Generation> {
        if label.len() < MIN_GENERATION_LEN || !label.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }

        Some(Generation(label.to_owned()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A set of hostnames covered by one certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainGroup {
    id: String,
    domains: Vec<String>,
}

impl DomainGroup {
    /// One group bundling every domain into a single SAN certificate.
    pub fn san(domains: Vec<String>) -> DomainGroup {
        DomainGroup {
            id: SAN_GROUP.to_owned(),
            domains,
        }
    }

    /// A group covering a single domain, identified by its transliterated name.
    pub fn single(domain: &str) -> DomainGroup {
        DomainGroup {
            id: transliterate(domain),
            domains: vec![domain.to_owned()],
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_san(&self) -> bool {
        self.id == SAN_GROUP
    }

    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    /// First domain of the group; names the local cache files.
    pub fn primary_domain(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or(&self.id)
    }

    /// Name of the `kind` artifact of this group for `generation`.
    pub fn artifact(&self, kind: ArtifactKind, generation: &Generation) -> ArtifactName {
        ArtifactName {
            kind,
            group: self.id.clone(),
            generation: generation.clone(),
        }
    }
}

/// Maps a domain onto a name segment safe for artifact names and hostnames.
///
/// `*.example.com` becomes `star-example-com`.
pub fn transliterate(domain: &str) -> String {
    domain.replace('*', "star").replace('.', "-")
}

/// Parsed form of a managed secret name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArtifactName {
    pub kind: ArtifactKind,
    pub group: String,
    pub generation: Generation,
}

impl ArtifactName {
    /// Parses a secret name back into its parts.
    ///
    /// Returns `None` for names outside the managed namespace and for managed-looking names
    /// with a malformed generation. Callers must leave such artifacts alone.
    pub fn parse(name: &str) -> Option<ArtifactName> {
        let (kind, rest) = ArtifactKind::ALL
            .into_iter()
            .find_map(|kind| name.strip_prefix(kind.prefix()).map(|rest| (kind, rest)))?;

        let (group, label) = match rest.rsplit_once('_') {
            Some((group, label)) if !group.is_empty() => (group, label),
            Some(_) => return None,
            None => (SAN_GROUP, rest),
        };

        Some(ArtifactName {
            kind,
            group: group.to_owned(),
            generation: Generation::parse(label)?,
        })
    }

    /// File name the reference to this artifact mounts under.
    ///
    /// San mode keeps fixed names so consumers can point at stable paths; split mode mounts
    /// each artifact under its own name.
    pub fn mount_name(&self) -> String {
        if self.group == SAN_GROUP {
            self.kind.san_mount().to_owned()
        } else {
            self.to_string()
        }
    }
}

impl fmt::Display for ArtifactName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group == SAN_GROUP {
            write!(f, "{}{}", self.kind.prefix(), self.generation)
        } else {
            write!(f, "{}{}_{}", self.kind.prefix(), self.group, self.generation)
        }
    }
}

/// Family of dynamic config artifacts sharing a configured prefix.
///
/// Members are named `<prefix>_<generation>.yml`; one member is produced per pass and covers
/// every domain group of that pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFamily {
    prefix: String,
}

impl ConfigFamily {
    pub fn new(prefix: impl Into<String>) -> ConfigFamily {
        ConfigFamily {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn name(&self, generation: &Generation) -> String {
        format!("{}_{generation}.yml", self.prefix)
    }

    /// Returns true if `name` belongs to this family.
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(&self.prefix)
            .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Generation of a family member, if the name is well formed.
    pub fn generation_of(&self, name: &str) -> Option<Generation> {
        let rest = name.strip_prefix(&self.prefix)?.strip_prefix('_')?;
        let label = rest.strip_suffix(".yml").unwrap_or(rest);
        Generation::parse(label)
    }
}
