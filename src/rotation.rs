//! The rotation cycle.
//!
//! A pass walks every labelled service and, per domain group, either reuses the material the
//! cluster already holds or issues and publishes a new generation. The service spec is then
//! rewritten onto the new references and older generations are retired.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use eyre::{bail, WrapErr as _};
use time::OffsetDateTime;

use crate::{
    api::{ConfigReference, Reference, SecretReference, Service, ServiceSpec},
    cache::{CacheMeta, CertCache},
    cert::{should_renew_at, Certificate},
    cluster::{ArtifactClass, ArtifactStore, CertificateIssuer, ServiceRegistry},
    config::{Config, TlsConfigOptions},
    error::Degraded,
    gc::RetentionGc,
    naming::{ArtifactKind, ArtifactName, DomainGroup, Generation},
    publish::{ArtifactPublisher, TlsConfigDocument},
    rewrite::{config_reference, secret_reference, ServiceSpecRewriter},
};

/// What a pass did to one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceOutcome {
    /// The spec was rewritten onto new references.
    Updated,

    /// The spec already carried the current references.
    Unchanged,

    /// Nothing was applied to the service; retried next pass.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceReport {
    pub service: String,
    pub outcome: ServiceOutcome,

    /// Groups that kept their previous references because preparing them failed.
    pub failed_groups: Vec<String>,

    /// Artifacts retired by retention.
    pub deleted: Vec<String>,
}

impl ServiceReport {
    fn failed(service: &str, err: &eyre::Report) -> ServiceReport {
        ServiceReport {
            service: service.to_owned(),
            outcome: ServiceOutcome::Failed(format!("{err:#}")),
            failed_groups: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub generation: Generation,
    pub services: Vec<ServiceReport>,
}

impl PassReport {
    fn count(&self, f: impl Fn(&ServiceOutcome) -> bool) -> usize {
        self.services.iter().filter(|s| f(&s.outcome)).count()
    }
}

impl fmt::Display for PassReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "pass {}: {} updated, {} unchanged, {} failed",
            self.generation,
            self.count(|o| *o == ServiceOutcome::Updated),
            self.count(|o| *o == ServiceOutcome::Unchanged),
            self.count(|o| matches!(o, ServiceOutcome::Failed(_))),
        )
    }
}

/// References to the certificate and key of one domain group.
#[derive(Debug, Clone)]
struct GroupMaterial {
    cert: SecretReference,
    key: SecretReference,
}

/// Config artifacts published during one pass, by name, with the document they hold.
///
/// Services sharing a pass share its generation and therefore the config artifact name.
type PublishedConfigs = HashMap<String, (String, ConfigReference)>;

/// Drives certificate rotation for the labelled services.
pub struct Rotator {
    config: Config,
    issuer: Arc<dyn CertificateIssuer>,
    store: Arc<dyn ArtifactStore>,
    registry: Arc<dyn ServiceRegistry>,
    cache: CertCache,
}

impl Rotator {
    pub fn new(
        config: Config,
        issuer: Arc<dyn CertificateIssuer>,
        store: Arc<dyn ArtifactStore>,
        registry: Arc<dyn ServiceRegistry>,
    ) -> Rotator {
        let cache = CertCache::new(&config.persist_dir);

        Rotator {
            config,
            issuer,
            store,
            registry,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Runs a pass immediately and then again an interval after each pass ends, forever.
    ///
    /// A failed pass is logged and retried after the next sleep.
    pub async fn run(&self) {
        log::info!(
            "rotating {} for services labelled {} every {:?}",
            self.config.domains.join(","),
            format_labels(&self.config.labels),
            self.config.interval,
        );

        loop {
            match self.run_pass().await {
                Ok(report) => log::info!("{report}"),
                Err(err) => log::error!("rotation pass failed: {err:#}"),
            }

            tokio::time::sleep(self.config.interval).await;
        }
    }

    pub async fn run_pass(&self) -> eyre::Result<PassReport> {
        self.run_pass_at(OffsetDateTime::now_utc()).await
    }

    /// Runs one pass as if the clock read `now`.
    ///
    /// Only listing the services can fail the pass as a whole; every other failure is confined
    /// to the service it happened on.
    pub async fn run_pass_at(&self, now: OffsetDateTime) -> eyre::Result<PassReport> {
        let generation = Generation::at(now);

        let services = self
            .registry
            .list(&self.config.labels)
            .await
            .wrap_err("list services")?;

        if services.is_empty() {
            log::warn!(
                "no services labelled {}",
                format_labels(&self.config.labels)
            );
        }

        let mut report = PassReport {
            generation: generation.clone(),
            services: Vec::with_capacity(services.len()),
        };

        let mut configs = PublishedConfigs::new();

        for service in &services {
            let service_report = match self
                .rotate_service(service, &generation, now, &mut configs)
                .await
            {
                Ok(service_report) => service_report,
                Err(err) => {
                    log::error!("service {}: {err:#}", service.name());
                    ServiceReport::failed(service.name(), &err)
                }
            };

            report.services.push(service_report);
        }

        Ok(report)
    }

    async fn rotate_service(
        &self,
        service: &Service,
        generation: &Generation,
        now: OffsetDateTime,
        configs: &mut PublishedConfigs,
    ) -> eyre::Result<ServiceReport> {
        let groups = self.config.domain_groups();

        let mut prepared = Vec::with_capacity(groups.len());
        for group in &groups {
            let material = self.prepare_group(group, generation, now).await;

            if let Err(err) = &material {
                log::error!("service {}: group {}: {err:#}", service.name(), group.id());
            }

            prepared.push((group, material.ok()));
        }

        // fetched last so the version index is as fresh as possible
        let current = self
            .registry
            .inspect(&service.id)
            .await
            .wrap_err("inspect service")?;
        let rewriter = ServiceSpecRewriter::new(self.config.config_family());

        let mut secrets = Vec::new();
        let mut failed_groups = Vec::new();

        for (group, material) in prepared {
            match material {
                Some(GroupMaterial { cert, key }) => secrets.extend([cert, key]),
                None => {
                    failed_groups.push(group.id().to_owned());
                    secrets.extend(carried_forward(&rewriter, &current.spec, group));
                }
            }
        }

        if failed_groups.len() == groups.len() {
            bail!("no domain group could be prepared");
        }

        let mut report = ServiceReport {
            service: current.name().to_owned(),
            outcome: ServiceOutcome::Unchanged,
            failed_groups,
            deleted: Vec::new(),
        };

        let existing_config = rewriter
            .managed_configs(&current.spec)
            .into_iter()
            .next()
            .cloned();
        let converged = rewriter.is_converged(&current.spec, &secrets, existing_config.as_ref())
            && (self.config.tls_config.is_none() || existing_config.is_some());

        let spec = if converged {
            log::info!(
                "service {} already references the current certificates",
                report.service
            );
            current.spec
        } else {
            let config = match &self.config.tls_config {
                Some(options) => Some(
                    self.publish_config(options, generation, &secrets, configs)
                        .await?,
                ),
                None => None,
            };

            let spec = rewriter.rewrite(&current.spec, &secrets, config.as_ref());
            self.registry
                .update(&current.id, current.version.index, &spec)
                .await
                .wrap_err("update service")?;

            log::info!(
                "updated service {} onto {}",
                report.service,
                secrets
                    .iter()
                    .map(|r| r.artifact_name())
                    .collect::<Vec<_>>()
                    .join(", ")
            );

            report.outcome = ServiceOutcome::Updated;
            spec
        };

        report.deleted = self.collect_garbage(&spec).await;

        Ok(report)
    }

    /// Makes the material of `group` available in the store.
    ///
    /// Reuses the generation last published for the cached certificate when it still exists,
    /// so an unchanged certificate is not republished on every pass.
    async fn prepare_group(
        &self,
        group: &DomainGroup,
        generation: &Generation,
        now: OffsetDateTime,
    ) -> eyre::Result<GroupMaterial> {
        let meta = self.cache.load_meta(group);
        let cached = self.cache.load(group);

        let domains_changed = meta
            .as_ref()
            .is_some_and(|meta| meta.domains != group.domains());
        let due = should_renew_at(&self.cache.cert_path(group), self.config.renew_days, now);

        let cert = match cached {
            Some(cert) if !due && !domains_changed => {
                if let Some(published) = meta.as_ref().and_then(CacheMeta::generation) {
                    if let Some(material) = self.find_published(group, &published).await? {
                        log::debug!("group {} still on generation {published}", group.id());
                        return Ok(material);
                    }

                    log::info!(
                        "generation {published} of group {} is gone, republishing",
                        group.id()
                    );
                }

                cert
            }
            _ => self.issue(group, now).await?,
        };

        let material = self.publish_group(group, generation, &cert).await?;
        self.remember(group, Some(generation));

        Ok(material)
    }

    async fn issue(&self, group: &DomainGroup, now: OffsetDateTime) -> eyre::Result<Certificate> {
        log::info!("requesting certificate for {}", group.domains().join(","));

        let cert = self
            .issuer
            .obtain(&self.config.account, group.domains())
            .await
            .wrap_err("obtain certificate")?;

        match cert.valid_days_left(now) {
            Ok(days) => log::info!("certificate for group {} valid for {days} days", group.id()),
            Err(err) => log::warn!("certificate for group {}: {err:#}", group.id()),
        }

        // storing drops the recorded generation, which belongs to the previous certificate
        match self.cache.store(group, &cert) {
            Ok(()) => self.remember(group, None),
            Err(err) => Degraded::new("cache certificate", group.id(), err).log(),
        }

        Ok(cert)
    }

    fn remember(&self, group: &DomainGroup, generation: Option<&Generation>) {
        let meta = CacheMeta {
            domains: group.domains().to_vec(),
            generation: generation.map(Generation::to_string),
        };

        if let Err(err) = self.cache.store_meta(group, &meta) {
            Degraded::new("record cache metadata", group.id(), err).log();
        }
    }

    async fn find_published(
        &self,
        group: &DomainGroup,
        generation: &Generation,
    ) -> eyre::Result<Option<GroupMaterial>> {
        let cert = self.lookup(&group.artifact(ArtifactKind::Cert, generation)).await?;
        let key = self.lookup(&group.artifact(ArtifactKind::Key, generation)).await?;

        Ok(cert.zip(key).map(|(cert, key)| GroupMaterial { cert, key }))
    }

    async fn lookup(&self, name: &ArtifactName) -> eyre::Result<Option<SecretReference>> {
        let full = name.to_string();

        let found = self
            .store
            .list(ArtifactClass::Secret, Some(&full))
            .await
            .wrap_err_with(|| format!("look up secret {full}"))?
            .into_iter()
            .find(|meta| meta.name == full);

        Ok(found.map(|meta| secret_reference(&meta.id, &meta.name, &name.mount_name())))
    }

    async fn publish_group(
        &self,
        group: &DomainGroup,
        generation: &Generation,
        cert: &Certificate,
    ) -> eyre::Result<GroupMaterial> {
        let cert_name = group.artifact(ArtifactKind::Cert, generation);
        let key_name = group.artifact(ArtifactKind::Key, generation);

        Ok(GroupMaterial {
            cert: self
                .publish_secret(&cert_name, cert.certificate().as_bytes())
                .await?,
            key: self
                .publish_secret(&key_name, cert.private_key().as_bytes())
                .await?,
        })
    }

    async fn publish_secret(
        &self,
        name: &ArtifactName,
        data: &[u8],
    ) -> eyre::Result<SecretReference> {
        let full = name.to_string();

        let published = ArtifactPublisher::new(&*self.store)
            .publish(ArtifactClass::Secret, &full, data)
            .await
            .wrap_err_with(|| format!("publish secret {full}"))?;
        log_degraded(&published.degraded);

        Ok(secret_reference(
            &published.id,
            &published.name,
            &name.mount_name(),
        ))
    }

    async fn publish_config(
        &self,
        options: &TlsConfigOptions,
        generation: &Generation,
        secrets: &[SecretReference],
        configs: &mut PublishedConfigs,
    ) -> eyre::Result<ConfigReference> {
        let name = options.family.name(generation);
        let document = tls_document(secrets).render()?;

        // an earlier service of this pass may already be running on it
        if let Some((published, reference)) = configs.get(&name) {
            if *published == document {
                log::debug!("reusing config {name}");
                return Ok(reference.clone());
            }

            bail!("config {name} was already published this pass with other certificates");
        }

        let published = ArtifactPublisher::new(&*self.store)
            .publish(ArtifactClass::Config, &name, document.as_bytes())
            .await
            .wrap_err_with(|| format!("publish config {name}"))?;
        log_degraded(&published.degraded);

        let reference = config_reference(&published.id, &published.name, &options.target);
        configs.insert(name, (document, reference.clone()));

        Ok(reference)
    }

    /// Retires superseded generations, protecting everything `spec` references.
    async fn collect_garbage(&self, spec: &ServiceSpec) -> Vec<String> {
        let gc = RetentionGc::new(&*self.store, self.config.retain);
        let cs = &spec.task_template.container_spec;
        let mut deleted = Vec::new();

        let live = cs
            .secrets
            .iter()
            .map(|r| r.artifact_name())
            .collect::<HashSet<_>>();

        match gc.collect_secrets(&live).await {
            Ok(report) => {
                log_degraded(&report.degraded);
                deleted.extend(report.deleted);
            }
            Err(err) => Degraded::new("gc", "secrets", err).log(),
        }

        if let Some(family) = self.config.config_family() {
            let live = cs
                .configs
                .iter()
                .map(|r| r.artifact_name())
                .collect::<HashSet<_>>();

            match gc.collect_configs(&live, family).await {
                Ok(report) => {
                    log_degraded(&report.degraded);
                    deleted.extend(report.deleted);
                }
                Err(err) => Degraded::new("gc", "configs", err).log(),
            }
        }

        deleted
    }
}

/// Managed references of `group` currently in `spec`.
fn carried_forward(
    rewriter: &ServiceSpecRewriter<'_>,
    spec: &ServiceSpec,
    group: &DomainGroup,
) -> Vec<SecretReference> {
    rewriter
        .managed_secrets(spec)
        .into_iter()
        .filter(|r| {
            ArtifactName::parse(r.artifact_name()).is_some_and(|name| name.group == group.id())
        })
        .cloned()
        .collect()
}

/// Pairs each certificate reference with the key of the same group and generation.
fn tls_document(secrets: &[SecretReference]) -> TlsConfigDocument {
    let parsed = secrets
        .iter()
        .filter_map(|r| Some((ArtifactName::parse(r.artifact_name())?, r)))
        .collect::<Vec<_>>();

    let mut document = TlsConfigDocument::new();

    for (name, cert) in parsed.iter().filter(|(name, _)| name.kind == ArtifactKind::Cert) {
        let key = parsed.iter().find(|(other, _)| {
            other.kind == ArtifactKind::Key
                && other.group == name.group
                && other.generation == name.generation
        });

        if let Some((_, key)) = key {
            document.push(mount(cert), mount(key));
        }
    }

    document
}

fn mount(r: &SecretReference) -> &str {
    r.mount_name().unwrap_or(r.artifact_name())
}

fn log_degraded(degraded: &[Degraded]) {
    for d in degraded {
        d.log();
    }
}

fn format_labels(labels: &[(String, String)]) -> String {
    labels
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join(",")
}
