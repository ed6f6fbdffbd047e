//! Retention of superseded generations.
//!
//! Artifacts referenced by the service are never candidates. The remaining managed artifacts are
//! grouped by kind and domain group (certificate/key secrets) or pooled per family (configs), and
//! all but the `retain` newest of each group are deleted.

use std::collections::{BTreeMap, HashSet};

use crate::{
    cluster::{ArtifactClass, ArtifactMeta, ArtifactStore},
    error::{Degraded, Result},
    naming::{ArtifactKind, ArtifactName, ConfigFamily, Generation},
};

/// Selects the certificate/key secrets to delete from `catalog`.
///
/// Names that are outside the managed namespace or do not parse are never selected.
pub fn plan_secrets(
    live: &HashSet<&str>,
    catalog: &[ArtifactMeta],
    retain: usize,
) -> Vec<ArtifactMeta> {
    let mut groups = BTreeMap::<(ArtifactKind, String), Vec<(Generation, &ArtifactMeta)>>::new();

    for meta in catalog {
        if live.contains(meta.name.as_str()) {
            continue;
        }

        let Some(name) = ArtifactName::parse(&meta.name) else {
            continue;
        };

        groups
            .entry((name.kind, name.group))
            .or_default()
            .push((name.generation, meta));
    }

    groups
        .into_values()
        .flat_map(|candidates| oldest_beyond(candidates, retain))
        .collect()
}

/// Selects the members of a config family to delete from `catalog`.
///
/// The whole family forms a single retention group, since each member covers every domain group
/// of its pass.
pub fn plan_configs(
    live: &HashSet<&str>,
    catalog: &[ArtifactMeta],
    family: &ConfigFamily,
    retain: usize,
) -> Vec<ArtifactMeta> {
    let candidates = catalog
        .iter()
        .filter(|meta| !live.contains(meta.name.as_str()))
        .filter_map(|meta| Some((family.generation_of(&meta.name)?, meta)))
        .collect();

    oldest_beyond(candidates, retain)
}

fn oldest_beyond(
    mut candidates: Vec<(Generation, &ArtifactMeta)>,
    retain: usize,
) -> Vec<ArtifactMeta> {
    candidates.sort_by(|(a, a_meta), (b, b_meta)| {
        a.cmp(b).then_with(|| a_meta.name.cmp(&b_meta.name))
    });

    let excess = candidates.len().saturating_sub(retain);
    candidates
        .into_iter()
        .take(excess)
        .map(|(_, meta)| meta.clone())
        .collect()
}

/// What a collection run removed and failed to remove.
#[derive(Debug, Default)]
pub struct GcReport {
    pub deleted: Vec<String>,
    pub degraded: Vec<Degraded>,
}

/// Deletes unreferenced artifacts beyond the retention depth.
pub struct RetentionGc<'a> {
    store: &'a dyn ArtifactStore,
    retain: usize,
}

impl<'a> RetentionGc<'a> {
    pub fn new(store: &'a dyn ArtifactStore, retain: usize) -> Self {
        RetentionGc { store, retain }
    }

    /// Collects certificate/key secrets, protecting every name in `live`.
    pub async fn collect_secrets(&self, live: &HashSet<&str>) -> Result<GcReport> {
        let catalog = self.store.list(ArtifactClass::Secret, None).await?;
        let doomed = plan_secrets(live, &catalog, self.retain);
        Ok(self.delete_all(ArtifactClass::Secret, doomed).await)
    }

    /// Collects members of `family`, protecting every name in `live`.
    pub async fn collect_configs(
        &self,
        live: &HashSet<&str>,
        family: &ConfigFamily,
    ) -> Result<GcReport> {
        let catalog = self.store.list(ArtifactClass::Config, None).await?;
        let doomed = plan_configs(live, &catalog, family, self.retain);
        Ok(self.delete_all(ArtifactClass::Config, doomed).await)
    }

    async fn delete_all(&self, class: ArtifactClass, doomed: Vec<ArtifactMeta>) -> GcReport {
        let mut report = GcReport::default();

        for meta in doomed {
            match self.store.delete(class, &meta.id).await {
                Ok(()) => {
                    log::info!("removed superseded {} {}", class.as_str(), meta.name);
                    report.deleted.push(meta.name);
                }
                Err(err) => {
                    let target = format!("{} {}", class.as_str(), meta.name);
                    report.degraded.push(Degraded::new("gc", target, err));
                }
            }
        }

        report
    }
}
