use std::path::Path;

use crate::{
    api::{
        ConfigReference, FileTarget, Reference, SecretReference, ServiceSpec, UpdateConfig,
        UpdateOrder,
    },
    naming::{is_managed_secret, ConfigFamily},
};

/// File mode of mounted certificate and key secrets.
pub const SECRET_MODE: u32 = 0o400;

/// File mode of the mounted dynamic config.
pub const CONFIG_MODE: u32 = 0o444;

/// Reference to a published secret, mounted as `mount`.
pub fn secret_reference(id: &str, name: &str, mount: &str) -> SecretReference {
    SecretReference {
        secret_id: id.to_owned(),
        secret_name: name.to_owned(),
        file: Some(FileTarget::new(mount, SECRET_MODE)),
        ..Default::default()
    }
}

/// Reference to a published config, mounted under the file name of `target`.
pub fn config_reference(id: &str, name: &str, target: &Path) -> ConfigReference {
    let mount = target
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_owned());

    ConfigReference {
        config_id: id.to_owned(),
        config_name: name.to_owned(),
        file: Some(FileTarget::new(mount, CONFIG_MODE)),
        ..Default::default()
    }
}

/// Swaps the managed references of a service spec for a new set.
///
/// Managed secret references are recognized by the certificate/key name prefixes. Config
/// references are only managed when a config family is configured; otherwise the rewriter
/// leaves them alone entirely.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServiceSpecRewriter<'a> {
    config_family: Option<&'a ConfigFamily>,
}

impl<'a> ServiceSpecRewriter<'a> {
    pub fn new(config_family: Option<&'a ConfigFamily>) -> Self {
        ServiceSpecRewriter { config_family }
    }

    /// Managed secret references currently in `spec`.
    pub fn managed_secrets<'s>(&self, spec: &'s ServiceSpec) -> Vec<&'s SecretReference> {
        spec.task_template
            .container_spec
            .secrets
            .iter()
            .filter(|r| is_managed_secret(r.artifact_name()))
            .collect()
    }

    /// Managed config references currently in `spec`.
    pub fn managed_configs<'s>(&self, spec: &'s ServiceSpec) -> Vec<&'s ConfigReference> {
        let Some(family) = self.config_family else {
            return Vec::new();
        };

        spec.task_template
            .container_spec
            .configs
            .iter()
            .filter(|r| family.owns(r.artifact_name()))
            .collect()
    }

    /// Computes the spec to submit.
    ///
    /// Every managed reference is dropped, whatever its generation, and `secrets` (plus `config`
    /// when a family is configured) appended. Foreign references keep their content and order.
    /// The update order is forced to start-first and the force-update counter bumped, so the
    /// orchestrator rolls the tasks without a gap.
    pub fn rewrite(
        &self,
        current: &ServiceSpec,
        secrets: &[SecretReference],
        config: Option<&ConfigReference>,
    ) -> ServiceSpec {
        let mut spec = current.clone();
        let cs = &mut spec.task_template.container_spec;

        cs.secrets.retain(|r| !is_managed_secret(r.artifact_name()));
        cs.secrets.extend_from_slice(secrets);

        if let Some(family) = self.config_family {
            cs.configs.retain(|r| !family.owns(r.artifact_name()));
            cs.configs.extend(config.cloned());
        }

        spec.update_config
            .get_or_insert_with(UpdateConfig::default)
            .order = Some(UpdateOrder::StartFirst);

        spec.task_template.force_update = spec.task_template.force_update.wrapping_add(1);

        spec
    }

    /// Returns true if `current` already carries exactly these managed references.
    pub fn is_converged(
        &self,
        current: &ServiceSpec,
        secrets: &[SecretReference],
        config: Option<&ConfigReference>,
    ) -> bool {
        let secrets_match = reference_keys(self.managed_secrets(current).into_iter())
            == reference_keys(secrets.iter());

        let configs_match = self.config_family.is_none()
            || reference_keys(self.managed_configs(current).into_iter())
                == reference_keys(config.into_iter());

        secrets_match && configs_match
    }
}

fn reference_keys<'r, R: Reference + 'r>(
    refs: impl Iterator<Item = &'r R>,
) -> Vec<(&'r str, Option<&'r str>)> {
    let mut keys = refs
        .map(|r| (r.artifact_name(), r.mount_name()))
        .collect::<Vec<_>>();
    keys.sort_unstable();
    keys
}
