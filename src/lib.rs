//! Rotating ACME certificates into Docker Swarm secrets.
//!
//! Certificates are issued through a DNS-01 capable ACME client, published as immutable,
//! generation-suffixed swarm secrets and attached to every service carrying a selector label.
//! Services roll onto the new secrets start-first, and superseded generations are deleted once
//! more than a configured number of them have piled up.
//!
//! # Usage
//!
//! The `swarm-cert-rotator` binary reads its configuration from the environment (see
//! [`Config::from_env`]) and runs a pass immediately and then once per interval. The same cycle
//! is available as a library:
//!
//! ```no_run
//! # async fn run() -> eyre::Result<()> {
//! use std::sync::Arc;
//!
//! use rotator::{lego::LegoIssuer, swarm::DockerClient, Config, Rotator};
//!
//! let config = Config::from_env()?;
//! let docker = Arc::new(DockerClient::new(&config.docker_host)?);
//! let issuer = LegoIssuer::new(
//!     &config.lego_bin,
//!     &config.dns_provider,
//!     config.key_type,
//!     config.persist_dir.join("lego"),
//! );
//!
//! let rotator = Rotator::new(config, Arc::new(issuer), docker.clone(), docker);
//! let report = rotator.run_pass().await?;
//! println!("{report}");
//! # Ok(())
//! # }
//! ```
//!
//! # Generations
//!
//! Swarm secrets cannot be modified, so every rotation creates new ones, named after the
//! minute of the pass. See [`naming`] for the scheme and [`gc`] for how old generations are
//! retired.
//!
//! # Safety Net
//!
//! The last certificate issued for each domain group is cached under the persist directory.
//! Renewal is decided from that cache, and cached material is republished if the cluster lost
//! it.

#![deny(rust_2018_idioms, nonstandard_style, future_incompatible)]

mod cache;
mod cert;
mod error;
mod req;
mod rotation;

pub mod api;
pub mod cluster;
pub mod config;
pub mod gc;
pub mod lego;
pub mod naming;
pub mod publish;
pub mod rewrite;
pub mod swarm;

#[cfg(test)]
mod test;

pub use crate::{
    cache::{CacheMeta, CertCache},
    cert::{should_renew, should_renew_at, Certificate, DEFAULT_RENEW_DAYS},
    config::Config,
    error::{ClusterError, Degraded},
    rotation::{PassReport, Rotator, ServiceOutcome, ServiceReport},
};
