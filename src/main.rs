use std::sync::Arc;

use rotator::{lego::LegoIssuer, swarm::DockerClient, Config, Rotator};

#[tokio::main(flavor = "current_thread")]
async fn main() -> eyre::Result<()> {
    color_eyre::install()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = Config::from_env()?;
    let docker = Arc::new(DockerClient::new(&config.docker_host)?);

    let issuer = LegoIssuer::new(
        &config.lego_bin,
        &config.dns_provider,
        config.key_type,
        config.persist_dir.join("lego"),
    )
    .with_env(config.provider_env.clone());

    log::info!(
        "engine {}, mode {:?}, renew {} days before expiry, keep {} generations",
        docker.endpoint(),
        config.mode,
        config.renew_days,
        config.retain,
    );

    let rotator = Rotator::new(config, Arc::new(issuer), docker.clone(), docker);

    tokio::select! {
        () = rotator.run() => {}
        () = shutdown_signal() => log::info!("shutting down"),
    }

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(err) => {
                log::warn!("cannot listen for SIGTERM: {err}");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
