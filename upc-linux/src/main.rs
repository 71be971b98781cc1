// UnifiedPush connector daemon: keeps one instance registered with a local distributor.

mod config;
mod directory;
mod keyring;
mod service;
mod transport;
mod wire;

use std::sync::Arc;

use anyhow::Context;
use upc_core::{Connector, DefaultKeyManager, FileBackend, KeyManager, KeyStorage, Store};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut instance = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("upc-linux {}", VERSION);
                return Ok(());
            }
            "--instance" => instance = args.next(),
            other => anyhow::bail!("unknown argument {:?}", other),
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cfg = config::load();

    let backend = FileBackend::open(&cfg.store_path)
        .with_context(|| format!("opening store {}", cfg.store_path.display()))?;
    let store = Arc::new(Store::open(backend));
    let keys: Arc<dyn KeyManager> = match cfg.connector.key_storage {
        KeyStorage::Keyring => Arc::new(DefaultKeyManager::wrapped(
            Arc::clone(&store),
            keyring::KeyringWrappingKey::new(&cfg.connector.application),
        )),
        KeyStorage::Plain => Arc::new(DefaultKeyManager::plain(Arc::clone(&store))),
    };
    let connector = Arc::new(Connector::new(store, keys, cfg.connector.clone()));
    let instance = instance.unwrap_or_else(|| cfg.connector.default_instance.clone());

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        let transport = Arc::new(transport::SocketTransport::new());
        let (service, events) = service::Service::new(connector, transport.clone());
        let service = Arc::new(service);
        service::spawn_consumer(events, Arc::new(service::LogReceiver));

        let auto = transport::AutoRegister {
            instance,
            vapid: cfg.vapid.clone(),
            features: cfg.required_features.clone(),
        };
        let available = directory::scan(&cfg.distributors);
        if directory::choose(&cfg, &available).is_none() {
            log::warn!("no distributor selected, waiting for one to appear");
            let (instance, vapid, features) =
                (auto.instance.clone(), auto.vapid.clone(), auto.features.clone());
            if let Err(e) = service.register(instance, None, vapid, features).await {
                log::error!("register failed: {}", e);
            }
        }

        tokio::spawn(directory::run_directory(
            cfg.clone(),
            transport.clone(),
            service.clone(),
            auto,
        ));
        shutdown_signal().await
    })?;
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
    log::info!("shutting down");
    Ok(())
}
