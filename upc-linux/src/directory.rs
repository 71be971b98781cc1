//! Peer directory: which configured distributors are reachable, and which one to bind.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use upc_core::peer::{filter_by_features, sole_candidate};
use upc_core::PeerInfo;

use crate::config::{Config, DistributorConfig};
use crate::service::Service;
use crate::transport::{run_connection, AutoRegister, SocketTransport};

/// Distributors whose socket is present.
pub fn scan(distributors: &[DistributorConfig]) -> Vec<PeerInfo> {
    distributors
        .iter()
        .filter(|d| d.socket.exists())
        .map(|d| PeerInfo {
            id: d.id.clone(),
            protocol: d.protocol,
            features: d.features.clone(),
        })
        .collect()
}

/// The configured distributor, or the only available one advertising the required features.
pub fn choose<'a>(cfg: &'a Config, available: &[PeerInfo]) -> Option<&'a DistributorConfig> {
    let id = match &cfg.distributor {
        Some(id) => id.clone(),
        None => {
            let required: Vec<&str> = cfg.required_features.iter().map(String::as_str).collect();
            let candidates = filter_by_features(available, &required);
            sole_candidate(&candidates)?.id.clone()
        }
    };
    cfg.distributors.iter().find(|d| d.id == id)
}

/// Rescan every `scan_interval_secs`. The engine drops a bound distributor that went
/// away; when no connection is running and a distributor can be chosen, one is started.
pub async fn run_directory(
    cfg: Config,
    transport: Arc<SocketTransport>,
    service: Arc<Service>,
    auto: AutoRegister,
) {
    let interval = Duration::from_secs(cfg.scan_interval_secs.max(1));
    let mut active: Option<(String, JoinHandle<()>)> = None;
    loop {
        let available = scan(&cfg.distributors);
        let vanished = active
            .as_ref()
            .is_some_and(|(id, _)| !available.iter().any(|p| &p.id == id));
        if vanished {
            if let Some((id, task)) = active.take() {
                log::info!("distributor {} went away", id);
                task.abort();
            }
        }

        let listed = available.clone();
        service.run(move |c| c.on_peer_list(&listed)).await;

        if active.is_none() {
            if let Some(distributor) = choose(&cfg, &available) {
                log::info!("using distributor {}", distributor.id);
                let task = tokio::spawn(run_connection(
                    distributor.clone(),
                    Arc::clone(&transport),
                    Arc::clone(&service),
                    auto.clone(),
                ));
                active = Some((distributor.id.clone(), task));
            }
        }
        tokio::time::sleep(interval).await;
    }
}
