//! epidemicd server - wires the store, multiplexer and both protocols

use cloudgossip_core::{CloudRef, Node, PeerAddr, RandomSelector, View};
use cloudgossip_net::Multiplexer;
use cloudgossip_store::cloud::{CloudBackend, MemoryCloud};
use cloudgossip_store::diff::WholeEntryStrategy;
use cloudgossip_store::persist::{PersistenceBackend, SledBackend};
use cloudgossip_store::Store;
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::info;

use crate::antientropy::{AntiEntropy, ANTI_ENTROPY_CLIENT_ID};
use crate::config::Config;
use crate::engine::Engine;
use crate::error::ServerError;
use crate::providers::ProviderRegistry;
use crate::rumor::{RumorMongering, RUMOR_CLIENT_ID};

/// Server state
pub struct Server {
    config: Config,
    store: Arc<Store>,
    cloud: Option<(CloudRef, Arc<Store>)>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Server {
    pub fn new(config: Config, registry: &ProviderRegistry) -> Result<Self, ServerError> {
        let backend = registry.resolve(&config.provider, &config.data_dir)?;
        let store = Arc::new(Store::new(backend, Arc::new(WholeEntryStrategy::new())));
        store.set_list_window(config.list_window());

        let cloud = config
            .cloud
            .as_deref()
            .map(resolve_cloud)
            .transpose()?;

        let (shutdown_tx, _) = broadcast::channel(1);
        Ok(Self {
            config,
            store,
            cloud,
            shutdown_tx,
        })
    }

    /// The replicated store this node gossips about.
    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    /// Signal the running server to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Run both protocols until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let mux = Multiplexer::bind(self.config.listen).await?;
        info!(addr = %mux.local_addr(), "epidemicd listening");

        let mut view = View::new();
        for peer in &self.config.peers {
            view.insert(Node::Peer(PeerAddr(*peer)), Vec::new());
        }
        if let Some((cloud_ref, _)) = &self.cloud {
            view.insert(Node::Cloud(cloud_ref.clone()), Vec::new());
        }
        let view = Arc::new(RwLock::new(view));

        let ae_selector = Arc::new(RandomSelector::new(view.clone()));
        let rumor_selector = Arc::new(RandomSelector::new(view).exclude_cloud(true));

        let mut antientropy = AntiEntropy::new(
            self.store.clone(),
            ae_selector,
            mux.register_client(ANTI_ENTROPY_CLIENT_ID)?,
        );
        if let Some((cloud_ref, cloud_store)) = &self.cloud {
            antientropy = antientropy.with_cloud(cloud_ref.clone(), cloud_store.clone());
        }
        let antientropy = Engine::new(Arc::new(antientropy), self.config.antientropy_period());

        let rumor = Engine::new(
            Arc::new(RumorMongering::new(
                self.store.clone(),
                rumor_selector,
                mux.register_client(RUMOR_CLIENT_ID)?,
                self.config.rumor_threshold,
            )),
            self.config.rumor_period(),
        );

        antientropy.start()?;
        rumor.start()?;

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let _ = shutdown_rx.recv().await;
        info!("shutting down");

        antientropy.terminate()?;
        rumor.terminate()?;
        antientropy.join().await;
        rumor.join().await;
        mux.shutdown();
        Ok(())
    }
}

/// Resolve a `<provider>:<location>` cloud reference to a store over that
/// cloud's object storage.
fn resolve_cloud(reference: &str) -> Result<(CloudRef, Arc<Store>), ServerError> {
    let (scheme, location) = reference
        .split_once(':')
        .ok_or_else(|| ServerError::UnknownProvider(reference.to_string()))?;

    let backend: Arc<dyn PersistenceBackend> = match scheme {
        "memory" => Arc::new(CloudBackend::new(Arc::new(MemoryCloud::new()))),
        "sled" => Arc::new(SledBackend::open(PathBuf::from(location))?),
        _ => return Err(ServerError::UnknownProvider(scheme.to_string())),
    };

    let store = Store::new(backend, Arc::new(WholeEntryStrategy::new()));
    Ok((CloudRef(reference.to_string()), Arc::new(store)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use std::time::Duration;

    fn config(listen: &str) -> Config {
        Config::parse_from([
            "epidemicd",
            "--listen",
            listen,
            "--provider",
            "memory",
            "--peers",
            "127.0.0.1:1",
        ])
    }

    #[tokio::test]
    async fn server_starts_and_shuts_down() {
        let server = Arc::new(
            Server::new(config("127.0.0.1:0"), &ProviderRegistry::with_defaults()).unwrap(),
        );

        let running = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        server.shutdown();
        running.await.unwrap().unwrap();
    }

    #[test]
    fn cloud_reference_resolution() {
        assert!(resolve_cloud("memory:shared").is_ok());
        assert!(matches!(
            resolve_cloud("s3:bucket"),
            Err(ServerError::UnknownProvider(_))
        ));
    }
}
