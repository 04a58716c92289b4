//! Coordinator server

use crate::common::{CoordinatorConfig, Result};
use crate::coordinator::grpc::ConsensusGrpcService;
use crate::coordinator::http::{create_router, CoordState};
use crate::coordinator::meta::MetaStore;
use crate::coordinator::raft_node::{start_consensus_tasks, ConsensusNode};
use crate::coordinator::service::CoordService;
use crate::store::CounterStore;
use std::sync::Arc;

pub struct Coordinator {
    config: CoordinatorConfig,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self { config }
    }

    pub async fn serve(self) -> Result<()> {
        self.config.validate()?;

        tracing::info!("Starting coordinator: node {}", self.config.node_id);
        tracing::info!("  HTTP API: {}", self.config.bind_addr);
        tracing::info!("  gRPC API: {}", self.config.grpc_addr);
        tracing::info!("  Data dir: {}", self.config.data_dir.display());
        tracing::info!("  Peers: {}", self.config.peers.len());
        tracing::info!("  Flush policy: {:?}", self.config.flush_policy);

        // Consensus metadata + sparse counter store
        let meta = MetaStore::open(self.config.data_dir.join("meta"))?;
        let store = Arc::new(CounterStore::open(
            self.config.data_dir.join("counters"),
            self.config.counter_file_size,
            self.config.flush_policy,
        )?);

        // Consensus node + background election/heartbeat tasks
        let node = ConsensusNode::new(&self.config, meta)?;
        let _consensus_handle = start_consensus_tasks(node.clone());

        // Coordination service core
        let service = Arc::new(CoordService::new(
            self.config.node_id,
            self.config.public_addr(),
            node.clone(),
            store,
        ));

        // Create HTTP server
        let http_router = create_router(CoordState { service });

        // Create gRPC server
        let grpc_service = ConsensusGrpcService::new(node.clone());
        let grpc_server = tonic::transport::Server::builder()
            .add_service(grpc_service.into_server())
            .serve(self.config.grpc_addr);

        // Start servers
        let http_listener = tokio::net::TcpListener::bind(self.config.bind_addr).await?;
        let http_server = axum::serve(http_listener, http_router);

        tracing::info!("✓ Coordinator ready ({})", node.role());

        tokio::select! {
            res = http_server => {
                if let Err(e) = res {
                    tracing::error!("HTTP server error: {}", e);
                }
            }
            res = grpc_server => {
                if let Err(e) = res {
                    tracing::error!("gRPC server error: {}", e);
                }
            }
        }

        Ok(())
    }
}
