//! Consensus gRPC service (internal)
//!
//! Exposes the internal consensus plane between coordination nodes:
//! leader election, ownership-log replication, and ownership acquisition.
//! External storage/compute nodes never speak this protocol; they use the
//! public HTTP API.

use crate::coordinator::raft_node::ConsensusNode;
use crate::proto::consensus_internal_server::{ConsensusInternal, ConsensusInternalServer};
use crate::proto::*;
use std::sync::Arc;
use tonic::{Request, Response, Status};

/// ConsensusGrpcService adapts the consensus node to the wire.
pub struct ConsensusGrpcService {
    node: Arc<ConsensusNode>,
}

impl ConsensusGrpcService {
    pub fn new(node: Arc<ConsensusNode>) -> Self {
        Self { node }
    }

    /// Converts this service into a gRPC server instance.
    pub fn into_server(self) -> ConsensusInternalServer<Self> {
        ConsensusInternalServer::new(self)
    }
}

#[tonic::async_trait]
impl ConsensusInternal for ConsensusGrpcService {
    async fn request_vote(
        &self,
        req: Request<VoteRequest>,
    ) -> Result<Response<VoteResponse>, Status> {
        self.node
            .handle_request_vote(req.into_inner())
            .map(Response::new)
            .map_err(|e| e.to_grpc_status())
    }

    async fn append_ownership(
        &self,
        req: Request<AppendRequest>,
    ) -> Result<Response<AppendResponse>, Status> {
        self.node
            .handle_append(req.into_inner())
            .map(Response::new)
            .map_err(|e| e.to_grpc_status())
    }

    async fn acquire_ownership(
        &self,
        req: Request<AcquireRequest>,
    ) -> Result<Response<AcquireResponse>, Status> {
        self.node
            .handle_acquire(req.into_inner())
            .await
            .map(Response::new)
            .map_err(|e| e.to_grpc_status())
    }
}
