//! gRPC client helpers for the consensus plane

use crate::proto::consensus_internal_client::ConsensusInternalClient;
use crate::proto::{
    AcquireRequest, AcquireResponse, AppendRequest, AppendResponse, VoteRequest, VoteResponse,
};
use std::time::Duration;
use tokio::sync::Mutex;
use tonic::transport::Channel;

/// Cached connection to one peer of the consensus group.
///
/// The channel is established lazily and dropped on RPC failure so the
/// next call reconnects. Every RPC carries the consensus-plane timeout.
pub struct PeerClient {
    addr: String,
    rpc_timeout: Duration,
    channel: Mutex<Option<Channel>>,
}

impl PeerClient {
    pub fn new(addr: String, rpc_timeout: Duration) -> Self {
        Self {
            addr,
            rpc_timeout,
            channel: Mutex::new(None),
        }
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    async fn channel(&self) -> Result<Channel, tonic::Status> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.as_ref() {
            return Ok(channel.clone());
        }
        let endpoint = Channel::from_shared(self.addr.clone())
            .map_err(|e| tonic::Status::internal(e.to_string()))?
            .connect_timeout(self.rpc_timeout)
            .timeout(self.rpc_timeout);
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| tonic::Status::unavailable(e.to_string()))?;
        *guard = Some(channel.clone());
        Ok(channel)
    }

    async fn reset(&self) {
        *self.channel.lock().await = None;
    }

    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse, tonic::Status> {
        let mut client = ConsensusInternalClient::new(self.channel().await?);
        match client.request_vote(req).await {
            Ok(resp) => Ok(resp.into_inner()),
            Err(status) => {
                self.reset().await;
                Err(status)
            }
        }
    }

    pub async fn append_ownership(
        &self,
        req: AppendRequest,
    ) -> Result<AppendResponse, tonic::Status> {
        let mut client = ConsensusInternalClient::new(self.channel().await?);
        match client.append_ownership(req).await {
            Ok(resp) => Ok(resp.into_inner()),
            Err(status) => {
                self.reset().await;
                Err(status)
            }
        }
    }

    pub async fn acquire_ownership(
        &self,
        req: AcquireRequest,
    ) -> Result<AcquireResponse, tonic::Status> {
        let mut client = ConsensusInternalClient::new(self.channel().await?);
        match client.acquire_ownership(req).await {
            Ok(resp) => Ok(resp.into_inner()),
            Err(status) => {
                self.reset().await;
                Err(status)
            }
        }
    }
}
