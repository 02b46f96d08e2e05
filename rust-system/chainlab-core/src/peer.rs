//! Peer transport
//!
//! Outbound calls a node makes to its peers: fetch a peer's chain, fetch
//! its peer list and push a block to it. Every call fails independently
//! with a [`PeerError`]; callers collect these per peer instead of
//! aborting.

use crate::block::Block;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Default timeout for a single peer request
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, thiserror::Error, Serialize)]
pub enum PeerError {
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },

    #[error("peer {peer} answered with status {status}")]
    BadStatus { peer: String, status: u16 },

    #[error("peer {peer} sent a malformed response: {reason}")]
    MalformedResponse { peer: String, reason: String },
}

impl PeerError {
    pub fn peer(&self) -> &str {
        match self {
            PeerError::Unreachable { peer, .. }
            | PeerError::BadStatus { peer, .. }
            | PeerError::MalformedResponse { peer, .. } => peer,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            PeerError::Unreachable { .. } => "peer_unreachable",
            PeerError::BadStatus { .. } => "peer_bad_status",
            PeerError::MalformedResponse { .. } => "peer_malformed_response",
        }
    }
}

/// Result of one call to one peer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PeerOutcome {
    pub peer: String,
    pub result: Result<(), PeerError>,
}

impl PeerOutcome {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Full chain of `peer`, genesis first
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, PeerError>;

    /// Peer endpoints known to `peer`
    async fn fetch_peers(&self, peer: &str) -> Result<Vec<String>, PeerError>;

    /// Offer a block to `peer`
    async fn send_block(&self, peer: &str, block: &Block) -> Result<(), PeerError>;
}

#[derive(Deserialize)]
struct ChainResponse {
    chain: Vec<Block>,
}

#[derive(Deserialize)]
struct PeersResponse {
    peers: Vec<String>,
}

/// JSON over HTTP transport speaking the node routes
/// `/api/blockchain`, `/api/peers/list` and `/api/blockchain/receive`
#[derive(Debug, Clone)]
pub struct HttpPeerTransport {
    client: reqwest::Client,
}

impl HttpPeerTransport {
    pub fn new() -> crate::Result<Self> {
        Self::with_timeout(DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::BlockchainError::Network(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    fn url(peer: &str, path: &str) -> String {
        format!("{}{}", peer.trim_end_matches('/'), path)
    }

    async fn get_json<T>(&self, peer: &str, path: &str) -> Result<T, PeerError>
    where
        T: serde::de::DeserializeOwned,
    {
        let url = Self::url(peer, path);
        debug!("GET {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;
        let response = check_status(peer, response)?;

        response.json::<T>().await.map_err(|e| PeerError::MalformedResponse {
            peer: peer.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
impl PeerTransport for HttpPeerTransport {
    async fn fetch_chain(&self, peer: &str) -> Result<Vec<Block>, PeerError> {
        let body: ChainResponse = self.get_json(peer, "/api/blockchain").await?;
        Ok(body.chain)
    }

    async fn fetch_peers(&self, peer: &str) -> Result<Vec<String>, PeerError> {
        let body: PeersResponse = self.get_json(peer, "/api/peers/list").await?;
        Ok(body.peers)
    }

    async fn send_block(&self, peer: &str, block: &Block) -> Result<(), PeerError> {
        let url = Self::url(peer, "/api/blockchain/receive");
        debug!("POST {} (block #{})", url, block.index);

        let response = self
            .client
            .post(&url)
            .json(block)
            .send()
            .await
            .map_err(|e| unreachable(peer, e))?;
        check_status(peer, response)?;
        Ok(())
    }
}

fn unreachable(peer: &str, err: reqwest::Error) -> PeerError {
    PeerError::Unreachable {
        peer: peer.to_string(),
        reason: err.to_string(),
    }
}

fn check_status(peer: &str, response: reqwest::Response) -> Result<reqwest::Response, PeerError> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(PeerError::BadStatus {
            peer: peer.to_string(),
            status: status.as_u16(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_joining() {
        assert_eq!(
            HttpPeerTransport::url("http://node:3000/", "/api/blockchain"),
            "http://node:3000/api/blockchain"
        );
        assert_eq!(
            HttpPeerTransport::url("http://node:3000", "/api/peers/list"),
            "http://node:3000/api/peers/list"
        );
    }

    #[test]
    fn test_response_shapes() {
        let chain: ChainResponse = serde_json::from_str(
            r#"{"chain":[{"index":0,"timestamp":0,"transactions":[],"previousHash":"0","hash":"ab","nonce":0}]}"#,
        )
        .unwrap();
        assert_eq!(chain.chain.len(), 1);
        assert_eq!(chain.chain[0].previous_hash, "0");

        let peers: PeersResponse =
            serde_json::from_str(r#"{"peers":["http://a:3000","http://b:3000"]}"#).unwrap();
        assert_eq!(peers.peers.len(), 2);
    }

    #[test]
    fn test_error_accessors() {
        let err = PeerError::BadStatus {
            peer: "http://a".to_string(),
            status: 500,
        };
        assert_eq!(err.peer(), "http://a");
        assert_eq!(err.code(), "peer_bad_status");
    }

    #[tokio::test]
    async fn test_unreachable_peer() {
        let transport = HttpPeerTransport::with_timeout(Duration::from_millis(500)).unwrap();
        // port 9 (discard) on loopback is not served in test environments
        let err = transport.fetch_peers("http://127.0.0.1:9").await.unwrap_err();
        assert_eq!(err.code(), "peer_unreachable");
        assert_eq!(err.peer(), "http://127.0.0.1:9");
    }
}
