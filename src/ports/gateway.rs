use anyhow::Result;
use async_trait::async_trait;

use crate::types::{CancelRequest, OrderId, OrderRequest};

/// Narrow order-routing contract the engine consumes. Venue-specific
/// REST/WebSocket plumbing lives behind implementations of this trait;
/// submissions are fire-and-forget from the engine's perspective and all
/// results come back later as order events on the engine queue.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    /// Submit a limit order and return its client order id. The returned id
    /// is known immediately; the fill/terminal status arrives asynchronously.
    async fn submit(&self, req: OrderRequest) -> Result<OrderId>;

    async fn cancel(&self, req: CancelRequest) -> Result<()>;

    async fn subscribe(&self, instrument: &str) -> Result<()>;

    async fn unsubscribe(&self, instrument: &str) -> Result<()>;

    /// Ask for a position snapshot; the answer arrives as a position event
    /// carrying the strategy name.
    async fn query_position(&self, strategy: &str, instrument: &str) -> Result<()>;
}

/// Gateway tags accepted in configuration. Validated at load time so an
/// unknown tag fails configuration loading, not the first order.
pub const KNOWN_GATEWAYS: &[&str] = &["sim"];

pub fn is_known_gateway(tag: &str) -> bool {
    KNOWN_GATEWAYS.contains(&tag)
}
