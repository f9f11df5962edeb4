//! Outbound hook point.
//!
//! The worker hands every request to the hook after building it from the
//! endpoint configuration and before sending it. A hook can rewrite the
//! URL, method, headers or body, or reject the delivery by returning an
//! error, in which case the task stays queued and is retried on reclaim.

use async_trait::async_trait;
use hookwire_core::models::Endpoint;

use crate::{
    client::{DeliveryRequest, DeliveryResponse},
    error::Result,
};

/// Request/response interception around a delivery.
#[async_trait]
pub trait OutboundHook: Send + Sync + std::fmt::Debug {
    /// Called with the fully built request just before it is sent.
    async fn before_deliver(&self, request: &mut DeliveryRequest, endpoint: &Endpoint)
        -> Result<()>;

    /// Called with the response of a completed request.
    async fn after_deliver(&self, _response: &mut DeliveryResponse) {}
}

/// Hook that leaves requests untouched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpOutboundHook;

#[async_trait]
impl OutboundHook for NoOpOutboundHook {
    async fn before_deliver(
        &self,
        _request: &mut DeliveryRequest,
        _endpoint: &Endpoint,
    ) -> Result<()> {
        Ok(())
    }
}
