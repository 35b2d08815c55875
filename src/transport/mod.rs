//! 传输层：批处理核心与远端存储之间的唯一接缝。
//!
//! # Transport Module
//!
//! The batch core never speaks a wire protocol itself. It hands each operation
//! to a [`Transport`], which either refuses it synchronously or returns a future
//! that resolves exactly once with an [`Outcome`].
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`Transport`] | The contract consumed by the dispatcher |
//! | [`HttpPutTransport`] | Streams payloads to `{endpoint}/{bucket}/{key}` with HTTP `PUT` |
//! | [`SimulatedTransport`] | Scripted outcomes, latencies, and a capacity budget for tests and demos |
//!
//! Aborting an operation means dropping its future; [`Transport::abort`] is an
//! extra best-effort hook for transports holding resources outside the future.

mod http;
mod sim;

pub use http::{HttpPutConfig, HttpPutTransport};
pub use sim::{Script, SimStats, SimulatedTransport};

use crate::batch::{OperationId, Outcome, PayloadRef};
use futures::future::BoxFuture;
use thiserror::Error;

/// Future of one remote call.
pub type OutcomeFuture = BoxFuture<'static, Outcome>;

#[derive(Debug, Clone)]
pub struct SendRequest {
    pub id: OperationId,
    pub payload: PayloadRef,
}

pub trait Transport: Send + Sync + 'static {
    /// Start the remote call for one operation.
    ///
    /// `Err` means the call never started. The returned future must resolve
    /// exactly once.
    fn send(&self, request: SendRequest) -> Result<OutcomeFuture, TransportError>;

    /// Called after the operation's future has been dropped by an abort.
    fn abort(&self, _id: OperationId) {}
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid request for operation {id}: {message}")]
    InvalidRequest { id: OperationId, message: String },

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Other(String),
}
