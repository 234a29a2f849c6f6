//! Service-mesh dispatch interception.
//!
//! Outbound HTTP calls flow through a [`Dispatcher`] pipeline. Requests whose
//! hostname carries the reserved internal suffix are rewritten into control
//! channel RPCs by the [`MeshInterceptor`]; everything else passes through to
//! a real network dispatcher.
//!
//! [`Dispatcher`]: dispatch::Dispatcher
//! [`MeshInterceptor`]: interceptor::MeshInterceptor

pub mod dispatch;
pub mod interceptor;
pub mod network;
