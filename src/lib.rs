//! Client and event pipeline for the nDPId distributor socket.
//!
//! The distributor streams length-prefixed JSON events describing packets,
//! flows, daemon status and errors. [`client::DistributorClient`] reads and
//! decodes that stream, [`flow::FlowManager`] tracks flow lifecycles per
//! daemon instance, and [`dispatch::Dispatcher`] fans events out to bounded
//! per-category worker pools feeding a [`sink::Sink`].

pub mod agent;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod export;
pub mod flow;
pub mod protocol;
pub mod sink;
