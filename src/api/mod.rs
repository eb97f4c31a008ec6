//! HTTP API Module
//!
//! Provides a REST API for volume management and rebuild monitoring.

mod http;

pub use http::{
    ActionResponse, AddReplicaRequest, ErrorResponse, HttpServer, NamedRequest,
    RemoveSnapshotResponse, ResizeRequest, SnapshotRequest, SnapshotResponse,
};
