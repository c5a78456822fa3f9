// src/proto.rs

//! Generated gRPC types for the gateway control surface and the monitor
//! rendezvous.

pub mod gateway {
    tonic::include_proto!("gateway");
}

pub mod monitor {
    tonic::include_proto!("monitor");
}
