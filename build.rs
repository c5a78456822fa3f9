// build.rs

use std::env;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let version = env::var("NVMEOF_GW_VERSION")
        .unwrap_or_else(|_| env::var("CARGO_PKG_VERSION").unwrap_or_else(|_| "dev".to_string()));

    println!("cargo:rustc-env=CARGO_PKG_VERSION={version}");
    println!("cargo:rerun-if-env-changed=NVMEOF_GW_VERSION");
    println!("cargo:rerun-if-changed=proto/gateway.proto");
    println!("cargo:rerun-if-changed=proto/monitor.proto");

    // protox compiles the proto files without requiring a system protoc binary.
    let file_descriptors =
        protox::compile(["proto/gateway.proto", "proto/monitor.proto"], ["proto"])?;
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .compile_fds(file_descriptors)?;

    Ok(())
}
