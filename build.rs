fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile proto files
    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        // The netd service has an rpc named `Connect`, which collides with the
        // generated transport `connect` constructor; no code uses the
        // constructor, so skip transport codegen.
        .build_transport(false)
        // Listing output is rendered as JSON by the CLI
        .type_attribute(".gangway", "#[derive(serde::Serialize)]")
        .compile_protos(&["proto/broker.proto", "proto/netd.proto"], &["proto"])?;

    // Re-run if proto files change
    println!("cargo:rerun-if-changed=proto/broker.proto");
    println!("cargo:rerun-if-changed=proto/netd.proto");

    Ok(())
}
