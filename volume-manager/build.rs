fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile the CSI proto subset (Identity + Node services) for the plugin client
    tonic_prost_build::configure()
        .build_server(false)
        .build_client(true)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
