fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Compile CSI proto (server side only, the driver is never a CSI client)
    tonic_prost_build::configure()
        .build_server(true)
        .build_client(false)
        .compile_protos(&["../proto/csi.proto"], &["../proto"])?;

    Ok(())
}
