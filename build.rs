fn main() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(feature = "grpc")]
    {
        let out_dir = std::path::PathBuf::from(std::env::var("OUT_DIR")?);

        // Both halves are needed: peers serve ExclusionManager and call it on each other.
        tonic_build::configure()
            .build_server(true)
            .build_client(true)
            .out_dir(&out_dir)
            .compile_protos(&["proto/exclusion.proto"], &["proto"])?;

        println!("cargo:rerun-if-changed=proto/exclusion.proto");
    }

    Ok(())
}
