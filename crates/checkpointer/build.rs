fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("cargo:rerun-if-changed=proto/runtime/v1alpha2/api.proto");

    tonic_build::configure()
        .build_server(false)
        .build_client(true)
        .format(true)
        .compile(
            &["proto/runtime/v1alpha2/api.proto"],
            &["proto/runtime/v1alpha2"],
        )?;
    Ok(())
}
