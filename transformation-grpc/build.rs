use std::env;
use std::path::PathBuf;
use std::process::Command;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let out_dir = PathBuf::from(env::var("OUT_DIR")?);

    // Fall back to the bundled protoc when none is configured
    if env::var_os("PROTOC").is_none() {
        env::set_var("PROTOC", protoc_bin_vendored::protoc_bin_path()?);
    }

    tonic_build::configure()
        .build_server(true)
        .build_client(true)
        .file_descriptor_set_path(out_dir.join("transformation_descriptor.bin"))
        .compile_protos(&["proto/transformation.proto"], &["proto"])?;

    // Recorded into the service info detail string
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let rustc_version = Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "rustc unknown".to_string());
    println!("cargo:rustc-env=TRANSFORMATION_GRPC_RUSTC_VERSION={rustc_version}");

    println!("cargo:rerun-if-changed=proto/transformation.proto");
    println!("cargo:rerun-if-env-changed=PROTOC");
    Ok(())
}
