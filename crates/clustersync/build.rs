fn main() {
    // surfaced by `clustersync version --extended`
    if let Ok(target) = std::env::var("TARGET") {
        println!("cargo:rustc-env=CLUSTERSYNC_BUILD_TARGET={target}");
    }
    println!("cargo:rerun-if-env-changed=TARGET");
    println!("cargo:rerun-if-changed=build.rs");
}
