fn main() {
    let target_os =
        std::env::var("CARGO_CFG_TARGET_OS").expect("CARGO_CFG_TARGET_OS should be set");

    if target_os != "linux" {
        panic!("fusebind binds the Linux FUSE3 kernel interface via libfuse3");
    }

    // The session loop and reply functions come from libfuse3. The FUSE wire
    // protocol framing is libfuse's job, not ours.
    pkg_config::Config::new()
        .atleast_version("3.2.0")
        .probe("fuse3")
        .map_err(|e| eprintln!("{e}"))
        .expect("libfuse3 development files not found (install libfuse3-dev/fuse3-devel)");
}
