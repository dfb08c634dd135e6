fn main() {
    set_git_revision_hash();
}

/// Make the current git hash available to the build as the environment
/// variable `IPSEE_BUILD_GIT_HASH`, falling back to `unknown` outside a
/// checkout so `env!` always resolves.
fn set_git_revision_hash() {
    use std::process::Command;

    let args = &["rev-parse", "--short=10", "HEAD"];
    let rev = Command::new("git")
        .args(args)
        .output()
        .ok()
        .map(|output| String::from_utf8_lossy(&output.stdout).trim().to_string())
        .filter(|rev| !rev.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=IPSEE_BUILD_GIT_HASH={}", rev);
}
