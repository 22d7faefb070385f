use std::process::Command;

fn git_hash() -> Option<String> {
    let out = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8(out.stdout).ok()?.trim().to_string())
}

fn rustc_version() -> Option<String> {
    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let out = Command::new(rustc).arg("--version").output().ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8(out.stdout).ok()?.trim().to_string())
}

fn main() {
    println!(
        "cargo:rustc-env=BUILD_DATE={}",
        chrono::Utc::now().format("%Y-%m-%d %H:%M")
    );
    println!(
        "cargo:rustc-env=BUILD_HASH={}",
        git_hash().unwrap_or_else(|| "unknown".to_string())
    );
    println!(
        "cargo:rustc-env=RUSTC_VERSION={}",
        rustc_version().unwrap_or_else(|| "unknown".to_string())
    );
}
