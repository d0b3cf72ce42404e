//! Build script for the AI4All cluster node
//!
//! Embeds git revision, build timestamp, target and compiler version.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = command_output("git", &["rev-parse", "--short=8", "HEAD"]);
    let git_branch = command_output("git", &["rev-parse", "--abbrev-ref", "HEAD"]);
    let git_dirty = match Command::new("git").args(["status", "--porcelain"]).output() {
        Ok(out) if out.status.success() => (!out.stdout.is_empty()).to_string(),
        _ => "unknown".to_string(),
    };
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());

    let vars = [
        ("AI4ALL_GIT_HASH", git_hash),
        ("AI4ALL_GIT_BRANCH", git_branch),
        ("AI4ALL_GIT_DIRTY", git_dirty),
        (
            "AI4ALL_BUILD_TIMESTAMP",
            chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        ),
        ("AI4ALL_TARGET", env_or_unknown("TARGET")),
        ("AI4ALL_PROFILE", env_or_unknown("PROFILE")),
        ("AI4ALL_RUSTC_VERSION", command_output(&rustc, &["--version"])),
        ("AI4ALL_HOST", env_or_unknown("HOST")),
    ];

    for (key, value) in &vars {
        println!("cargo:rustc-env={}={}", key, value);
    }
}

fn env_or_unknown(key: &str) -> String {
    env::var(key).unwrap_or_else(|_| "unknown".to_string())
}

/// Trimmed stdout of a command, or "unknown" if it fails
fn command_output(program: &str, args: &[&str]) -> String {
    Command::new(program)
        .args(args)
        .output()
        .ok()
        .filter(|out| out.status.success())
        .and_then(|out| String::from_utf8(out.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}
