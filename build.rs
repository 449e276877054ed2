//! Build metadata for `delivery-tracker --version` and the `about` command.
//!
//! - `BUILD_TIMESTAMP`: UTC time of the build, or `unknown`.
//! - `BUILD_GIT_SHA`: short commit hash (`-dirty` suffix for local edits),
//!   or `unknown` outside a git checkout.

use std::process::Command;

fn main() {
    let timestamp = build_timestamp().unwrap_or_else(|| "unknown".into());
    let sha = git_sha().unwrap_or_else(|| "unknown".into());

    println!("cargo:rustc-env=BUILD_TIMESTAMP={timestamp}");
    println!("cargo:rustc-env=BUILD_GIT_SHA={sha}");
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");
    println!("cargo:rerun-if-changed=build.rs");
}

/// Trimmed stdout of `program args...` when it exits successfully.
fn command_output(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    let text = text.trim();
    (!text.is_empty()).then(|| text.to_string())
}

fn git_sha() -> Option<String> {
    command_output("git", &["describe", "--always", "--dirty", "--abbrev=8"])
}

// chrono is a runtime dependency only, so ask the platform for the time.
fn build_timestamp() -> Option<String> {
    if cfg!(windows) {
        command_output(
            "powershell",
            &[
                "-NoProfile",
                "-Command",
                "(Get-Date).ToUniversalTime().ToString('yyyy-MM-ddTHH:mm:ssZ')",
            ],
        )
    } else {
        command_output("date", &["-u", "+%Y-%m-%dT%H:%M:%SZ"])
    }
}
