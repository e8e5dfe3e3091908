use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let rustc = std::env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    let Ok(output) = Command::new(rustc).arg("-V").output() else {
        return;
    };

    let Ok(stdout) = String::from_utf8(output.stdout) else {
        return;
    };

    // rustc -V: rustc 1.76.0 (07dca489a 2024-02-04)
    // reported to the agent as Datadog-Meta-Lang-Version: 1.76.0
    if let Some(version) = stdout.split_whitespace().nth(1) {
        println!("cargo:rustc-env=DD_RUSTC_VERSION={}", version);
    }
}
