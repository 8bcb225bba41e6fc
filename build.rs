//! Build script for meshgate
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! for `meshgate --version`.

fn main() {
    println!("cargo:rerun-if-env-changed=MESHGATE_IPTABLES");

    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
