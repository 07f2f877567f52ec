//! Generates the compile-time provisioning constants.
//!
//! Network name, broker endpoint and device identity come from build-time
//! environment variables; the TLS material is read from PEM files in the
//! certificate directory. Anything missing ends up as an empty string, which
//! the firmware reports as a provisioning error at startup.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

const CA_FILE: &str = "AmazonRootCA1.pem";
const CERT_FILE: &str = "certificate.pem.crt";
const KEY_FILE: &str = "private.pem.key";

fn env_or(name: &str, default: &str) -> String {
    println!("cargo:rerun-if-env-changed={name}");
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn read_pem(dir: &Path, file: &str) -> String {
    let path = dir.join(file);
    println!("cargo:rerun-if-changed={}", path.display());
    std::fs::read_to_string(&path).unwrap_or_default()
}

fn main() {
    let manifest_dir = PathBuf::from(std::env::var("CARGO_MANIFEST_DIR").unwrap());
    let default_certs = manifest_dir.join("..").join("certs");
    let certs_dir = PathBuf::from(env_or(
        "DALLAS_IOT_CERTS",
        &default_certs.to_string_lossy(),
    ));

    let constants = [
        ("WIFI_SSID", env_or("WIFI_SSID", "")),
        ("WIFI_PASS", env_or("WIFI_PASS", "")),
        ("AWS_IOT_ENDPOINT", env_or("AWS_IOT_ENDPOINT", "")),
        ("THING_NAME", env_or("THING_NAME", "ESP32_Dallas")),
        ("AWS_CERT_CA", read_pem(&certs_dir, CA_FILE)),
        ("AWS_CERT_CRT", read_pem(&certs_dir, CERT_FILE)),
        ("AWS_CERT_PRIVATE", read_pem(&certs_dir, KEY_FILE)),
    ];

    let mut out = String::new();
    for (name, value) in constants {
        writeln!(out, "pub const {name}: &str = {value:?};").unwrap();
    }

    let out_dir = PathBuf::from(std::env::var("OUT_DIR").unwrap());
    std::fs::write(out_dir.join("provisioning.rs"), out).unwrap();
}
