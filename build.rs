use chrono::{DateTime, Utc};

/// Exposes the build time to the crate as `PMP_BUILD_TIME` (RFC 3339, UTC).
/// Honors `SOURCE_DATE_EPOCH` for reproducible builds.
fn main() {
    println!("cargo:rerun-if-env-changed=SOURCE_DATE_EPOCH");

    let built_at = std::env::var("SOURCE_DATE_EPOCH")
        .ok()
        .and_then(|epoch| epoch.trim().parse::<i64>().ok())
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0))
        .unwrap_or_else(Utc::now);

    println!(
        "cargo:rustc-env=PMP_BUILD_TIME={}",
        built_at.format("%Y-%m-%dT%H:%M:%SZ")
    );
}
