#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Handler panics are caught and rolled back, which only works when the
//! release profile unwinds.

const WORKSPACE_MANIFEST: &str = include_str!("../../../Cargo.toml");

#[test]
fn release_profile_unwinds_on_panic() {
    let manifest: toml::Value = toml::from_str(WORKSPACE_MANIFEST).unwrap();
    let panic = manifest
        .get("profile")
        .and_then(|p| p.get("release"))
        .and_then(|r| r.get("panic"))
        .and_then(toml::Value::as_str)
        .unwrap_or("unwind");
    assert_eq!(panic, "unwind");
}
