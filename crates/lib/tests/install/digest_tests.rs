//! Source verification happens before anything touches the source.

use cellar_lib::fetch::FetchError;
use cellar_lib::install::NodeError;
use serde_json::json;

use super::common::{NO_FLAGS, TestEnv, formula, kegs};

#[tokio::test]
async fn digest_mismatch_aborts_before_patch_and_build() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let marker = env.path("build-ran");
  let (url, _) = env.tarball("libfoo", "1.0", &[("libfoo.c", "int main(void) { return 0; }\n")]);
  let declared = format!("deadbeef{}", "0".repeat(56));

  let libfoo = formula(json!({
    "name": "libfoo",
    "url": url,
    "sha256": declared,
    "patches": [{ "inline": "--- a/missing.c\n+++ b/missing.c\n@@ -1 +1 @@\n-a\n+b\n" }],
    "install": [{ "op": "shell", "script": format!("touch {}", marker.display()) }]
  }));
  let installer = env.installer(vec![libfoo]);

  let report = installer.install("libfoo", NO_FLAGS).await.unwrap();
  assert_eq!(report.failed.len(), 1);
  match report.failed[0].1.as_ref() {
    NodeError::Fetch(FetchError::DigestMismatch { expected, actual, .. }) => {
      assert!(expected.contains("deadbeef"));
      assert_ne!(expected, actual);
    }
    other => panic!("expected a digest mismatch, got {other:?}"),
  }

  assert!(!marker.exists());
  assert!(kegs(&prefix, "libfoo").is_empty());
  assert!(installer.registry().installed().is_empty());
  assert!(!prefix.join("opt/libfoo").exists());
}

#[tokio::test]
async fn undeclared_digest_is_refused() {
  let env = TestEnv::new();
  let (url, _) = env.tarball("loose", "1.0", &[("loose.txt", "x\n")]);
  let loose = formula(json!({
    "name": "loose",
    "url": url,
    "install": [{ "op": "install", "src": "loose.txt", "dest": "$${share}" }]
  }));
  let installer = env.installer(vec![loose]);

  let report = installer.install("loose", NO_FLAGS).await.unwrap();
  assert!(matches!(
    report.failed[0].1.as_ref(),
    NodeError::Fetch(FetchError::MissingDigest { .. })
  ));
  assert!(installer.registry().active("loose").is_none());
}
