//! Full install sessions: resolution, fetch, patch, build and promotion.

use cellar_lib::install::{InstallError, NodeError, Provenance};
use cellar_lib::registry::Registry;
use serde_json::json;

use super::common::{NO_FLAGS, TestEnv, kegs, read};
use cellar_lib::Formula;

const LIBFOO_SH: &str = "#!/bin/sh\necho original\n";

const LIBFOO_PATCH: &str = "--- a/libfoo.sh\n+++ b/libfoo.sh\n@@ -1,2 +1,2 @@\n #!/bin/sh\n-echo original\n+echo patched\n";

fn libfoo(env: &TestEnv) -> Formula {
  let (url, sha256) = env.tarball(
    "libfoo",
    "1.0",
    &[("libfoo.sh", LIBFOO_SH), ("README", "libfoo readme\n")],
  );
  super::common::formula(json!({
    "name": "libfoo",
    "url": url,
    "sha256": sha256,
    "options": [{ "name": "with-bar", "description": "Build with bar support" }],
    "dependencies": [{ "target": "bar", "when": { "with": "bar" } }],
    "patches": [{ "inline": LIBFOO_PATCH }],
    "install": [
      { "op": "install", "src": "libfoo.sh", "dest": "$${bin}", "rename": "libfoo" },
      { "op": "install", "src": "README", "dest": "$${doc}" },
      { "op": "write_file", "path": "$${prefix}/bar-prefix", "contents": "$${opt:bar}", "when": { "with": "bar" } }
    ],
    "test": [
      { "op": "assert_output", "command": "cat", "args": ["$${bin}/libfoo"], "expect": "patched" }
    ]
  }))
}

fn bar(env: &TestEnv) -> Formula {
  let (url, sha256) = env.tarball("bar", "2.1", &[("bar.h", "#define BAR 1\n")]);
  super::common::formula(json!({
    "name": "bar",
    "url": url,
    "sha256": sha256,
    "install": [{ "op": "install", "src": "bar.h", "dest": "$${include}" }]
  }))
}

#[test]
fn optional_dependency_follows_flag() {
  let env = TestEnv::new();
  let installer = env.installer(vec![libfoo(&env), bar(&env)]);

  let plain = installer.resolve("libfoo", NO_FLAGS).unwrap();
  assert!(!plain.contains("bar"));
  assert_eq!(plain.len(), 1);

  let with_bar = installer.resolve("libfoo", &["with-bar"]).unwrap();
  let order: Vec<&str> = with_bar.build_order().iter().map(|n| n.name()).collect();
  assert_eq!(order, vec!["bar", "libfoo"]);
}

#[tokio::test]
async fn install_promotes_links_and_registers() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let installer = env.installer(vec![libfoo(&env), bar(&env)]);

  let report = installer.install("libfoo", NO_FLAGS).await.unwrap().into_result().unwrap();
  assert_eq!(report.provenance("libfoo"), Some(Provenance::Built));

  let record = report.record("libfoo").unwrap().clone();
  assert_eq!(record.version, "1.0");
  assert!(record.source_digest.as_deref().is_some_and(|d| d.starts_with("sha256:")));
  assert!(record.root.starts_with(prefix.join("Cellar/libfoo")));

  // patched before the install steps ran
  assert_eq!(read(&record.root.join("bin/libfoo")), "#!/bin/sh\necho patched\n");
  assert!(record.root.join("share/doc/libfoo/README").is_file());
  assert!(record.root.join("INSTALL_RECEIPT.json").is_file());
  assert!(!record.root.join("bar-prefix").exists());

  let linked = prefix.join("bin/libfoo");
  assert!(linked.symlink_metadata().unwrap().file_type().is_symlink());
  assert_eq!(std::fs::read_link(&linked).unwrap(), record.root.join("bin/libfoo"));
  assert_eq!(std::fs::read_link(prefix.join("opt/libfoo")).unwrap(), record.root);

  assert_eq!(installer.registry().active("libfoo"), Some(record.clone()));
  assert!(kegs(&prefix, "bar").is_empty());
}

#[tokio::test]
async fn flagged_install_builds_dependency_first() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let installer = env.installer(vec![libfoo(&env), bar(&env)]);

  let report = installer
    .install("libfoo", &["with-bar"])
    .await
    .unwrap()
    .into_result()
    .unwrap();

  let names: Vec<&str> = report.installed.iter().map(|i| i.record.name.as_str()).collect();
  assert_eq!(names, vec!["bar", "libfoo"]);

  let libfoo = report.record("libfoo").unwrap();
  assert_eq!(libfoo.runtime_dependencies, vec!["bar".to_string()]);
  assert!(libfoo.options.enabled.contains("bar"));
  assert_eq!(read(&libfoo.root.join("bar-prefix")), prefix.join("opt/bar").display().to_string());
  assert!(prefix.join("include/bar.h").exists());
}

#[tokio::test]
async fn option_sets_get_distinct_kegs() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let installer = env.installer(vec![libfoo(&env), bar(&env)]);

  let plain = installer.install("libfoo", NO_FLAGS).await.unwrap().into_result().unwrap();
  let flagged = installer.install("libfoo", &["with-bar"]).await.unwrap().into_result().unwrap();

  let plain = plain.record("libfoo").unwrap();
  let flagged = flagged.record("libfoo").unwrap();
  assert_ne!(plain.fingerprint, flagged.fingerprint);
  assert_eq!(kegs(&prefix, "libfoo").len(), 2);
  assert_eq!(installer.registry().records("libfoo").len(), 2);
  assert_eq!(installer.registry().active("libfoo").as_ref(), Some(flagged));
  assert_eq!(std::fs::read_link(prefix.join("opt/libfoo")).unwrap(), flagged.root);
}

#[tokio::test]
async fn reinstall_is_a_no_op() {
  let env = TestEnv::new();
  let installer = env.installer(vec![libfoo(&env), bar(&env)]);

  let first = installer.install("libfoo", NO_FLAGS).await.unwrap().into_result().unwrap();
  let second = installer.install("libfoo", NO_FLAGS).await.unwrap().into_result().unwrap();

  assert_eq!(second.provenance("libfoo"), Some(Provenance::AlreadyInstalled));
  assert_eq!(first.record("libfoo"), second.record("libfoo"));
}

#[tokio::test]
async fn keg_only_formula_is_not_linked() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let (url, sha256) = env.tarball("oldssl", "1.1", &[("ssl.h", "/* ssl */\n")]);
  let oldssl = super::common::formula(json!({
    "name": "oldssl",
    "url": url,
    "sha256": sha256,
    "keg_only": "conflicts with the system library",
    "install": [{ "op": "install", "src": "ssl.h", "dest": "$${include}" }]
  }));
  let installer = env.installer(vec![oldssl]);

  let report = installer.install("oldssl", NO_FLAGS).await.unwrap().into_result().unwrap();
  let record = report.record("oldssl").unwrap();

  assert!(record.keg_only);
  assert!(record.root.join("include/ssl.h").is_file());
  assert!(!prefix.join("include/ssl.h").exists());
  assert_eq!(std::fs::read_link(prefix.join("opt/oldssl")).unwrap(), record.root);
}

#[tokio::test]
async fn failed_dependency_skips_dependents() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let (url, sha256) = env.tarball("broken", "0.1", &[("Makefile", "all:\n")]);
  let broken = super::common::formula(json!({
    "name": "broken",
    "url": url,
    "sha256": sha256,
    "install": [{ "op": "system", "command": "false" }]
  }));
  let (url, sha256) = env.tarball("app", "3.0", &[("app.sh", "#!/bin/sh\n")]);
  let app = super::common::formula(json!({
    "name": "app",
    "url": url,
    "sha256": sha256,
    "dependencies": ["broken"],
    "install": [{ "op": "install", "src": "app.sh", "dest": "$${bin}" }]
  }));
  let installer = env.installer(vec![broken, app]);

  let report = installer.install("app", NO_FLAGS).await.unwrap();
  assert!(!report.is_success());
  assert_eq!(report.failed.len(), 1);
  assert_eq!(report.failed[0].0, "broken");
  assert!(matches!(report.failed[0].1.as_ref(), NodeError::Build(_)));
  assert_eq!(report.skipped.len(), 1);
  assert_eq!(report.skipped[0].name, "app");
  assert_eq!(report.skipped[0].dependency, "broken");

  // no keg, no staging leftovers, nothing registered
  let broken_dir = prefix.join("Cellar/broken");
  assert!(!broken_dir.exists() || std::fs::read_dir(&broken_dir).unwrap().next().is_none());
  assert!(kegs(&prefix, "app").is_empty());
  assert!(installer.registry().installed().is_empty());

  let err = report.into_result().unwrap_err();
  assert!(matches!(err, InstallError::Node { name, .. } if name == "broken"));
}

#[tokio::test]
async fn self_test_failures_are_warnings() {
  let env = TestEnv::new();
  let (url, sha256) = env.tarball("greeter", "1.0", &[("greet.sh", "#!/bin/sh\necho hi\n")]);
  let greeter = super::common::formula(json!({
    "name": "greeter",
    "url": url,
    "sha256": sha256,
    "install": [{ "op": "install", "src": "greet.sh", "dest": "$${bin}" }],
    "test": [{ "op": "assert_output", "command": "cat", "args": ["$${bin}/greet.sh"], "expect": "goodbye" }]
  }));
  let mut config = env.config();
  config.run_tests = true;
  let installer = env.installer_with(config, vec![greeter]);

  let report = installer.install("greeter", NO_FLAGS).await.unwrap();
  assert!(report.is_success());
  assert_eq!(report.test_warnings.len(), 1);
  assert!(installer.registry().active("greeter").is_some());

  assert!(matches!(installer.test("greeter").await, Err(InstallError::Test(_))));
}

#[tokio::test]
async fn explicit_test_runs_against_active_keg() {
  let env = TestEnv::new();
  let installer = env.installer(vec![libfoo(&env), bar(&env)]);

  assert!(matches!(
    installer.test("libfoo").await,
    Err(InstallError::NotInstalled(name)) if name == "libfoo"
  ));

  installer.install("libfoo", NO_FLAGS).await.unwrap().into_result().unwrap();
  installer.test("libfoo").await.unwrap();
}

#[test]
fn second_session_on_prefix_is_refused() {
  let env = TestEnv::new();
  let _first = env.installer(Vec::new());

  let second = cellar_lib::Installer::open(env.config(), super::common::facts(), Default::default());
  assert!(matches!(second, Err(InstallError::Lock(_))));
}

fn versioned_tool(env: &TestEnv, version: &str) -> Formula {
  let (url, sha256) = env.tarball("tool", version, &[("tool.sh", "#!/bin/sh\necho tool\n")]);
  super::common::formula(json!({
    "name": "tool",
    "version": version,
    "url": url,
    "sha256": sha256,
    "install": [{ "op": "install", "src": "tool.sh", "dest": "$${bin}", "rename": "tool" }]
  }))
}

#[tokio::test]
async fn failed_registration_keeps_previous_keg_active() {
  let env = TestEnv::new();
  let prefix = env.prefix();

  let old = {
    let installer = env.installer(vec![versioned_tool(&env, "1.0")]);
    let report = installer.install("tool", NO_FLAGS).await.unwrap().into_result().unwrap();
    report.record("tool").unwrap().clone()
  };

  // the index cannot be rewritten while its temp path is a directory
  std::fs::create_dir_all(prefix.join("var/cellar/registry.json.tmp")).unwrap();

  let installer = env.installer(vec![versioned_tool(&env, "2.0")]);
  let report = installer.install("tool", NO_FLAGS).await.unwrap();
  assert_eq!(report.failed.len(), 1);
  assert!(matches!(report.failed[0].1.as_ref(), NodeError::Registry(_)));

  assert_eq!(std::fs::read_link(prefix.join("opt/tool")).unwrap(), old.root);
  assert_eq!(std::fs::read_link(prefix.join("bin/tool")).unwrap(), old.root.join("bin/tool"));
  assert_eq!(kegs(&prefix, "tool"), vec![old.key()]);
  assert_eq!(installer.registry().active("tool"), Some(old.clone()));

  let on_disk = Registry::open(&prefix).unwrap();
  assert_eq!(on_disk.active("tool"), Some(old));
}

#[tokio::test]
async fn failed_first_registration_leaves_no_alias() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  std::fs::create_dir_all(prefix.join("var/cellar/registry.json.tmp")).unwrap();

  let installer = env.installer(vec![versioned_tool(&env, "1.0")]);
  let report = installer.install("tool", NO_FLAGS).await.unwrap();

  assert!(!report.is_success());
  assert!(prefix.join("opt/tool").symlink_metadata().is_err());
  assert!(prefix.join("bin/tool").symlink_metadata().is_err());
  assert!(kegs(&prefix, "tool").is_empty());
}

#[tokio::test]
async fn failed_build_leaves_no_configuration_behind() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let (url, sha256) = env.tarball("leaky", "0.1", &[("leaky.conf", "key = value\n")]);
  let leaky = super::common::formula(json!({
    "name": "leaky",
    "url": url,
    "sha256": sha256,
    "install": [
      { "op": "write_file", "path": "$${etc}/leaky.conf", "contents": "key = value\n" },
      { "op": "write_file", "path": "$${var}/leaky/state", "contents": "0\n" },
      { "op": "system", "command": "false" }
    ]
  }));
  let installer = env.installer(vec![leaky]);

  let report = installer.install("leaky", NO_FLAGS).await.unwrap();
  assert!(matches!(report.failed[0].1.as_ref(), NodeError::Build(_)));
  assert!(!prefix.join("etc/leaky.conf").exists());
  assert!(!prefix.join("var/leaky").exists());
  assert!(kegs(&prefix, "leaky").is_empty());
}

#[tokio::test]
async fn configuration_is_part_of_the_keg() {
  let env = TestEnv::new();
  let prefix = env.prefix();
  let (url, sha256) = env.tarball("daemon", "1.0", &[("daemon.conf", "port = 80\n")]);
  let daemon = super::common::formula(json!({
    "name": "daemon",
    "url": url,
    "sha256": sha256,
    "install": [{ "op": "install", "src": "daemon.conf", "dest": "$${etc}" }]
  }));
  let installer = env.installer(vec![daemon]);

  let report = installer.install("daemon", NO_FLAGS).await.unwrap().into_result().unwrap();
  let record = report.record("daemon").unwrap();

  assert!(record.files.contains(&std::path::PathBuf::from("etc/daemon.conf")));
  assert_eq!(
    std::fs::read_link(prefix.join("etc/daemon.conf")).unwrap(),
    record.root.join("etc/daemon.conf")
  );
}
