//! Concurrent requests for the same keg within one session.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use cellar_lib::Formula;
use cellar_lib::formula::SourceSpec;
use cellar_lib::install::Provenance;
use cellar_lib::sandbox::{BuildContext, BuildError, InstallProcedure};
use cellar_lib::util::hash::Checksum;
use tokio::task::JoinSet;

use super::common::{NO_FLAGS, TestEnv};

/// Counts how often it was asked to build.
struct CountingInstall {
  builds: Arc<AtomicUsize>,
}

#[async_trait]
impl InstallProcedure for CountingInstall {
  async fn install(&self, ctx: &mut BuildContext) -> Result<(), BuildError> {
    self.builds.fetch_add(1, Ordering::SeqCst);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let bin = ctx.paths().bin.clone();
    ctx.write_file(&bin.join("libfoo"), "#!/bin/sh\n")
  }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn same_keg_builds_once() {
  let env = TestEnv::new();
  let (url, sha256) = env.tarball("libfoo", "1.0", &[("libfoo.c", "\n")]);
  let builds = Arc::new(AtomicUsize::new(0));
  let libfoo = Formula::new(
    "libfoo",
    SourceSpec::new(url).with_checksum(Checksum::sha256(&sha256).unwrap()),
  )
  .with_install(Arc::new(CountingInstall { builds: builds.clone() }));
  let installer = env.installer(vec![libfoo]);

  let mut tasks = JoinSet::new();
  for _ in 0..6 {
    let installer = installer.clone();
    tasks.spawn(async move { installer.install("libfoo", NO_FLAGS).await });
  }

  let mut records = Vec::new();
  let mut built = 0;
  while let Some(joined) = tasks.join_next().await {
    let report = joined.unwrap().unwrap().into_result().unwrap();
    if report.provenance("libfoo") == Some(Provenance::Built) {
      built += 1;
    }
    records.push(report.record("libfoo").unwrap().clone());
  }

  assert_eq!(builds.load(Ordering::SeqCst), 1);
  assert_eq!(built, 1);
  assert!(records.windows(2).all(|w| w[0] == w[1]));
  assert_eq!(installer.registry().records("libfoo").len(), 1);
}
