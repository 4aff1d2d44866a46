use predicates::prelude::*;
use tempfile::TempDir;

use super::common::{HELLO, TestEnv};

#[test]
fn push_then_pull_into_another_root() {
  let cache = TempDir::new().unwrap();
  let cache_dir = cache.path().to_str().unwrap();

  let producer = TestEnv::new();
  let file = producer.write_file("hello.json", HELLO);
  let report = producer.build_json(&file);
  let filename = report[0]["filename"].as_str().unwrap().to_string();

  producer
    .bramble_cmd()
    .args(["push", cache_dir])
    .arg(&file)
    .assert()
    .success()
    .stdout(predicate::str::contains("Outputs uploaded: 1"));
  assert!(cache.path().join("derivation").join(&filename).is_file());

  let consumer = TestEnv::new();
  let out = consumer
    .bramble_cmd()
    .args(["pull", "-o", "json", cache_dir, &filename])
    .output()
    .unwrap();
  assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
  let pulled: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
  let output = pulled[0]["outputs"][0].as_str().unwrap();
  assert!(output.starts_with(consumer.root_path().to_str().unwrap()), "{output}");
  assert_eq!(std::fs::read_to_string(format!("{output}/hi")).unwrap(), "hi\n");
}

#[test]
fn pushing_twice_skips_existing_outputs() {
  let cache = TempDir::new().unwrap();
  let env = TestEnv::new();
  let file = env.write_file("hello.json", HELLO);
  env.build_json(&file);

  for expected in ["Outputs uploaded: 1", "Outputs already cached: 1"] {
    env
      .bramble_cmd()
      .arg("push")
      .arg(cache.path())
      .arg(&file)
      .assert()
      .success()
      .stdout(predicate::str::contains(expected));
  }
}

#[test]
fn pushing_unbuilt_derivations_fails() {
  let cache = TempDir::new().unwrap();
  let env = TestEnv::new();
  let file = env.write_file("hello.json", HELLO);

  env
    .bramble_cmd()
    .arg("push")
    .arg(cache.path())
    .arg(&file)
    .assert()
    .failure()
    .stderr(predicate::str::contains("has not been built"));
}

#[test]
fn pulling_unknown_derivations_fails() {
  let cache = TempDir::new().unwrap();
  let env = TestEnv::new();

  env
    .bramble_cmd()
    .arg("pull")
    .arg(cache.path())
    .arg("missing.drv")
    .assert()
    .failure()
    .stderr(predicate::str::contains("not found in cache"));
}
