use predicates::prelude::*;

use super::common::{HELLO, TestEnv};

#[test]
fn build_writes_outputs_into_the_store() {
  let env = TestEnv::new();
  let file = env.write_file("hello.json", HELLO);

  let report = env.build_json(&file);
  let built = &report[0];
  assert_eq!(built["name"], "hello");
  assert_eq!(built["built"], true);

  let out = built["outputs"]["out"].as_str().unwrap();
  assert!(out.contains("bramble_store_padding"), "{out}");
  assert_eq!(std::fs::read_to_string(format!("{out}/hi")).unwrap(), "hi\n");
}

#[test]
fn second_build_is_cut_off() {
  let env = TestEnv::new();
  let file = env.write_file("hello.json", HELLO);

  let first = env.build_json(&file);
  let second = env.build_json(&file);
  assert_eq!(second[0]["built"], false);
  assert_eq!(first[0]["outputs"], second[0]["outputs"]);
}

#[test]
fn outputs_are_the_same_across_roots() {
  let a = TestEnv::new();
  let b = TestEnv::new();
  let report_a = a.build_json(&a.write_file("hello.json", HELLO));
  let report_b = b.build_json(&b.write_file("hello.json", HELLO));

  let hash = |report: &serde_json::Value| {
    let path = report[0]["outputs"]["out"].as_str().unwrap().to_string();
    path.rsplit('/').next().unwrap().to_string()
  };
  assert_eq!(hash(&report_a), hash(&report_b));
}

#[test]
fn text_output_summarizes_the_build() {
  let env = TestEnv::new();
  let file = env.write_file("hello.json", HELLO);

  env
    .bramble_cmd()
    .args(["build", "--sandbox", "direct"])
    .arg(&file)
    .assert()
    .success()
    .stdout(predicate::str::contains("Built hello"))
    .stdout(predicate::str::contains("Duration"));
}

#[test]
fn failing_builder_reports_its_log() {
  let env = TestEnv::new();
  let file = env.write_file(
    "broken.json",
    r#"{"name":"broken","builder":"/bin/sh","args":["-c","echo something went wrong >&2; exit 3"]}"#,
  );

  env
    .bramble_cmd()
    .args(["build", "--sandbox", "direct"])
    .arg(&file)
    .assert()
    .failure()
    .stderr(predicate::str::contains("something went wrong"))
    .stderr(predicate::str::contains("1 derivation(s) failed"));
}

#[test]
fn dependencies_build_first() {
  let env = TestEnv::new();
  let dep: serde_json::Value = serde_json::from_str(HELLO).unwrap();
  let dep_drv: bramble_lib::derivation::Derivation = serde_json::from_value(dep.clone()).unwrap();
  let dep_filename = dep_drv.canonicalize().filename();

  let consumer = serde_json::json!({
    "name": "consumer",
    "builder": "/bin/sh",
    "args": ["-c", "read line < $src/hi; echo \"got $line\" > $out/result"],
    "env": { "src": [{ "pending": { "filename": dep_filename, "output": "out" } }] },
    "dependencies": [{ "filename": dep_filename, "output_name": "out" }],
  });
  let file = env.write_file("both.json", &serde_json::json!([consumer, dep]).to_string());

  let report = env.build_json(&file);
  let consumer = report
    .as_array()
    .unwrap()
    .iter()
    .find(|d| d["name"] == "consumer")
    .unwrap();
  let out = consumer["outputs"]["out"].as_str().unwrap();
  assert_eq!(std::fs::read_to_string(format!("{out}/result")).unwrap(), "got hi\n");
}

#[test]
fn timeout_cancels_a_slow_builder() {
  let env = TestEnv::new();
  let file = env.write_file(
    "slow.json",
    r#"{"name":"slow","builder":"/bin/sh","args":["-c","while :; do :; done"]}"#,
  );

  let start = std::time::Instant::now();
  env
    .bramble_cmd()
    .args(["build", "--sandbox", "direct", "--timeout", "500ms"])
    .arg(&file)
    .assert()
    .failure()
    .stderr(predicate::str::contains("build was cancelled"));
  assert!(start.elapsed() < std::time::Duration::from_secs(20));
}
