// CLI integration tests for field and query flows.
use std::path::Path;
use std::process::{Command, Output};

use serde_json::{Value, json};

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_fielddb");
    Command::new(exe)
}

fn run(dir: &Path, args: &[&str]) -> Output {
    cmd()
        .arg("--dir")
        .arg(dir)
        .args(args)
        .output()
        .expect("run fielddb")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("stdout json")
}

fn stderr_json(output: &Output) -> Value {
    let text = String::from_utf8_lossy(&output.stderr);
    let line = text.lines().next().expect("stderr line");
    serde_json::from_str(line).expect("stderr json")
}

#[test]
fn put_get_list_info_delete_flow() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path().join("fields");

    let put = run(&dir, &["field", "put", "price", r#"{"k1": 10, "k2": 2.5}"#]);
    assert!(put.status.success(), "{}", String::from_utf8_lossy(&put.stderr));
    let put_json = stdout_json(&put);
    assert_eq!(put_json["field"]["name"], "price");
    assert_eq!(put_json["field"]["entries"], 2);
    assert!(
        put_json["field"]["path"]
            .as_str()
            .expect("path")
            .ends_with("field_price.fdb")
    );

    let get = run(&dir, &["field", "get", "price"]);
    assert!(get.status.success());
    assert_eq!(
        stdout_json(&get),
        json!({"field": "price", "entries": {"k1": 10, "k2": 2.5}})
    );

    let list = run(&dir, &["field", "list"]);
    assert!(list.status.success());
    let names: Vec<String> = stdout_json(&list)["fields"]
        .as_array()
        .expect("fields")
        .iter()
        .map(|field| field["name"].as_str().expect("name").to_string())
        .collect();
    assert_eq!(names, vec!["price"]);

    let info = run(&dir, &["field", "info", "price"]);
    assert!(info.status.success());
    assert!(stdout_json(&info)["field"]["size_bytes"].as_u64().expect("size") > 64);

    let delete = run(&dir, &["field", "delete", "price"]);
    assert!(delete.status.success());
    assert_eq!(stdout_json(&delete), json!({"deleted": ["price"]}));

    let info = run(&dir, &["field", "info", "price"]);
    assert_eq!(info.status.code(), Some(3));
    let err = stderr_json(&info);
    assert_eq!(err["error"]["kind"], "NotFound");
    assert!(err["error"]["hint"].as_str().expect("hint").contains("field list"));
}

#[test]
fn missing_field_reads_as_empty() {
    let temp = tempfile::tempdir().expect("tempdir");
    let get = run(temp.path(), &["field", "get", "never"]);
    assert!(get.status.success());
    assert_eq!(stdout_json(&get), json!({"field": "never", "entries": {}}));
}

#[test]
fn set_inserts_into_existing_field() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    assert!(run(dir, &["field", "put", "color", r#"{"k1": "red"}"#]).status.success());

    let set = run(dir, &["field", "set", "color", "k2", r#""blue""#]);
    assert!(set.status.success());
    assert_eq!(
        stdout_json(&set),
        json!({"field": "color", "key": "k2", "entries": 2})
    );

    let get = run(dir, &["field", "get", "color"]);
    assert_eq!(stdout_json(&get)["entries"], json!({"k1": "red", "k2": "blue"}));
}

#[test]
fn find_inner_and_outer() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    assert!(run(dir, &["field", "put", "a", r#"{"k1": 1, "k2": 2}"#]).status.success());
    assert!(run(dir, &["field", "put", "b", r#"{"k1": 10}"#]).status.success());

    let inner = run(dir, &["find", "a,b", "--where", ".[1] == null"]);
    assert!(inner.status.success());
    assert_eq!(stdout_json(&inner), json!({"keys": []}));

    let outer = run(dir, &["find", "a,b", "--mode", "outer", "--where", ".[1] == null"]);
    assert!(outer.status.success());
    assert_eq!(stdout_json(&outer), json!({"keys": ["k2"]}));

    let all = run(dir, &["find", "b,a", "--mode", "OUTER_JOIN"]);
    assert!(all.status.success());
    assert_eq!(stdout_json(&all), json!({"keys": ["k1", "k2"]}));
}

#[test]
fn group_by_sums_values() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    assert!(
        run(dir, &["field", "put", "group", r#"{"k1": "g1", "k2": "g1", "k3": "g2"}"#])
            .status
            .success()
    );
    assert!(run(dir, &["field", "put", "v", r#"{"k1": 1, "k2": 2, "k3": 3}"#]).status.success());

    let group = run(
        dir,
        &[
            "group",
            "v",
            "--by",
            "group",
            "--where",
            "reduce .[0][] as $x (0; . + $x) > 2",
        ],
    );
    assert!(group.status.success(), "{}", String::from_utf8_lossy(&group.stderr));
    assert_eq!(
        stdout_json(&group),
        json!({"groups": [
            {"group": "g1", "keys": ["k1", "k2"]},
            {"group": "g2", "keys": ["k3"]},
        ]})
    );
}

#[test]
fn bad_inputs_are_usage_errors() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();

    let bad_name = run(dir, &["field", "get", "../escape"]);
    assert_eq!(bad_name.status.code(), Some(2));
    assert_eq!(stderr_json(&bad_name)["error"]["kind"], "Usage");

    let bad_mode = run(dir, &["find", "a", "--mode", "sideways"]);
    assert_eq!(bad_mode.status.code(), Some(2));

    let bad_expr = run(dir, &["find", "a", "--where", ".[0] =="]);
    assert_eq!(bad_expr.status.code(), Some(2));

    let not_object = run(dir, &["field", "put", "a", "[1, 2]"]);
    assert_eq!(not_object.status.code(), Some(2));
    assert_eq!(stderr_json(&not_object)["error"]["message"], "field data must be a JSON object");

    let dup = run(dir, &["find", "a,a"]);
    assert_eq!(dup.status.code(), Some(2));
}

#[test]
fn runtime_expression_errors_use_predicate_exit_code() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    assert!(run(dir, &["field", "put", "a", r#"{"k1": "text"}"#]).status.success());

    let find = run(dir, &["find", "a", "--where", ".[0] - 1 > 0"]);
    assert_eq!(find.status.code(), Some(10));
    assert_eq!(stderr_json(&find)["error"]["kind"], "Predicate");
}

#[test]
fn corrupt_field_reports_corrupt() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    std::fs::write(dir.join("field_bad.fdb"), b"not a field blob").expect("write");

    let get = run(dir, &["field", "get", "bad"]);
    assert_eq!(get.status.code(), Some(7));
    let err = stderr_json(&get);
    assert_eq!(err["error"]["kind"], "Corrupt");
    assert_eq!(err["error"]["field"], "bad");
}

#[test]
fn version_prints_json_when_piped() {
    let output = cmd().arg("version").output().expect("version");
    assert!(output.status.success());
    let value = stdout_json(&output);
    assert_eq!(value["name"], "fielddb");
    assert_eq!(value["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn non_finite_floats_print_as_tags() {
    let temp = tempfile::tempdir().expect("tempdir");
    let dir = temp.path();
    let put = run(dir, &["field", "put", "reading", r#"{"k1": {"$float": "nan"}, "k2": 1.5}"#]);
    assert!(put.status.success(), "{}", String::from_utf8_lossy(&put.stderr));

    let set = run(dir, &["field", "set", "reading", "k3", r#"{"$float": "inf"}"#]);
    assert!(set.status.success());

    let get = run(dir, &["field", "get", "reading"]);
    assert_eq!(
        stdout_json(&get)["entries"],
        json!({"k1": {"$float": "nan"}, "k2": 1.5, "k3": {"$float": "inf"}})
    );
}
