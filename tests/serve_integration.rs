//! Purpose: End-to-end tests for the HTTP/JSON server.
//! Exports: None (integration test module).
//! Role: Drive `fielddb serve` over TCP and check routes, status mapping and auth.
//! Invariants: Uses a loopback-only server with a temp data directory.
//! Invariants: Bounded waits avoid test flakiness; servers are killed on drop.

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::process::{Child, Command, Stdio};
use std::sync::{Mutex, MutexGuard};
use std::thread::sleep;
use std::time::{Duration, Instant};

use serde_json::{Value, json};

type TestResult<T> = Result<T, Box<dyn std::error::Error>>;

static SERVER_LOCK: Mutex<()> = Mutex::new(());

struct TestServer {
    child: Child,
    base_url: String,
    _server_guard: MutexGuard<'static, ()>,
}

impl TestServer {
    fn start(data_dir: &std::path::Path) -> TestResult<Self> {
        Self::start_with_args(data_dir, &[])
    }

    fn start_with_args(data_dir: &std::path::Path, extra: &[&str]) -> TestResult<Self> {
        let guard = SERVER_LOCK
            .lock()
            .unwrap_or_else(|poison| poison.into_inner());
        let mut last_err: Option<Box<dyn std::error::Error>> = None;
        for _attempt in 0..3 {
            let port = pick_port()?;
            let bind = format!("127.0.0.1:{port}");

            let mut child = Command::new(env!("CARGO_BIN_EXE_fielddb"))
                .arg("--dir")
                .arg(data_dir)
                .arg("serve")
                .arg("--bind")
                .arg(&bind)
                .args(extra)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .spawn()?;

            match wait_for_server(&mut child, bind.parse()?) {
                Ok(()) => {
                    return Ok(Self {
                        child,
                        base_url: format!("http://{bind}"),
                        _server_guard: guard,
                    });
                }
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    last_err = Some(err);
                    sleep(Duration::from_millis(30));
                }
            }
        }

        Err(last_err.unwrap_or_else(|| "server failed to start".into()))
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn read_json(response: ureq::Response) -> TestResult<Value> {
    Ok(serde_json::from_str(&response.into_string()?)?)
}

/// Expect an error status and return it with the decoded error body.
fn expect_status(result: Result<ureq::Response, ureq::Error>) -> TestResult<(u16, Value)> {
    match result {
        Err(ureq::Error::Status(code, response)) => Ok((code, read_json(response)?)),
        Err(err) => Err(err.into()),
        Ok(response) => Err(format!("expected error status, got {}", response.status()).into()),
    }
}

fn put_field(server: &TestServer, name: &str, entries: Value) -> TestResult<Value> {
    let body = json!({ "entries": entries }).to_string();
    let response = ureq::put(&server.url(&format!("/v0/fields/{name}")))
        .set("content-type", "application/json")
        .send_string(&body)?;
    read_json(response)
}

#[test]
fn field_routes_round_trip() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(temp.path())?;

    let put = put_field(&server, "price", json!({"k1": 10, "k2": 2.5}))?;
    assert_eq!(put["field"]["name"], "price");
    assert_eq!(put["field"]["entries"], 2);

    let response = ureq::get(&server.url("/v0/fields/price")).call()?;
    assert_eq!(response.header("fielddb-version"), Some("0"));
    assert_eq!(
        read_json(response)?,
        json!({"field": "price", "entries": {"k1": 10, "k2": 2.5}})
    );

    let list = read_json(ureq::get(&server.url("/v0/fields")).call()?)?;
    assert_eq!(list["fields"][0]["name"], "price");

    let deleted = read_json(ureq::delete(&server.url("/v0/fields/price")).call()?)?;
    assert_eq!(deleted, json!({"ok": true}));

    let (code, body) = expect_status(ureq::delete(&server.url("/v0/fields/price")).call())?;
    assert_eq!(code, 404);
    assert_eq!(body["error"]["kind"], "NotFound");
    Ok(())
}

#[test]
fn find_and_group_routes() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(temp.path())?;
    put_field(&server, "a", json!({"k1": 1, "k2": 2}))?;
    put_field(&server, "b", json!({"k1": 10}))?;
    put_field(&server, "group", json!({"k1": "g1", "k2": "g1", "k3": "g2"}))?;
    put_field(&server, "v", json!({"k1": 1, "k2": 2, "k3": 3}))?;

    let inner = read_json(
        ureq::get(&server.url("/v0/find/a,b/inner"))
            .query("where", ".[1] == null")
            .call()?,
    )?;
    assert_eq!(inner, json!({"keys": []}));

    let outer = read_json(
        ureq::get(&server.url("/v0/find/a,b/OUTER_JOIN"))
            .query("where", ".[1] == null")
            .call()?,
    )?;
    assert_eq!(outer, json!({"keys": ["k2"]}));

    let groups = read_json(
        ureq::get(&server.url("/v0/group/v/inner"))
            .query("by", "group")
            .query("where", "reduce .[0][] as $x (0; . + $x) > 2")
            .call()?,
    )?;
    assert_eq!(
        groups,
        json!({"groups": [
            {"group": "g1", "keys": ["k1", "k2"]},
            {"group": "g2", "keys": ["k3"]},
        ]})
    );
    Ok(())
}

#[test]
fn bad_requests_map_to_400() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start(temp.path())?;
    put_field(&server, "a", json!({"k1": "text"}))?;

    let (code, body) = expect_status(ureq::get(&server.url("/v0/find/a/sideways")).call())?;
    assert_eq!(code, 400);
    assert_eq!(body["error"]["kind"], "Usage");

    let (code, body) = expect_status(
        ureq::get(&server.url("/v0/find/a/inner"))
            .query("where", ".[0] ==")
            .call(),
    )?;
    assert_eq!(code, 400);
    assert!(body["error"]["hint"].as_str().is_some());

    let (code, body) = expect_status(
        ureq::get(&server.url("/v0/find/a/inner"))
            .query("where", ".[0] - 1 > 0")
            .call(),
    )?;
    assert_eq!(code, 400);
    assert_eq!(body["error"]["kind"], "Predicate");

    let (code, body) = expect_status(ureq::get(&server.url("/v0/fields/a.b")).call())?;
    assert_eq!(code, 400);
    assert_eq!(body["error"]["field"], "a.b");

    let (code, _) = expect_status(
        ureq::get(&server.url("/v0/group/a/inner"))
            .query("by", "..")
            .call(),
    )?;
    assert_eq!(code, 400);
    Ok(())
}

#[test]
fn corrupt_field_is_500() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    std::fs::write(temp.path().join("field_bad.fdb"), b"garbage")?;
    let server = TestServer::start(temp.path())?;

    let (code, body) = expect_status(ureq::get(&server.url("/v0/find/bad/outer")).call())?;
    assert_eq!(code, 500);
    assert_eq!(body["error"]["kind"], "Corrupt");
    Ok(())
}

#[test]
fn token_is_required_when_configured() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start_with_args(temp.path(), &["--token", "devtoken"])?;

    let (code, body) = expect_status(ureq::get(&server.url("/v0/fields")).call())?;
    assert_eq!(code, 401);
    assert_eq!(body["error"]["message"], "missing bearer token");

    let (code, _) = expect_status(
        ureq::get(&server.url("/v0/fields"))
            .set("Authorization", "Bearer wrong")
            .call(),
    )?;
    assert_eq!(code, 401);

    let ok = ureq::get(&server.url("/v0/fields"))
        .set("Authorization", "Bearer devtoken")
        .call()?;
    assert_eq!(ok.status(), 200);
    Ok(())
}

#[test]
fn read_only_access_forbids_writes() -> TestResult<()> {
    let temp = tempfile::tempdir()?;
    let server = TestServer::start_with_args(temp.path(), &["--access", "read-only"])?;

    let (code, body) = expect_status(
        ureq::put(&server.url("/v0/fields/a"))
            .set("content-type", "application/json")
            .send_string(r#"{"entries": {}}"#),
    )?;
    assert_eq!(code, 403);
    assert_eq!(body["error"]["kind"], "Permission");

    let listed = read_json(ureq::get(&server.url("/v0/fields")).call()?)?;
    assert_eq!(listed, json!({"fields": []}));
    Ok(())
}

fn pick_port() -> TestResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")?;
    let port = listener.local_addr()?.port();
    drop(listener);
    Ok(port)
}

fn wait_for_server(child: &mut Child, addr: SocketAddr) -> TestResult<()> {
    let url = format!("http://{addr}/healthz");
    let start = Instant::now();
    loop {
        if let Ok(resp) = ureq::get(&url).call() {
            if resp.status() == 200 {
                return Ok(());
            }
        }
        if let Some(status) = child.try_wait()? {
            let mut stderr = String::new();
            if let Some(mut pipe) = child.stderr.take() {
                let _ = pipe.read_to_string(&mut stderr);
            }
            let detail = stderr.trim();
            return Err(format!(
                "server exited before ready (status: {status}, stderr: {})",
                if detail.is_empty() { "<empty>" } else { detail }
            )
            .into());
        }
        if start.elapsed() > Duration::from_secs(8) {
            return Err("server did not start in time".into());
        }
        sleep(Duration::from_millis(20));
    }
}
