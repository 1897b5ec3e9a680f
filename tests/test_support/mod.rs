#![allow(dead_code)]

use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use wiremock::MockServer;

/// A running `classroomd` child; responses are matched to requests by id
/// since slow saves may answer after later requests.
pub struct Sidecar {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
    pending: HashMap<String, Value>,
}

pub fn spawn_sidecar() -> Sidecar {
    let exe = env!("CARGO_BIN_EXE_classroomd");
    let mut child = Command::new(exe)
        .env_remove("CLASSROOMD_API_URL")
        .env_remove("CLASSROOMD_TOKEN")
        .env_remove("CLASSROOMD_TIMEOUT_SECONDS")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn classroomd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    Sidecar {
        child,
        stdin,
        reader: BufReader::new(stdout),
        pending: HashMap::new(),
    }
}

/// Spawn and connect to `server`, whose API root is mounted at `/api/`.
pub fn connected_sidecar(server: &MockServer) -> Sidecar {
    let mut sidecar = spawn_sidecar();
    sidecar.request_ok(
        "connect",
        "session.connect",
        json!({
            "baseUrl": format!("{}/api/", server.uri()),
            "token": "test-token",
            "timeoutSeconds": 5,
        }),
    );
    sidecar
}

impl Sidecar {
    pub fn send_raw(&mut self, line: &str) {
        writeln!(self.stdin, "{}", line).expect("write request");
        self.stdin.flush().expect("flush request");
    }

    pub fn send(&mut self, id: &str, method: &str, params: Value) {
        let payload = json!({
            "id": id,
            "method": method,
            "params": params,
        });
        self.send_raw(&payload.to_string());
    }

    /// Next line that carries no id (protocol-level errors).
    pub fn read_anonymous(&mut self) -> Value {
        self.wait("")
    }

    pub fn wait(&mut self, id: &str) -> Value {
        loop {
            if let Some(v) = self.pending.remove(id) {
                return v;
            }
            let mut line = String::new();
            self.reader.read_line(&mut line).expect("read response line");
            assert!(!line.trim().is_empty(), "sidecar closed while waiting for {}", id);
            let value: Value = serde_json::from_str(line.trim()).expect("parse response json");
            let key = value
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            self.pending.insert(key, value);
        }
    }

    pub fn request(&mut self, id: &str, method: &str, params: Value) -> Value {
        self.send(id, method, params);
        let value = self.wait(id);
        if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
            assert_ne!(
                error_code(&value),
                "not_implemented",
                "unexpected unknown method for {}",
                method
            );
        }
        value
    }

    pub fn request_ok(&mut self, id: &str, method: &str, params: Value) -> Value {
        let value = self.request(id, method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(true),
            "{} failed: {}",
            method,
            value
        );
        value.get("result").cloned().unwrap_or(Value::Null)
    }

    pub fn request_err(&mut self, id: &str, method: &str, params: Value) -> String {
        let value = self.request(id, method, params);
        assert_eq!(
            value.get("ok").and_then(|v| v.as_bool()),
            Some(false),
            "{} unexpectedly succeeded: {}",
            method,
            value
        );
        error_code(&value).to_string()
    }
}

impl Drop for Sidecar {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

pub fn error_code(resp: &Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
}

pub fn rows(result: &Value) -> Vec<Value> {
    result
        .get("rows")
        .and_then(|v| v.as_array())
        .cloned()
        .expect("rows")
}

pub fn row<'a>(rows: &'a [Value], id: &str) -> &'a Value {
    rows.iter()
        .find(|r| r.get("id").and_then(|v| v.as_str()) == Some(id))
        .unwrap_or_else(|| panic!("row {} missing", id))
}

pub async fn bodies_for(server: &MockServer, method: &str, path: &str) -> Vec<Value> {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .into_iter()
        .filter(|r| r.method.as_str() == method && r.url.path() == path)
        .map(|r| serde_json::from_slice(&r.body).unwrap_or(Value::Null))
        .collect()
}
