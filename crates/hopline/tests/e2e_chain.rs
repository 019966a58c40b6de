use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use serial_test::serial;

fn free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn bin() -> &'static str {
    env!("CARGO_BIN_EXE_hopline")
}

fn write_config(temp: &Path, ports: &[u16; 3]) -> PathBuf {
    let config_path = temp.join("config.toml");
    let config = format!(
        r#"forward_timeout = "2s"
persist_budget = "1s"
export_flush_ms = 25
export_batch_size = 16

[[services]]
name = "user-service"
listen_addr = "127.0.0.1:{}"

[[services]]
name = "order-service"
listen_addr = "127.0.0.1:{}"

[[services]]
name = "audit-service"
listen_addr = "127.0.0.1:{}"
"#,
        ports[0], ports[1], ports[2]
    );
    std::fs::write(&config_path, config).unwrap();
    config_path
}

fn spawn_chain(temp: &Path) -> (Child, [u16; 3]) {
    let ports = [free_port(), free_port(), free_port()];
    let config_path = write_config(temp, &ports);
    let db_path = temp.join("hopline.duckdb");

    let child = Command::new(bin())
        .arg("run")
        .arg("--config")
        .arg(&config_path)
        .arg("--db-path")
        .arg(&db_path)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();

    (child, ports)
}

async fn wait_http_ready(port: u16, child: &mut Child) {
    let client = reqwest::Client::new();
    let mut ready = false;
    for _ in 0..100 {
        assert!(child.try_wait().unwrap().is_none(), "hopline exited early");
        if let Ok(resp) = client
            .get(format!("http://127.0.0.1:{port}/health"))
            .send()
            .await
        {
            if resp.status().is_success() {
                ready = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert!(ready, "service on port {port} not ready");
}

#[tokio::test]
#[serial]
async fn e2e_run_send_and_trace() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, ports) = spawn_chain(temp.path());
    for port in ports {
        wait_http_ready(port, &mut child).await;
    }

    let send = Command::new(bin())
        .arg("send")
        .arg("--addr")
        .arg(format!("127.0.0.1:{}", ports[0]))
        .arg("--user-id")
        .arg("1001")
        .arg("--action")
        .arg("checkout")
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&send.stdout);
    assert!(stdout.contains("status=ok"), "send output: {stdout}");
    assert!(stdout.contains("user-service -> order-service -> audit-service"));

    let trace_id = stdout
        .lines()
        .find_map(|l| l.split("trace=").nth(1))
        .map(|s| s.trim().to_string())
        .expect("trace id in send output");
    assert_eq!(trace_id.len(), 32);

    tokio::time::sleep(Duration::from_millis(400)).await;

    let trace = Command::new(bin())
        .arg("trace")
        .arg(&trace_id)
        .arg("--addr")
        .arg(format!("127.0.0.1:{}", ports[2]))
        .output()
        .unwrap();
    let stdout = String::from_utf8_lossy(&trace.stdout);
    assert!(stdout.contains(&format!("TRACE {trace_id}")), "trace output: {stdout}");
    assert!(stdout.contains("user-service"));
    assert!(stdout.contains("order-service"));
    assert!(stdout.contains("audit-service"));
    assert!(stdout.contains("-- 3 records --"));

    let _ = child.kill();
    let _ = child.wait();
}

#[tokio::test]
#[serial]
async fn e2e_send_json_shape() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, ports) = spawn_chain(temp.path());
    for port in ports {
        wait_http_ready(port, &mut child).await;
    }

    let send = Command::new(bin())
        .arg("--json")
        .arg("send")
        .arg("--addr")
        .arg(format!("127.0.0.1:{}", ports[0]))
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&send.stdout).unwrap();
    assert_eq!(value["status"], "ok");
    assert_eq!(
        value["service_chain"],
        serde_json::json!(["user-service", "order-service", "audit-service"])
    );
    assert_eq!(value["downstream"]["downstream"]["data"]["audit_status"], "passed");

    let _ = child.kill();
    let _ = child.wait();
}

#[tokio::test]
#[serial]
async fn e2e_trace_unknown_id_fails() {
    let temp = tempfile::tempdir().unwrap();
    let (mut child, ports) = spawn_chain(temp.path());
    wait_http_ready(ports[2], &mut child).await;

    let trace = Command::new(bin())
        .arg("trace")
        .arg("ffffffffffffffffffffffffffffffff")
        .arg("--addr")
        .arg(format!("127.0.0.1:{}", ports[2]))
        .output()
        .unwrap();
    assert!(!trace.status.success());
    let stderr = String::from_utf8_lossy(&trace.stderr);
    assert!(stderr.contains("no records for trace"), "stderr: {stderr}");

    let _ = child.kill();
    let _ = child.wait();
}
