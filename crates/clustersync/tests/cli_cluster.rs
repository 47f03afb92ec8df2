#![cfg(feature = "cli")]

use std::net::TcpListener;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

fn unique_temp_dir(tag: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "clustersync-cluster-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    dir
}

fn free_ports<const N: usize>() -> [u16; N] {
    let listeners: Vec<TcpListener> = (0..N)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("listener should bind"))
        .collect();
    std::array::from_fn(|i| listeners[i].local_addr().expect("local addr").port())
}

fn wait_with_timeout(mut child: std::process::Child, timeout: Duration) -> Output {
    let start = Instant::now();
    loop {
        if child.try_wait().expect("child should be pollable").is_some() {
            return child.wait_with_output().expect("child output");
        }
        if start.elapsed() >= timeout {
            let _ = child.kill();
            let output = child.wait_with_output().expect("child output");
            panic!(
                "node did not finish: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        thread::sleep(Duration::from_millis(25));
    }
}

fn spawn_node(topology: &Path, node: usize, client: bool, frames: u64) -> std::process::Child {
    let mut command = Command::new(env!("CARGO_BIN_EXE_clustersync"));
    command
        .args(["--format", "json", "--log-level", "warn", "node", "--local"])
        .arg("--topology")
        .arg(topology)
        .arg("--node")
        .arg(node.to_string())
        .arg("--frames")
        .arg(frames.to_string())
        .args(["--fps", "200", "--sync-timeout", "10s", "--connect-timeout", "10s"]);
    if client {
        command.arg("--client");
    }
    command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("node should start")
}

fn summary(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).expect("node should emit a json summary")
}

#[test]
fn master_and_client_run_frame_locked() {
    let dir = unique_temp_dir("lockstep");
    let [master_sync, client_sync, client_data] = free_ports::<3>();
    let path = dir.join("cluster.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "master_address": "127.0.0.1",
                "firm_sync": true,
                "nodes": [
                    {{ "address": "127.0.0.1", "sync_port": {master_sync} }},
                    {{ "address": "127.0.0.1", "sync_port": {client_sync}, "data_transfer_port": {client_data} }}
                ]
            }}"#
        ),
    )
    .expect("topology should be writable");

    let master = spawn_node(&path, 0, false, 30);
    let client = spawn_node(&path, 1, true, 30);

    let master = wait_with_timeout(master, Duration::from_secs(30));
    let client = wait_with_timeout(client, Duration::from_secs(30));

    assert!(master.status.success(), "{}", String::from_utf8_lossy(&master.stderr));
    assert!(client.status.success(), "{}", String::from_utf8_lossy(&client.stderr));

    let master = summary(&master);
    let client = summary(&client);
    assert_eq!(master["frames"], 30);
    assert_eq!(master["timeouts"], 0);
    assert_eq!(client["frames"], 30);
    assert_eq!(client["stopped"], false);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn client_stops_when_master_leaves() {
    let dir = unique_temp_dir("master-leaves");
    let [master_sync, client_sync] = free_ports::<2>();
    let path = dir.join("cluster.json");
    std::fs::write(
        &path,
        format!(
            r#"{{
                "master_address": "127.0.0.1",
                "nodes": [
                    {{ "address": "127.0.0.1", "sync_port": {master_sync} }},
                    {{ "address": "127.0.0.1", "sync_port": {client_sync} }}
                ]
            }}"#
        ),
    )
    .expect("topology should be writable");

    let master = spawn_node(&path, 0, false, 10);
    let client = spawn_node(&path, 1, true, 1_000_000);

    let master = wait_with_timeout(master, Duration::from_secs(30));
    let client = wait_with_timeout(client, Duration::from_secs(30));

    assert!(master.status.success(), "{}", String::from_utf8_lossy(&master.stderr));
    assert!(client.status.success(), "{}", String::from_utf8_lossy(&client.stderr));
    assert_eq!(summary(&client)["stopped"], true);

    let _ = std::fs::remove_dir_all(&dir);
}
