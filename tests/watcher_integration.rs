//! Integration test for the debounced configuration watcher.

use mogoly::config::Config;
use mogoly::watcher::watch_config;
use std::sync::mpsc;
use std::time::Duration;

async fn wait_for_reload(rx: &mpsc::Receiver<Config>, deadline: Duration) -> Option<Config> {
    let started = std::time::Instant::now();
    while started.elapsed() < deadline {
        if let Ok(config) = rx.try_recv() {
            return Some(config);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    None
}

#[tokio::test]
async fn test_overwrite_triggers_reload_with_new_config() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mogoly.yaml");
    std::fs::write(
        &path,
        "server:\n  - name: a\n    protocol: http\n    host: 127.0.0.1\n    port: 8080\n",
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let _watcher = watch_config(&path, move |config| {
        let _ = tx.send(config);
    })
    .unwrap();

    // Give the watcher a beat to register before mutating the file.
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(
        &path,
        "server:\n  - name: b\n    protocol: http\n    host: 127.0.0.1\n    port: 8081\n",
    )
    .unwrap();

    let config = wait_for_reload(&rx, Duration::from_secs(2))
        .await
        .expect("reload callback within 2s");
    assert_eq!(config.servers.len(), 1);
    assert_eq!(config.servers[0].name, "b");
    assert_eq!(config.servers[0].port, 8081);
}

#[tokio::test]
async fn test_atomic_rename_triggers_reload() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mogoly.json");
    std::fs::write(
        &path,
        r#"{"server":[{"name":"a","protocol":"http","host":"127.0.0.1","port":8080}]}"#,
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let _watcher = watch_config(&path, move |config| {
        let _ = tx.send(config);
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Write a sibling file and rename it over the target, the way atomic
    // editors commit.
    let staging = dir.path().join(".mogoly.json.tmp");
    std::fs::write(
        &staging,
        r#"{"server":[{"name":"c","protocol":"http","host":"127.0.0.1","port":8082}]}"#,
    )
    .unwrap();
    std::fs::rename(&staging, &path).unwrap();

    let config = wait_for_reload(&rx, Duration::from_secs(2))
        .await
        .expect("reload callback within 2s");
    assert_eq!(config.servers[0].name, "c");
    assert_eq!(config.servers[0].port, 8082);
}

#[tokio::test]
async fn test_invalid_content_does_not_fire_callback() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mogoly.yaml");
    std::fs::write(
        &path,
        "server:\n  - name: a\n    protocol: http\n    host: 127.0.0.1\n    port: 8080\n",
    )
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let _watcher = watch_config(&path, move |config| {
        let _ = tx.send(config);
    })
    .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    std::fs::write(&path, "server: [ definitely broken").unwrap();

    // Debounce plus all read retries still fit well inside this window.
    let reloaded = wait_for_reload(&rx, Duration::from_millis(1500)).await;
    assert!(reloaded.is_none(), "broken config must not reach the callback");
}
