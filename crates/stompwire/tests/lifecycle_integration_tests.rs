//! Connection teardown, failure notification and keep-alive

mod integration;

use anyhow::Result;
use integration::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use stompwire::proto::Command;
use stompwire::test_utils::RecordingManager;
use stompwire::{ConnectionFailure, KeepAlive, StompConnection};

#[derive(Default)]
struct Counters {
    failures: Mutex<Vec<String>>,
    closes: AtomicUsize,
}

fn watch(connection: &StompConnection) -> Arc<Counters> {
    let counters = Arc::new(Counters::default());

    let seen = counters.clone();
    connection.add_failure_listener(Arc::new(move |_: &StompConnection, failure: &ConnectionFailure| {
        seen.failures.lock().unwrap().push(failure.to_string());
    }));
    let seen = counters.clone();
    connection.add_close_listener(Arc::new(move |_: &StompConnection| {
        seen.closes.fetch_add(1, Ordering::SeqCst);
    }));

    counters
}

/// Peer hang-up is a normal close
#[tokio::test]
async fn test_peer_eof_destroys_connection() -> Result<()> {
    let mut client = TestClient::start(RecordingManager::new());
    let counters = watch(&client.connection);
    client.connect("1.1").await?;

    client.hang_up().await?;

    assert!(client.connection.is_destroyed());
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    assert!(counters.failures.lock().unwrap().is_empty());
    assert_eq!(client.manager.cleanup_count(), 1);
    Ok(())
}

/// Garbage on the wire fails the connection and closes the stream
#[tokio::test]
async fn test_malformed_input_fails_connection() -> Result<()> {
    let mut client = TestClient::start(RecordingManager::new());
    let counters = watch(&client.connection);

    client.send_raw(b"hello there\n\n\0").await?;

    assert!(client.at_eof().await?);
    client.join().await?;

    let failures = counters.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].starts_with("Decode error"), "{}", failures[0]);
    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    Ok(())
}

/// Oversized frames are rejected before they are fully buffered
#[tokio::test]
async fn test_frame_size_limit() -> Result<()> {
    let config = stompwire::StompConfig::default().with_max_frame_size(1024);
    let mut client = TestClient::start_with(RecordingManager::new(), config);
    let counters = watch(&client.connection);

    let big = frame(Command::Send, &[("destination", "q")]).with_body(vec![b'x'; 4096]);
    client.send(&big).await?;

    assert!(client.at_eof().await?);
    let failures = counters.failures.lock().unwrap().clone();
    assert!(failures[0].contains("Frame too large"), "{}", failures[0]);
    Ok(())
}

/// A content-length beyond any limit fails the connection instead of the reader
#[tokio::test]
async fn test_absurd_content_length_fails_connection() -> Result<()> {
    let mut client = TestClient::start(RecordingManager::new());
    let counters = watch(&client.connection);
    client.connect("1.1").await?;

    client
        .send_raw(b"SEND\ndestination:q\ncontent-length:18446744073709551615\n\n\0")
        .await?;

    assert!(client.at_eof().await?);
    client.join().await?;

    let failures = counters.failures.lock().unwrap().clone();
    assert_eq!(failures.len(), 1);
    assert!(failures[0].contains("Frame too large"), "{}", failures[0]);
    assert_eq!(client.manager.cleanup_count(), 1);
    Ok(())
}

/// Teardown requested from many tasks while the read loop runs happens once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_teardown_with_live_reader() -> Result<()> {
    let mut client = TestClient::start(RecordingManager::new());
    let counters = watch(&client.connection);
    client.connect("1.0").await?;

    let mut tasks = Vec::new();
    for i in 0..16 {
        let connection = client.connection.clone();
        tasks.push(tokio::spawn(async move {
            if i % 3 == 0 {
                connection.fail(ConnectionFailure::KeepAliveExpired).await;
            } else {
                connection.destroy().await;
            }
        }));
    }
    for task in tasks {
        task.await?;
    }

    // The read loop notices the teardown without any more input
    client.join().await?;
    assert!(client.at_eof().await?);

    assert_eq!(counters.closes.load(Ordering::SeqCst), 1);
    assert!(counters.failures.lock().unwrap().len() <= 1);
    assert_eq!(client.manager.cleanup_count(), 1);
    Ok(())
}

/// A silent client is failed by the keep-alive monitor
#[tokio::test]
async fn test_keep_alive_expires_silent_client() -> Result<()> {
    let mut client = TestClient::start(RecordingManager::new());
    let counters = watch(&client.connection);
    client.connect("1.1").await?;

    let _keep_alive = KeepAlive::spawn(client.connection.clone(), Duration::from_millis(100));

    tokio::time::timeout(Duration::from_secs(5), client.connection.closed()).await?;

    let failures = counters.failures.lock().unwrap().clone();
    assert_eq!(failures, vec!["No data received within the keep-alive period"]);
    assert!(client.at_eof().await?);
    Ok(())
}

/// Heart-beats keep a quiet connection alive
#[tokio::test]
async fn test_keep_alive_satisfied_by_heart_beats() -> Result<()> {
    let mut client = TestClient::start(RecordingManager::new());
    let counters = watch(&client.connection);
    client.connect("1.1").await?;

    let keep_alive = KeepAlive::spawn(client.connection.clone(), Duration::from_millis(200));
    for _ in 0..20 {
        client.send_raw(b"\n").await?;
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert!(!client.connection.is_destroyed());
    assert!(!keep_alive.is_finished());
    assert!(counters.failures.lock().unwrap().is_empty());

    drop(keep_alive);
    client.hang_up().await?;
    assert!(counters.failures.lock().unwrap().is_empty());
    Ok(())
}
