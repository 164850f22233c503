//! The worker bootstrap against a scripted supervising runtime.

use std::time::Duration;

use tokio::net::TcpListener;

use tramway::wire::{Frame, LengthPrefixedFramed};
use tramway::worker::{control, Worker, WorkerOptions};

#[tokio::test]
async fn worker_handshakes_heartbeats_and_terminates() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap();

    let worker = Worker::new(WorkerOptions {
        endpoint,
        uuid: "worker-7".to_owned(),
        locator: None,
    });
    let run = tokio::spawn(async move { worker.run().await });

    let (stream, _) = tokio::time::timeout(Duration::from_secs(2), listener.accept())
        .await
        .expect("worker never dialed in")
        .unwrap();
    let mut runtime = LengthPrefixedFramed::new(stream);

    // The worker announces itself first.
    let hello = runtime.recv().await.unwrap().unwrap();
    assert_eq!(hello.event, control::HANDSHAKE);
    let (uuid,): (String,) = postcard::from_bytes(&hello.payload).unwrap();
    assert_eq!(uuid, "worker-7");

    // Heartbeats are echoed on the same band.
    runtime
        .send(&Frame::new(hello.band, control::HEARTBEAT, Vec::new()))
        .await
        .unwrap();
    let beat = runtime.recv().await.unwrap().unwrap();
    assert_eq!(beat.event, control::HEARTBEAT);
    assert_eq!(beat.band, hello.band);

    // Terminate ends the run loop cleanly.
    runtime
        .send(&Frame::new(hello.band, control::TERMINATE, Vec::new()))
        .await
        .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(2), run)
        .await
        .expect("worker did not exit")
        .unwrap();
    assert!(outcome.is_ok());
}

#[tokio::test]
async fn worker_run_surfaces_a_dead_runtime() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = listener.local_addr().unwrap();
    drop(listener);

    let worker = Worker::new(WorkerOptions {
        endpoint,
        uuid: "worker-8".to_owned(),
        locator: None,
    });
    assert!(worker.run().await.is_err());
}
