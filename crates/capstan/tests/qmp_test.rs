//! QMP client behavior against a scripted monitor: handshake, FIFO
//! response matching under interleaved events, error mapping, timeouts
//! and disconnects.

use capstan::Error;
use capstan::qmp::QmpClient;
use capstan::qmp::mock::MockQmp;
use serde_json::{Value, json};
use std::time::Duration;

fn socket_path(dir: &tempfile::TempDir) -> std::path::PathBuf {
    dir.path().join("qmp_socket")
}

#[tokio::test]
async fn handshake_negotiates_capabilities_and_reads_version() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |_cmd, _args| {
        vec![json!({"return": {}})]
    })
    .unwrap();

    let client = QmpClient::connect(mock.path()).await.unwrap();
    assert_eq!(client.qemu_version(), Some((8, 2)));
    assert_eq!(mock.commands()[0].0, "qmp_capabilities");
}

#[tokio::test]
async fn responses_match_fifo_despite_interleaved_events() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |cmd, _args| match cmd {
        "query-status" => vec![
            json!({"event": "STOP", "timestamp": {"seconds": 1, "microseconds": 0}}),
            json!({"event": "RESUME", "timestamp": {"seconds": 2, "microseconds": 0}}),
            json!({"return": {"status": "running", "running": true}}),
        ],
        "query-balloon" => vec![json!({"return": {"actual": 4096}})],
        _ => vec![json!({"return": {}})],
    })
    .unwrap();

    let client = QmpClient::connect(mock.path()).await.unwrap();
    let mut events = client.subscribe_events();

    let (status, running) = client.query_status().await.unwrap();
    assert_eq!(status, "running");
    assert!(running);

    let balloon = client.execute("query-balloon", None).await.unwrap();
    assert_eq!(balloon["actual"], 4096);

    // both events were fanned out, in arrival order
    assert_eq!(events.recv().await.unwrap().event, "STOP");
    assert_eq!(events.recv().await.unwrap().event, "RESUME");
}

#[tokio::test]
async fn qmp_errors_are_fatal_only_on_execute() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |_cmd, _args| {
        vec![json!({"error": {"class": "DeviceNotFound", "desc": "no cd0"}})]
    })
    .unwrap();
    let client = QmpClient::connect(mock.path()).await.unwrap();

    // non-fatal call hands the error back for caller-level retry
    let response = client
        .call("eject", Some(json!({"device": "cd0"})))
        .await
        .unwrap();
    assert!(response.is_error());

    let err = client.execute("eject", None).await.unwrap_err();
    match err {
        Error::Qmp { class, desc } => {
            assert_eq!(class, "DeviceNotFound");
            assert_eq!(desc, "no cd0");
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[tokio::test]
async fn late_responses_are_discarded_not_rematched() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |cmd, _args| match cmd {
        "sleepy" => vec![
            json!({"__delay_ms": 300}),
            json!({"return": {"who": "sleepy"}}),
        ],
        "query-balloon" => vec![json!({"return": {"actual": 777}})],
        _ => vec![json!({"return": {}})],
    })
    .unwrap();
    let client = QmpClient::connect(mock.path()).await.unwrap();

    let err = client
        .call_timeout("sleepy", None, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout(_)));

    // the sleepy response arrives later and must not answer this call
    let balloon = client.execute("query-balloon", None).await.unwrap();
    assert_eq!(balloon["actual"], 777);
}

#[tokio::test]
async fn wait_for_event_filters_by_name() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |cmd, _args| match cmd {
        "poke" => vec![
            json!({"event": "MIGRATION", "data": {"status": "setup"}}),
            json!({"event": "MIGRATION", "data": {"status": "completed"}}),
            json!({"return": {}}),
        ],
        _ => vec![json!({"return": {}})],
    })
    .unwrap();
    let client = QmpClient::connect(mock.path()).await.unwrap();

    let (event, _) = tokio::join!(
        client.wait_for_event("MIGRATION", Duration::from_secs(5)),
        client.execute("poke", None)
    );
    assert_eq!(event.unwrap().data["status"], "setup");
}

#[tokio::test]
async fn server_going_away_fails_pending_and_later_calls() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |cmd, _args| match cmd {
        // no response: the connection dies while this request is pending
        "void" => vec![],
        _ => vec![json!({"return": {}})],
    })
    .unwrap();
    let client = QmpClient::connect(mock.path()).await.unwrap();

    let pending = {
        let client = &client;
        async move { client.call("void", None).await }
    };
    let killer = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        drop(mock);
    };
    let (result, ()) = tokio::join!(pending, killer);
    assert!(matches!(result.unwrap_err(), Error::Disconnected));

    assert!(!client.is_connected());
    let err = client.call("query-status", None).await.unwrap_err();
    assert!(matches!(err, Error::Disconnected));
}

#[tokio::test]
async fn human_monitor_wraps_the_text_monitor() {
    let dir = tempfile::tempdir().unwrap();
    let mock = MockQmp::start(&socket_path(&dir), |cmd, args| {
        assert_eq!(cmd, "human-monitor-command");
        let line = args["command-line"].as_str().unwrap().to_string();
        vec![json!({"return": format!("ack: {line}")})]
    })
    .unwrap();
    let client = QmpClient::connect(mock.path()).await.unwrap();

    let ret = client.human_monitor("stopcapture 0").await.unwrap();
    assert_eq!(ret, Value::String("ack: stopcapture 0".into()));
}
