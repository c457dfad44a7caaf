//! Loading engine and worker configuration from files.

use anyhow::Result;
use sketchflow::testing::*;
use sketchflow::*;
use std::io::Write;
use std::time::Duration;

#[test]
fn worker_config_round_trips_through_json() -> Result<()> {
    let config = WorkerConfig {
        listen_address: "0.0.0.0:4100".to_string(),
        memoize: false,
        engine: EngineConfig {
            bundle_interval: Duration::from_millis(40),
            rpc_timeout: Duration::from_secs(5),
            compute_threads: Some(3),
            max_frame_length: 1 << 16,
        },
    };
    let file = temp_worker_config(&config)?;
    assert_eq!(WorkerConfig::from_json_file(file.path())?, config);
    Ok(())
}

#[test]
fn invalid_files_are_config_errors() -> Result<()> {
    let mut garbage = tempfile::NamedTempFile::new()?;
    write!(garbage, "not json")?;
    let err = WorkerConfig::from_json_file(garbage.path()).err();
    assert!(matches!(err, Some(Error::Config(_))), "{err:?}");

    let invalid = WorkerConfig {
        listen_address: " ".to_string(),
        ..WorkerConfig::default()
    };
    let file = temp_worker_config(&invalid)?;
    let err = WorkerConfig::from_json_file(file.path()).err();
    assert_eq!(err.map(|e| e.kind()), Some(ErrorKind::Internal));

    let missing = WorkerConfig::from_json_file("/nonexistent/worker.json").err();
    assert!(matches!(missing, Some(Error::Config(_))));
    Ok(())
}

#[test]
fn engine_is_built_from_config() -> Result<()> {
    let config = EngineConfig {
        compute_threads: Some(2),
        bundle_interval: Duration::from_millis(75),
        ..EngineConfig::default()
    };
    let engine = Engine::from_config(&config)?;
    assert_eq!(engine.bundler().window(), Duration::from_millis(75));
    assert!(engine.bundler().is_enabled());

    let broken = EngineConfig {
        compute_threads: Some(0),
        ..EngineConfig::default()
    };
    assert!(Engine::from_config(&broken).is_err());
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_rejects_invalid_config() {
    let config = EngineConfig {
        max_frame_length: 0,
        ..EngineConfig::default()
    };
    assert!(RemoteClient::on_current_runtime(&config).is_err());
}
