//! Process lifecycle tests against small shell stand-ins for an engine.
//!
//! `sh -c <script> sh --test <db>` puts `--test` in `$1` and the database path
//! in `$2`, which lets a one-line script play the engine.

#[cfg(all(test, unix))]
mod tests {
    use std::io::{BufRead, Cursor};
    use std::path::PathBuf;
    use std::time::{Duration, Instant};

    use tracing_subscriber::EnvFilter;

    use crate::process::*;
    use crate::protocol::{Command, ProtocolError};
    use crate::{HarnessConfig, HarnessError};

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    }

    /// An "engine" running `script` under `sh`.
    fn shell_engine(script: &str) -> HarnessConfig {
        init_tracing();
        HarnessConfig {
            engine_args: vec!["-c".into(), script.into(), "sh".into()],
            ..HarnessConfig::new("sh")
        }
    }

    /// Acknowledges every line by echoing it.
    fn echo_engine() -> HarnessConfig {
        shell_engine("exec cat")
    }

    #[test]
    fn engine_receives_test_flag_and_db_path() {
        let mut session =
            EngineSession::start(shell_engine(r#"printf '%s\n%s\n' "$1" "$2"; exec cat"#))
                .unwrap();

        assert_eq!(session.send(&Command::CreateReader).unwrap(), TEST_MODE_FLAG);
        let db = session.send(&Command::CreateReader).unwrap();
        assert_eq!(PathBuf::from(db), session.db_path());
        assert_eq!(session.db_path(), session.dir().join("db.kv"));
    }

    #[test]
    fn send_round_trips_through_child() {
        let mut session = EngineSession::start(echo_engine()).unwrap();
        let reply = session
            .send(&Command::CreateBucket {
                bucket: b"A".to_vec(),
            })
            .unwrap();
        assert_eq!(reply, "create-bucket,41");
        assert!(session.is_running());
    }

    #[test]
    fn kill_restarts_on_same_path() {
        let mut session = EngineSession::start(echo_engine()).unwrap();
        let path = session.db_path().to_path_buf();

        session.kill().unwrap();
        assert_eq!(session.restarts(), 1);
        assert_eq!(session.db_path(), path);
        assert_eq!(session.send(&Command::CreateReader).unwrap(), "create-reader,");

        session.kill().unwrap();
        assert_eq!(session.restarts(), 2);
    }

    #[test]
    fn kill_tolerates_engine_exiting_without_ack() {
        // Exits as soon as it reads a line.
        let mut session = EngineSession::start(shell_engine("read line")).unwrap();
        session.kill().unwrap();
        assert!(session.is_running());
    }

    #[test]
    fn early_exit_surfaces_as_disconnect() {
        let mut session = EngineSession::start(shell_engine("exit 0")).unwrap();
        let err = session.send(&Command::CreateReader).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Protocol(ProtocolError::Disconnected { .. })
        ));
    }

    #[test]
    fn rejected_hash_check_is_reported() {
        let mut session = EngineSession::start(shell_engine(
            "while read line; do echo 'error: mismatch'; done",
        ))
        .unwrap();
        let err = session
            .ensure_hash(crate::canonical::Digest::new([0; 32]))
            .unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Protocol(ProtocolError::Rejected {
                command: "ensure-hash",
                ..
            })
        ));
    }

    #[test]
    fn stopped_session_refuses_commands() {
        let mut session = EngineSession::start(echo_engine()).unwrap();
        session.stop().unwrap();
        assert!(!session.is_running());
        assert!(matches!(
            session.send(&Command::CreateReader),
            Err(ProcessError::NotRunning)
        ));
        // Stopping twice is harmless.
        session.stop().unwrap();
    }

    #[test]
    fn dropping_session_removes_directory() {
        let session = EngineSession::start(echo_engine()).unwrap();
        let dir = session.dir().to_path_buf();
        assert!(dir.is_dir());
        drop(session);
        assert!(!dir.exists());
    }

    #[test]
    fn missing_binary_fails_to_spawn() {
        init_tracing();
        let err = EngineSession::start(HarnessConfig::new("/nonexistent/kv-engine")).unwrap_err();
        assert!(matches!(
            err,
            HarnessError::Process(ProcessError::Spawn { .. })
        ));
    }

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        let config = HarnessConfig {
            db_file_name: "nested/db.kv".into(),
            ..echo_engine()
        };
        assert!(matches!(
            EngineSession::start(config),
            Err(HarnessError::InvalidConfig(_))
        ));
    }

    #[test]
    fn stop_reports_exit_status() {
        let process = EngineProcess::start(&shell_engine("exit 3"), std::path::Path::new("db"))
            .unwrap();
        let status = process.stop().unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[test]
    fn hung_engine_times_out_and_is_killed() {
        let config = HarnessConfig {
            reply_timeout: Some(Duration::from_millis(200)),
            ..shell_engine("read line; exec sleep 30")
        };
        let mut session = EngineSession::start(config).unwrap();
        let err = session.send(&Command::CreateReader).unwrap_err();
        assert!(matches!(
            err,
            ProcessError::Protocol(ProtocolError::Timeout {
                command: "create-reader"
            })
        ));

        let started = Instant::now();
        session.stop().unwrap();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!session.is_running());
    }

    #[test]
    fn reply_reader_yields_lines_then_eof() {
        let mut replies =
            ReplyReader::spawn(Cursor::new(b"ok\nlast".to_vec()), Some(Duration::from_secs(5)))
                .unwrap();
        let mut line = String::new();
        assert_eq!(replies.read_line(&mut line).unwrap(), 3);
        assert_eq!(line, "ok\n");

        line.clear();
        replies.read_line(&mut line).unwrap();
        assert_eq!(line, "last");

        line.clear();
        assert_eq!(replies.read_line(&mut line).unwrap(), 0);
    }
}
