use super::*;

fn retained(topic: &str, payload: &[u8]) -> StoredRetainedMessage {
    StoredRetainedMessage {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        qos: 1,
        properties: StoredProperties::default(),
        timestamp_secs: models::now_unix_secs(),
    }
}

fn session(client_id: &str) -> StoredSession {
    StoredSession {
        client_id: client_id.to_string(),
        protocol_version: 5,
        session_expiry_interval: 3600,
        subscriptions: vec![StoredSubscription {
            filter: "a/#".to_string(),
            qos: 1,
            no_local: false,
            retain_as_published: false,
            retain_handling: 0,
            subscription_id: None,
        }],
        pending_messages: Vec::new(),
        inflight: Vec::new(),
        will: None,
        will_delay_interval: 0,
        created_at_secs: models::now_unix_secs(),
        disconnected_at_secs: Some(models::now_unix_secs()),
    }
}

fn put_retained(topic: &str, payload: &[u8]) -> PersistenceOp {
    PersistenceOp::PutRetained {
        topic: topic.to_string(),
        message: retained(topic, payload),
    }
}

#[tokio::test]
async fn test_memory_backend_applies_in_order() {
    let backend = MemoryBackend::new();

    let ops = vec![
        put_retained("topic1", &[1]),
        put_retained("topic2", &[2]),
        PersistenceOp::RemoveRetained {
            topic: "topic1".to_string(),
        },
        PersistenceOp::PutSession {
            client_id: "c1".to_string(),
            session: session("c1"),
        },
    ];
    backend.apply(ops).await.unwrap();

    let loaded = backend.load().await.unwrap();
    assert_eq!(loaded.retained.len(), 1);
    assert_eq!(loaded.retained[0].0, "topic2");
    assert_eq!(loaded.retained[0].1.payload, vec![2]);
    assert_eq!(loaded.sessions.len(), 1);
    assert_eq!(backend.session("c1").unwrap().subscriptions.len(), 1);

    backend.apply(vec![PersistenceOp::ClearRetained]).await.unwrap();
    assert_eq!(backend.retained_len(), 0);
    assert_eq!(backend.sessions_len(), 1);
}

#[tokio::test]
async fn test_file_backend_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");

    {
        let backend = FileBackend::open(&path).unwrap();
        backend
            .apply(vec![
                put_retained("t", b"abc"),
                PersistenceOp::PutSession {
                    client_id: "c1".to_string(),
                    session: session("c1"),
                },
            ])
            .await
            .unwrap();
        backend.flush().await.unwrap();
    }

    let reopened = FileBackend::open(&path).unwrap();
    let loaded = reopened.load().await.unwrap();
    assert_eq!(loaded.retained.len(), 1);
    assert_eq!(loaded.retained[0].1.payload, b"abc".to_vec());
    assert_eq!(loaded.sessions[0].1, session_with_times(&loaded.sessions[0].1));
}

// timestamps are taken at construction, compare everything else
fn session_with_times(stored: &StoredSession) -> StoredSession {
    let mut expected = session("c1");
    expected.created_at_secs = stored.created_at_secs;
    expected.disconnected_at_secs = stored.disconnected_at_secs;
    expected
}

#[tokio::test]
async fn test_file_backend_rejects_foreign_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.bin");
    std::fs::write(&path, b"definitely not a snapshot").unwrap();

    assert!(matches!(
        FileBackend::open(&path),
        Err(PersistenceError::Deserialize(_))
    ));
}

#[tokio::test]
async fn test_missing_file_starts_empty() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FileBackend::open(dir.path().join("missing.bin")).unwrap();
    let loaded = backend.load().await.unwrap();
    assert!(loaded.retained.is_empty());
    assert!(loaded.sessions.is_empty());
}

#[tokio::test]
async fn test_manager_flushes_on_shutdown() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 1000);

    for i in 0..10 {
        manager.write(put_retained(&format!("t/{}", i), b"x"));
    }
    manager.write(PersistenceOp::RemoveSession {
        client_id: "gone".to_string(),
    });
    manager.shutdown().await.unwrap();

    assert_eq!(backend.retained_len(), 10);
    assert_eq!(backend.sessions_len(), 0);

    // writes after shutdown are dropped
    manager.write(put_retained("late", b"x"));
    assert_eq!(backend.retained_len(), 10);
}

#[tokio::test]
async fn test_manager_flushes_full_batches() {
    let backend = Arc::new(MemoryBackend::new());
    let manager = PersistenceManager::new(backend.clone(), Duration::from_secs(3600), 2);

    manager.write(PersistenceOp::PutSession {
        client_id: "c1".to_string(),
        session: session("c1"),
    });
    manager.write(PersistenceOp::PutSession {
        client_id: "c2".to_string(),
        session: session("c2"),
    });

    for _ in 0..100 {
        if backend.sessions_len() == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert_eq!(backend.sessions_len(), 2);
    manager.shutdown().await.unwrap();
}
