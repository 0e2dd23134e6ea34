//! Cross-layer tests: several sessions sharing one store, disconnects,
//! persistence through SQLite, and profile survival across restarts.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use sqlx::SqlitePool;
    use tokio::sync::mpsc;

    use crate::db::pool::{create_pool, run_migrations};
    use crate::db::queries::nodes;
    use crate::engine::events::SessionEvent;
    use crate::engine::identity::{FileProfileStore, LocalProfile, MemoryProfileStore};
    use crate::engine::messages::{self, MessageStream};
    use crate::engine::presence::sweep_expired_presence;
    use crate::engine::session::{SessionManager, SessionSettings};
    use crate::engine::now_ms;
    use crate::store::{MemoryStore, StoreConnection, StoreEventKind};

    // ── Helpers ──────────────────────────────────────────────────

    struct Client {
        session: SessionManager,
        events: mpsc::UnboundedReceiver<SessionEvent>,
    }

    impl Client {
        fn connect(store: &Arc<MemoryStore>, username: &str) -> Self {
            Self::connect_with(store, username, SessionSettings::default())
        }

        fn connect_with(store: &Arc<MemoryStore>, username: &str, settings: SessionSettings) -> Self {
            let conn = Arc::new(StoreConnection::open(store.clone()));
            let profiles = MemoryProfileStore::new(LocalProfile {
                uid: None,
                username: Some(username.to_string()),
                saved_servers: Vec::new(),
            });
            let (session, events) =
                SessionManager::new(conn, Box::new(profiles), settings).unwrap();
            Self { session, events }
        }

        fn settle(&mut self) -> Vec<SessionEvent> {
            self.session.process_pending();
            let mut out = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                out.push(event);
            }
            out
        }

        fn message_texts(events: &[SessionEvent]) -> Vec<String> {
            events
                .iter()
                .filter_map(|e| match e {
                    SessionEvent::MessageAppended { message, .. } => Some(message.text.clone()),
                    _ => None,
                })
                .collect()
        }

        fn last_presence(events: &[SessionEvent]) -> Option<Vec<String>> {
            events.iter().rev().find_map(|e| match e {
                SessionEvent::PresenceChanged { users, .. } => {
                    Some(users.iter().map(|u| u.username.clone()).collect())
                }
                _ => None,
            })
        }
    }

    async fn setup_db() -> SqlitePool {
        let pool = create_pool("sqlite::memory:").await.unwrap();
        run_migrations(&pool).await.unwrap();
        pool
    }

    // ── Channel provisioning ─────────────────────────────────────

    #[test]
    fn test_two_sessions_converge_on_one_general() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Client::connect(&store, "alice");
        let mut bob = Client::connect(&store, "bob");

        // Both join before either has handled its empty snapshot
        alice.session.join_server("lobby").unwrap();
        bob.session.join_server("lobby").unwrap();
        alice.settle();
        bob.settle();
        alice.settle();

        let channels = store.get("servers/lobby/channels").unwrap().unwrap();
        assert_eq!(channels.as_object().unwrap().len(), 1);
        assert!(channels.get("general").is_some());
        assert_eq!(alice.session.active_channel(), Some("general"));
        assert_eq!(bob.session.active_channel(), Some("general"));
    }

    #[test]
    fn test_channel_created_by_one_is_seen_by_other() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Client::connect(&store, "alice");
        let mut bob = Client::connect(&store, "bob");
        alice.session.join_server("lobby").unwrap();
        alice.settle();
        bob.session.join_server("lobby").unwrap();
        bob.settle();

        alice.session.create_channel("Game Night").unwrap();
        let events = bob.settle();
        let ids = events.iter().rev().find_map(|e| match e {
            SessionEvent::ChannelsChanged { channels, .. } => {
                Some(channels.iter().map(|c| c.id.clone()).collect::<Vec<_>>())
            }
            _ => None,
        });
        assert_eq!(ids.unwrap(), ["general", "game-night"]);
    }

    // ── Messaging ────────────────────────────────────────────────

    #[test]
    fn test_messages_reach_every_member_in_order() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Client::connect(&store, "alice");
        let mut bob = Client::connect(&store, "bob");
        alice.session.join_server("lobby").unwrap();
        alice.settle();
        bob.session.join_server("lobby").unwrap();
        bob.settle();

        alice.session.post_message("A").unwrap();
        bob.session.post_message("B").unwrap();
        alice.session.post_message("C").unwrap();

        assert_eq!(Client::message_texts(&alice.settle()), ["A", "B", "C"]);
        assert_eq!(Client::message_texts(&bob.settle()), ["A", "B", "C"]);
    }

    #[test]
    fn test_late_joiner_gets_trailing_window() {
        let store = Arc::new(MemoryStore::new());
        let conn = StoreConnection::open(store.clone());
        conn.set(
            "servers/lobby/channels/general",
            json!({"name": "general", "created": 1}),
        )
        .unwrap();
        for i in 0..250 {
            messages::publish(&conn, "lobby", "general", "bot", &format!("m{i}"), 100).unwrap();
        }

        let mut carol = Client::connect(&store, "carol");
        carol.session.join_server("lobby").unwrap();
        let texts = Client::message_texts(&carol.settle());
        assert_eq!(texts.len(), 200);
        assert_eq!(texts[0], "m50");
        assert_eq!(texts[199], "m249");
    }

    #[test]
    fn test_resubscribe_redelivers_only_window() {
        let store = Arc::new(MemoryStore::new());
        let conn = StoreConnection::open(store.clone());
        for i in 0..5 {
            messages::publish(&conn, "s", "c", "bot", &format!("m{i}"), 100).unwrap();
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        let first = MessageStream::subscribe(&conn, "s", "c", 3, tx.clone()).unwrap();
        first.unsubscribe();
        let _second = MessageStream::subscribe(&conn, "s", "c", 3, tx).unwrap();

        let mut keys = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let StoreEventKind::ChildAdded { key, .. } = event.kind {
                keys.push(key);
            }
        }
        // Three from each subscription, no more
        assert_eq!(keys.len(), 6);
        assert_eq!(keys[..3], keys[3..]);
    }

    #[test]
    fn test_no_events_for_old_server_after_leave() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Client::connect(&store, "alice");
        let mut bob = Client::connect(&store, "bob");
        alice.session.join_server("lobby").unwrap();
        alice.settle();
        bob.session.join_server("lobby").unwrap();
        bob.settle();
        alice.settle();

        alice.session.join_server("elsewhere").unwrap();
        alice.settle();
        bob.session.post_message("anyone?").unwrap();
        bob.session.set_display_name("robert").unwrap();

        let events = alice.settle();
        assert!(events.iter().all(|e| match e {
            SessionEvent::MessageAppended { server_id, .. }
            | SessionEvent::PresenceChanged { server_id, .. } => server_id != "lobby",
            _ => true,
        }));
    }

    // ── Presence ─────────────────────────────────────────────────

    #[test]
    fn test_presence_lists_both_users() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Client::connect(&store, "alice");
        let mut bob = Client::connect(&store, "bob");
        alice.session.join_server("lobby").unwrap();
        alice.settle();
        bob.session.join_server("lobby").unwrap();
        bob.settle();

        let seen = Client::last_presence(&alice.settle()).unwrap();
        assert_eq!(seen, ["alice", "bob"]);
    }

    #[test]
    fn test_disconnect_removes_presence_for_others() {
        let store = Arc::new(MemoryStore::new());
        let mut alice = Client::connect(&store, "alice");
        let mut bob = Client::connect(&store, "bob");
        alice.session.join_server("lobby").unwrap();
        alice.settle();
        bob.session.join_server("lobby").unwrap();
        bob.settle();
        alice.settle();

        let bob_uid = bob.session.uid().to_string();
        // Abrupt close: no leave, just the connection going away
        bob.session.connection().disconnect();

        assert_eq!(store.get(&format!("presence/lobby/{bob_uid}")).unwrap(), None);
        let seen = Client::last_presence(&alice.settle()).unwrap();
        assert_eq!(seen, ["alice"]);

        // Operations on the dead connection surface as store errors
        assert_eq!(
            bob.session.post_message("hello?").unwrap_err().error_code(),
            "store_error"
        );
    }

    #[test]
    fn test_expired_presence_is_hidden_and_swept() {
        let store = Arc::new(MemoryStore::new());
        store
            .set(
                "presence/lobby/uid_ghost0",
                json!({"username": "ghost", "ts": now_ms() - 120_000}),
            )
            .unwrap();

        let mut alice = Client::connect(&store, "alice");
        alice.session.join_server("lobby").unwrap();
        let seen = Client::last_presence(&alice.settle()).unwrap();
        assert_eq!(seen, ["alice"]);

        let removed = sweep_expired_presence(&store, Duration::from_secs(30), now_ms()).unwrap();
        assert_eq!(removed, 1);
        assert!(store.get("presence/lobby/uid_ghost0").unwrap().is_none());
        assert!(
            store
                .get(&format!("presence/lobby/{}", alice.session.uid()))
                .unwrap()
                .is_some()
        );
    }

    #[test]
    fn test_short_window_setting_applies() {
        let store = Arc::new(MemoryStore::new());
        let conn = StoreConnection::open(store.clone());
        conn.set("servers/s/channels/c", json!({"name": "c", "created": 1}))
            .unwrap();
        for i in 0..10 {
            messages::publish(&conn, "s", "c", "bot", &format!("m{i}"), 100).unwrap();
        }

        let settings = SessionSettings {
            window_size: 3,
            ..SessionSettings::default()
        };
        let mut dave = Client::connect_with(&store, "dave", settings);
        dave.session.join_server("s").unwrap();
        assert_eq!(Client::message_texts(&dave.settle()), ["m7", "m8", "m9"]);
    }

    // ── Persistence ──────────────────────────────────────────────

    #[tokio::test]
    async fn test_store_round_trips_through_sqlite() {
        let pool = setup_db().await;
        let store = Arc::new(MemoryStore::open(pool.clone()).await.unwrap());
        {
            let mut alice = Client::connect(&store, "alice");
            alice.session.create_server("lobby").unwrap();
            alice.settle();
            alice.session.post_message("kept").unwrap();
            alice.settle();
        }
        store.flush().await.unwrap();

        let reopened = Arc::new(MemoryStore::open(pool.clone()).await.unwrap());
        assert!(reopened.get("servers/lobby/created").unwrap().is_some());
        assert_eq!(
            reopened
                .get("servers/lobby/channels/general/name")
                .unwrap(),
            Some(json!("general"))
        );
        let messages = reopened.get("messages/lobby/general").unwrap().unwrap();
        let texts: Vec<&str> = messages
            .as_object()
            .unwrap()
            .values()
            .filter_map(|m| m["text"].as_str())
            .collect();
        assert_eq!(texts, ["kept"]);
        // Presence never reaches the database
        assert_eq!(reopened.get("presence").unwrap(), None);
        let rows = nodes::load_nodes(&pool).await.unwrap();
        assert!(rows.iter().all(|r| !r.path.starts_with("presence/")));
    }

    #[tokio::test]
    async fn test_file_database_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("campfire.db").display());

        {
            let pool = create_pool(&url).await.unwrap();
            run_migrations(&pool).await.unwrap();
            let store = MemoryStore::open(pool.clone()).await.unwrap();
            store
                .set("servers/lobby/channels/general", json!({"name": "general", "created": 5}))
                .unwrap();
            store.flush().await.unwrap();
            pool.close().await;
        }

        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = MemoryStore::open(pool).await.unwrap();
        assert_eq!(
            store.get("servers/lobby/channels/general").unwrap(),
            Some(json!({"name": "general", "created": 5}))
        );
    }

    #[tokio::test]
    async fn test_messages_after_restart_sort_after_stored_history() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}", dir.path().join("campfire.db").display());
        // History written while the clock ran an hour ahead of this one
        let ahead = now_ms() + 3_600_000;
        let stored = format!("{ahead:012x}{:08x}", 0);

        {
            let pool = create_pool(&url).await.unwrap();
            run_migrations(&pool).await.unwrap();
            let store = MemoryStore::open(pool.clone()).await.unwrap();
            store
                .set(
                    &format!("messages/lobby/general/{stored}"),
                    json!({"username": "bot", "text": "before", "ts": ahead}),
                )
                .unwrap();
            store.flush().await.unwrap();
            pool.close().await;
        }

        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let store = Arc::new(MemoryStore::open(pool).await.unwrap());
        let conn = StoreConnection::open(store);
        let key = messages::publish(&conn, "lobby", "general", "bot", "after", 100).unwrap();
        assert!(key > stored, "{key} should sort after {stored}");

        // A window of one holds the newest message
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _stream = MessageStream::subscribe(&conn, "lobby", "general", 1, tx).unwrap();
        match rx.try_recv().unwrap().kind {
            StoreEventKind::ChildAdded { key: newest, value } => {
                assert_eq!(newest, key);
                assert_eq!(value["text"], "after");
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(rx.try_recv().is_err());
    }

    // ── Local profile ────────────────────────────────────────────

    #[test]
    fn test_profile_file_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profile.json");
        let store = Arc::new(MemoryStore::new());

        let uid = {
            let conn = Arc::new(StoreConnection::open(store.clone()));
            let (mut session, _events) = SessionManager::new(
                conn,
                Box::new(FileProfileStore::new(&path)),
                SessionSettings::default(),
            )
            .unwrap();
            session.join_server("lobby").unwrap();
            session.join_server("games").unwrap();
            session.set_display_name("zed").unwrap();
            session.uid().to_string()
        };

        let conn = Arc::new(StoreConnection::open(store));
        let (session, mut events) = SessionManager::new(
            conn,
            Box::new(FileProfileStore::new(&path)),
            SessionSettings::default(),
        )
        .unwrap();
        assert_eq!(session.uid(), uid);
        assert_eq!(session.display_name(), "zed");
        assert_eq!(
            events.try_recv().unwrap(),
            SessionEvent::Ready {
                uid,
                username: "zed".into(),
                saved_servers: vec!["lobby".into(), "games".into()],
            }
        );
    }
}
