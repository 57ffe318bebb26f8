use beacon::db::Database;
use beacon::error::CoreError;
use beacon::models::*;
use speculate2::speculate;
use uuid::Uuid;

fn create_test_app(db: &Database, name: &str) -> App {
    db.create_app(CreateAppInput {
        name: name.to_string(),
        secret: None,
        auto_publish: false,
        inherits_from: None,
    })
    .expect("Failed to create app")
}

fn create_child_app(db: &Database, name: &str, parent: Uuid) -> App {
    db.create_app(CreateAppInput {
        name: name.to_string(),
        secret: None,
        auto_publish: false,
        inherits_from: Some(parent),
    })
    .expect("Failed to create app")
}

fn entry_input(env: Environment, key: &str, value: &str) -> CreateEntryInput {
    CreateEntryInput {
        environment: env,
        key: key.to_string(),
        value: value.to_string(),
        value_kind: None,
        group_label: None,
    }
}

fn update_input(value: &str, expected_version: i64) -> UpdateEntryInput {
    UpdateEntryInput {
        value: value.to_string(),
        value_kind: None,
        group_label: None,
        expected_version,
    }
}

const ENV: Environment = Environment::Production;

speculate! {
    before {
        let db = Database::open_memory().expect("Failed to create in-memory database");
        db.migrate().expect("Failed to run migrations");
    }

    describe "apps" {
        describe "create_app" {
            it "generates a secret when none is supplied" {
                let app = create_test_app(&db, "orders");
                assert!(!app.secret.is_empty());
                assert!(app.enabled);
                assert!(!app.auto_publish);
            }

            it "keeps a caller-supplied secret" {
                let app = db.create_app(CreateAppInput {
                    name: "orders".to_string(),
                    secret: Some("s3cret".to_string()),
                    auto_publish: true,
                    inherits_from: None,
                }).expect("Failed to create app");

                assert_eq!(app.secret, "s3cret");
                assert!(app.auto_publish);
            }

            it "rejects a duplicate name" {
                create_test_app(&db, "orders");
                let err = db.create_app(CreateAppInput {
                    name: "orders".to_string(),
                    secret: None,
                    auto_publish: false,
                    inherits_from: None,
                }).unwrap_err();

                assert!(matches!(err, CoreError::Validation(_)));
            }

            it "rejects an unknown parent" {
                let err = db.create_app(CreateAppInput {
                    name: "orders".to_string(),
                    secret: None,
                    auto_publish: false,
                    inherits_from: Some(Uuid::new_v4()),
                }).unwrap_err();

                assert!(matches!(err, CoreError::NotFound { .. }));
            }
        }

        describe "update_app" {
            it "re-parents an app" {
                let base = create_test_app(&db, "base");
                let app = create_test_app(&db, "orders");

                let updated = db.update_app(app.id, UpdateAppInput {
                    name: None,
                    enabled: None,
                    auto_publish: None,
                    inherits_from: Some(Some(base.id)),
                }).expect("Failed to update");

                assert_eq!(updated.inherits_from, Some(base.id));
            }

            it "detaches a parent with an explicit null" {
                let base = create_test_app(&db, "base");
                let app = create_child_app(&db, "orders", base.id);

                let updated = db.update_app(app.id, UpdateAppInput {
                    name: None,
                    enabled: None,
                    auto_publish: None,
                    inherits_from: Some(None),
                }).expect("Failed to update");

                assert!(updated.inherits_from.is_none());
            }

            it "rejects inheriting from itself" {
                let app = create_test_app(&db, "orders");
                let err = db.update_app(app.id, UpdateAppInput {
                    name: None,
                    enabled: None,
                    auto_publish: None,
                    inherits_from: Some(Some(app.id)),
                }).unwrap_err();

                assert!(matches!(err, CoreError::Validation(_)));
            }

            it "rejects a parent that would close a cycle" {
                let a = create_test_app(&db, "a");
                let b = create_child_app(&db, "b", a.id);
                let c = create_child_app(&db, "c", b.id);

                // a -> b -> c exists; making a inherit from c closes the loop
                let err = db.update_app(a.id, UpdateAppInput {
                    name: None,
                    enabled: None,
                    auto_publish: None,
                    inherits_from: Some(Some(c.id)),
                }).unwrap_err();

                assert!(matches!(err, CoreError::Validation(_)));
            }
        }

        describe "disable_app" {
            it "disables instead of deleting" {
                let app = create_test_app(&db, "orders");
                db.create_entry(app.id, entry_input(ENV, "k", "v")).unwrap();

                let disabled = db.disable_app(app.id).expect("Failed to disable");
                assert!(!disabled.enabled);

                // Entries survive the disable
                let entries = db.list_entries(app.id, ENV).expect("Query failed");
                assert_eq!(entries.len(), 1);
            }
        }
    }

    describe "entries" {
        describe "create_entry" {
            it "starts as a version-1 draft" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "db.pool_size", "10"))
                    .expect("Failed to create entry");

                assert_eq!(entry.version, 1);
                assert_eq!(entry.status, EntryStatus::Init);
                assert_eq!(entry.value_kind, ValueKind::Text);
            }

            it "rejects a duplicate live key" {
                let app = create_test_app(&db, "orders");
                db.create_entry(app.id, entry_input(ENV, "k", "v1")).unwrap();

                let err = db.create_entry(app.id, entry_input(ENV, "k", "v2")).unwrap_err();
                assert!(matches!(err, CoreError::DuplicateKey { .. }));
            }

            it "allows the same key in another environment" {
                let app = create_test_app(&db, "orders");
                db.create_entry(app.id, entry_input(Environment::Staging, "k", "v1")).unwrap();
                db.create_entry(app.id, entry_input(ENV, "k", "v2")).unwrap();

                let staging = db.get_entry_by_key(app.id, Environment::Staging, "k").unwrap().unwrap();
                assert_eq!(staging.value, "v1");
            }

            it "rejects a malformed key" {
                let app = create_test_app(&db, "orders");
                let err = db.create_entry(app.id, entry_input(ENV, "bad key!", "v")).unwrap_err();
                assert!(matches!(err, CoreError::Validation(_)));
            }
        }

        describe "update_entry" {
            it "increments the version by exactly 1 on every edit" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "k", "v1")).unwrap();

                let v2 = db.update_entry(entry.id, update_input("v2", 1)).expect("edit failed");
                assert_eq!(v2.version, 2);

                let v3 = db.update_entry(entry.id, update_input("v3", 2)).expect("edit failed");
                assert_eq!(v3.version, 3);
                assert_eq!(v3.value, "v3");
            }

            it "rejects a stale version and reports the current one" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "k", "v1")).unwrap();
                db.update_entry(entry.id, update_input("v2", 1)).unwrap();

                let err = db.update_entry(entry.id, update_input("lost", 1)).unwrap_err();
                match err {
                    CoreError::VersionMismatch { expected, current, .. } => {
                        assert_eq!(expected, 1);
                        assert_eq!(current, 2);
                    }
                    other => panic!("expected VersionMismatch, got {other:?}"),
                }
            }

            it "lets exactly one of two concurrent editors win" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "k", "v1")).unwrap();

                let mut handles = Vec::new();
                for value in ["from-a", "from-b"] {
                    let db = db.clone();
                    let id = entry.id;
                    handles.push(std::thread::spawn(move || {
                        db.update_entry(id, update_input(value, 1))
                    }));
                }

                let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
                let wins = results.iter().filter(|r| r.is_ok()).count();
                assert_eq!(wins, 1);

                let loser = results.into_iter().find(|r| r.is_err()).unwrap().unwrap_err();
                assert!(matches!(loser, CoreError::VersionMismatch { current: 2, .. }));
            }

            it "refuses to edit an archived entry" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "k", "v1")).unwrap();
                db.archive_entry(entry.id).unwrap();

                let err = db.update_entry(entry.id, update_input("v2", 2)).unwrap_err();
                assert!(matches!(err, CoreError::Validation(_)));
            }
        }

        describe "put_entry" {
            it "creates a fresh draft for an unknown key" {
                let app = create_test_app(&db, "orders");
                let entry = db.put_entry(app.id, ENV, "k", "v1".into(), None, None, None)
                    .expect("put failed");
                assert_eq!(entry.version, 1);
                assert_eq!(entry.status, EntryStatus::Init);
            }

            it "requires the caller-held version for an existing key" {
                let app = create_test_app(&db, "orders");
                db.put_entry(app.id, ENV, "k", "v1".into(), None, None, None).unwrap();

                let err = db.put_entry(app.id, ENV, "k", "v2".into(), None, None, None).unwrap_err();
                assert!(matches!(err, CoreError::Validation(_)));

                let entry = db.put_entry(app.id, ENV, "k", "v2".into(), None, None, Some(1))
                    .expect("put failed");
                assert_eq!(entry.version, 2);
            }

            it "starts a new lifecycle when the key was archived" {
                let app = create_test_app(&db, "orders");
                let old = db.put_entry(app.id, ENV, "k", "v1".into(), None, None, None).unwrap();
                db.archive_entry(old.id).unwrap();

                let fresh = db.put_entry(app.id, ENV, "k", "v2".into(), None, None, None)
                    .expect("put failed");
                assert_ne!(fresh.id, old.id);
                assert_eq!(fresh.version, 1);
            }
        }

        describe "archive" {
            it "hides the entry from the draft view but keeps the row" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "k", "v")).unwrap();

                let archived = db.archive_entry(entry.id).expect("archive failed");
                assert_eq!(archived.status, EntryStatus::Archived);
                assert_eq!(archived.version, 2);

                assert!(db.list_entries(app.id, ENV).unwrap().is_empty());
                assert!(db.get_entry(entry.id).unwrap().is_some());
                assert!(db.get_entry_by_key(app.id, ENV, "k").unwrap().is_none());
            }

            it "archiving twice is a no-op" {
                let app = create_test_app(&db, "orders");
                let entry = db.create_entry(app.id, entry_input(ENV, "k", "v")).unwrap();
                db.archive_entry(entry.id).unwrap();
                let again = db.archive_entry(entry.id).expect("archive failed");
                assert_eq!(again.version, 2);
            }
        }
    }

    describe "batch operations" {
        describe "batch_import" {
            it "applies every item independently" {
                let app = create_test_app(&db, "orders");
                // key5 collides with an existing live entry
                db.create_entry(app.id, entry_input(ENV, "key5", "existing")).unwrap();

                let items: Vec<ImportItem> = (1..=10).map(|i| ImportItem {
                    key: format!("key{i}"),
                    value: format!("value{i}"),
                    value_kind: None,
                    group_label: None,
                }).collect();

                let outcome = db.batch_import(BatchImportInput {
                    app_id: app.id,
                    environment: ENV,
                    items,
                }).expect("import failed");

                assert_eq!(outcome.success_count, 9);
                assert_eq!(outcome.failed_keys, vec!["key5".to_string()]);

                // The failed item did not clobber the existing value, and the
                // rest of the batch is persisted.
                let existing = db.get_entry_by_key(app.id, ENV, "key5").unwrap().unwrap();
                assert_eq!(existing.value, "existing");
                assert_eq!(db.list_entries(app.id, ENV).unwrap().len(), 10);
            }

            it "reports duplicates within the batch itself" {
                let app = create_test_app(&db, "orders");
                let outcome = db.batch_import(BatchImportInput {
                    app_id: app.id,
                    environment: ENV,
                    items: vec![
                        ImportItem { key: "k".into(), value: "first".into(), value_kind: None, group_label: None },
                        ImportItem { key: "k".into(), value: "second".into(), value_kind: None, group_label: None },
                    ],
                }).expect("import failed");

                assert_eq!(outcome.success_count, 1);
                assert_eq!(outcome.failed_keys, vec!["k".to_string()]);
                let kept = db.get_entry_by_key(app.id, ENV, "k").unwrap().unwrap();
                assert_eq!(kept.value, "first");
            }
        }

        describe "batch_delete" {
            it "archives what it can and reports the rest" {
                let app = create_test_app(&db, "orders");
                db.create_entry(app.id, entry_input(ENV, "a", "1")).unwrap();
                db.create_entry(app.id, entry_input(ENV, "b", "2")).unwrap();

                let outcome = db.batch_delete(BatchDeleteInput {
                    app_id: app.id,
                    environment: ENV,
                    keys: vec!["a".into(), "missing".into(), "b".into()],
                }).expect("delete failed");

                assert_eq!(outcome.success_count, 2);
                assert_eq!(outcome.failed_keys, vec!["missing".to_string()]);
                assert!(db.list_entries(app.id, ENV).unwrap().is_empty());
            }
        }
    }

    describe "inheritance resolution" {
        it "prefers the closest descendant for each key" {
            let a = create_test_app(&db, "a");
            let b = create_child_app(&db, "b", a.id);
            let c = create_child_app(&db, "c", b.id);

            // k1 set everywhere, k2 set on a and b, k3 only on a
            db.create_entry(a.id, entry_input(ENV, "k1", "from-a")).unwrap();
            db.create_entry(a.id, entry_input(ENV, "k2", "from-a")).unwrap();
            db.create_entry(a.id, entry_input(ENV, "k3", "from-a")).unwrap();
            db.create_entry(b.id, entry_input(ENV, "k1", "from-b")).unwrap();
            db.create_entry(b.id, entry_input(ENV, "k2", "from-b")).unwrap();
            db.create_entry(c.id, entry_input(ENV, "k1", "from-c")).unwrap();

            for app in [&a, &b, &c] {
                db.publish(app.id, ENV, None, "tester").expect("publish failed");
            }

            let effective = db.resolve_effective(c.id, ENV).expect("resolve failed");
            assert_eq!(effective.get("k1").map(String::as_str), Some("from-c"));
            assert_eq!(effective.get("k2").map(String::as_str), Some("from-b"));
            assert_eq!(effective.get("k3").map(String::as_str), Some("from-a"));
        }

        it "excludes unpublished drafts from the effective view" {
            let app = create_test_app(&db, "orders");
            db.create_entry(app.id, entry_input(ENV, "live", "1")).unwrap();
            db.publish(app.id, ENV, None, "tester").unwrap();
            db.create_entry(app.id, entry_input(ENV, "draft", "2")).unwrap();

            let effective = db.resolve_effective(app.id, ENV).expect("resolve failed");
            assert!(effective.contains_key("live"));
            assert!(!effective.contains_key("draft"));

            // ...but editors see the draft
            assert_eq!(db.list_entries(app.id, ENV).unwrap().len(), 2);
        }

        it "scopes resolution to the requested environment" {
            let app = create_test_app(&db, "orders");
            db.create_entry(app.id, entry_input(Environment::Staging, "k", "staging")).unwrap();
            db.publish(app.id, Environment::Staging, None, "tester").unwrap();

            let effective = db.resolve_effective(app.id, ENV).expect("resolve failed");
            assert!(effective.is_empty());
        }

        it "skips disabled ancestors" {
            let a = create_test_app(&db, "a");
            let b = create_child_app(&db, "b", a.id);
            db.create_entry(a.id, entry_input(ENV, "k", "from-a")).unwrap();
            db.create_entry(b.id, entry_input(ENV, "other", "from-b")).unwrap();
            db.publish(a.id, ENV, None, "tester").unwrap();
            db.publish(b.id, ENV, None, "tester").unwrap();

            db.disable_app(a.id).unwrap();

            let effective = db.resolve_effective(b.id, ENV).expect("resolve failed");
            assert!(!effective.contains_key("k"));
            assert!(effective.contains_key("other"));
        }

        it "refuses to resolve a disabled app" {
            let app = create_test_app(&db, "orders");
            db.disable_app(app.id).unwrap();

            let err = db.resolve_effective(app.id, ENV).unwrap_err();
            assert!(matches!(err, CoreError::Validation(_)));
        }

        it "fails for an unknown app" {
            let err = db.resolve_effective(Uuid::new_v4(), ENV).unwrap_err();
            assert!(matches!(err, CoreError::NotFound { .. }));
        }
    }
}
