mod common;

use common::{backends, load, seed};
use songbook_core::{Record, SessionError, Song, StateError, TransactionStatus};

#[test]
fn persist_then_commit_assigns_identity_and_roundtrips() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let mut tx = session.begin_transaction().unwrap();
        let song = tx.persist(Song::new("Peaches", "Justin")).unwrap();
        assert_eq!(song.borrow().id(), None);
        tx.commit().unwrap();

        let id = song.borrow().id().expect("commit assigns an identity");
        assert!(session.contains(&song), "{}", store.label);
        assert_eq!(session.transaction_status(), Some(TransactionStatus::Committed));
        session.close();

        let loaded = load(&store.factory, id).unwrap();
        assert_eq!(loaded, song.get(), "{}", store.label);
        assert_eq!(loaded.name(), "Peaches");
        assert_eq!(loaded.artist(), "Justin");
    }
}

#[test]
fn setter_mutation_is_flushed_without_resubmission() {
    for store in backends() {
        seed(&store.factory, &[(3, "Adore You", "Harry")]);

        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(3).unwrap();
        let tx = session.begin_transaction().unwrap();
        song.borrow_mut().set_name("Fine Line");
        assert_eq!(tx.dirty_count(), 1);
        tx.commit().unwrap();
        assert_eq!(session.dirty_count(), 0);
        session.close();

        let reloaded = load(&store.factory, 3).unwrap();
        assert_eq!(reloaded.name(), "Fine Line", "{}", store.label);
        assert_eq!(reloaded.artist(), "Harry");
    }
}

#[test]
fn explicit_resubmission_is_only_a_hint() {
    for store in backends() {
        seed(&store.factory, &[(3, "Adore You", "Harry")]);

        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(3).unwrap();
        let mut tx = session.begin_transaction().unwrap();
        song.borrow_mut().set_name("Fine Line");
        tx.save(&song).unwrap();
        tx.save(&song).unwrap();
        assert_eq!(tx.pending_insert_count(), 0);
        assert_eq!(tx.dirty_count(), 1);
        tx.commit().unwrap();

        assert_eq!(load(&store.factory, 3).unwrap().name(), "Fine Line");
    }
}

#[test]
fn remove_then_commit_makes_record_not_found() {
    for store in backends() {
        seed(&store.factory, &[(4, "Sorry", "Justin"), (5, "Yummy", "Justin")]);

        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(4).unwrap();
        let mut tx = session.begin_transaction().unwrap();
        tx.remove(&song).unwrap();
        assert_eq!(tx.pending_delete_count(), 1);
        assert!(matches!(
            tx.get::<Song>(4),
            Err(SessionError::NotFound { table: "song", id: 4 })
        ));
        tx.commit().unwrap();
        assert!(!session.contains(&song));

        let err = session.get::<Song>(4).unwrap_err();
        assert!(
            matches!(err, SessionError::NotFound { table: "song", id: 4 }),
            "{}: {err}",
            store.label
        );
        assert!(load(&store.factory, 5).is_some());
    }
}

#[test]
fn rollback_of_staged_insert_leaves_nothing_behind() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let mut tx = session.begin_transaction().unwrap();
        let song = tx.persist(Song::new("Peaches", "Justin")).unwrap();
        tx.rollback().unwrap();

        assert_eq!(session.transaction_status(), Some(TransactionStatus::RolledBack));
        assert_eq!(song.borrow().id(), None);
        assert!(!session.contains(&song));
        assert_eq!(session.tracked_count(), 0);
        assert!(matches!(
            session.get::<Song>(1),
            Err(SessionError::NotFound { id: 1, .. })
        ));
    }
}

#[test]
fn rollback_restores_records_and_store() {
    for store in backends() {
        seed(
            &store.factory,
            &[(1, "Peaches", "Justin"), (2, "Golden", "Harry")],
        );

        let mut session = store.factory.open_session().unwrap();
        let edited = session.get::<Song>(1).unwrap();
        let removed = session.get::<Song>(2).unwrap();

        let mut tx = session.begin_transaction().unwrap();
        edited.borrow_mut().set_artist("Someone Else");
        tx.remove(&removed).unwrap();
        tx.persist(Song::new("Watermelon Sugar", "Harry")).unwrap();
        tx.rollback().unwrap();

        assert_eq!(edited.borrow().artist(), "Justin", "{}", store.label);
        assert!(session.contains(&removed));
        assert_eq!(session.dirty_count(), 0);
        assert_eq!(session.pending_delete_count(), 0);
        assert_eq!(session.pending_insert_count(), 0);
        session.close();

        assert_eq!(load(&store.factory, 1).unwrap().artist(), "Justin");
        assert!(load(&store.factory, 2).is_some());
        assert!(load(&store.factory, 3).is_none());
    }
}

#[test]
fn failed_commit_rolls_back_every_write() {
    for store in backends() {
        seed(
            &store.factory,
            &[(1, "Peaches", "Justin"), (2, "Golden", "Harry")],
        );

        let mut session = store.factory.open_session().unwrap();
        let doomed = session.get::<Song>(1).unwrap();
        let mut tx = session.begin_transaction().unwrap();
        tx.remove(&doomed).unwrap();
        let duplicate = tx.persist(Song::with_id(2, "Clash", "Someone")).unwrap();
        let err = tx.commit().unwrap_err();

        assert!(
            matches!(err, SessionError::Constraint { table: "song", .. }),
            "{}: {err}",
            store.label
        );
        assert_eq!(session.transaction_status(), Some(TransactionStatus::RolledBack));
        assert!(session.contains(&doomed));
        assert!(!session.contains(&duplicate));
        assert!(!session.in_transaction());
        session.close();

        assert!(load(&store.factory, 1).is_some());
        assert_eq!(load(&store.factory, 2).unwrap().name(), "Golden");
    }
}

#[test]
fn invalid_record_is_rejected_before_any_write() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let mut tx = session.begin_transaction().unwrap();
        tx.persist(Song::new("Fine", "Harry")).unwrap();
        tx.persist(Song::new("   ", "Nobody")).unwrap();
        let err = tx.commit().unwrap_err();
        assert!(matches!(err, SessionError::Validation(_)), "{err}");
        session.close();

        assert!(load(&store.factory, 1).is_none(), "{}", store.label);
    }
}

#[test]
fn closed_session_rejects_every_operation() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(1).unwrap();
        session.close();
        session.close();

        assert!(!session.is_open());
        assert!(!session.contains(&song));
        let closed = |err: SessionError| matches!(err, SessionError::State(StateError::Closed));
        assert!(closed(session.get::<Song>(1).unwrap_err()));
        assert!(closed(session.find::<Song>(1).unwrap_err()));
        assert!(closed(session.persist(Song::new("a", "b")).unwrap_err()));
        assert!(closed(session.save(&song).unwrap_err()));
        assert!(closed(session.remove(&song).unwrap_err()));
        assert!(closed(session.begin_transaction().unwrap_err()));
    }
}

#[test]
fn nested_begin_is_a_state_error() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let mut tx = session.begin_transaction().unwrap();
        let err = tx.begin_transaction().unwrap_err();
        assert!(matches!(
            err,
            SessionError::State(StateError::TransactionActive)
        ));
        tx.commit().unwrap();

        let tx = session.begin_transaction().unwrap();
        tx.rollback().unwrap();
    }
}

#[test]
fn removing_a_record_of_another_session_fails() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut owner = store.factory.open_session().unwrap();
        let mut other = store.factory.open_session().unwrap();
        let song = owner.get::<Song>(1).unwrap();

        let err = other.remove(&song).unwrap_err();
        assert!(matches!(
            err,
            SessionError::State(StateError::Detached { table: "song" })
        ));
        assert!(matches!(
            other.save(&song).unwrap_err(),
            SessionError::State(StateError::Detached { .. })
        ));

        owner.close();
        let reloaded = other.get::<Song>(1).unwrap();
        assert!(!reloaded.ptr_eq(&song));
    }
}

#[test]
fn identity_map_returns_the_same_handle() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        let first = session.get::<Song>(1).unwrap();
        let second = session.get::<Song>(1).unwrap();
        assert!(first.ptr_eq(&second));
        assert_eq!(session.tracked_count(), 1);

        first.borrow_mut().set_name("Changed");
        assert_eq!(second.borrow().name(), "Changed");
    }
}

#[test]
fn persisting_an_attached_identity_twice_fails() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        session.get::<Song>(1).unwrap();
        let err = session
            .persist(Song::with_id(1, "Other", "Other"))
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::State(StateError::DuplicateIdentity { table: "song", id: 1 })
        ));
    }
}

#[test]
fn removing_a_staged_insert_just_unstages_it() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let mut tx = session.begin_transaction().unwrap();
        let song = tx.persist(Song::new("Peaches", "Justin")).unwrap();
        tx.remove(&song).unwrap();
        assert_eq!(tx.tracked_count(), 0);
        tx.commit().unwrap();

        assert_eq!(song.borrow().id(), None);
        assert!(load(&store.factory, 1).is_none());
    }
}

#[test]
fn dropping_an_active_transaction_rolls_it_back() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        {
            let mut tx = session.begin_transaction().unwrap();
            tx.persist(Song::new("Peaches", "Justin")).unwrap();
        }
        assert!(!session.in_transaction());
        assert_eq!(session.transaction_status(), Some(TransactionStatus::RolledBack));
        assert_eq!(session.pending_insert_count(), 0);

        let tx = session.begin_transaction().unwrap();
        tx.commit().unwrap();
        assert!(load(&store.factory, 1).is_none());
    }
}

#[test]
fn changes_staged_before_begin_flush_on_next_commit() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let song = session.persist(Song::new("Peaches", "Justin")).unwrap();
        assert_eq!(session.pending_insert_count(), 1);

        let tx = session.begin_transaction().unwrap();
        tx.commit().unwrap();

        let id = song.borrow().id().unwrap();
        assert!(load(&store.factory, id).is_some(), "{}", store.label);
    }
}

#[test]
fn mutations_after_close_are_not_flushed() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(1).unwrap();
        session.close();

        song.borrow_mut().set_name("Detached edit");

        let mut next = store.factory.open_session().unwrap();
        let tx = next.begin_transaction().unwrap();
        tx.commit().unwrap();
        next.close();

        assert_eq!(load(&store.factory, 1).unwrap().name(), "Peaches");
    }
}

#[test]
fn commit_while_caller_holds_a_borrow_fails_cleanly() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(1).unwrap();

        let tx = session.begin_transaction().unwrap();
        song.borrow_mut().set_name("Held");
        let guard = song.borrow();
        let err = tx.commit().unwrap_err();
        drop(guard);

        assert!(matches!(
            err,
            SessionError::State(StateError::RecordBorrowed { table: "song" })
        ));
        assert_eq!(session.transaction_status(), Some(TransactionStatus::RolledBack));
        assert!(!session.contains(&song));
        assert_eq!(session.dirty_count(), 0);

        let tx = session.begin_transaction().unwrap();
        tx.commit().unwrap();
        assert_eq!(load(&store.factory, 1).unwrap().name(), "Peaches", "{}", store.label);
    }
}

#[test]
fn rollback_while_caller_holds_a_borrow_detaches_the_record() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(1).unwrap();

        let tx = session.begin_transaction().unwrap();
        song.borrow_mut().set_name("Held");
        let guard = song.borrow();
        let err = tx.rollback().unwrap_err();
        drop(guard);
        assert!(matches!(
            err,
            SessionError::State(StateError::RecordBorrowed { table: "song" })
        ));
        assert!(!session.contains(&song));

        let tx = session.begin_transaction().unwrap();
        tx.commit().unwrap();
        assert_eq!(load(&store.factory, 1).unwrap().name(), "Peaches", "{}", store.label);

        let reloaded = session.get::<Song>(1).unwrap();
        assert!(!reloaded.ptr_eq(&song));
        assert_eq!(reloaded.borrow().name(), "Peaches");
    }
}

#[test]
fn changing_an_attached_identity_fails_the_commit() {
    for store in backends() {
        seed(&store.factory, &[(1, "Peaches", "Justin")]);
        let mut session = store.factory.open_session().unwrap();
        let song = session.get::<Song>(1).unwrap();

        let tx = session.begin_transaction().unwrap();
        {
            let mut record = song.borrow_mut();
            record.assign_identity(Some(99));
            record.set_name("Renamed");
        }
        let err = tx.commit().unwrap_err();
        assert!(
            matches!(
                err,
                SessionError::State(StateError::IdentityChanged {
                    table: "song",
                    expected: Some(1),
                    actual: Some(99),
                })
            ),
            "{}: {err}",
            store.label
        );

        assert_eq!(song.borrow().id(), Some(1));
        assert_eq!(song.borrow().name(), "Peaches");
        assert!(session.contains(&song));
        session.close();

        assert_eq!(load(&store.factory, 1).unwrap().name(), "Peaches");
        assert!(load(&store.factory, 99).is_none());
    }
}

#[test]
fn closing_with_an_open_transaction_discards_it() {
    for store in backends() {
        let mut session = store.factory.open_session().unwrap();
        let mut tx = session.begin_transaction().unwrap();
        tx.persist(Song::new("Peaches", "Justin")).unwrap();
        tx.close();
        drop(tx);

        assert!(!session.is_open());
        assert_eq!(session.transaction_status(), Some(TransactionStatus::RolledBack));
        assert!(load(&store.factory, 1).is_none());
    }
}
