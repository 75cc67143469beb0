#![allow(dead_code)]

use songbook_core::{FactoryConfig, SessionFactory, Song};
use tempfile::TempDir;

/// One configured backend; keeps its temp directory alive for the test.
pub struct TestStore {
    pub label: &'static str,
    pub factory: SessionFactory,
    _dir: Option<TempDir>,
}

/// Fresh memory and SQLite factories.
pub fn backends() -> Vec<TestStore> {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SessionFactory::build(&FactoryConfig::sqlite(dir.path().join("songs.db"))).unwrap();
    vec![
        TestStore {
            label: "memory",
            factory: SessionFactory::build(&FactoryConfig::memory()).unwrap(),
            _dir: None,
        },
        TestStore {
            label: "sqlite",
            factory: sqlite,
            _dir: Some(dir),
        },
    ]
}

/// Inserts songs with explicit ids in one committed transaction.
pub fn seed(factory: &SessionFactory, songs: &[(i64, &str, &str)]) {
    let mut session = factory.open_session().unwrap();
    let mut tx = session.begin_transaction().unwrap();
    for (id, name, artist) in songs {
        tx.persist(Song::with_id(*id, *name, *artist)).unwrap();
    }
    tx.commit().unwrap();
}

/// Reads one song through a fresh session, `None` when absent.
pub fn load(factory: &SessionFactory, id: i64) -> Option<Song> {
    let mut session = factory.open_session().unwrap();
    session.find::<Song>(id).unwrap().map(|song| song.get())
}
