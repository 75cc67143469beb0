//! Song use-case service.
//!
//! # Responsibility
//! - Provide the create/read/update/delete entry points for callers.
//! - Run each use case as one unit of work: open session, begin, operate,
//!   commit, close.
//!
//! # Invariants
//! - A failed use case leaves the store unchanged and releases its session.
//! - Updates never issue a write of their own; dirty checking flushes them.

use crate::model::song::Song;
use crate::session::{SessionFactory, SessionResult};
use log::info;

/// Use-case service wrapper for song CRUD operations.
pub struct SongService<'f> {
    factory: &'f SessionFactory,
}

impl<'f> SongService<'f> {
    pub fn new(factory: &'f SessionFactory) -> Self {
        Self { factory }
    }

    /// Inserts a new song and returns it with its store-assigned id.
    pub fn create_song(
        &self,
        name: impl Into<String>,
        artist: impl Into<String>,
    ) -> SessionResult<Song> {
        let mut session = self.factory.open_session()?;
        let mut tx = session.begin_transaction()?;
        let song = tx.persist(Song::new(name, artist))?;
        tx.commit()?;
        session.close();

        let created = song.get();
        info!(
            "event=song_create module=service status=ok id={}",
            created.id().unwrap_or_default()
        );
        Ok(created)
    }

    /// Reads one song by id.
    pub fn read_song(&self, id: i64) -> SessionResult<Song> {
        let mut session = self.factory.open_session()?;
        let song = session.get::<Song>(id)?;
        session.close();
        Ok(song.get())
    }

    /// Renames a song through its setter only.
    pub fn rename_song(&self, id: i64, name: impl Into<String>) -> SessionResult<Song> {
        let mut session = self.factory.open_session()?;
        let song = session.get::<Song>(id)?;

        let tx = session.begin_transaction()?;
        song.borrow_mut().set_name(name);
        tx.commit()?;
        session.close();

        info!("event=song_update module=service status=ok id={id} mode=dirty_check");
        Ok(song.get())
    }

    /// Rewrites both fields, then re-submits the record explicitly.
    ///
    /// The re-submission is a hint only; the write itself comes from dirty
    /// checking, so it is issued once.
    pub fn update_song(
        &self,
        id: i64,
        name: impl Into<String>,
        artist: Option<String>,
    ) -> SessionResult<Song> {
        let mut session = self.factory.open_session()?;
        let song = session.get::<Song>(id)?;

        let mut tx = session.begin_transaction()?;
        {
            let mut record = song.borrow_mut();
            record.set_name(name);
            if let Some(artist) = artist {
                record.set_artist(artist);
            }
        }
        tx.save(&song)?;
        tx.commit()?;
        session.close();

        info!("event=song_update module=service status=ok id={id} mode=resubmit");
        Ok(song.get())
    }

    /// Deletes a song by id.
    pub fn delete_song(&self, id: i64) -> SessionResult<()> {
        let mut session = self.factory.open_session()?;
        let song = session.get::<Song>(id)?;

        let mut tx = session.begin_transaction()?;
        tx.remove(&song)?;
        tx.commit()?;
        session.close();

        info!("event=song_delete module=service status=ok id={id}");
        Ok(())
    }
}
