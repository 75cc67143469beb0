//! Song entity, the single mapped table.
//!
//! # Responsibility
//! - Hold one row of the `song` table: identity plus `name` and `artist`.
//! - Describe its column mapping for the session and store layers.
//!
//! # Invariants
//! - `id` is `None` until the store assigns one, unless built with `with_id`.
//! - There is no public identity setter.
//! - `name` and `artist` are non-blank and at most 255 characters when written.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use super::{
    text_field, Entity, EntityMapping, FieldValue, Fields, MappingError, Record,
    ValidationError,
};

/// Maximum stored length of text columns.
pub const MAX_TEXT_LEN: usize = 255;

const SONG_MAPPING: EntityMapping = EntityMapping {
    table: "song",
    identity_column: "id",
    columns: &["artist", "name"],
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Song {
    id: Option<i64>,
    name: String,
    artist: String,
}

impl Song {
    /// Creates a transient song without identity.
    pub fn new(name: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            artist: artist.into(),
        }
    }

    /// Creates a transient song carrying a caller-chosen identity.
    ///
    /// The identity is used verbatim on insert instead of a store-assigned one.
    pub fn with_id(id: i64, name: impl Into<String>, artist: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            name: name.into(),
            artist: artist.into(),
        }
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn artist(&self) -> &str {
        &self.artist
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    pub fn set_artist(&mut self, artist: impl Into<String>) {
        self.artist = artist.into();
    }
}

impl Display for Song {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.id {
            Some(id) => write!(f, "Song{{id={id}, ")?,
            None => write!(f, "Song{{id=<unsaved>, ")?,
        }
        write!(f, "name='{}', artist='{}'}}", self.name, self.artist)
    }
}

impl Record for Song {
    fn identity(&self) -> Option<i64> {
        self.id
    }

    fn assign_identity(&mut self, identity: Option<i64>) {
        self.id = identity;
    }

    fn fields(&self) -> Fields {
        let mut fields = Fields::new();
        fields.insert("name", FieldValue::from(self.name.as_str()));
        fields.insert("artist", FieldValue::from(self.artist.as_str()));
        fields
    }

    fn apply_fields(&mut self, fields: &Fields) -> Result<(), MappingError> {
        self.name = text_field(Self::MAPPING, fields, "name")?;
        self.artist = text_field(Self::MAPPING, fields, "artist")?;
        Ok(())
    }

    fn validate(&self) -> Result<(), ValidationError> {
        check_text("name", &self.name)?;
        check_text("artist", &self.artist)
    }
}

impl Entity for Song {
    const MAPPING: &'static EntityMapping = &SONG_MAPPING;

    fn from_fields(identity: i64, fields: &Fields) -> Result<Self, MappingError> {
        Ok(Self {
            id: Some(identity),
            name: text_field(Self::MAPPING, fields, "name")?,
            artist: text_field(Self::MAPPING, fields, "artist")?,
        })
    }
}

fn check_text(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::Blank { field });
    }
    let actual = value.chars().count();
    if actual > MAX_TEXT_LEN {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_TEXT_LEN,
            actual,
        });
    }
    Ok(())
}
