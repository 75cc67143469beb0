use songbook_core::model::song::MAX_TEXT_LEN;
use songbook_core::{Entity, FieldValue, Fields, Record, Song, ValidationError};

#[test]
fn new_song_is_transient_until_stored() {
    let song = Song::new("Peaches", "Justin");
    assert_eq!(song.id(), None);
    assert_eq!(song.name(), "Peaches");
    assert_eq!(song.artist(), "Justin");
    assert_eq!(song.to_string(), "Song{id=<unsaved>, name='Peaches', artist='Justin'}");
}

#[test]
fn display_shows_all_fields() {
    let song = Song::with_id(3, "Fine Line", "Harry");
    assert_eq!(song.to_string(), "Song{id=3, name='Fine Line', artist='Harry'}");
}

#[test]
fn serde_json_shape_matches_columns() {
    let song = Song::with_id(7, "Golden", "Harry");
    let value = serde_json::to_value(&song).unwrap();
    assert_eq!(
        value,
        serde_json::json!({ "id": 7, "name": "Golden", "artist": "Harry" })
    );

    let transient: Song =
        serde_json::from_str(r#"{ "id": null, "name": "Yummy", "artist": "Justin" }"#).unwrap();
    assert_eq!(transient, Song::new("Yummy", "Justin"));
}

#[test]
fn fields_exclude_identity_and_rebuild_the_record() {
    let song = Song::with_id(4, "Sorry", "Justin");
    let fields = song.fields();
    assert_eq!(fields.len(), 2);
    assert!(!fields.contains_key("id"));

    let rebuilt = Song::from_fields(4, &fields).unwrap();
    assert_eq!(rebuilt, song);
}

#[test]
fn from_fields_rejects_wrong_value_type() {
    let mut fields = Fields::new();
    fields.insert("name", FieldValue::Integer(1));
    fields.insert("artist", FieldValue::from("Justin"));
    assert!(Song::from_fields(1, &fields).is_err());
}

#[test]
fn validation_rejects_blank_and_overlong_text() {
    assert_eq!(Song::new("Peaches", "Justin").validate(), Ok(()));
    assert_eq!(
        Song::new("  ", "Justin").validate(),
        Err(ValidationError::Blank { field: "name" })
    );
    assert_eq!(
        Song::new("Peaches", "").validate(),
        Err(ValidationError::Blank { field: "artist" })
    );

    let long = "x".repeat(MAX_TEXT_LEN + 1);
    assert_eq!(
        Song::new(long, "Justin").validate(),
        Err(ValidationError::TooLong {
            field: "name",
            max: MAX_TEXT_LEN,
            actual: MAX_TEXT_LEN + 1,
        })
    );
}

#[test]
fn mapping_describes_the_song_table() {
    let mapping = Song::MAPPING;
    assert_eq!(mapping.table, "song");
    assert_eq!(mapping.identity_column, "id");
    assert_eq!(mapping.columns, &["artist", "name"]);
    assert!(mapping.validate().is_ok());
}
