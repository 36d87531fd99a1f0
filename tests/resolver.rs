use assert_matches::assert_matches;
use camino::Utf8Path;

use ukb_bids::domain::Datatype;
use ukb_bids::error::ResolutionError;
use ukb_bids::fields::FieldTable;
use ukb_bids::naming::NamingParser;
use ukb_bids::participants::ParticipantTable;
use ukb_bids::resolver::EntityResolver;

fn participants(content: &str) -> ParticipantTable {
    ParticipantTable::parse(Utf8Path::new("participants.tsv"), content).unwrap()
}

#[test]
fn worked_example_resolves_to_func_bold() {
    let fields = FieldTable::builtin();
    let table = ParticipantTable::empty();
    let id = NamingParser::new().parse("1000001_20227_2_0.zip").unwrap();
    let entity = EntityResolver::new(&fields, &table).resolve(&id).unwrap();
    assert_eq!(entity.datatype, Datatype::Func);
    assert_eq!(
        entity.relative_path().as_str(),
        "sub-1000001/ses-02/func/sub-1000001_ses-02_bold.zip"
    );
}

#[test]
fn participant_table_overrides_session_label() {
    let fields = FieldTable::builtin();
    let table = participants("eid\tinstance\tsession\n1000001\t2\timaging1\n");
    let resolver = EntityResolver::new(&fields, &table);
    let id = NamingParser::new().parse("1000001_20252_2_0.zip").unwrap();
    let entity = resolver.resolve(&id).unwrap();
    assert_eq!(entity.session.unwrap().as_str(), "imaging1");

    let other = NamingParser::new().parse("1000002_20252_2_0.zip").unwrap();
    assert_eq!(
        resolver.resolve(&other).unwrap().session.unwrap().as_str(),
        "02"
    );
}

#[test]
fn contradictory_rows_fail_every_asset_of_the_subject() {
    let fields = FieldTable::builtin();
    let table = ParticipantTable::parse(
        Utf8Path::new("participants.csv"),
        "eid,instance,session\n1000001,2,a\n1000001,3,a\n",
    )
    .unwrap();
    let resolver = EntityResolver::new(&fields, &table);
    let parser = NamingParser::new();
    for name in ["1000001_20252_2_0.zip", "1000001_20252_3_0.zip"] {
        let id = parser.parse(name).unwrap();
        assert_matches!(
            resolver.resolve(&id),
            Err(ResolutionError::AmbiguousSession { .. })
        );
    }
}

#[test]
fn unknown_field_and_extension_are_rejected() {
    let fields = FieldTable::builtin();
    let table = ParticipantTable::empty();
    let resolver = EntityResolver::new(&fields, &table);
    let parser = NamingParser::new();

    let unknown = parser.parse("1000001_99999_2_0.zip").unwrap();
    assert_eq!(
        resolver.resolve(&unknown),
        Err(ResolutionError::UnknownFieldCode(99999))
    );

    let wrong_ext = parser.parse("1000001_20252_2_0.txt").unwrap();
    assert_matches!(
        resolver.resolve(&wrong_ext),
        Err(ResolutionError::UnexpectedExtension { field: 20252, .. })
    );
}

#[test]
fn array_index_becomes_run() {
    let fields = FieldTable::builtin();
    let table = ParticipantTable::empty();
    let resolver = EntityResolver::new(&fields, &table);
    let id = NamingParser::new().parse("1000001_20227_2_1.zip").unwrap();
    let entity = resolver.resolve(&id).unwrap();
    assert_eq!(entity.run, Some(2));
    assert_eq!(
        entity.file_name(),
        "sub-1000001_ses-02_bold_run-2.zip"
    );
}
