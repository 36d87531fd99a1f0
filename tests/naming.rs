use assert_matches::assert_matches;

use ukb_bids::error::ParseError;
use ukb_bids::naming::{NamingParser, NamingRule};

#[test]
fn tagged_names_keep_tags_in_the_key() {
    let id = NamingParser::new()
        .parse("1000001_20227_2_0_Echo1.zip")
        .unwrap();
    assert_eq!(id.rule, NamingRule::BulkTagged);
    assert_eq!(id.tags, vec!["echo1".to_string()]);
    assert_eq!(id.source_key().as_str(), "1000001:2:20227:0:echo1:zip");
}

#[test]
fn field_only_names_have_no_instance() {
    let id = NamingParser::new().parse("1000001_25750.txt").unwrap();
    assert_eq!(id.instance, None);
    assert_eq!(id.array, 0);
    assert_eq!(id.source_key().as_str(), "1000001:-:25750:0:txt");
}

#[test]
fn extension_is_lowercased() {
    let id = NamingParser::new().parse("1000001_20252_2_0.ZIP").unwrap();
    assert_eq!(id.extension, "zip");
}

#[test]
fn rejects_names_outside_the_rule_set() {
    let parser = NamingParser::new();
    for name in [
        "fetched.lis",
        "1000001.zip",
        "sub-1000001_T1w.zip",
        "1000001_20252_2_0",
        "abc_20252_2_0.zip",
        "1000001__2_0.zip",
    ] {
        assert_matches!(
            parser.parse(name),
            Err(ParseError::UnrecognizedPattern(_)),
            "{name}"
        );
    }
}

#[test]
fn parsing_is_pure() {
    let parser = NamingParser::new();
    let first = parser.parse("1000001_20250_3_1.zip").unwrap();
    let second = parser.parse("1000001_20250_3_1.zip").unwrap();
    assert_eq!(first, second);
}
