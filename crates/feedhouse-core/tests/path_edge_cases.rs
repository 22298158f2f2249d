//! Edge-case tests for feed path parsing and the varint helpers.

use feedhouse_core::varint::{decode_varint_u64, encode_varint_u64};
use feedhouse_core::{Error, FeedPath, Segment};

// ---------------------------------------------------------------
// Path parse/print inverses
// ---------------------------------------------------------------

#[test]
fn path_roundtrip_plain_names() {
    for s in ["/", "/a", "/a/b/c", "/shop/orders@v2", "/~tenant/x", "/x/~~msg"] {
        let path: FeedPath = s.parse().unwrap();
        assert_eq!(path.to_string(), s);
    }
}

#[test]
fn path_roundtrip_reserved_characters() {
    let names = ["a/b", "back\\slash", "at@sign", "~tilde", "~~double", "@", "\\"];
    for name in names {
        let path = FeedPath::root().feed(name).unwrap();
        let printed = path.to_string();
        let parsed: FeedPath = printed.parse().unwrap();
        assert_eq!(parsed, path, "failed for {name:?} printed as {printed:?}");
    }
}

#[test]
fn path_roundtrip_versioned_with_reserved_characters() {
    let segment = Segment::versioned("na@me", "v/1").unwrap();
    let path = FeedPath::root().child(segment).unwrap();
    let parsed: FeedPath = path.to_string().parse().unwrap();
    assert_eq!(parsed, path);
}

#[test]
fn path_roundtrip_unicode() {
    let path = FeedPath::root().feed("ñandú").unwrap().feed("日本").unwrap();
    let parsed: FeedPath = path.to_string().parse().unwrap();
    assert_eq!(parsed, path);
}

#[test]
fn escaped_marker_is_a_feed_name() {
    let path: FeedPath = "/\\~abc".parse().unwrap();
    assert_eq!(path.segments(), &[Segment::feed("~abc").unwrap()]);
}

#[test]
fn message_id_in_middle_is_rejected() {
    assert!(matches!(
        "/a/~~m/b".parse::<FeedPath>(),
        Err(Error::InvalidPath(_))
    ));
    assert!(FeedPath::from_segments(vec![
        Segment::message_id("m").unwrap(),
        Segment::feed("a").unwrap(),
    ])
    .is_err());
}

#[test]
fn empty_identifiers_are_rejected() {
    assert!(matches!(Segment::feed(""), Err(Error::InvalidIdentifier(_))));
    assert!(matches!(Segment::feed_id(""), Err(Error::InvalidIdentifier(_))));
    assert!(matches!(
        Segment::message_id(""),
        Err(Error::InvalidIdentifier(_))
    ));
    assert!(Segment::versioned("a", "").is_err());
}

#[test]
fn with_message_id_replaces_existing_id() {
    let message: FeedPath = "/a/~~old".parse().unwrap();
    let renamed = message.with_message_id("new").unwrap();
    assert_eq!(renamed.to_string(), "/a/~~new");
}

#[test]
fn root_has_no_parent() {
    assert_eq!(FeedPath::root().parent(), None);
    let child: FeedPath = "/a".parse().unwrap();
    assert_eq!(child.parent(), Some(FeedPath::root()));
}

// ---------------------------------------------------------------
// Varint boundaries
// ---------------------------------------------------------------

#[test]
fn varint_boundaries() {
    for val in [0u64, 127, 128, 16_383, 16_384, 2_097_151, u64::MAX] {
        let mut buf = Vec::new();
        encode_varint_u64(&mut buf, val);
        let decoded = decode_varint_u64(&mut &buf[..]).unwrap();
        assert_eq!(decoded, val, "failed for value {val}");
    }
}

#[test]
fn varint_decode_leaves_trailing_bytes() {
    let mut buf = Vec::new();
    encode_varint_u64(&mut buf, 300);
    buf.extend_from_slice(b"rest");

    let mut cursor = &buf[..];
    assert_eq!(decode_varint_u64(&mut cursor).unwrap(), 300);
    assert_eq!(cursor, b"rest");
}
