//! Property test for the message envelope: any request envelope this
//! crate can build survives an encode/parse round trip with its
//! method, URI, headers and body intact (spec §4.2).

use proptest::prelude::*;

use telling_core::prelude::{Method, StartLine, Writer};

fn method_strategy() -> impl Strategy<Value = Method> {
    prop_oneof![
        Just(Method::Get),
        Just(Method::Head),
        Just(Method::Post),
        Just(Method::Put),
        Just(Method::Delete),
        Just(Method::Patch),
        Just(Method::Options),
        Just(Method::Connect),
        Just(Method::Trace),
    ]
}

// URIs are non-empty, start with a slash, and contain no whitespace or
// control characters that would be ambiguous against the start-line
// token splitter.
fn uri_strategy() -> impl Strategy<Value = String> {
    "/[a-zA-Z0-9_./-]{0,32}".prop_map(|s| s)
}

// Header names/values must avoid ':' and line terminators, matching
// what `Writer::header` itself rejects.
fn header_strategy() -> impl Strategy<Value = (String, String)> {
    ("[a-zA-Z][a-zA-Z0-9-]{0,16}", "[a-zA-Z0-9 _-]{0,24}")
}

proptest! {
    #[test]
    fn request_envelope_round_trips(
        method in method_strategy(),
        uri in uri_strategy(),
        headers in prop::collection::vec(header_strategy(), 0..5),
        body in prop::collection::vec(any::<u8>(), 0..64),
    ) {
        let mut writer = Writer::new();
        writer.start_request(method, uri.clone()).unwrap();
        for (name, value) in &headers {
            writer.header(name.clone(), value.clone()).unwrap();
        }
        let envelope = writer.body(&body).unwrap().release().unwrap();

        let wire = Writer::encode(&envelope);
        let reparsed = telling_core::message::parse(&wire).unwrap();

        match reparsed.start_line {
            StartLine::Request { method: parsed_method, uri: parsed_uri, .. } => {
                prop_assert_eq!(parsed_method, method);
                prop_assert_eq!(parsed_uri, uri);
            }
            other => prop_assert!(false, "expected a request start-line, got {:?}", other),
        }

        for (name, value) in &headers {
            prop_assert_eq!(reparsed.header(name), Some(value.as_str()));
        }
        prop_assert_eq!(&reparsed.body[..], &body[..]);
    }
}
