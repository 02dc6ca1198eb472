//! Property-based tests for the Slice codec and frame decoder.

use icebridge_protocol::{
    Decoder, Encapsulation, Identity, Message, Request, SliceDecoder, SliceEncoder, TagFormat,
};
use proptest::prelude::*;

const KNOWN_TAG: i32 = 5;

/// An unrecognized tagged member, as a newer peer might send it.
#[derive(Debug, Clone)]
enum Extra {
    Bool(bool),
    Int(i32),
    Long(i64),
    Text(String),
}

fn extra() -> impl Strategy<Value = Extra> {
    prop_oneof![
        any::<bool>().prop_map(Extra::Bool),
        any::<i32>().prop_map(Extra::Int),
        any::<i64>().prop_map(Extra::Long),
        ".{0,40}".prop_map(Extra::Text),
    ]
}

/// Unknown tags in ascending order, never equal to the known one.
fn extras() -> impl Strategy<Value = Vec<(i32, Extra)>> {
    prop::collection::btree_map(0i32..300, extra(), 0..12).prop_map(|tags| {
        tags.into_iter()
            .filter(|(tag, _)| *tag != KNOWN_TAG)
            .collect()
    })
}

fn encode_extra(encoder: &mut SliceEncoder, tag: i32, value: &Extra) -> Result<(), icebridge_protocol::ProtocolError> {
    match value {
        Extra::Bool(v) => encoder.encode_tagged(tag, TagFormat::F1, Some(v), |e, v| {
            e.encode_bool(*v);
            Ok(())
        }),
        Extra::Int(v) => encoder.encode_tagged(tag, TagFormat::F4, Some(v), |e, v| {
            e.encode_i32(*v);
            Ok(())
        }),
        Extra::Long(v) => encoder.encode_tagged(tag, TagFormat::F8, Some(v), |e, v| {
            e.encode_i64(*v);
            Ok(())
        }),
        Extra::Text(v) => encoder.encode_tagged(tag, TagFormat::OVSize, Some(v.as_str()), |e, v| {
            e.encode_string(v);
            Ok(())
        }),
    }
}

proptest! {
    #[test]
    fn test_primitives_round_trip(
        flag in any::<bool>(),
        short in any::<i16>(),
        double in any::<f64>().prop_filter("NaN never compares equal", |v| !v.is_nan()),
        text in "\\PC{0,64}",
    ) {
        let mut encoder = SliceEncoder::new();
        encoder.encode_bool(flag);
        encoder.encode_i16(short);
        encoder.encode_f64(double);
        encoder.encode_string(&text);
        let bytes = encoder.freeze();

        let mut decoder = SliceDecoder::new(&bytes);
        prop_assert_eq!(decoder.decode_bool().unwrap(), flag);
        prop_assert_eq!(decoder.decode_i16().unwrap(), short);
        prop_assert_eq!(decoder.decode_f64().unwrap(), double);
        prop_assert_eq!(decoder.decode_string().unwrap(), text);
        prop_assert!(decoder.is_at_end());
    }

    #[test]
    fn test_unknown_tags_are_skipped(extras in extras(), known in any::<i32>(), trailer in any::<i32>()) {
        let mut encoder = SliceEncoder::new();
        for (tag, value) in extras.iter().filter(|(tag, _)| *tag < KNOWN_TAG) {
            encode_extra(&mut encoder, *tag, value).unwrap();
        }
        encoder
            .encode_tagged(KNOWN_TAG, TagFormat::F4, Some(&known), |e, v| {
                e.encode_i32(*v);
                Ok(())
            })
            .unwrap();
        for (tag, value) in extras.iter().filter(|(tag, _)| *tag > KNOWN_TAG) {
            encode_extra(&mut encoder, *tag, value).unwrap();
        }
        encoder.encode_tag_end();
        encoder.encode_i32(trailer);
        let bytes = encoder.freeze();

        let mut decoder = SliceDecoder::new(&bytes);
        let decoded = decoder
            .decode_tagged(KNOWN_TAG, TagFormat::F4, |d| d.decode_i32())
            .unwrap();
        prop_assert_eq!(decoded, Some(known));
        decoder.skip_tagged_members().unwrap();
        prop_assert_eq!(decoder.decode_i32().unwrap(), trailer);
        prop_assert!(decoder.is_at_end());
    }

    #[test]
    fn test_request_context_round_trip(
        context in prop::collection::hash_map("[a-z]{1,8}", "\\PC{0,16}", 0..64),
        name in "[a-z]{1,16}",
    ) {
        let mut request = Request::new(Identity::new(name), "op", Encapsulation::empty())
            .with_context(context.clone());
        request.request_id = 9;
        let frame = Message::Request(request.clone()).to_frame();

        match Message::from_frame(&frame).unwrap() {
            Message::Request(decoded) => {
                prop_assert_eq!(&decoded.context, &context);
                prop_assert_eq!(decoded, request);
            }
            other => prop_assert!(false, "unexpected {:?}", other),
        }
    }

    #[test]
    fn test_arbitrary_bytes_never_panic(data in prop::collection::vec(any::<u8>(), 0..512)) {
        let mut decoder = Decoder::new();
        decoder.extend(&data);
        let _ = decoder.decode_message();

        let _ = SliceDecoder::new(&data).decode_class();
        let _ = SliceDecoder::new(&data).decode_exception();
        let _ = SliceDecoder::new(&data).decode_proxy();
    }
}
