//! Property-based tests for the APDU codec.
//!
//! These tests use proptest to generate random valid commands and responses
//! and verify that the codec invariants hold for all of them.

use cardlink_apdu::{CommandApdu, ResponseApdu};
use proptest::prelude::*;

/// Data lengths biased towards the standard/extended boundary.
fn data_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..=16),
        prop::collection::vec(any::<u8>(), 250..=260),
        prop::collection::vec(any::<u8>(), 0..=1024),
    ]
}

/// Expected lengths across the whole valid range, with the edges weighted up.
fn le_strategy() -> impl Strategy<Value = Option<u32>> {
    prop_oneof![
        Just(None),
        Just(Some(0)),
        Just(Some(256)),
        Just(Some(257)),
        Just(Some(65_536)),
        (1u32..=65_536).prop_map(Some),
    ]
}

proptest! {
    /// Property: decoding an encoded command yields the original command.
    #[test]
    fn prop_command_roundtrip(
        cla in any::<u8>(),
        ins in any::<u8>(),
        p1 in any::<u8>(),
        p2 in any::<u8>(),
        data in data_strategy(),
        le in le_strategy(),
    ) {
        let mut builder = CommandApdu::builder(cla, ins, p1, p2).data(data);
        if let Some(le) = le {
            builder = builder.le(le);
        }
        let cmd = builder.build().unwrap();

        let bytes = cmd.encode();
        prop_assert_eq!(bytes.len(), cmd.encoded_len());
        prop_assert_eq!(CommandApdu::decode(&bytes).unwrap(), cmd);
    }

    /// Property: the extended layout is used iff data > 255 or Le > 256.
    #[test]
    fn prop_extended_selection(data in data_strategy(), le in le_strategy()) {
        let mut builder = CommandApdu::builder(0x00, 0xB0, 0x00, 0x00).data(data.clone());
        if let Some(le) = le {
            builder = builder.le(le);
        }
        let cmd = builder.build().unwrap();

        let expected = data.len() > 255 || cmd.le().is_some_and(|le| le > 256);
        prop_assert_eq!(cmd.is_extended(), expected);
    }

    /// Property: any header range check accepts exactly 0..=255.
    #[test]
    fn prop_try_new_range(value in -1024i64..1024) {
        let result = CommandApdu::try_new(value, 0, 0, 0);
        prop_assert_eq!(result.is_ok(), (0..=255).contains(&value));
    }

    /// Property: response decoding never drops bytes.
    #[test]
    fn prop_response_roundtrip(bytes in prop::collection::vec(any::<u8>(), 2..512)) {
        let resp = ResponseApdu::decode(&bytes).unwrap();
        prop_assert_eq!(resp.data().len(), bytes.len() - 2);
        prop_assert_eq!(resp.encode(), bytes);
    }

    /// Property: decoding arbitrary bytes never panics.
    #[test]
    fn prop_decode_arbitrary_is_total(bytes in prop::collection::vec(any::<u8>(), 0..300)) {
        let _ = CommandApdu::decode(&bytes);
    }
}
