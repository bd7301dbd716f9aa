//! Round-trip and layout-selection tests for the APDU codec.
//!
//! Covers the standard/extended boundaries for both the data field
//! (255 vs 256 bytes) and the expected length (256 vs 257).

use cardlink_apdu::{ApduError, CommandApdu, ResponseApdu};
use rstest::rstest;

fn command(data_len: usize, le: Option<u32>) -> CommandApdu {
    let data: Vec<u8> = (0..data_len).map(|i| (i % 251) as u8).collect();
    let mut builder = CommandApdu::builder(0x80, 0xCA, 0x9F, 0x7F).data(data);
    if let Some(le) = le {
        builder = builder.le(le);
    }
    builder.build().unwrap()
}

#[rstest]
fn test_command_roundtrip(
    #[values(0, 1, 255, 256, 65_535)] data_len: usize,
    #[values(None, Some(0), Some(1), Some(256), Some(257), Some(65_536))] le: Option<u32>,
) {
    let cmd = command(data_len, le);
    let bytes = cmd.encode();

    assert_eq!(bytes.len(), cmd.encoded_len());
    assert_eq!(CommandApdu::decode(&bytes).unwrap(), cmd);
}

#[rstest]
#[case(255, None, false)]
#[case(256, None, true)]
#[case(0, Some(256), false)]
#[case(0, Some(257), true)]
#[case(255, Some(256), false)]
#[case(255, Some(257), true)]
#[case(256, Some(1), true)]
#[case(0, Some(0), false)]
fn test_extended_form_selection(
    #[case] data_len: usize,
    #[case] le: Option<u32>,
    #[case] extended: bool,
) {
    let cmd = command(data_len, le);
    assert_eq!(cmd.is_extended(), extended);

    let bytes = cmd.encode();
    if data_len > 0 || le.is_some() {
        // Extended commands carry a zero marker right after the header
        assert_eq!(bytes[4] == 0x00 && (data_len > 0 || bytes.len() > 5), extended);
    }
}

#[test]
fn test_data_255_uses_one_byte_lc() {
    let bytes = command(255, None).encode();
    assert_eq!(bytes.len(), 4 + 1 + 255);
    assert_eq!(bytes[4], 0xFF);
}

#[test]
fn test_data_256_uses_two_byte_lc() {
    let bytes = command(256, None).encode();
    assert_eq!(bytes.len(), 4 + 3 + 256);
    assert_eq!(&bytes[4..7], &[0x00, 0x01, 0x00]);
}

#[test]
fn test_select_aid_wire_format() {
    let cmd = CommandApdu::builder(0x00, 0xA4, 0x04, 0x00)
        .data(vec![0xA0, 0x00, 0x00, 0x00, 0x03])
        .le(0)
        .build()
        .unwrap();

    assert_eq!(
        cmd.encode(),
        vec![0x00, 0xA4, 0x04, 0x00, 0x05, 0xA0, 0x00, 0x00, 0x00, 0x03, 0x00]
    );
}

#[rstest]
#[case(&[][..])]
#[case(&[0x00][..])]
#[case(&[0x00, 0xA4, 0x04][..])]
fn test_decode_rejects_inputs_shorter_than_header(#[case] bytes: &[u8]) {
    assert!(matches!(
        CommandApdu::decode(bytes),
        Err(ApduError::TooShort { expected: 4, .. })
    ));
}

#[rstest]
#[case(vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0x01])]
#[case(vec![0x00, 0xA4, 0x04, 0x00, 0x02, 0x01, 0x02, 0x03, 0x04])]
#[case(vec![0x00, 0xA4, 0x04, 0x00, 0x00, 0x00, 0x03, 0x01])]
#[case(vec![0x00, 0xA4, 0x04, 0x00, 0x00, 0x00, 0x01, 0x01, 0x00])]
fn test_decode_rejects_malformed_bodies(#[case] bytes: Vec<u8>) {
    assert!(CommandApdu::decode(&bytes).is_err());
}

#[rstest]
#[case(vec![], 0x9000)]
#[case(vec![0x6F, 0x10, 0x84], 0x9000)]
#[case(vec![0x00; 256], 0x6100)]
#[case(vec![0xFF; 65_536], 0x9000)]
fn test_response_roundtrip(#[case] data: Vec<u8>, #[case] sw: u16) {
    let resp = ResponseApdu::new(data, sw);
    assert_eq!(ResponseApdu::decode(&resp.encode()).unwrap(), resp);
}
