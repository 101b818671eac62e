use relay_wire::{Buffer, decode_frame, encode_frame};

#[test]
fn vectors_match_frame_encoding() {
    // Known-good wire vectors: (msg_type, body, full frame hex).
    let vectors: &[(u16, &[u8], &str)] = &[
        // heartbeat: empty body
        (0x0001, b"", "000000020001"),
        // echo request
        (0x0002, b"hello router", "0000000e000268656c6c6f20726f75746572"),
        // high message type, single byte body
        (0xFFFF, b"\x00", "00000003ffff00"),
    ];
    for (msg_type, body, frame_hex) in vectors {
        let expected = hex_to_bytes(frame_hex);
        let encoded = encode_frame(*msg_type, body).expect("encode");
        assert_eq!(encoded.as_ref(), expected.as_slice(), "encode {msg_type}");

        let mut buf = Buffer::new(expected.len());
        buf.append(&expected);
        let frame = decode_frame(&mut buf, 0).expect("decode").expect("complete");
        assert_eq!(frame.msg_type, *msg_type);
        assert_eq!(frame.body.as_ref(), *body, "decode {msg_type}");
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    assert!(hex.len() % 2 == 0, "hex length must be even");
    hex.as_bytes()
        .chunks(2)
        .map(|pair| (from_hex_char(pair[0]) << 4) | from_hex_char(pair[1]))
        .collect()
}

fn from_hex_char(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => panic!("invalid hex char"),
    }
}
