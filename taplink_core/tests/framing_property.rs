use proptest::prelude::*;
use taplink_core::proto::framing::{
    encode_frame, parse_header, read_frame, write_frame, FrameDecoder, HEADER_SIZE, MAX_FRAME_SIZE,
};
use taplink_core::TunnelError;

proptest! {
    #[test]
    fn encode_decode_roundtrip(payload in proptest::collection::vec(any::<u8>(), 1..=MAX_FRAME_SIZE)) {
        let enc = encode_frame(&payload).unwrap();
        prop_assert_eq!(enc.len(), HEADER_SIZE + payload.len());

        let mut dec = FrameDecoder::new();
        dec.push(&enc);
        prop_assert_eq!(dec.next_frame().unwrap(), Some(payload));
        prop_assert_eq!(dec.buffered_bytes(), 0);
    }

    #[test]
    fn decoder_is_split_invariant(
        payloads in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 1..64), 1..8),
        chunk in 1usize..16,
    ) {
        let mut stream = Vec::new();
        for p in &payloads {
            stream.extend(encode_frame(p).unwrap());
        }

        let mut dec = FrameDecoder::new();
        let mut got = Vec::new();
        for piece in stream.chunks(chunk) {
            dec.push(piece);
            while let Some(frame) = dec.next_frame().unwrap() {
                got.push(frame);
            }
        }
        prop_assert_eq!(got, payloads);
        prop_assert!(!dec.is_mid_frame());
    }

    #[test]
    fn oversized_headers_are_rejected(declared in (MAX_FRAME_SIZE as u32 + 1)..=u32::MAX) {
        let header = declared.to_be_bytes();
        let is_violation = matches!(
            parse_header(&header),
            Err(TunnelError::ProtocolViolation { max: MAX_FRAME_SIZE, .. })
        );
        prop_assert!(is_violation);
    }
}

#[test]
fn legacy_header_layout_for_max_frame() {
    // Two zero bytes, then the length as a big-endian u16
    let enc = encode_frame(&vec![0x5A; MAX_FRAME_SIZE]).unwrap();
    assert_eq!(&enc[..HEADER_SIZE], &[0x00, 0x00, 0x10, 0x00]);
}

#[tokio::test]
async fn async_roundtrip_over_one_byte_pipe() {
    let (mut a, mut b) = tokio::io::duplex(1);
    let writer = tokio::spawn(async move {
        write_frame(&mut a, b"first").await.unwrap();
        write_frame(&mut a, &[0xFF; 300]).await.unwrap();
    });

    let mut buf = vec![0u8; MAX_FRAME_SIZE];
    let n = read_frame(&mut b, &mut buf).await.unwrap().unwrap();
    assert_eq!(&buf[..n], b"first");
    let n = read_frame(&mut b, &mut buf).await.unwrap().unwrap();
    assert_eq!(&buf[..n], &[0xFF; 300][..]);

    writer.await.unwrap();
    assert_eq!(read_frame(&mut b, &mut buf).await.unwrap(), None);
}
