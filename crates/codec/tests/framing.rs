use anyhow::Result;
use broker_server_codec::{Backend, FrameReader, decode_frame, encode_frame};
use serde_json::json;

#[test]
fn frames_survive_arbitrary_chunking() -> Result<()> {
    let backend = Backend::Standard;
    let frames = vec![
        json!({"error": false, "service": "Echo", "attribute": "echo", "args": [], "kwargs": {}, "uid": "u1"}),
        json!({"error": false, "result": null, "requester": "127.0.0.1:5000", "uid": "u1"}),
        json!({"error": false, "service": "Ticker", "result": [[1], {"t": "a"}], "uid": "notification"}),
    ];

    let mut wire = Vec::new();
    for frame in &frames {
        wire.extend_from_slice(&encode_frame(&backend, frame)?);
    }

    // Re-split the byte stream at every possible boundary width and make sure
    // the reader always yields the same frames in the same order.
    for chunk_size in [1, 2, 3, 7, 64, wire.len()] {
        let mut reader = FrameReader::default();
        let mut decoded = Vec::new();

        for chunk in wire.chunks(chunk_size) {
            reader.extend(chunk);
            while let Some(frame) = reader.next_frame()? {
                decoded.push(decode_frame(&backend, &frame)?);
            }
        }

        assert_eq!(decoded, frames, "chunk_size={}", chunk_size);
    }

    Ok(())
}
