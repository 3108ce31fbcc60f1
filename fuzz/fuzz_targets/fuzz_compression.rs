#![no_main]

use libfuzzer_sys::fuzz_target;
use packet_engine::protocol::Compression;
use packet_engine::utils::compression::{BlockCompression, CompressionKind};

fuzz_target!(|data: &[u8]| {
    let mut out = vec![0u8; 64 * 1024];
    for kind in [CompressionKind::Lz4, CompressionKind::Zstd] {
        let strategy = BlockCompression::new(kind);

        // Arbitrary framed input must fail cleanly and respect the size limit
        if let Ok(result) = strategy.decompress(data, &mut out) {
            assert!(result.consumed <= data.len());
            assert!(result.produced <= out.len());
        }

        let mut framed = vec![0u8; data.len() * 2 + 64];
        if let Ok(n) = strategy.compress(data, &mut framed) {
            if data.len() <= out.len() {
                let result = strategy.decompress(&framed[..n], &mut out).unwrap();
                assert_eq!(&out[..result.produced], data);
            }
        }
    }
});
