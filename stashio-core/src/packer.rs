use crate::error::{Result, StashError};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

/// Compresses raw blob bytes with zlib framing.
///
/// The sink is an in-memory `Vec`, so the encoder cannot observe a write
/// failure.
pub fn pack(data: &[u8]) -> Vec<u8> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .expect("zlib write into Vec is infallible");
    encoder
        .finish()
        .expect("zlib finish into Vec is infallible")
}

/// Inflates bytes previously produced by [`pack`].
pub fn unpack(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|error| StashError::Decode(format!("zlib inflate failed: {}", error)))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_unpack_roundtrip() {
        let samples: &[&[u8]] = &[
            b"",
            b"hello-world",
            b"a.jpg\x00HELLO",
            &[0u8; 4096],
            &[0xde, 0xad, 0xbe, 0xef],
        ];

        for sample in samples {
            let packed = pack(sample);
            let unpacked = unpack(&packed).unwrap();
            assert_eq!(&unpacked, sample);
        }
    }

    #[test]
    fn test_unpack_rejects_garbage() {
        let result = unpack(b"definitely not zlib");
        assert!(matches!(result, Err(StashError::Decode(_))));
    }
}
