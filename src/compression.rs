//! Transparent decompression of layer and archive streams.
//!
//! The format is detected from the first bytes of the stream, so media
//! types that lie about the compression (or are missing) do not matter.

use std::io::{self, Cursor, Read};

const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

const ZSTD_MAGIC: &[u8] = &[0x28, 0xb5, 0x2f, 0xfd];

/// Compression format of a stream.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Detect the format from the magic number at the start of a stream.
    pub fn detect(magic: &[u8]) -> Compression {
        if magic.starts_with(GZIP_MAGIC) {
            Compression::Gzip
        } else if magic.starts_with(ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Wrap `reader` with a decoder for the detected compression format.
///
/// Uncompressed streams are returned as-is.
pub fn decompress_maybe<'a, R: Read + 'a>(
    mut reader: R,
) -> io::Result<(Compression, Box<dyn Read + 'a>)> {
    let mut magic = [0u8; 4];
    let len = read_prefix(&mut reader, &mut magic)?;

    let compression = Compression::detect(&magic[..len]);
    let stream = Cursor::new(magic).take(len as u64).chain(reader);

    let decoded: Box<dyn Read + 'a> = match compression {
        Compression::None => Box::new(stream),

        Compression::Gzip => Box::new(flate2::read::GzDecoder::new(stream)),

        #[cfg(feature = "zstd")]
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(stream)?),

        #[cfg(not(feature = "zstd"))]
        Compression::Zstd => {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "zstd compression is not enabled",
            ))
        }
    };

    Ok((compression, decoded))
}

/// Fill `buf` as much as possible. Returns the number of bytes read,
/// which is less than `buf.len()` only at EOF.
pub(crate) fn read_prefix(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    Ok(filled)
}

#[test]
fn detect_formats() {
    assert_eq!(Compression::detect(&[0x1f, 0x8b, 8, 0]), Compression::Gzip);
    assert_eq!(Compression::detect(&[0x28, 0xb5, 0x2f, 0xfd]), Compression::Zstd);
    assert_eq!(Compression::detect(b"ustar"), Compression::None);
    assert_eq!(Compression::detect(&[0x1f]), Compression::None);
    assert_eq!(Compression::detect(&[]), Compression::None);
}

#[test]
fn gzip_round_trip() {
    use std::io::Write;

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), Default::default());
    encoder.write_all(b"layer data").unwrap();
    let data = encoder.finish().unwrap();

    let (compression, mut reader) = decompress_maybe(Cursor::new(data)).unwrap();
    assert_eq!(compression, Compression::Gzip);

    let mut output = String::new();
    reader.read_to_string(&mut output).unwrap();
    assert_eq!(output, "layer data");
}

#[test]
fn short_plain_stream() {
    let (compression, mut reader) = decompress_maybe(Cursor::new(b"ab".to_vec())).unwrap();
    assert_eq!(compression, Compression::None);

    let mut output = Vec::new();
    reader.read_to_end(&mut output).unwrap();
    assert_eq!(output, b"ab");
}
