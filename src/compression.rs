//! Compression detection and streaming decoders.

use std::fmt;
use std::io::{self, Cursor, Read};

/// Longest magic sequence we look for (xz).
const MAGIC_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Bzip2,
    Xz,
    Zstd,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Bzip2 => "bzip2",
            Self::Xz => "xz",
            Self::Zstd => "zstd",
        })
    }
}

/// Detect compression from magic bytes.
pub fn detect_compression_magic(magic: &[u8]) -> Compression {
    if magic.starts_with(&[0x1f, 0x8b]) {
        Compression::Gzip
    } else if magic.starts_with(b"BZh") {
        Compression::Bzip2
    } else if magic.starts_with(&[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00]) {
        Compression::Xz
    } else if magic.starts_with(&[0x28, 0xb5, 0x2f, 0xfd]) {
        Compression::Zstd
    } else {
        Compression::None
    }
}

/// Read up to [`MAGIC_LEN`] bytes, tolerating short reads from the network.
fn read_magic<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut magic = vec![0u8; MAGIC_LEN];
    let mut filled = 0;
    while filled < MAGIC_LEN {
        match reader.read(&mut magic[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    magic.truncate(filled);
    Ok(magic)
}

/// Sniff the stream's format and wrap it in the matching decoder.
///
/// The sniffed bytes are replayed in front of the rest of the stream, so the
/// returned reader yields the complete decompressed content. Decoders keep
/// going across concatenated members (`pigz`, `pbzip2`, `xz -T`), otherwise
/// `tar` would see a clean EOF after the first one. Plain tar streams are
/// passed through untouched.
pub fn decompress<R: Read + 'static>(mut reader: R) -> io::Result<(Compression, Box<dyn Read>)> {
    let magic = read_magic(&mut reader)?;
    let compression = detect_compression_magic(&magic);
    let stream = Cursor::new(magic).chain(reader);

    let decoder: Box<dyn Read> = match compression {
        Compression::Gzip => {
            let decoder = flate2::read::MultiGzDecoder::new(stream);
            // The header is parsed eagerly; no header means it was malformed.
            if decoder.header().is_none() {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "invalid gzip header",
                ));
            }
            Box::new(decoder)
        }
        Compression::Bzip2 => Box::new(bzip2::read::MultiBzDecoder::new(stream)),
        Compression::Xz => Box::new(xz2::read::XzDecoder::new_multi_decoder(stream)),
        Compression::Zstd => Box::new(zstd::stream::read::Decoder::new(stream)?),
        Compression::None => Box::new(stream),
    };
    Ok((compression, decoder))
}
