use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::ResourceId;

// No real reason these limits need to exist, just don't want to read corrupt
// data and try to allocate based on it.
const MAX_HEADER_SIZE: usize = 1024 * 1024;
const MAX_PAYLOAD_SIZE: usize = 1024 * 1024 * 1024;

/// How the payload block is stored on disk. Encoded as a u32 tag.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionMethod {
    None,
    Deflate,
}

/// The lightweight metadata at the top of every resource file. Reading it is
/// a much smaller operation than decoding the payload, which is what lets the
/// loader discover and schedule dependencies before the heavy decode runs.
///
/// File layout:
/// `[u32 meta size][meta, bincode] [u32 payload size][payload bytes]`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceHeader {
    pub dependencies: Vec<ResourceId>,
    pub allow_async_loading: bool,
    pub compression: CompressionMethod,
}

impl Default for ResourceHeader {
    fn default() -> Self {
        ResourceHeader {
            dependencies: Vec::new(),
            allow_async_loading: true,
            compression: CompressionMethod::None,
        }
    }
}

impl ResourceHeader {
    pub fn write<W: Write>(
        &self,
        writer: &mut W,
    ) -> std::io::Result<()> {
        let serialized = bincode::serialize(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        assert!(serialized.len() < MAX_HEADER_SIZE);
        writer.write_all(&(serialized.len() as u32).to_le_bytes())?;
        writer.write_all(&serialized)?;
        Ok(())
    }

    pub fn read<R: Read>(reader: &mut R) -> std::io::Result<ResourceHeader> {
        let mut length_bytes = [0u8; 4];
        reader.read_exact(&mut length_bytes)?;
        let length = u32::from_le_bytes(length_bytes) as usize;
        if length >= MAX_HEADER_SIZE {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "resource header length out of bounds",
            ));
        }

        let mut read_buffer = vec![0u8; length];
        reader.read_exact(&mut read_buffer)?;

        bincode::deserialize(&read_buffer)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Writes the payload block, compressing per `compression`. The stored size
/// prefix is the post-compression size.
pub fn write_payload<W: Write>(
    writer: &mut W,
    payload: &[u8],
    compression: CompressionMethod,
) -> std::io::Result<()> {
    let stored = match compression {
        CompressionMethod::None => None,
        CompressionMethod::Deflate => {
            let mut encoder =
                flate2::read::DeflateEncoder::new(payload, flate2::Compression::default());
            let mut compressed = Vec::new();
            encoder.read_to_end(&mut compressed)?;
            Some(compressed)
        }
    };
    let stored = stored.as_deref().unwrap_or(payload);

    writer.write_all(&(stored.len() as u32).to_le_bytes())?;
    writer.write_all(stored)?;
    Ok(())
}

/// Reads the payload block back into its decoded-input form.
pub fn read_payload<R: Read>(
    reader: &mut R,
    compression: CompressionMethod,
) -> std::io::Result<Vec<u8>> {
    let mut length_bytes = [0u8; 4];
    reader.read_exact(&mut length_bytes)?;
    let length = u32::from_le_bytes(length_bytes) as usize;
    if length >= MAX_PAYLOAD_SIZE {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "resource payload length out of bounds",
        ));
    }

    let mut stored = vec![0u8; length];
    reader.read_exact(&mut stored)?;

    match compression {
        CompressionMethod::None => Ok(stored),
        CompressionMethod::Deflate => {
            let mut decoder = flate2::read::DeflateDecoder::new(&stored[..]);
            let mut payload = Vec::new();
            decoder.read_to_end(&mut payload)?;
            Ok(payload)
        }
    }
}

/// Writes a complete resource file: header, then payload block.
pub fn write_resource_file<W: Write>(
    writer: &mut W,
    header: &ResourceHeader,
    payload: &[u8],
) -> std::io::Result<()> {
    header.write(writer)?;
    write_payload(writer, payload, header.compression)
}

/// Reads a complete resource file back as header plus payload bytes.
pub fn read_resource_file<R: Read>(reader: &mut R) -> std::io::Result<(ResourceHeader, Vec<u8>)> {
    let header = ResourceHeader::read(reader)?;
    let payload = read_payload(reader, header.compression)?;
    Ok((header, payload))
}
