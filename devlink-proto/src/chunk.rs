//! Payload layout of a streamed dump chunk.
//!
//! `[u16 name_len][name][u8 flags][u64 offset][data...]`, little-endian.

use crate::{ProtoError, Result};

/// Flag bit marking the final chunk of a file.
pub const LAST_CHUNK: u8 = 0x01;

/// Fixed bytes preceding the name and following it (flags + offset).
const FIXED_LEN: usize = 2 + 1 + 8;

/// Decoded dump chunk payload.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct ChunkPayload {
    /// Relative file name the chunk belongs to.
    pub name: String,
    /// `true` for the final chunk of `name`.
    pub last: bool,
    /// Byte offset of `data` within the file.
    pub offset: u64,
    /// Chunk bytes.
    pub data: Vec<u8>,
}

impl ChunkPayload {
    /// Creates a chunk payload.
    pub fn new(name: impl Into<String>, offset: u64, data: Vec<u8>, last: bool) -> Self {
        Self {
            name: name.into(),
            last,
            offset,
            data,
        }
    }

    /// Encodes the payload. Fails if the name exceeds `u16::MAX` bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let name_len = u16::try_from(self.name.len())
            .map_err(|_| ProtoError::BadChunk("name longer than 65535 bytes"))?;
        let mut buf = Vec::with_capacity(FIXED_LEN + self.name.len() + self.data.len());
        buf.extend_from_slice(&name_len.to_le_bytes());
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(if self.last { LAST_CHUNK } else { 0 });
        buf.extend_from_slice(&self.offset.to_le_bytes());
        buf.extend_from_slice(&self.data);
        Ok(buf)
    }

    /// Decodes a payload produced by [`encode`](Self::encode).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let (len_bytes, rest) = buf
            .split_first_chunk::<2>()
            .ok_or(ProtoError::BadChunk("missing name length"))?;
        let name_len = usize::from(u16::from_le_bytes(*len_bytes));
        if rest.len() < name_len + FIXED_LEN - 2 {
            return Err(ProtoError::BadChunk("truncated chunk header"));
        }
        let (name, rest) = rest.split_at(name_len);
        let name = std::str::from_utf8(name)
            .map_err(|_| ProtoError::BadChunk("name is not UTF-8"))?
            .to_owned();
        let (flags, rest) = rest
            .split_first()
            .ok_or(ProtoError::BadChunk("missing flags"))?;
        let (offset, data) = rest
            .split_first_chunk::<8>()
            .ok_or(ProtoError::BadChunk("missing offset"))?;
        Ok(Self {
            name,
            last: flags & LAST_CHUNK != 0,
            offset: u64::from_le_bytes(*offset),
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fields() {
        let chunk = ChunkPayload::new("op/conv1.bin", 4096, b"tensor".to_vec(), true);
        let decoded = ChunkPayload::decode(&chunk.encode().unwrap()).unwrap();
        assert_eq!(decoded.name, "op/conv1.bin");
        assert_eq!(decoded.offset, 4096);
        assert!(decoded.last);
        assert_eq!(decoded.data, b"tensor");
    }

    #[test]
    fn rejects_truncated_input() {
        assert!(ChunkPayload::decode(&[]).is_err());
        assert!(ChunkPayload::decode(&[5, 0, b'a', b'b']).is_err());
        let mut buf = ChunkPayload::new("x", 0, Vec::new(), false).encode().unwrap();
        buf.truncate(buf.len() - 1);
        assert!(ChunkPayload::decode(&buf).is_err());
    }

    #[test]
    fn rejects_non_utf8_name() {
        let buf = [2, 0, 0xFF, 0xFE, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(
            ChunkPayload::decode(&buf),
            Err(ProtoError::BadChunk("name is not UTF-8"))
        );
    }
}
