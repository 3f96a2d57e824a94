//! Backup file layout.
//!
//! ```text
//! CAUCASE-BACKUP-2\n
//! [u32 BE length][SHA-256 of payload][payload]   header, then one frame per chunk
//! ...
//! [0u32][SHA-256 over every frame digest]         trailer
//! ```
//!
//! The first payload is a JSON [`BackupHeader`] listing the data key wrapped
//! for each operator able to restore. Every later payload is newline-delimited
//! JSON [`DumpRow`]s sealed with AES-256-GCM under that data key, the frame's
//! position bound as associated data. Digests cover the sealed bytes, so a
//! file of any size is checked without the key and without holding more than
//! one chunk in memory.

use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use zeroize::Zeroizing;

use caucase_crypto::aead::{self, KEY_SIZE};
use caucase_crypto::WrappedKey;
use caucase_storage::DumpRow;

use crate::error::BackupError;

/// File signature and format version.
pub const MAGIC: &[u8] = b"CAUCASE-BACKUP-2\n";

/// SHA-256 output length.
pub const DIGEST_LEN: usize = 32;

/// Frames announcing more than this are rejected when reading.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Chunk checksum.
pub type Digest = [u8; DIGEST_LEN];

/// SHA-256 of `payload`.
pub fn digest(payload: &[u8]) -> Digest {
    Sha256::digest(payload).into()
}

/// Digest carried by the trailer frame.
pub fn trailer_digest(chunks: &[Digest]) -> Digest {
    let mut hasher = Sha256::new();
    for chunk in chunks {
        hasher.update(chunk);
    }
    hasher.finalize().into()
}

/// Appends `row` as one JSON line.
pub fn append_row(buffer: &mut Vec<u8>, row: &DumpRow) -> Result<(), BackupError> {
    serde_json::to_writer(&mut *buffer, row)?;
    buffer.push(b'\n');
    Ok(())
}

/// Parses a chunk payload back into rows.
pub fn decode_rows(payload: &[u8]) -> Result<Vec<DumpRow>, BackupError> {
    payload
        .split(|byte| *byte == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| {
            serde_json::from_slice(line).map_err(|e| BackupError::Corrupt(format!("bad row: {e}")))
        })
        .collect()
}

/// Writes the magic, then checksummed chunks, then the trailer.
pub struct FrameWriter<W> {
    inner: W,
    digests: Vec<Digest>,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Writes the file signature.
    pub async fn new(mut inner: W) -> Result<Self, BackupError> {
        inner.write_all(MAGIC).await?;
        Ok(Self {
            inner,
            digests: Vec::new(),
        })
    }

    /// Writes one chunk. Empty payloads are skipped; a zero length marks the
    /// trailer.
    pub async fn write_chunk(&mut self, payload: &[u8]) -> Result<(), BackupError> {
        if payload.is_empty() {
            return Ok(());
        }
        let len = u32::try_from(payload.len())
            .map_err(|_| BackupError::InvalidInput("chunk exceeds 4 GiB".into()))?;
        let checksum = digest(payload);

        self.inner.write_all(&len.to_be_bytes()).await?;
        self.inner.write_all(&checksum).await?;
        self.inner.write_all(payload).await?;
        self.digests.push(checksum);
        Ok(())
    }

    /// Writes the trailer and hands back the sink and chunk digests.
    pub async fn finish(mut self) -> Result<(W, Vec<Digest>), BackupError> {
        self.inner.write_all(&0u32.to_be_bytes()).await?;
        self.inner.write_all(&trailer_digest(&self.digests)).await?;
        self.inner.flush().await?;
        Ok((self.inner, self.digests))
    }
}

/// Reads and verifies frames written by [`FrameWriter`].
pub struct FrameReader<R> {
    inner: R,
    digests: Vec<Digest>,
    finished: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Checks the file signature.
    pub async fn new(mut inner: R) -> Result<Self, BackupError> {
        let mut magic = [0u8; MAGIC.len()];
        inner.read_exact(&mut magic).await.map_err(read_error)?;
        if magic != MAGIC {
            return Err(BackupError::Corrupt("not a caucase backup".into()));
        }
        Ok(Self {
            inner,
            digests: Vec::new(),
            finished: false,
        })
    }

    /// Next verified chunk payload, or `None` once the trailer checked out.
    pub async fn next_chunk(&mut self) -> Result<Option<Vec<u8>>, BackupError> {
        if self.finished {
            return Ok(None);
        }

        let mut header = [0u8; 4 + DIGEST_LEN];
        self.inner.read_exact(&mut header).await.map_err(read_error)?;
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let mut expected = [0u8; DIGEST_LEN];
        expected.copy_from_slice(&header[4..]);

        if len == 0 {
            if expected != trailer_digest(&self.digests) {
                return Err(BackupError::Corrupt("trailer digest mismatch".into()));
            }
            let mut extra = [0u8; 1];
            if self.inner.read(&mut extra).await? != 0 {
                return Err(BackupError::Corrupt("data after trailer".into()));
            }
            self.finished = true;
            return Ok(None);
        }
        if len > MAX_FRAME_LEN {
            return Err(BackupError::Corrupt(format!("frame of {len} bytes")));
        }

        let mut payload = vec![0u8; len];
        self.inner.read_exact(&mut payload).await.map_err(read_error)?;
        if digest(&payload) != expected {
            return Err(BackupError::Corrupt(format!(
                "chunk {} digest mismatch",
                self.digests.len()
            )));
        }
        self.digests.push(expected);
        Ok(Some(payload))
    }

    /// Digests of the chunks read so far.
    pub fn digests(&self) -> &[Digest] {
        &self.digests
    }
}

/// Operators able to unlock a backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupHeader {
    /// One wrapped copy of the data key per recipient certificate.
    pub recipients: Vec<Recipient>,
}

/// The data key wrapped for one user certificate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Serial of the recipient's user certificate.
    pub serial: String,
    /// Hex SEC1 point of the ephemeral key.
    pub ephemeral_key: String,
    /// Hex sealed data key.
    pub wrapped_key: String,
}

impl Recipient {
    /// Records `wrapped` as addressed to `serial`.
    pub fn new(serial: &str, wrapped: &WrappedKey) -> Self {
        Self {
            serial: serial.to_string(),
            ephemeral_key: hex::encode(&wrapped.ephemeral_public_key),
            wrapped_key: hex::encode(&wrapped.ciphertext),
        }
    }

    /// The wrapped key, or `None` if the hex is damaged.
    pub fn wrapped(&self) -> Option<WrappedKey> {
        Some(WrappedKey {
            ephemeral_public_key: hex::decode(&self.ephemeral_key).ok()?,
            ciphertext: hex::decode(&self.wrapped_key).ok()?,
        })
    }
}

/// Associated data of the `index`th sealed chunk.
fn chunk_aad(index: u64) -> [u8; 8] {
    index.to_be_bytes()
}

/// Writes the header, then row chunks sealed under the data key.
pub struct BackupWriter<W> {
    frames: FrameWriter<W>,
    data_key: Zeroizing<[u8; KEY_SIZE]>,
    sealed: u64,
}

impl<W: AsyncWrite + Unpin> BackupWriter<W> {
    /// Writes the signature and `header`.
    pub async fn new(
        inner: W,
        header: &BackupHeader,
        data_key: Zeroizing<[u8; KEY_SIZE]>,
    ) -> Result<Self, BackupError> {
        let mut frames = FrameWriter::new(inner).await?;
        frames.write_chunk(&serde_json::to_vec(header)?).await?;
        Ok(Self {
            frames,
            data_key,
            sealed: 0,
        })
    }

    /// Seals and writes one chunk of rows. Empty chunks are skipped.
    pub async fn write_rows(&mut self, rows: &[u8]) -> Result<(), BackupError> {
        if rows.is_empty() {
            return Ok(());
        }
        let sealed = aead::seal(&self.data_key, rows, &chunk_aad(self.sealed))?;
        self.frames.write_chunk(&sealed).await?;
        self.sealed += 1;
        Ok(())
    }

    /// Writes the trailer; see [`FrameWriter::finish`].
    pub async fn finish(self) -> Result<(W, Vec<Digest>), BackupError> {
        self.frames.finish().await
    }
}

/// Reads the header, then opens row chunks with the data key.
pub struct BackupReader<R> {
    frames: FrameReader<R>,
    header: BackupHeader,
    opened: u64,
}

impl<R: AsyncRead + Unpin> BackupReader<R> {
    /// Checks the signature and reads the header.
    pub async fn new(inner: R) -> Result<Self, BackupError> {
        let mut frames = FrameReader::new(inner).await?;
        let payload = frames
            .next_chunk()
            .await?
            .ok_or_else(|| BackupError::Corrupt("missing header".into()))?;
        let header = serde_json::from_slice(&payload)
            .map_err(|e| BackupError::Corrupt(format!("bad header: {e}")))?;
        Ok(Self {
            frames,
            header,
            opened: 0,
        })
    }

    /// Recipients listed in the header.
    pub fn header(&self) -> &BackupHeader {
        &self.header
    }

    /// Next verified and decrypted row chunk, or `None` after the trailer.
    pub async fn next_rows(
        &mut self,
        data_key: &[u8; KEY_SIZE],
    ) -> Result<Option<Zeroizing<Vec<u8>>>, BackupError> {
        let Some(sealed) = self.frames.next_chunk().await? else {
            return Ok(None);
        };
        let rows = aead::open(data_key, &sealed, &chunk_aad(self.opened)).map_err(|_| {
            BackupError::Corrupt(format!("chunk {} does not decrypt", self.opened))
        })?;
        self.opened += 1;
        Ok(Some(rows))
    }
}

fn read_error(e: std::io::Error) -> BackupError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        BackupError::Corrupt("truncated backup".into())
    } else {
        e.into()
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use caucase_storage::Hierarchy;

    async fn encode(chunks: &[&[u8]]) -> Vec<u8> {
        let mut writer = FrameWriter::new(Vec::new()).await.unwrap();
        for chunk in chunks {
            writer.write_chunk(chunk).await.unwrap();
        }
        writer.finish().await.unwrap().0
    }

    async fn decode(bytes: &[u8]) -> Result<Vec<Vec<u8>>, BackupError> {
        let mut reader = FrameReader::new(bytes).await?;
        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().await? {
            chunks.push(chunk);
        }
        Ok(chunks)
    }

    #[tokio::test]
    async fn test_frames_read_back() {
        let bytes = encode(&[b"first", b"", b"second"]).await;
        assert!(bytes.starts_with(MAGIC));
        let chunks = decode(&bytes).await.unwrap();
        assert_eq!(chunks, vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn test_flipped_payload_byte_detected() {
        let mut bytes = encode(&[b"payload"]).await;
        let offset = MAGIC.len() + 4 + DIGEST_LEN;
        bytes[offset] ^= 0x01;
        assert!(matches!(decode(&bytes).await, Err(BackupError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_truncation_detected() {
        let bytes = encode(&[b"payload", b"more"]).await;
        for cut in [MAGIC.len() - 1, MAGIC.len() + 10, bytes.len() - 1] {
            assert!(
                matches!(decode(&bytes[..cut]).await, Err(BackupError::Corrupt(_))),
                "cut at {cut}"
            );
        }
    }

    #[tokio::test]
    async fn test_dropped_chunk_breaks_trailer() {
        let full = encode(&[b"aaaa", b"bbbb"]).await;
        let frame = 4 + DIGEST_LEN + 4;
        let mut bytes = full[..MAGIC.len() + frame].to_vec();
        bytes.extend_from_slice(&full[MAGIC.len() + 2 * frame..]);
        assert!(matches!(decode(&bytes).await, Err(BackupError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_trailing_garbage_rejected() {
        let mut bytes = encode(&[b"payload"]).await;
        bytes.push(0);
        assert!(matches!(decode(&bytes).await, Err(BackupError::Corrupt(_))));
    }

    async fn seal_rows(header: &BackupHeader, chunks: &[&[u8]]) -> (Vec<u8>, [u8; KEY_SIZE]) {
        let key = caucase_crypto::random::generate_key();
        let copy = *key;
        let mut writer = BackupWriter::new(Vec::new(), header, key).await.unwrap();
        for chunk in chunks {
            writer.write_rows(chunk).await.unwrap();
        }
        (writer.finish().await.unwrap().0, copy)
    }

    fn header() -> BackupHeader {
        BackupHeader {
            recipients: vec![Recipient {
                serial: "0a".into(),
                ephemeral_key: "04ab".into(),
                wrapped_key: "cd".into(),
            }],
        }
    }

    #[tokio::test]
    async fn test_rows_sealed_behind_header() {
        let (bytes, key) = seal_rows(&header(), &[b"{\"row\":1}\n", b"", b"{\"row\":2}\n"]).await;
        assert!(!bytes.windows(6).any(|w| w == b"\"row\":"));

        let mut reader = BackupReader::new(bytes.as_slice()).await.unwrap();
        assert_eq!(reader.header(), &header());
        let mut rows = Vec::new();
        while let Some(chunk) = reader.next_rows(&key).await.unwrap() {
            rows.push(chunk.to_vec());
        }
        assert_eq!(rows, vec![b"{\"row\":1}\n".to_vec(), b"{\"row\":2}\n".to_vec()]);
    }

    #[tokio::test]
    async fn test_wrong_data_key_is_corrupt() {
        let (bytes, _) = seal_rows(&header(), &[b"rows"]).await;
        let mut reader = BackupReader::new(bytes.as_slice()).await.unwrap();
        let other = caucase_crypto::random::generate_key();
        assert!(matches!(reader.next_rows(&other).await, Err(BackupError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_unsealed_v1_file_refused() {
        let mut bytes = b"CAUCASE-BACKUP-1\n".to_vec();
        bytes.extend_from_slice(&encode(&[b"{}"]).await[MAGIC.len()..]);
        assert!(matches!(
            BackupReader::new(bytes.as_slice()).await,
            Err(BackupError::Corrupt(_))
        ));

        let headerless = encode(&[b"not json"]).await;
        assert!(matches!(
            BackupReader::new(headerless.as_slice()).await,
            Err(BackupError::Corrupt(_))
        ));
    }

    #[test]
    fn test_recipient_hex_round_trips() {
        let wrapped = WrappedKey {
            ephemeral_public_key: vec![4, 1, 2],
            ciphertext: vec![9, 8],
        };
        let recipient = Recipient::new("ff", &wrapped);
        assert_eq!(recipient.ephemeral_key, "040102");
        assert_eq!(recipient.wrapped(), Some(wrapped));

        let damaged = Recipient {
            wrapped_key: "zz".into(),
            ..recipient
        };
        assert_eq!(damaged.wrapped(), None);
    }

    #[test]
    fn test_rows_are_json_lines() {
        let rows = vec![
            DumpRow::Counter {
                hierarchy: Hierarchy::Service,
                name: "next_csr_id".into(),
                value: 3,
            },
            DumpRow::Counter {
                hierarchy: Hierarchy::User,
                name: "crl_number".into(),
                value: 9,
            },
        ];
        let mut buffer = Vec::new();
        for row in &rows {
            append_row(&mut buffer, row).unwrap();
        }
        assert_eq!(buffer.iter().filter(|b| **b == b'\n').count(), 2);
        assert_eq!(decode_rows(&buffer).unwrap(), rows);
        assert!(decode_rows(b"{not json}\n").is_err());
    }
}
