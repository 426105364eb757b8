//! The binary checkpoint format.
//!
//! A checkpoint starts with a `u16` format version, a `u16` model tag and an `i64` step
//! counter, followed by the model's flat record arrays. All primitives are little-endian.

use crate::{CheckpointError, ModelKind};
use std::io::Read;

/// The checkpoint format version written by this crate.
pub const FORMAT_VERSION: u16 = 1;

/// File extension of checkpoint files.
pub const EXTENSION: &str = "trs";

/// Appends little-endian primitives to a byte buffer.
#[derive(Default)]
pub(crate) struct CheckpointWriter {
    buf: Vec<u8>,
}

impl CheckpointWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn i32(&mut self, value: i32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    pub fn f32(&mut self, value: f32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Writes an array length.
    pub fn count(&mut self, len: usize) {
        self.i32(len as i32);
    }

    pub fn header(&mut self, model: ModelKind, step: i64) {
        self.u16(FORMAT_VERSION);
        self.u16(model.tag());
        self.i64(step);
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads little-endian primitives from a stream.
pub(crate) struct CheckpointReader<R> {
    inner: R,
}

impl<R: Read> CheckpointReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    fn bytes<const N: usize>(&mut self) -> Result<[u8; N], CheckpointError> {
        let mut bytes = [0; N];
        self.inner.read_exact(&mut bytes)?;
        Ok(bytes)
    }

    pub fn u16(&mut self) -> Result<u16, CheckpointError> {
        Ok(u16::from_le_bytes(self.bytes()?))
    }

    pub fn i32(&mut self) -> Result<i32, CheckpointError> {
        Ok(i32::from_le_bytes(self.bytes()?))
    }

    pub fn i64(&mut self) -> Result<i64, CheckpointError> {
        Ok(i64::from_le_bytes(self.bytes()?))
    }

    pub fn f32(&mut self) -> Result<f32, CheckpointError> {
        Ok(f32::from_le_bytes(self.bytes()?))
    }

    /// Reads an array length.
    pub fn count(&mut self) -> Result<usize, CheckpointError> {
        let count = self.i32()?;
        if count < 0 {
            return Err(CheckpointError::Corrupt("negative array length"));
        }
        Ok(count as usize)
    }

    /// Reads and checks the header, returning the model and step counter.
    pub fn header(&mut self) -> Result<(ModelKind, i64), CheckpointError> {
        let version = self.u16()?;
        if version != FORMAT_VERSION {
            return Err(CheckpointError::UnsupportedVersion(version));
        }
        let tag = self.u16()?;
        let model = ModelKind::from_tag(tag).ok_or(CheckpointError::UnknownModel(tag))?;
        let step = self.i64()?;
        Ok((model, step))
    }

    /// Checks that the stream has been fully consumed.
    pub fn expect_end(&mut self) -> Result<(), CheckpointError> {
        let mut byte = [0];
        match self.inner.read(&mut byte)? {
            0 => Ok(()),
            _ => Err(CheckpointError::Corrupt("trailing bytes")),
        }
    }
}

/// Checks that a stored cell reference is `NONE` or a valid index.
pub(crate) fn check_ref(value: i32, len: usize, what: &'static str) -> Result<(), CheckpointError> {
    if value == crate::NONE || (value >= 0 && (value as usize) < len) {
        Ok(())
    } else {
        Err(CheckpointError::Corrupt(what))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut writer = CheckpointWriter::new();
        writer.header(ModelKind::CarFollowing, 1234);
        let bytes = writer.into_bytes();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[..4], &[1, 0, 1, 0]);
        let mut reader = CheckpointReader::new(bytes.as_slice());
        let (model, step) = reader.header().unwrap();
        assert_eq!(model, ModelKind::CarFollowing);
        assert_eq!(step, 1234);
    }

    #[test]
    fn rejects_unknown_version_and_model() {
        let bytes = [2u8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = CheckpointReader::new(&bytes[..]).header().unwrap_err();
        assert!(matches!(err, CheckpointError::UnsupportedVersion(2)));

        let bytes = [1u8, 0, 9, 0, 0, 0, 0, 0, 0, 0, 0, 0];
        let err = CheckpointReader::new(&bytes[..]).header().unwrap_err();
        assert!(matches!(err, CheckpointError::UnknownModel(9)));
    }

    #[test]
    fn truncated_input() {
        let err = CheckpointReader::new(&[1u8][..]).u16().unwrap_err();
        assert!(matches!(err, CheckpointError::Io(_)));
    }

    #[test]
    fn trailing_bytes() {
        let mut reader = CheckpointReader::new(&[0u8, 0, 7][..]);
        reader.u16().unwrap();
        assert!(matches!(reader.expect_end(), Err(CheckpointError::Corrupt(_))));
        reader.u16().unwrap_err();
        assert!(CheckpointReader::new(&[0u8; 0][..]).expect_end().is_ok());
    }

    #[test]
    fn negative_count() {
        let bytes = (-3i32).to_le_bytes();
        let err = CheckpointReader::new(&bytes[..]).count().unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt(_)));
    }
}
