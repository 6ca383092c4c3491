//! Slice and metadata framing shared by every transport
//!
//! A frame is a JSON header block followed by an optional raw payload. On
//! the wire it is encoded as
//!
//! ```text
//! u32 header_len | i32 payload_marker | header bytes | payload bytes
//! ```
//!
//! with little-endian integers. The marker says what the frame carries:
//! `-1` global header, `-2` global footer, `0` failed slice read and any
//! positive value a slice whose payload is exactly that many bytes.

use crate::error::{Result, VolumeError};
use crate::metadata::VolumeMetadata;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Marker of the global header frame
pub const HEADER_MARKER: i32 = -1;
/// Marker of the global footer frame
pub const FOOTER_MARKER: i32 = -2;
/// Marker of a failed slice read
pub const FAILURE_MARKER: i32 = 0;

const PREFIX_LEN: usize = 8;

/// What a frame carries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Header,
    Footer,
    Slice,
    Failure,
}

/// Header block of a slice frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SliceHeader {
    /// 1-based image number within the series
    pub instance_number: u32,
    pub min: i32,
    pub max: i32,
    pub success: bool,
}

/// Header block of a failure frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureHeader {
    pub success: bool,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_number: Option<u32>,
}

/// One decoded frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    marker: i32,
    header: Bytes,
    payload: Bytes,
}

impl Frame {
    /// Build a frame from a header length, a payload marker and the combined
    /// header + payload buffer.
    pub fn from_parts(header_bytes: usize, marker: i32, combined: Bytes) -> Result<Self> {
        if header_bytes > combined.len() {
            return Err(VolumeError::InvalidFormat(format!(
                "Header length {} exceeds frame length {}",
                header_bytes,
                combined.len()
            )));
        }
        let mut payload = combined;
        let header = payload.split_to(header_bytes);
        let frame = Self {
            marker,
            header,
            payload,
        };
        frame.check()?;
        Ok(frame)
    }

    fn check(&self) -> Result<()> {
        match self.marker {
            HEADER_MARKER | FOOTER_MARKER => Ok(()),
            FAILURE_MARKER if self.payload.is_empty() => Ok(()),
            FAILURE_MARKER => Err(VolumeError::InvalidFormat(
                "Failure frame must not carry a payload".to_string(),
            )),
            size if size > 0 && size as usize == self.payload.len() => Ok(()),
            size if size > 0 => Err(VolumeError::InvalidFormat(format!(
                "Slice frame announces {} payload bytes but carries {}",
                size,
                self.payload.len()
            ))),
            other => Err(VolumeError::InvalidFormat(format!(
                "Unknown payload marker {}",
                other
            ))),
        }
    }

    fn with_json<T: Serialize>(marker: i32, header: &T, payload: Bytes) -> Result<Self> {
        let header = Bytes::from(serde_json::to_vec(header)?);
        let frame = Self {
            marker,
            header,
            payload,
        };
        frame.check()?;
        Ok(frame)
    }

    /// Global header frame announcing the volume metadata
    pub fn header(metadata: &VolumeMetadata) -> Result<Self> {
        Self::with_json(HEADER_MARKER, metadata, Bytes::new())
    }

    /// Global footer frame with extra metadata fields
    pub fn footer(fields: &Value) -> Result<Self> {
        Self::with_json(FOOTER_MARKER, fields, Bytes::new())
    }

    /// Slice frame; an empty payload is not a valid slice
    pub fn slice(info: &SliceHeader, payload: Bytes) -> Result<Self> {
        if payload.is_empty() || payload.len() > i32::MAX as usize {
            return Err(VolumeError::InvalidFormat(format!(
                "Slice payload of {} bytes cannot be framed",
                payload.len()
            )));
        }
        Self::with_json(payload.len() as i32, info, payload)
    }

    /// Failed slice read carrying an error message
    pub fn failure(message: impl Into<String>, instance_number: Option<u32>) -> Result<Self> {
        let header = FailureHeader {
            success: false,
            error_message: message.into(),
            instance_number,
        };
        Self::with_json(FAILURE_MARKER, &header, Bytes::new())
    }

    pub fn marker(&self) -> i32 {
        self.marker
    }

    pub fn kind(&self) -> FrameKind {
        match self.marker {
            HEADER_MARKER => FrameKind::Header,
            FOOTER_MARKER => FrameKind::Footer,
            FAILURE_MARKER => FrameKind::Failure,
            _ => FrameKind::Slice,
        }
    }

    /// Raw header block
    pub fn header_bytes(&self) -> &Bytes {
        &self.header
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Parse the header block as JSON
    pub fn header_json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.header).map_err(|e| {
            VolumeError::InvalidFormat(format!("Malformed {:?} frame header: {}", self.kind(), e))
        })
    }

    /// Parse a global header frame
    pub fn metadata(&self) -> Result<VolumeMetadata> {
        self.expect_kind(FrameKind::Header)?;
        let meta: VolumeMetadata = self.header_json()?;
        meta.validate()?;
        Ok(meta)
    }

    /// Parse a slice frame header
    pub fn slice_header(&self) -> Result<SliceHeader> {
        self.expect_kind(FrameKind::Slice)?;
        self.header_json()
    }

    /// Error message of a failure frame
    pub fn failure_message(&self) -> Result<String> {
        self.expect_kind(FrameKind::Failure)?;
        let header: FailureHeader = self.header_json()?;
        Ok(header.error_message)
    }

    fn expect_kind(&self, kind: FrameKind) -> Result<()> {
        if self.kind() != kind {
            return Err(VolumeError::InvalidFormat(format!(
                "Expected {:?} frame, got {:?}",
                kind,
                self.kind()
            )));
        }
        Ok(())
    }

    /// Length of the encoded frame
    pub fn encoded_len(&self) -> usize {
        PREFIX_LEN + self.header.len() + self.payload.len()
    }

    /// Append the wire encoding to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        buf.put_u32_le(self.header.len() as u32);
        buf.put_i32_le(self.marker);
        buf.put_slice(&self.header);
        buf.put_slice(&self.payload);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decode one frame occupying the whole of `buf`
    pub fn decode(mut buf: Bytes) -> Result<Self> {
        if buf.len() < PREFIX_LEN {
            return Err(VolumeError::InvalidFormat(format!(
                "Frame of {} bytes is shorter than its prefix",
                buf.len()
            )));
        }
        let header_len = buf.get_u32_le() as usize;
        let marker = buf.get_i32_le();
        Self::from_parts(header_len, marker, buf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PixelFormat;
    use serde_json::json;

    #[test]
    fn test_from_parts() {
        let header = br#"{"instanceNumber":3,"min":0,"max":9,"success":true}"#;
        let mut combined = header.to_vec();
        combined.extend_from_slice(&[1, 2, 3, 4]);
        let frame = Frame::from_parts(header.len(), 4, Bytes::from(combined)).unwrap();
        assert_eq!(frame.kind(), FrameKind::Slice);
        assert_eq!(frame.payload().as_ref(), &[1, 2, 3, 4]);
        assert_eq!(frame.slice_header().unwrap().instance_number, 3);
    }

    #[test]
    fn test_marker_validation() {
        let combined = Bytes::from_static(b"{}abc");
        assert!(Frame::from_parts(2, 4, combined.clone()).is_err());
        assert!(Frame::from_parts(2, 0, combined.clone()).is_err());
        assert!(Frame::from_parts(2, -3, combined.clone()).is_err());
        assert!(Frame::from_parts(9, -1, combined.clone()).is_err());
        assert_eq!(Frame::from_parts(2, 3, combined).unwrap().payload().len(), 3);
    }

    #[test]
    fn test_encode_layout() {
        let frame = Frame::footer(&json!({})).unwrap();
        let encoded = frame.encode();
        assert_eq!(&encoded[..4], &2u32.to_le_bytes());
        assert_eq!(&encoded[4..8], &(-2i32).to_le_bytes());
        assert_eq!(&encoded[8..], b"{}");
        assert_eq!(Frame::decode(encoded).unwrap(), frame);
        assert!(Frame::decode(Bytes::from_static(&[1, 0, 0])).is_err());
    }

    #[test]
    fn test_typed_accessors() {
        let meta = VolumeMetadata::new([2, 2, 3], PixelFormat::UInt8);
        let header = Frame::header(&meta).unwrap();
        assert_eq!(header.metadata().unwrap(), meta);
        assert!(header.slice_header().is_err());

        let failure = Frame::failure("file missing", Some(2)).unwrap();
        assert_eq!(failure.kind(), FrameKind::Failure);
        assert_eq!(failure.failure_message().unwrap(), "file missing");

        let info = SliceHeader {
            instance_number: 1,
            min: 0,
            max: 0,
            success: true,
        };
        assert!(Frame::slice(&info, Bytes::new()).is_err());
    }
}
