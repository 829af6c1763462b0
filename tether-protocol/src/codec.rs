//! Message codec for IPC framing
//!
//! Every frame is a big-endian `u32` length followed by a bincode body.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{JobMessage, PeerMessage};

/// Maximum message size (16 MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;

/// Protocol codec error
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },
}

/// Codec used by the job manager: decodes [`PeerMessage`], encodes [`JobMessage`]
#[derive(Debug, Default)]
pub struct JobCodec;

impl JobCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for JobCodec {
    type Item = PeerMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_message(src)
    }
}

impl Encoder<JobMessage> for JobCodec {
    type Error = CodecError;

    fn encode(&mut self, item: JobMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_message(&item, dst)
    }
}

/// Codec used by the main server: decodes [`JobMessage`], encodes [`PeerMessage`]
#[derive(Debug, Default)]
pub struct PeerCodec;

impl PeerCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for PeerCodec {
    type Item = JobMessage;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        decode_message(src)
    }
}

impl Encoder<PeerMessage> for PeerCodec {
    type Error = CodecError;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_message(&item, dst)
    }
}

fn decode_message<T: serde::de::DeserializeOwned>(
    src: &mut BytesMut,
) -> Result<Option<T>, CodecError> {
    if src.len() < 4 {
        return Ok(None);
    }

    // Peek at length without consuming
    let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

    if len > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: len,
            max: MAX_MESSAGE_SIZE,
        });
    }

    if src.len() < 4 + len {
        src.reserve(4 + len - src.len());
        return Ok(None);
    }

    src.advance(4);
    let data = src.split_to(len);

    let msg: T = bincode::deserialize(&data)?;
    Ok(Some(msg))
}

fn encode_message<T: serde::Serialize>(item: &T, dst: &mut BytesMut) -> Result<(), CodecError> {
    let data = bincode::serialize(item)?;

    if data.len() > MAX_MESSAGE_SIZE {
        return Err(CodecError::MessageTooLarge {
            size: data.len(),
            max: MAX_MESSAGE_SIZE,
        });
    }

    dst.reserve(4 + data.len());
    dst.put_u32(data.len() as u32);
    dst.put_slice(&data);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{JobRequest, JobResponse, RpcError};
    use crate::types::{StreamAck, StreamData, StreamMeta};

    #[test]
    fn test_peer_request_reaches_job() {
        let mut peer = PeerCodec::new();
        let mut job = JobCodec::new();

        let msg = PeerMessage::Request {
            req_id: 7,
            request: JobRequest::PrepareConnect {
                stream: StreamMeta::new("s1", 65536),
                seq: 42,
            },
        };

        let mut buf = BytesMut::new();
        peer.encode(msg.clone(), &mut buf).unwrap();
        let decoded = job.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_error_response_reaches_peer() {
        let mut peer = PeerCodec::new();
        let mut job = JobCodec::new();

        let msg = JobMessage::Response {
            req_id: 3,
            result: Err::<JobResponse, _>(RpcError::new("not authenticated")),
        };

        let mut buf = BytesMut::new();
        job.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(peer.decode(&mut buf).unwrap().unwrap(), msg);
    }

    #[test]
    fn test_partial_message() {
        let mut peer = PeerCodec::new();
        let mut job = JobCodec::new();

        let mut buf = BytesMut::new();
        peer.encode(PeerMessage::StreamAck(StreamAck::new("s1", 5, 1024)), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(2);
        assert!(job.decode(&mut partial).unwrap().is_none());

        // Header present but body incomplete
        partial.unsplit(buf.split_to(4));
        assert!(job.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(job.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_multiple_frames_in_one_buffer() {
        let mut peer = PeerCodec::new();
        let mut job = JobCodec::new();

        let mut buf = BytesMut::new();
        job.encode(JobMessage::StreamData(StreamData::data("s", 0, b"ab")), &mut buf)
            .unwrap();
        job.encode(JobMessage::StreamData(StreamData::eof("s", 2)), &mut buf)
            .unwrap();

        let first = peer.decode(&mut buf).unwrap().unwrap();
        let second = peer.decode(&mut buf).unwrap().unwrap();
        assert!(matches!(first, JobMessage::StreamData(ref d) if d.seq == 0));
        assert!(matches!(second, JobMessage::StreamData(ref d) if d.eof));
        assert!(peer.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_message_too_large() {
        let mut job = JobCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_MESSAGE_SIZE + 1) as u32);
        buf.put_slice(&[0u8; 16]);

        let err = job.decode(&mut buf).unwrap_err();
        assert!(matches!(err, CodecError::MessageTooLarge { .. }));
    }

    #[test]
    fn test_garbage_body() {
        let mut job = JobCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(2);
        buf.put_slice(&[0xff, 0xff]);

        assert!(matches!(job.decode(&mut buf), Err(CodecError::Bincode(_))));
    }
}
