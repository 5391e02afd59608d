use std::io::{Error, ErrorKind, Read};

use byteorder::{NetworkEndian, ReadBytesExt};
use bytes::{Buf, BytesMut};
use tokio::net::TcpStream;
use tokio_util::codec::{Decoder, Encoder, Framed};
use twoway::find_bytes;

use super::msg::{Message, MessageError};

pub type MessageProtocol = Framed<TcpStream, MessageCodec>;

/// Frames BGP messages on a TCP stream (preamble scan + declared length)
/// and hands the bytes to the wire codec.
#[derive(Debug, Default)]
pub struct MessageCodec {
    four_byte_asn: bool,
}

impl MessageCodec {
    pub fn new() -> Self {
        // 4-octet encoding is assumed until the OPEN exchange says otherwise
        Self {
            four_byte_asn: true,
        }
    }

    pub fn set_four_byte_asn(&mut self, enabled: bool) {
        self.four_byte_asn = enabled;
    }
}

impl Decoder for MessageCodec {
    type Item = Result<Message, MessageError>;
    type Error = Error;

    // Look for a BGP message (preamble + length) and decode it; decode
    // errors are surfaced as items so the session can map them to a
    // NOTIFICATION instead of silently dropping the connection
    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Error> {
        match find_msg_range(buf) {
            Some(range) => {
                let message = Message::decode(&buf[range.start..range.stop], self.four_byte_asn);
                buf.advance(range.stop);
                Ok(Some(message))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(&mut self, message: Message, buf: &mut BytesMut) -> Result<(), Error> {
        let mut bytes: Vec<u8> = Vec::with_capacity(64);
        message
            .encode(&mut bytes, self.four_byte_asn)
            .map_err(|err| Error::new(ErrorKind::InvalidData, err.to_string()))?;
        buf.extend_from_slice(&bytes);
        Ok(())
    }
}

#[derive(Debug)]
struct MsgRange {
    start: usize,
    stop: usize,
}

/// Given a stream of bytes, find the start and end of a BGP message.
/// Returns None until a whole message is buffered.
fn find_msg_range(data: &[u8]) -> Option<MsgRange> {
    let start = find_bytes(data, &[255; 16])?;
    let buf = &mut data.split_at(start).1;
    let mut _preamble: [u8; 16] = [0; 16];
    buf.read_exact(&mut _preamble).ok()?;
    let length = buf.read_u16::<NetworkEndian>().ok()? as usize;
    let stop = start + length;
    if data.len() < stop {
        return None;
    }
    Some(MsgRange { start, stop })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_msg_range() {
        let data: [u8; 64] = [
            255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 255, 0, 45,
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
        ];
        let range = find_msg_range(&data).unwrap();
        assert_eq!(range.start, 0);
        assert_eq!(range.stop, 45);
    }

    #[test]
    fn test_find_msg_range_incomplete() {
        // Preamble present but fewer bytes than the declared length
        let mut data = vec![255u8; 16];
        data.extend_from_slice(&[0, 45, 2, 0, 0]);
        assert!(find_msg_range(&data).is_none());
    }

    #[test]
    fn test_find_msg_range_no_preamble() {
        let data: [u8; 32] = [
            0, 45, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
            0, 0, 0,
        ];
        assert!(find_msg_range(&data).is_none());
    }

    #[test]
    fn test_codec_decodes_keepalive() {
        let mut codec = MessageCodec::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[255u8; 16]);
        buf.extend_from_slice(&[0, 19, 4]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
        assert!(buf.is_empty());
    }
}
