//! 패킷 코덱
//!
//! 와이어 형식: `length: u32 (빅엔디언) | type_tag: u8 | payload[length]`
//!
//! 전송 계층은 메시지 경계를 보장하지 않으므로 수신 측은 항상 두 번 읽는다:
//! 고정 크기 헤더, 그 다음 정확히 `length` 바이트.

use std::io::{ErrorKind, Read, Write};

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Error, Result};

/// 헤더 크기 (length 4 + tag 1)
pub const HEADER_SIZE: usize = 5;

/// 패킷 타입
///
/// 요청과 응답이 같은 태그를 공유한다. 방향은 연결 상태로 구분된다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    /// 키 협상 요청/응답
    KeyAgreement = 1,

    /// 레코드 요청(RecordRequest) / 응답(RecordReply)
    Record = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = Error;

    fn try_from(tag: u8) -> Result<Self> {
        match tag {
            1 => Ok(PacketType::KeyAgreement),
            2 => Ok(PacketType::Record),
            other => Err(Error::UnknownPacketType(other)),
        }
    }
}

/// 패킷 헤더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub packet_type: PacketType,
    /// 선언된 페이로드 길이
    pub length: u32,
}

/// 패킷 (헤더 + 길이 검증된 페이로드)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub packet_type: PacketType,
    pub payload: Bytes,
}

impl Packet {
    pub fn new(packet_type: PacketType, payload: impl Into<Bytes>) -> Self {
        Self {
            packet_type,
            payload: payload.into(),
        }
    }

    /// 바이트로 직렬화
    pub fn encode(&self, max_payload: usize) -> Result<Bytes> {
        encode(self.packet_type, &self.payload, max_payload)
    }
}

/// 패킷 직렬화. 최대 크기를 넘으면 잘라내지 않고 거부한다
pub fn encode(packet_type: PacketType, payload: &[u8], max_payload: usize) -> Result<Bytes> {
    if payload.len() > max_payload {
        return Err(Error::PayloadTooLarge {
            len: payload.len(),
            max: max_payload,
        });
    }

    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_u8(packet_type as u8);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// 헤더 파싱
pub fn decode_header(bytes: &[u8], max_payload: usize) -> Result<PacketHeader> {
    if bytes.len() < HEADER_SIZE {
        return Err(Error::Truncated {
            expected: HEADER_SIZE,
            got: bytes.len(),
        });
    }

    let length = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let packet_type = PacketType::try_from(bytes[4])?;

    if length as usize > max_payload {
        return Err(Error::PayloadTooLarge {
            len: length as usize,
            max: max_payload,
        });
    }

    Ok(PacketHeader {
        packet_type,
        length,
    })
}

/// EOF 또는 버퍼가 찰 때까지 읽기. 읽은 바이트 수 반환
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// 헤더 읽기
///
/// 첫 바이트 전에 EOF면 `ConnectionClosed`, 헤더 중간이면 `Truncated`.
pub fn read_header<R: Read>(reader: &mut R, max_payload: usize) -> Result<PacketHeader> {
    let mut header = [0u8; HEADER_SIZE];
    let n = read_full(reader, &mut header)?;
    if n == 0 {
        return Err(Error::ConnectionClosed);
    }
    decode_header(&header[..n], max_payload)
}

/// 정확히 `length` 바이트의 페이로드 읽기. 중간에 끊기면 `Truncated`
pub fn read_payload<R: Read>(reader: &mut R, length: usize) -> Result<Bytes> {
    let mut payload = vec![0u8; length];
    let n = read_full(reader, &mut payload)?;
    if n < length {
        return Err(Error::Truncated {
            expected: length,
            got: n,
        });
    }
    Ok(Bytes::from(payload))
}

/// 패킷 하나 읽기 (헤더 + 페이로드)
pub fn read_packet<R: Read>(reader: &mut R, max_payload: usize) -> Result<Packet> {
    let header = read_header(reader, max_payload)?;
    let payload = read_payload(reader, header.length as usize)?;
    Ok(Packet {
        packet_type: header.packet_type,
        payload,
    })
}

/// 패킷 하나 쓰기
pub fn write_packet<W: Write>(
    writer: &mut W,
    packet_type: PacketType,
    payload: &[u8],
    max_payload: usize,
) -> Result<()> {
    let frame = encode(packet_type, payload, max_payload)?;
    writer.write_all(&frame)?;
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    const MAX: usize = 1024;

    #[test]
    fn test_encode_layout() {
        let frame = encode(PacketType::Record, b"alice", MAX).unwrap();
        assert_eq!(&frame[..4], &[0, 0, 0, 5]);
        assert_eq!(frame[4], 2);
        assert_eq!(&frame[5..], b"alice");
    }

    #[test]
    fn test_read_packet() {
        let frame = encode(PacketType::KeyAgreement, b"ABCDEF", MAX).unwrap();
        let mut cursor = Cursor::new(frame.to_vec());

        let packet = read_packet(&mut cursor, MAX).unwrap();
        assert_eq!(packet.packet_type, PacketType::KeyAgreement);
        assert_eq!(&packet.payload[..], b"ABCDEF");
    }

    #[test]
    fn test_two_packets_back_to_back() {
        let mut stream = encode(PacketType::KeyAgreement, b"first", MAX).unwrap().to_vec();
        stream.extend_from_slice(&encode(PacketType::Record, b"second", MAX).unwrap());
        let mut cursor = Cursor::new(stream);

        assert_eq!(&read_packet(&mut cursor, MAX).unwrap().payload[..], b"first");
        assert_eq!(&read_packet(&mut cursor, MAX).unwrap().payload[..], b"second");
        assert!(matches!(read_packet(&mut cursor, MAX), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_empty_payload() {
        let frame = encode(PacketType::Record, b"", MAX).unwrap();
        let packet = read_packet(&mut Cursor::new(frame.to_vec()), MAX).unwrap();
        assert!(packet.payload.is_empty());
    }

    #[test]
    fn test_closed_before_header() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(matches!(read_packet(&mut cursor, MAX), Err(Error::ConnectionClosed)));
    }

    #[test]
    fn test_truncated_header() {
        let mut cursor = Cursor::new(vec![0u8, 0, 0]);
        assert!(matches!(
            read_packet(&mut cursor, MAX),
            Err(Error::Truncated { expected: 5, got: 3 })
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut frame = encode(PacketType::Record, b"0123456789", MAX).unwrap().to_vec();
        frame.truncate(HEADER_SIZE + 4);

        assert!(matches!(
            read_packet(&mut Cursor::new(frame), MAX),
            Err(Error::Truncated { expected: 10, got: 4 })
        ));
    }

    #[test]
    fn test_closed_after_header() {
        let mut frame = encode(PacketType::Record, b"alice", MAX).unwrap().to_vec();
        frame.truncate(HEADER_SIZE);

        assert!(matches!(
            read_packet(&mut Cursor::new(frame), MAX),
            Err(Error::Truncated { expected: 5, got: 0 })
        ));
    }

    #[test]
    fn test_oversized_declared_length() {
        let header = [0x00, 0x01, 0x00, 0x00, 1];
        assert!(matches!(
            decode_header(&header, MAX),
            Err(Error::PayloadTooLarge { len: 65536, max: MAX })
        ));
        assert!(matches!(
            encode(PacketType::Record, &vec![0u8; MAX + 1], MAX),
            Err(Error::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn test_unknown_tag() {
        let header = [0, 0, 0, 1, 9];
        assert!(matches!(decode_header(&header, MAX), Err(Error::UnknownPacketType(9))));
    }
}
