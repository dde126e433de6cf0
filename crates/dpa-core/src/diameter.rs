use crate::error::{DpaError, Result};
use bytes::{BufMut, Bytes, BytesMut};
use dpa_shared::{Avp, DiameterMessage, FLAG_REQUEST};
use tokio_util::codec::{Decoder, Encoder};

/// Diameter header length in bytes
pub const HEADER_LEN: usize = 20;

/// Largest frame accepted from a peer
pub const MAX_FRAME_LEN: usize = 64 * 1024;

/// Diameter packet header (20 bytes)
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterHeader {
    pub version: u8,
    pub length: u32,
    pub flags: u8,
    pub command_code: u32,
    pub application_id: u32,
    pub hop_by_hop_id: u32,
    pub end_to_end_id: u32,
}

/// Diameter AVP as it appears on the wire
#[derive(Debug, Clone, PartialEq)]
pub struct DiameterAvp {
    pub code: u32,
    pub flags: u8,
    pub vendor_id: Option<u32>,
    pub data: Vec<u8>,
}

/// Complete Diameter packet
#[derive(Debug, Clone)]
pub struct DiameterPacket {
    pub header: DiameterHeader,
    pub avps: Vec<DiameterAvp>,
}

// AVP flags
pub const AVP_FLAG_VENDOR: u8 = 0x80;

/// Read a 24-bit big-endian integer
fn read_u24(data: &[u8]) -> u32 {
    u32::from_be_bytes([0, data[0], data[1], data[2]])
}

impl DiameterHeader {
    /// Parse header from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN {
            return Err(DpaError::InvalidPacket("Header too short".to_string()));
        }

        let version = data[0];
        if version != 1 {
            return Err(DpaError::InvalidPacket(format!("Invalid version: {version}")));
        }

        Ok(Self {
            version,
            length: read_u24(&data[1..4]),
            flags: data[4],
            command_code: read_u24(&data[5..8]),
            application_id: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
            hop_by_hop_id: u32::from_be_bytes([data[12], data[13], data[14], data[15]]),
            end_to_end_id: u32::from_be_bytes([data[16], data[17], data[18], data[19]]),
        })
    }

    /// Serialize header into a buffer
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_slice(&self.length.to_be_bytes()[1..4]);
        buf.put_u8(self.flags);
        buf.put_slice(&self.command_code.to_be_bytes()[1..4]);
        buf.put_u32(self.application_id);
        buf.put_u32(self.hop_by_hop_id);
        buf.put_u32(self.end_to_end_id);
    }

    /// Check if this is a request
    pub fn is_request(&self) -> bool {
        (self.flags & FLAG_REQUEST) != 0
    }
}

impl DiameterAvp {
    /// Parse AVP from bytes, returning it with its padded length
    pub fn parse(data: &[u8]) -> Result<(Self, usize)> {
        if data.len() < 8 {
            return Err(DpaError::InvalidPacket("AVP too short".to_string()));
        }

        let code = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
        let flags = data[4];
        let length = read_u24(&data[5..8]) as usize;

        let (vendor_id, offset) = if (flags & AVP_FLAG_VENDOR) != 0 {
            if data.len() < 12 {
                return Err(DpaError::InvalidPacket("Vendor AVP too short".to_string()));
            }
            (Some(u32::from_be_bytes([data[8], data[9], data[10], data[11]])), 12)
        } else {
            (None, 8)
        };

        if length < offset {
            return Err(DpaError::InvalidAvpValue {
                code,
                reason: format!("length {length} shorter than AVP header"),
            });
        }
        if data.len() < length {
            return Err(DpaError::InvalidPacket("AVP data truncated".to_string()));
        }

        let avp = Self {
            code,
            flags,
            vendor_id,
            data: data[offset..length].to_vec(),
        };

        // Padding aligns every AVP to 4 bytes
        Ok((avp, length.div_ceil(4) * 4))
    }

    /// Serialize AVP into a buffer, padding included
    pub fn write_to(&self, buf: &mut BytesMut) {
        let data_offset = if self.vendor_id.is_some() { 12 } else { 8 };
        let length = (data_offset + self.data.len()) as u32;

        buf.put_u32(self.code);
        buf.put_u8(self.flags);
        buf.put_slice(&length.to_be_bytes()[1..4]);
        if let Some(vid) = self.vendor_id {
            buf.put_u32(vid);
        }
        buf.put_slice(&self.data);

        let padding = (4 - self.data.len() % 4) % 4;
        buf.put_bytes(0, padding);
    }
}

impl DiameterPacket {
    /// Parse complete packet from bytes
    pub fn parse(data: &[u8]) -> Result<Self> {
        let header = DiameterHeader::parse(data)?;
        let total = header.length as usize;

        if data.len() < total {
            return Err(DpaError::InvalidPacket("Packet truncated".to_string()));
        }

        let mut avps = Vec::new();
        let mut offset = HEADER_LEN;

        while offset < total {
            let (avp, avp_length) = DiameterAvp::parse(&data[offset..total])?;
            avps.push(avp);
            offset += avp_length;
        }

        Ok(Self { header, avps })
    }

    /// Serialize packet, recomputing the header length
    pub fn serialize(&self) -> Vec<u8> {
        let mut body = BytesMut::new();
        for avp in &self.avps {
            avp.write_to(&mut body);
        }

        let mut header = self.header.clone();
        header.length = (HEADER_LEN + body.len()) as u32;

        let mut bytes = BytesMut::with_capacity(header.length as usize);
        header.write_to(&mut bytes);
        bytes.extend_from_slice(&body);
        bytes.to_vec()
    }

    /// Convert into the message model consumed by peers
    pub fn into_message(self) -> DiameterMessage {
        let mut msg = DiameterMessage::new(self.header.command_code, self.header.is_request());
        msg.version = self.header.version;
        msg.flags = self.header.flags;
        msg.application_id = self.header.application_id;
        msg.hop_by_hop_id = self.header.hop_by_hop_id;
        msg.end_to_end_id = self.header.end_to_end_id;
        msg.avps = self
            .avps
            .into_iter()
            .map(|avp| Avp {
                code: avp.code,
                flags: avp.flags,
                length: (avp.data.len() + if avp.vendor_id.is_some() { 12 } else { 8 }) as u32,
                vendor_id: avp.vendor_id,
                data: Bytes::from(avp.data),
            })
            .collect();
        msg
    }
}

impl From<&DiameterMessage> for DiameterPacket {
    fn from(msg: &DiameterMessage) -> Self {
        let flags = if msg.is_request {
            msg.flags | FLAG_REQUEST
        } else {
            msg.flags & !FLAG_REQUEST
        };

        Self {
            header: DiameterHeader {
                version: msg.version,
                length: 0, // Will be recalculated
                flags,
                command_code: msg.command_code,
                application_id: msg.application_id,
                hop_by_hop_id: msg.hop_by_hop_id,
                end_to_end_id: msg.end_to_end_id,
            },
            avps: msg
                .avps
                .iter()
                .map(|avp| DiameterAvp {
                    code: avp.code,
                    flags: avp.flags,
                    vendor_id: avp.vendor_id,
                    data: avp.data.to_vec(),
                })
                .collect(),
        }
    }
}

/// Bytes `message` occupies on the wire, AVP padding included
pub fn encoded_len(message: &DiameterMessage) -> usize {
    let avps: usize = message
        .avps
        .iter()
        .map(|avp| {
            let header = if avp.vendor_id.is_some() { 12 } else { 8 };
            (header + avp.data.len()).div_ceil(4) * 4
        })
        .sum();
    HEADER_LEN + avps
}

/// Reject a message that would not fit in one frame
pub fn check_frame_len(message: &DiameterMessage) -> Result<()> {
    let len = encoded_len(message);
    if len > MAX_FRAME_LEN {
        return Err(DpaError::InvalidPacket(format!("Frame too large: {len} bytes")));
    }
    Ok(())
}

/// Length-delimited framing for Diameter over a byte stream
#[derive(Debug, Default, Clone, Copy)]
pub struct DiameterCodec;

impl DiameterCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for DiameterCodec {
    type Item = DiameterMessage;
    type Error = DpaError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < 4 {
            return Ok(None);
        }

        let length = read_u24(&src[1..4]) as usize;
        if !(HEADER_LEN..=MAX_FRAME_LEN).contains(&length) {
            return Err(DpaError::InvalidPacket(format!("Invalid frame length: {length}")));
        }

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let frame = src.split_to(length);
        let packet = DiameterPacket::parse(&frame)?;
        Ok(Some(packet.into_message()))
    }
}

impl Encoder<DiameterMessage> for DiameterCodec {
    type Error = DpaError;

    fn encode(&mut self, item: DiameterMessage, dst: &mut BytesMut) -> Result<()> {
        check_frame_len(&item)?;
        let bytes = DiameterPacket::from(&item).serialize();
        dst.reserve(bytes.len());
        dst.put_slice(&bytes);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpa_shared::{AVP_ORIGIN_HOST, AVP_RESULT_CODE, CMD_CER, CMD_DWR};

    #[test]
    fn test_header_parse() {
        let data = vec![
            1, 0, 0, 20, // Version, Length (20)
            0x80, 0, 1, 1, // Flags (Request), Command Code (257)
            0, 0, 0, 0, // Application ID
            0, 0, 0, 1, // Hop-by-Hop ID
            0, 0, 0, 2, // End-to-End ID
        ];

        let header = DiameterHeader::parse(&data).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.length, 20);
        assert_eq!(header.command_code, CMD_CER);
        assert_eq!(header.hop_by_hop_id, 1);
        assert!(header.is_request());

        let mut buf = BytesMut::new();
        header.write_to(&mut buf);
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn test_avp_padding() {
        let data = vec![
            0, 0, 1, 8, // Code (264)
            0x40, 0, 0, 13, // Flags (Mandatory), Length (13)
            b'h', b'o', b's', b't', b'1', // Data "host1"
            0, 0, 0, // Padding
        ];

        let (avp, length) = DiameterAvp::parse(&data).unwrap();
        assert_eq!(avp.code, AVP_ORIGIN_HOST);
        assert_eq!(avp.data, b"host1");
        assert_eq!(length, 16);

        let mut buf = BytesMut::new();
        avp.write_to(&mut buf);
        assert_eq!(&buf[..], &data[..]);
    }

    #[test]
    fn test_invalid_version_rejected() {
        let mut data = vec![0u8; 20];
        data[0] = 2;
        assert!(matches!(
            DiameterHeader::parse(&data),
            Err(DpaError::InvalidPacket(_))
        ));
    }

    #[test]
    fn test_codec_waits_for_full_frame() {
        let mut cea = DiameterMessage::new(CMD_CER, false);
        cea.hop_by_hop_id = 42;
        cea.add_avp(Avp::u32(AVP_RESULT_CODE, 2001));
        cea.add_avp(Avp::string(AVP_ORIGIN_HOST, "hss.example.com"));

        let mut codec = DiameterCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(cea.clone(), &mut wire).unwrap();

        let mut partial = BytesMut::from(&wire[..10]);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.extend_from_slice(&wire[10..]);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert!(decoded.is_cea());
        assert_eq!(decoded.hop_by_hop_id, 42);
        assert_eq!(decoded.result_code(), Some(2001));
        assert_eq!(decoded.origin_host().as_deref(), Some("hss.example.com"));
        assert!(partial.is_empty());
    }

    #[test]
    fn test_codec_splits_back_to_back_frames() {
        let mut codec = DiameterCodec::new();
        let mut wire = BytesMut::new();
        codec.encode(DiameterMessage::new(CMD_DWR, true), &mut wire).unwrap();
        codec.encode(DiameterMessage::new(CMD_DWR, false), &mut wire).unwrap();

        assert!(codec.decode(&mut wire).unwrap().unwrap().is_dwr());
        assert!(codec.decode(&mut wire).unwrap().unwrap().is_dwa());
        assert!(codec.decode(&mut wire).unwrap().is_none());
    }

    #[test]
    fn test_encoded_len_matches_wire() {
        let mut cer = DiameterMessage::request(CMD_CER, 0);
        cer.add_avp(Avp::string(AVP_ORIGIN_HOST, "host1"));
        cer.add_avp(Avp::u32(AVP_RESULT_CODE, 2001));

        let mut wire = BytesMut::new();
        DiameterCodec::new().encode(cer.clone(), &mut wire).unwrap();
        assert_eq!(encoded_len(&cer), wire.len());
        assert_eq!(encoded_len(&cer), 20 + 16 + 12);
    }

    #[test]
    fn test_oversized_message_rejected_before_encoding() {
        let mut big = DiameterMessage::request(272, 4);
        big.add_avp(Avp::new(AVP_ORIGIN_HOST, vec![0u8; MAX_FRAME_LEN]));
        assert!(matches!(check_frame_len(&big), Err(DpaError::InvalidPacket(_))));

        let mut wire = BytesMut::new();
        assert!(DiameterCodec::new().encode(big, &mut wire).is_err());
        assert!(wire.is_empty());
    }

    #[test]
    fn test_codec_rejects_bad_length() {
        let mut codec = DiameterCodec::new();
        let mut wire = BytesMut::from(&[1u8, 0, 0, 8, 0x80, 0, 1, 1][..]);
        assert!(codec.decode(&mut wire).is_err());
    }
}
