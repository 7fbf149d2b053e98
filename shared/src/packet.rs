/*!
SpaceWire link packet classification and decoding.

The DPU receives three kinds of traffic over the link: timecode packets,
data-class packets (image data, overscan data and housekeeping, distinguished
by the packet type bit-field) and RMAP replies. RMAP replies are classified
but kept opaque; their handling lives in the transport layer.

## Data-class packet layout

A data-class packet starts with a 10 byte header:

| offset | field             |
|--------|-------------------|
| 0      | logical address   |
| 1      | protocol id       |
| 2..4   | data length (BE)  |
| 4..6   | type (BE)         |
| 6..8   | frame counter (BE)|
| 8..10  | sequence counter (BE) |

The 16-bit type field packs, from bit 0: packet type (2 bits), frame number
(2 bits), CCD number (2 bits), CCD side (1 bit), last packet (1 bit) and the
FPGA mode (4 bits).
*/

use bytes::Bytes;

use crate::error::{Result, SharedError};
use crate::mode::CcdSide;
use crate::protocol;

/// The packet type carried in the type field of a data-class packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Data = 0,
    Overscan = 1,
    Housekeeping = 2,
}

impl TryFrom<u8> for PacketType {
    type Error = SharedError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(PacketType::Data),
            1 => Ok(PacketType::Overscan),
            2 => Ok(PacketType::Housekeeping),
            other => Err(SharedError::invalid_packet(format!(
                "unknown packet type: {other}"
            ))),
        }
    }
}

/// A timecode packet as distributed by the front-end on every sync pulse
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimecodePacket {
    pub timecode: u8,
}

impl TimecodePacket {
    /// Decode a timecode packet. The timecode is the low 6 bits of the
    /// second byte.
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < 2 || raw[0] != protocol::TIMECODE_LEADER {
            return Err(SharedError::invalid_packet(format!(
                "not a timecode packet: {}",
                hex::encode(&raw[..raw.len().min(4)])
            )));
        }
        Ok(TimecodePacket {
            timecode: raw[1] & 0x3F,
        })
    }

    /// Encode this timecode as a wire packet
    pub fn to_bytes(self) -> Vec<u8> {
        vec![protocol::TIMECODE_LEADER, self.timecode & 0x3F]
    }
}

/// The decoded 16-bit type field of a data-class packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacketType(pub u16);

impl DataPacketType {
    pub fn packet_type(self) -> Result<PacketType> {
        PacketType::try_from((self.0 & 0b11) as u8)
    }

    pub fn frame_number(self) -> u8 {
        ((self.0 >> 2) & 0b11) as u8
    }

    pub fn ccd_number(self) -> u8 {
        ((self.0 >> 4) & 0b11) as u8
    }

    pub fn ccd_side(self) -> CcdSide {
        CcdSide::from(((self.0 >> 6) & 0b1) as u8)
    }

    pub fn last_packet(self) -> bool {
        (self.0 >> 7) & 0b1 == 1
    }

    pub fn mode(self) -> u8 {
        ((self.0 >> 8) & 0b1111) as u8
    }
}

/// Builder used by tests and the front-end simulator to compose type fields
pub fn pack_type_field(
    packet_type: PacketType,
    frame_number: u8,
    ccd_number: u8,
    ccd_side: CcdSide,
    last_packet: bool,
    mode: u8,
) -> u16 {
    (packet_type as u16)
        | ((frame_number as u16 & 0b11) << 2)
        | ((ccd_number as u16 & 0b11) << 4)
        | ((ccd_side as u16 & 0b1) << 6)
        | ((last_packet as u16) << 7)
        | ((mode as u16 & 0b1111) << 8)
}

/// Header of a data-class packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DataPacketHeader {
    pub logical_address: u8,
    pub protocol_id: u8,
    pub data_length: u16,
    pub packet_type: DataPacketType,
    pub frame_counter: u16,
    pub sequence_counter: u16,
}

impl DataPacketHeader {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        if raw.len() < protocol::DATA_HEADER_SIZE {
            return Err(SharedError::invalid_packet(format!(
                "data packet header too short: {} bytes",
                raw.len()
            )));
        }
        Ok(DataPacketHeader {
            logical_address: raw[0],
            protocol_id: raw[1],
            data_length: u16::from_be_bytes([raw[2], raw[3]]),
            packet_type: DataPacketType(u16::from_be_bytes([raw[4], raw[5]])),
            frame_counter: u16::from_be_bytes([raw[6], raw[7]]),
            sequence_counter: u16::from_be_bytes([raw[8], raw[9]]),
        })
    }

    pub fn to_bytes(self) -> [u8; protocol::DATA_HEADER_SIZE] {
        let mut raw = [0u8; protocol::DATA_HEADER_SIZE];
        raw[0] = self.logical_address;
        raw[1] = self.protocol_id;
        raw[2..4].copy_from_slice(&self.data_length.to_be_bytes());
        raw[4..6].copy_from_slice(&self.packet_type.0.to_be_bytes());
        raw[6..8].copy_from_slice(&self.frame_counter.to_be_bytes());
        raw[8..10].copy_from_slice(&self.sequence_counter.to_be_bytes());
        raw
    }
}

/// A complete data-class packet: header plus payload
#[derive(Debug, Clone)]
pub struct DataPacket {
    pub header: DataPacketHeader,
    pub data: Bytes,
}

impl DataPacket {
    pub fn from_bytes(raw: &[u8]) -> Result<Self> {
        let header = DataPacketHeader::from_bytes(raw)?;
        Ok(DataPacket {
            header,
            data: Bytes::copy_from_slice(&raw[protocol::DATA_HEADER_SIZE..]),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut raw = Vec::with_capacity(protocol::DATA_HEADER_SIZE + self.data.len());
        raw.extend_from_slice(&self.header.to_bytes());
        raw.extend_from_slice(&self.data);
        raw
    }
}

/// A classified link packet
#[derive(Debug, Clone)]
pub enum LinkPacket {
    Timecode(TimecodePacket),
    Housekeeping(DataPacket),
    Data(DataPacket),
    RmapReply(Bytes),
}

impl LinkPacket {
    /// Classify and decode a raw packet read from the link
    pub fn classify(raw: &[u8]) -> Result<LinkPacket> {
        if raw.len() < 2 {
            return Err(SharedError::invalid_packet(format!(
                "packet too short: {} bytes",
                raw.len()
            )));
        }
        if raw[0] == protocol::TIMECODE_LEADER {
            return Ok(LinkPacket::Timecode(TimecodePacket::from_bytes(raw)?));
        }
        match raw[1] {
            protocol::DATA_PROTOCOL_ID => {
                let packet = DataPacket::from_bytes(raw)?;
                match packet.header.packet_type.packet_type()? {
                    PacketType::Housekeeping => Ok(LinkPacket::Housekeeping(packet)),
                    PacketType::Data | PacketType::Overscan => Ok(LinkPacket::Data(packet)),
                }
            }
            protocol::RMAP_PROTOCOL_ID => Ok(LinkPacket::RmapReply(Bytes::copy_from_slice(raw))),
            other => Err(SharedError::invalid_packet(format!(
                "unknown protocol id: 0x{other:02X}"
            ))),
        }
    }

    /// Short description of the packet class, used in error messages
    pub fn class_name(&self) -> &'static str {
        match self {
            LinkPacket::Timecode(_) => "timecode packet",
            LinkPacket::Housekeeping(_) => "housekeeping packet",
            LinkPacket::Data(_) => "data packet",
            LinkPacket::RmapReply(_) => "RMAP reply",
        }
    }
}

/// Quick check whether a raw packet is a timecode packet
pub fn is_timecode(raw: &[u8]) -> bool {
    raw.len() >= 2 && raw[0] == protocol::TIMECODE_LEADER
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timecode_decoding() {
        let packet = TimecodePacket::from_bytes(&[0x91, 0x2A]).unwrap();
        assert_eq!(packet.timecode, 0x2A);

        // the two high bits are control flags and must be masked off
        let packet = TimecodePacket::from_bytes(&[0x91, 0xFF]).unwrap();
        assert_eq!(packet.timecode, 0x3F);

        assert!(TimecodePacket::from_bytes(&[0x50, 0x01]).is_err());
    }

    #[test]
    fn test_type_field_extraction() {
        let field = pack_type_field(PacketType::Overscan, 2, 3, CcdSide::F, true, 5);
        let decoded = DataPacketType(field);
        assert_eq!(decoded.packet_type().unwrap(), PacketType::Overscan);
        assert_eq!(decoded.frame_number(), 2);
        assert_eq!(decoded.ccd_number(), 3);
        assert_eq!(decoded.ccd_side(), CcdSide::F);
        assert!(decoded.last_packet());
        assert_eq!(decoded.mode(), 5);
    }

    #[test]
    fn test_header_roundtrip() {
        let header = DataPacketHeader {
            logical_address: 0x50,
            protocol_id: protocol::DATA_PROTOCOL_ID,
            data_length: 1024,
            packet_type: DataPacketType(pack_type_field(
                PacketType::Data,
                0,
                1,
                CcdSide::E,
                false,
                5,
            )),
            frame_counter: 17,
            sequence_counter: 3,
        };
        let decoded = DataPacketHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_classification() {
        let timecode = TimecodePacket { timecode: 5 }.to_bytes();
        assert!(matches!(
            LinkPacket::classify(&timecode).unwrap(),
            LinkPacket::Timecode(_)
        ));

        let hk = DataPacket {
            header: DataPacketHeader {
                logical_address: 0x50,
                protocol_id: protocol::DATA_PROTOCOL_ID,
                data_length: 4,
                packet_type: DataPacketType(pack_type_field(
                    PacketType::Housekeeping,
                    1,
                    0,
                    CcdSide::E,
                    false,
                    0,
                )),
                frame_counter: 0,
                sequence_counter: 0,
            },
            data: Bytes::from_static(&[1, 2, 3, 4]),
        };
        assert!(matches!(
            LinkPacket::classify(&hk.to_bytes()).unwrap(),
            LinkPacket::Housekeeping(_)
        ));

        let rmap = [0x50, 0x01, 0x0C, 0x00];
        assert!(matches!(
            LinkPacket::classify(&rmap).unwrap(),
            LinkPacket::RmapReply(_)
        ));

        assert!(LinkPacket::classify(&[0x50]).is_err());
        assert!(LinkPacket::classify(&[0x50, 0x77, 0, 0]).is_err());
    }
}
