use crate::error::Error;

use num_enum::{IntoPrimitive, TryFromPrimitive};

pub const FRAME_MARKER: u8 = b'~';
pub const FRAME_TERMINATOR: u8 = b'\r';

pub const PROTOCOL_VERSION: u8 = 0x20;
pub const BATTERY_CID1: u8 = 0x46;

// RTN status byte of a response frame. 0x71 marks a forwarded inter-pack
// subframe in clustered multi-pack installs.
#[derive(Clone, Copy, Debug, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum ResponseCode {
    Normal = 0x00,
    VersionAbnormal = 0x01,
    ChecksumAbnormal = 0x02,
    LengthChecksumAbnormal = 0x03,
    InvalidCommandClass = 0x04,
    InvalidCommand = 0x05,
    InvalidData = 0x06,
    NoData = 0x07,
    InvalidCid1 = 0x08,
    CommandFailed = 0x09,
    EquipmentFailure = 0x0A,
    NoPermission = 0x0B,
    InterPackSubframe = 0x71,
}

/// One ASCII-hex frame, either direction. On requests `cid2` is the command
/// code; on responses it carries the RTN status byte.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Frame {
    pub version: u8,
    pub address: u8,
    pub cid1: u8,
    pub cid2: u8,
    pub info: Vec<u8>,
}

impl Frame {
    pub fn request(address: u8, command: u8, info: &[u8]) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            address,
            cid1: BATTERY_CID1,
            cid2: command,
            info: info.to_vec(),
        }
    }

    pub fn response_code(&self) -> Option<ResponseCode> {
        ResponseCode::try_from(self.cid2).ok()
    }

    /// Frame body: hex header, hex-encoded info and the trailing frame
    /// checksum, without marker and terminator.
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        let info_hex = hex::encode_upper(&self.info);
        let length = length_field(info_hex.len())?;

        let mut body = format!(
            "{:02X}{:02X}{:02X}{:02X}{:04X}",
            self.version, self.address, self.cid1, self.cid2, length
        )
        .into_bytes();
        body.extend_from_slice(info_hex.as_bytes());

        let checksum = frame_checksum(&body);
        body.extend_from_slice(format!("{checksum:04X}").as_bytes());

        Ok(body)
    }

    /// Complete wire form: `~` + body + CR.
    pub fn wire(&self) -> Result<Vec<u8>, Error> {
        let mut wire = vec![FRAME_MARKER];
        wire.extend(self.encode()?);
        wire.push(FRAME_TERMINATOR);
        Ok(wire)
    }

    /// Parse a frame body (marker and terminator already stripped),
    /// re-deriving both checksums. Any mismatch is a hard protocol error.
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 16 {
            return Err(Error::Protocol(format!(
                "frame too short: {} bytes",
                body.len()
            )));
        }

        let (payload, checksum_hex) = body.split_at(body.len() - 4);
        let declared = hex_u16(checksum_hex)?;
        let computed = frame_checksum(payload);
        if declared != computed {
            return Err(Error::Protocol(format!(
                "frame checksum mismatch: expected={computed:04X}, got={declared:04X}"
            )));
        }

        let header = hex::decode(&payload[..12])
            .map_err(|err| Error::Protocol(format!("invalid frame header: {err}")))?;
        let length = u16::from_be_bytes([header[4], header[5]]);
        let info_hex = &payload[12..];

        let expected_len = parse_length_field(length)?;
        if info_hex.len() != expected_len {
            return Err(Error::Protocol(format!(
                "info length mismatch: expected={expected_len}, got={}",
                info_hex.len()
            )));
        }

        let info = hex::decode(info_hex)
            .map_err(|err| Error::Protocol(format!("invalid info field: {err}")))?;

        Ok(Self {
            version: header[0],
            address: header[1],
            cid1: header[2],
            cid2: header[3],
            info,
        })
    }
}

/// 16-bit frame checksum over the ASCII body: sum mod 0xFFFF, inverted,
/// plus one, masked to 16 bits.
pub fn frame_checksum(body: &[u8]) -> u16 {
    let sum: u32 = body.iter().map(|b| u32::from(*b)).sum();
    ((((sum % 0xFFFF) ^ 0xFFFF) + 1) & 0xFFFF) as u16
}

/// LENGTH field: 12-bit count of info hex characters, topped by a 4-bit
/// nibble-sum checksum over that count.
fn length_field(info_hex_len: usize) -> Result<u16, Error> {
    if info_hex_len == 0 {
        return Ok(0);
    }
    if info_hex_len > 0xFFF {
        return Err(Error::InvalidArgument(format!(
            "info too long: {info_hex_len} hex chars"
        )));
    }

    let lenid = info_hex_len as u16;
    Ok(((length_checksum(lenid) & 0xF) << 12) | lenid)
}

fn parse_length_field(field: u16) -> Result<usize, Error> {
    if field == 0 {
        return Ok(0);
    }

    let lenid = field & 0xFFF;
    let expected = length_checksum(lenid) & 0xF;
    let declared = (field >> 12) & 0xF;
    if expected != declared {
        return Err(Error::Protocol(format!(
            "length checksum mismatch: expected={expected:X}, got={declared:X}"
        )));
    }

    Ok(lenid as usize)
}

fn length_checksum(lenid: u16) -> u16 {
    (((lenid & 0xF) + ((lenid >> 4) & 0xF) + ((lenid >> 8) & 0xF)) % 16 ^ 0xF) + 1
}

fn hex_u16(hex: &[u8]) -> Result<u16, Error> {
    let digits = std::str::from_utf8(hex)
        .map_err(|_| Error::Protocol("checksum field is not ascii".into()))?;
    u16::from_str_radix(digits, 16)
        .map_err(|err| Error::Protocol(format!("invalid checksum field {digits:?}: {err}")))
}
