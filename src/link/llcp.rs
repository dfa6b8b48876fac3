//! Defines packet structures used by the Link Layer Control Protocol.
//!
//! Only the LLCP opcodes this Central stack actually drives are modeled: connection parameter
//! and channel map updates, termination, feature exchange, version exchange, and the catch-all
//! unknown-PDU response. Encryption-related opcodes (`LL_ENC_REQ`/`RSP`, `LL_START_ENC_REQ`/`RSP`,
//! `LL_PAUSE_ENC_REQ`/`RSP`) and the extended connection-parameter/length-negotiation opcodes are
//! out of scope (no pairing/encryption support) and are not implemented; peers that send them
//! receive `LL_UNKNOWN_RSP`, same as any other unsupported opcode.

use crate::bytes::{self, *};
use crate::link::{channel_map::ChannelMap, comp_id::CompanyId, features::FeatureSet};
use crate::{time::Duration, Error};
use zerocopy::{AsBytes, FromBytes, Unaligned};

/// An undecoded LLCP PDU.
#[derive(Debug)]
pub struct RawPdu<T>(T);

impl<T: AsRef<[u8]>> RawPdu<T> {
    pub fn new(buf: T) -> Option<Self> {
        if buf.as_ref().is_empty() {
            None
        } else {
            Some(RawPdu(buf))
        }
    }

    /// Decodes the LLCP opcode, returning a structured representation of the PDU.
    pub fn decode(&self) -> Option<PduRef<'_>> {
        let bytes = self.0.as_ref();
        let (opcode, data) = bytes.split_first()?;
        Some(match ControlOpcode::from(*opcode) {
            ControlOpcode::ConnectionUpdateReq => PduRef::ConnectionUpdateReq(data.decode_as()?),
            ControlOpcode::ChannelMapReq => PduRef::ChannelMapReq(data.decode_as()?),
            ControlOpcode::TerminateInd => PduRef::TerminateInd(data.decode_as()?),
            ControlOpcode::UnknownRsp => PduRef::UnknownRsp(data.decode_as()?),
            ControlOpcode::FeatureReq => PduRef::FeatureReq(data.decode_as()?),
            ControlOpcode::FeatureRsp => PduRef::FeatureRsp(data.decode_as()?),
            ControlOpcode::VersionInd => PduRef::VersionInd(data.decode_as()?),
            ControlOpcode::Unknown(_) => return None,
        })
    }

    pub fn opcode(&self) -> ControlOpcode {
        ControlOpcode::from(self.0.as_ref()[0])
    }
}

/// Reference to a structured LLCP PDU.
#[derive(Debug, Copy, Clone)]
pub enum PduRef<'a> {
    ConnectionUpdateReq(&'a ConnectionUpdateReq),
    ChannelMapReq(&'a ChannelMapReq),
    TerminateInd(&'a TerminateInd),
    UnknownRsp(&'a UnknownRsp),
    FeatureReq(&'a FeatureReq),
    FeatureRsp(&'a FeatureRsp),
    VersionInd(&'a VersionInd),
}

impl<'a> PduRef<'a> {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            Self::ConnectionUpdateReq(_) => ControlOpcode::ConnectionUpdateReq,
            Self::ChannelMapReq(_) => ControlOpcode::ChannelMapReq,
            Self::TerminateInd(_) => ControlOpcode::TerminateInd,
            Self::UnknownRsp(_) => ControlOpcode::UnknownRsp,
            Self::FeatureReq(_) => ControlOpcode::FeatureReq,
            Self::FeatureRsp(_) => ControlOpcode::FeatureRsp,
            Self::VersionInd(_) => ControlOpcode::VersionInd,
        }
    }
}

/// Structured representation of an LLCP PDU.
#[derive(Debug, Copy, Clone)]
pub enum Pdu {
    ConnectionUpdateReq(ConnectionUpdateReq),
    ChannelMapReq(ChannelMapReq),
    TerminateInd(TerminateInd),
    UnknownRsp(UnknownRsp),
    FeatureReq(FeatureReq),
    FeatureRsp(FeatureRsp),
    VersionInd(VersionInd),
}

impl Pdu {
    pub fn opcode(&self) -> ControlOpcode {
        match self {
            Self::ConnectionUpdateReq(_) => ControlOpcode::ConnectionUpdateReq,
            Self::ChannelMapReq(_) => ControlOpcode::ChannelMapReq,
            Self::TerminateInd(_) => ControlOpcode::TerminateInd,
            Self::UnknownRsp(_) => ControlOpcode::UnknownRsp,
            Self::FeatureReq(_) => ControlOpcode::FeatureReq,
            Self::FeatureRsp(_) => ControlOpcode::FeatureRsp,
            Self::VersionInd(_) => ControlOpcode::VersionInd,
        }
    }

    fn ctr_data(&self) -> &[u8] {
        match self {
            Self::ConnectionUpdateReq(it) => it.as_bytes(),
            Self::ChannelMapReq(it) => it.as_bytes(),
            Self::TerminateInd(it) => it.as_bytes(),
            Self::UnknownRsp(it) => it.as_bytes(),
            Self::FeatureReq(it) => it.as_bytes(),
            Self::FeatureRsp(it) => it.as_bytes(),
            Self::VersionInd(it) => it.as_bytes(),
        }
    }

    /// Number of Bytes this PDU occupies on the wire, including the opcode Byte.
    pub fn encoded_size(&self) -> u8 {
        1 + self.ctr_data().len() as u8
    }
}

impl ToBytes for Pdu {
    fn to_bytes(&self, buffer: &mut ByteWriter<'_>) -> Result<(), Error> {
        buffer.write_u8(self.opcode().into())?;
        buffer.write_slice(self.ctr_data())?;
        Ok(())
    }
}

enum_with_unknown! {
    /// Enumeration of the LL Control PDU opcodes this stack understands.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum ControlOpcode(u8) {
        ConnectionUpdateReq = 0x00,
        ChannelMapReq = 0x01,
        TerminateInd = 0x02,
        UnknownRsp = 0x07,
        FeatureReq = 0x08,
        FeatureRsp = 0x09,
        VersionInd = 0x0C,
    }
}

enum_with_unknown! {
    /// Enumeration of all possible `VersNr` for `LL_VERSION_IND` PDUs.
    ///
    /// According to https://www.bluetooth.com/specifications/assigned-numbers/link-layer
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum VersionNumber(u8) {
        V4_0 = 6,
        V4_1 = 7,
        V4_2 = 8,
        V5_0 = 9,
        V5_1 = 10,
    }
}

/// `LL_CONNECTION_UPDATE_REQ` - Update connection parameters.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct ConnectionUpdateReq {
    win_size: u8,
    win_offset: u16,
    interval: u16,
    latency: u16,
    timeout: u16,
    instant: u16,
}

impl ConnectionUpdateReq {
    /// Returns the size of the transmit window for the first PDU of the connection.
    pub fn win_size(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_size) * 1_250)
    }

    /// Returns the offset of the transmit window, as a duration since the `instant`.
    pub fn win_offset(&self) -> Duration {
        Duration::from_micros(u32::from(self.win_offset) * 1_250)
    }

    /// Returns the duration between connection events.
    pub fn interval(&self) -> Duration {
        Duration::from_micros(u32::from(self.interval) * 1_250)
    }

    /// Returns the slave latency.
    pub fn latency(&self) -> u16 {
        self.latency
    }

    /// Returns the connection supervision timeout (`connSupervisionTimeout`).
    pub fn timeout(&self) -> Duration {
        Duration::from_micros(u32::from(self.timeout) * 10_000)
    }

    /// Returns the instant at which these changes should take effect.
    pub fn instant(&self) -> u16 {
        self.instant
    }
}

/// `LL_CHANNEL_MAP_REQ` - Update the channel map in use.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct ChannelMapReq {
    map: [u8; 5],
    instant: u16,
}

impl ChannelMapReq {
    pub fn channel_map(&self) -> ChannelMap {
        ChannelMap::from_raw(self.map)
    }

    pub fn instant(&self) -> u16 {
        self.instant
    }
}

/// `LL_TERMINATE_IND` - Connection termination indication.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct TerminateInd {
    error: u8,
}

impl TerminateInd {
    pub fn new(error_code: u8) -> Self {
        Self { error: error_code }
    }

    pub fn error_code(&self) -> u8 {
        self.error
    }
}

/// `LL_UNKNOWN_RSP`
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct UnknownRsp {
    unknown_type: u8,
}

impl UnknownRsp {
    pub fn new(unknown: ControlOpcode) -> Self {
        Self {
            unknown_type: unknown.into(),
        }
    }
}

/// `LL_FEATURE_REQ`
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct FeatureReq {
    feature_set: u64,
}

impl FeatureReq {
    pub fn new(master_features: FeatureSet) -> Self {
        Self {
            feature_set: master_features.bits(),
        }
    }

    pub fn master_features(&self) -> FeatureSet {
        FeatureSet::from_bits_truncate(self.feature_set)
    }
}

/// `LL_FEATURE_RSP`
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct FeatureRsp {
    feature_set: u64,
}

impl FeatureRsp {
    pub fn new(feature_set: FeatureSet) -> Self {
        Self {
            feature_set: feature_set.bits(),
        }
    }

    pub fn features(&self) -> FeatureSet {
        FeatureSet::from_bits_truncate(self.feature_set)
    }
}

/// `LL_VERSION_IND`.
#[derive(Debug, Copy, Clone, FromBytes, AsBytes, Unaligned)]
#[repr(C, packed)]
pub struct VersionInd {
    vers_nr: u8,
    comp_id: u16,
    sub_vers_nr: u16,
}

impl VersionInd {
    pub fn new(bt_vers: VersionNumber, comp_id: CompanyId, sub_vers_nr: u16) -> Self {
        Self {
            vers_nr: bt_vers.into(),
            comp_id: comp_id.as_u16(),
            sub_vers_nr,
        }
    }

    pub fn version(&self) -> VersionNumber {
        VersionNumber::from(self.vers_nr)
    }

    pub fn company_id(&self) -> CompanyId {
        CompanyId::from_u16(self.comp_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_rsp_roundtrip() {
        let rsp = UnknownRsp::new(ControlOpcode::ConnectionUpdateReq);
        let pdu = Pdu::UnknownRsp(rsp);
        let mut buf = [0; 2];
        {
            let mut writer = ByteWriter::new(&mut buf);
            pdu.to_bytes(&mut writer).unwrap();
        }
        assert_eq!(buf, [u8::from(ControlOpcode::UnknownRsp), 0x00]);
    }

    #[test]
    fn feature_roundtrip() {
        let req = FeatureReq::new(FeatureSet::empty());
        assert_eq!(req.master_features(), FeatureSet::empty());
    }
}
