//! Advertising-channel PDU framing.
//!
//! Covers just enough of the advertising-channel PDU format for a Central: parsing inbound
//! `ADV_IND`/`ADV_DIRECT_IND`/`ADV_SCAN_IND` packets seen while scanning, and building the
//! outbound `CONNECT_IND` PDU that moves a peer from advertising into a connection.
//!
//! ```text
//! Advertising-channel PDU:
//!
//!  LSB                                                               MSB
//!  +------+-----+--------+--------+----------------+------------------+
//!  | Type | RFU | TxAdd  | RxAdd  | Length (6 bits) | RFU (2 bits)     |  <- Header, 2 Bytes
//!  |4 bits|2 bit| 1 bit  | 1 bit  |                 |                  |
//!  +------+-----+--------+--------+----------------+------------------+
//!  |                      Payload (2..=37 Bytes)                      |
//!  +--------------------------------------------------------------------+
//! ```

use crate::link::channel_map::ChannelMap;
use crate::link::device_address::{AddressKind, DeviceAddress};
use crate::time::{Duration, Sca};
use crate::{
    bytes::{ByteReader, ByteWriter, FromBytes, ToBytes},
    Error,
};
use core::fmt;

enum_with_unknown! {
    /// Type field of an advertising-channel PDU header.
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub enum PduType(u8) {
        AdvInd = 0x0,
        AdvDirectInd = 0x1,
        AdvNonconnInd = 0x2,
        ScanReq = 0x3,
        ScanRsp = 0x4,
        ConnectInd = 0x5,
        AdvScanInd = 0x6,
    }
}

/// Advertising-channel PDU header (2 Bytes).
#[derive(Copy, Clone)]
pub struct Header {
    ty: PduType,
    tx_add: AddressKind,
    rx_add: AddressKind,
    length: u8,
}

impl Header {
    /// Creates a header for a PDU of type `ty` carrying `length` Bytes of payload.
    pub fn new(ty: PduType, tx_add: AddressKind, rx_add: AddressKind, length: u8) -> Self {
        assert!(length <= 0x3F, "advertising PDU payload too large");
        Self {
            ty,
            tx_add,
            rx_add,
            length,
        }
    }

    /// Parses a `Header` from its 2-Byte wire representation.
    pub fn parse(raw: &[u8; 2]) -> Self {
        let first = raw[0];
        let ty = PduType::from(first & 0b1111);
        let tx_add = if first & 0b0100_0000 != 0 {
            AddressKind::Random
        } else {
            AddressKind::Public
        };
        let rx_add = if first & 0b1000_0000 != 0 {
            AddressKind::Random
        } else {
            AddressKind::Public
        };
        let length = raw[1] & 0x3F;

        Self {
            ty,
            tx_add,
            rx_add,
            length,
        }
    }

    /// Encodes this header into its 2-Byte wire representation.
    pub fn to_raw(&self) -> [u8; 2] {
        let mut first = u8::from(self.ty);
        if self.tx_add == AddressKind::Random {
            first |= 0b0100_0000;
        }
        if self.rx_add == AddressKind::Random {
            first |= 0b1000_0000;
        }
        [first, self.length & 0x3F]
    }

    pub fn pdu_type(&self) -> PduType {
        self.ty
    }

    pub fn tx_add(&self) -> AddressKind {
        self.tx_add
    }

    pub fn rx_add(&self) -> AddressKind {
        self.rx_add
    }

    /// Length of the payload following this header, in Bytes.
    pub fn payload_length(&self) -> u8 {
        self.length
    }
}

impl fmt::Debug for Header {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Header")
            .field("type", &self.ty)
            .field("tx_add", &self.tx_add)
            .field("rx_add", &self.rx_add)
            .field("length", &self.length)
            .finish()
    }
}

/// A parsed inbound advertising PDU (`ADV_IND`, `ADV_DIRECT_IND` or `ADV_SCAN_IND`).
///
/// Scan response and scan request PDUs aren't modeled here: a Central only needs to recognize
/// connectable/scannable advertisers to decide whether to send `CONNECT_IND`, not to parse scan
/// response payloads (GAP name/service discovery is out of scope, see SPEC_FULL.md Non-goals).
#[derive(Debug, Copy, Clone)]
pub struct AdvPdu<'a> {
    header: Header,
    adv_a: DeviceAddress,
    /// Advertiser's AD structure payload (only present on `ADV_IND`/`ADV_SCAN_IND`).
    ad_data: &'a [u8],
}

impl<'a> AdvPdu<'a> {
    pub fn header(&self) -> Header {
        self.header
    }

    /// The advertiser's address (`AdvA`).
    pub fn advertiser_address(&self) -> DeviceAddress {
        self.adv_a
    }

    /// Raw AD structure payload carried after `AdvA`.
    pub fn ad_data(&self) -> &'a [u8] {
        self.ad_data
    }

    /// Whether this advertisement is one of the types a scanner matches `AdvA` against:
    /// `ADV_IND`, `ADV_DIRECT_IND`, or `ADV_SCAN_IND`.
    ///
    /// This is broader than [`is_connectable`](Self::is_connectable): `ADV_SCAN_IND` is
    /// matchable (and reportable to the upper layer as a scan match) but not connectable, since
    /// a `CONNECT_IND` sent in response would go unanswered.
    pub fn is_matchable(&self) -> bool {
        matches!(
            self.header.pdu_type(),
            PduType::AdvInd | PduType::AdvDirectInd | PduType::AdvScanInd
        )
    }

    /// Whether this advertisement can be responded to with `CONNECT_IND`.
    pub fn is_connectable(&self) -> bool {
        matches!(
            self.header.pdu_type(),
            PduType::AdvInd | PduType::AdvDirectInd
        )
    }
}

impl<'a> FromBytes<'a> for AdvPdu<'a> {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let raw_header: [u8; 2] = bytes.read_array()?;
        let header = Header::parse(&raw_header);

        let payload = bytes.read_slice(usize::from(header.payload_length()))?;
        if payload.len() < 6 {
            return Err(Error::InvalidLength);
        }
        let mut addr = [0; 6];
        addr.copy_from_slice(&payload[..6]);
        let adv_a = DeviceAddress::new(addr, header.tx_add());

        Ok(Self {
            header,
            adv_a,
            ad_data: &payload[6..],
        })
    }
}

/// Link layer connection parameters carried in the `LLData` field of `CONNECT_IND`.
#[derive(Debug, Copy, Clone)]
pub struct ConnectRequestData {
    pub access_address: u32,
    pub crc_init: u32,
    pub win_size: Duration,
    pub win_offset: Duration,
    pub interval: Duration,
    pub slave_latency: u16,
    pub supervision_timeout: Duration,
    pub channel_map: ChannelMap,
    pub hop: u8,
    pub master_sca: Sca,
}

/// The 34-Byte payload of a `CONNECT_IND` PDU (`InitA`, `AdvA`, `LLData`).
///
/// Built by the scanning/initiating Central once it decides to connect to an observed advertiser;
/// the teacher never builds this (it only ever parses it, as the Peripheral/slave side), so this
/// is grounded on the wire layout documented in the Bluetooth Core Spec, Vol 6, Part B,
/// Section 2.3.3.1.
#[derive(Debug, Copy, Clone)]
pub struct ConnectIndPayload {
    pub init_a: DeviceAddress,
    pub adv_a: DeviceAddress,
    pub data: ConnectRequestData,
}

impl ConnectIndPayload {
    /// Header to transmit this PDU with.
    pub fn header(&self) -> Header {
        Header::new(
            PduType::ConnectInd,
            self.init_a.kind(),
            self.adv_a.kind(),
            34,
        )
    }
}

impl ToBytes for ConnectIndPayload {
    fn to_bytes(&self, writer: &mut ByteWriter<'_>) -> Result<(), Error> {
        writer.write_slice(self.init_a.raw())?;
        writer.write_slice(self.adv_a.raw())?;

        writer.write_u32_le(self.data.access_address)?;

        let crc = self.data.crc_init.to_le_bytes();
        writer.write_slice(&crc[..3])?;

        writer.write_u8(win_size_raw(self.data.win_size))?;
        writer.write_u16_le(offset_raw(self.data.win_offset))?;
        writer.write_u16_le(interval_raw(self.data.interval))?;
        writer.write_u16_le(self.data.slave_latency)?;
        writer.write_u16_le(timeout_raw(self.data.supervision_timeout))?;

        writer.write_slice(&self.data.channel_map.to_raw())?;

        let hop_and_sca = (self.data.hop & 0b1_1111) | (sca_raw(self.data.master_sca) << 5);
        writer.write_u8(hop_and_sca)?;

        Ok(())
    }
}

impl<'a> FromBytes<'a> for ConnectIndPayload {
    fn from_bytes(bytes: &mut ByteReader<'a>) -> Result<Self, Error> {
        let mut init_addr = [0; 6];
        init_addr.copy_from_slice(bytes.read_slice(6)?);
        let mut adv_addr = [0; 6];
        adv_addr.copy_from_slice(bytes.read_slice(6)?);

        let access_address = bytes.read_u32_le()?;

        let crc_bytes = bytes.read_slice(3)?;
        let crc_init = u32::from(crc_bytes[0])
            | (u32::from(crc_bytes[1]) << 8)
            | (u32::from(crc_bytes[2]) << 16);

        let win_size = Duration::from_micros(u32::from(bytes.read_u8()?) * 1250);
        let win_offset = Duration::from_micros(u32::from(bytes.read_u16_le()?) * 1250);
        let interval = Duration::from_micros(u32::from(bytes.read_u16_le()?) * 1250);
        let slave_latency = bytes.read_u16_le()?;
        let supervision_timeout = Duration::from_micros(u32::from(bytes.read_u16_le()?) * 10_000);

        let mut chm = [0; 5];
        chm.copy_from_slice(bytes.read_slice(5)?);
        let channel_map = ChannelMap::from_raw(chm);

        let hop_and_sca = bytes.read_u8()?;
        let hop = hop_and_sca & 0b1_1111;
        let master_sca = Sca::from_raw(hop_and_sca >> 5);

        // `AddressKind` for each address is only known from the enclosing advertising-channel
        // header (TxAdd/RxAdd), so callers that need it should track it separately; here we
        // default to `Public` and let `link::mod` override it from the header it already parsed.
        Ok(Self {
            init_a: DeviceAddress::new(init_addr, AddressKind::Public),
            adv_a: DeviceAddress::new(adv_addr, AddressKind::Public),
            data: ConnectRequestData {
                access_address,
                crc_init,
                win_size,
                win_offset,
                interval,
                slave_latency,
                supervision_timeout,
                channel_map,
                hop,
                master_sca,
            },
        })
    }
}

impl fmt::Display for ConnectIndPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CONNECT_IND {{ aa: {:#010x}, interval: {} }}",
            self.data.access_address, self.data.interval
        )
    }
}

fn win_size_raw(d: Duration) -> u8 {
    (d.as_micros() / 1250) as u8
}

fn offset_raw(d: Duration) -> u16 {
    (d.as_micros() / 1250) as u16
}

fn interval_raw(d: Duration) -> u16 {
    (d.as_micros() / 1250) as u16
}

fn timeout_raw(d: Duration) -> u16 {
    (d.as_micros() / 10_000) as u16
}

fn sca_raw(sca: Sca) -> u8 {
    match sca {
        Sca::Ppm251To500 => 0,
        Sca::Ppm151To250 => 1,
        Sca::Ppm101To150 => 2,
        Sca::Ppm76To100 => 3,
        Sca::Ppm51To75 => 4,
        Sca::Ppm31To50 => 5,
        Sca::Ppm21To30 => 6,
        Sca::Ppm0To20 => 7,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::device_address::AddressKind;

    #[test]
    fn header_roundtrip() {
        let header = Header::new(PduType::ConnectInd, AddressKind::Public, AddressKind::Random, 34);
        let raw = header.to_raw();
        let parsed = Header::parse(&raw);
        assert_eq!(parsed.pdu_type(), PduType::ConnectInd);
        assert_eq!(parsed.tx_add(), AddressKind::Public);
        assert_eq!(parsed.rx_add(), AddressKind::Random);
        assert_eq!(parsed.payload_length(), 34);
    }

    #[test]
    fn connect_ind_roundtrip() {
        let payload = ConnectIndPayload {
            init_a: DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Public),
            adv_a: DeviceAddress::new([6, 5, 4, 3, 2, 1], AddressKind::Random),
            data: ConnectRequestData {
                access_address: 0x1234_5678,
                crc_init: 0x555555,
                win_size: Duration::from_micros(2 * 1250),
                win_offset: Duration::from_micros(1 * 1250),
                interval: Duration::from_micros(80 * 1250),
                slave_latency: 4,
                supervision_timeout: Duration::from_micros(600 * 10_000),
                channel_map: ChannelMap::with_all_channels(),
                hop: 7,
                master_sca: Sca::Ppm0To20,
            },
        };

        let mut buf = [0; 34];
        {
            let mut writer = ByteWriter::new(&mut buf);
            payload.to_bytes(&mut writer).unwrap();
        }

        let parsed = ConnectIndPayload::from_bytes(&mut ByteReader::new(&buf)).unwrap();
        assert_eq!(parsed.data.access_address, 0x1234_5678);
        assert_eq!(parsed.data.crc_init, 0x555555);
        assert_eq!(parsed.data.hop, 7);
        assert_eq!(parsed.data.master_sca, Sca::Ppm0To20);
        assert_eq!(parsed.data.slave_latency, 4);
    }

    fn adv_pdu(ty: PduType) -> AdvPdu<'static> {
        AdvPdu {
            header: Header::new(ty, AddressKind::Public, AddressKind::Public, 6),
            adv_a: DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Public),
            ad_data: &[],
        }
    }

    #[test]
    fn adv_ind_and_adv_direct_ind_are_connectable_and_matchable() {
        for ty in [PduType::AdvInd, PduType::AdvDirectInd] {
            let pdu = adv_pdu(ty);
            assert!(pdu.is_connectable());
            assert!(pdu.is_matchable());
        }
    }

    #[test]
    fn adv_scan_ind_is_matchable_but_not_connectable() {
        let pdu = adv_pdu(PduType::AdvScanInd);
        assert!(pdu.is_matchable());
        assert!(!pdu.is_connectable());
    }
}
