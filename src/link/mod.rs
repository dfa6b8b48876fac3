//! Link-Layer.
//!
//! Note that a hardware BLE radio will already implement a few aspects of the link layer (such as
//! CRC calculation, preamble generation, etc.). Consider this module to be a construction kit for
//! BLE Link-Layers: Take whatever your hardware can do, supplement it with a few condiments from
//! this module, and you get a (hopefully) working Link-Layer.
//!
//! Refer to the official *Link Layer Specification* for details and more graphics and tables.
//!
//! # Packet Format
//!
//! All following graphics are based on the Bluetooth specification. If a field is marked with `-`,
//! it should be set to 0 when sending such a packet, and ignored when receiving it (the spec calls
//! these "RFU" = Reserved for Future Use).
//!
//! All values are transmitted in little-endian bit order unless otherwise noted. All fields in
//! graphics are ordered starting with the field transmitted first (LSB).
//!
//! The following graphic illustrates the raw in-air packet format. The packet transfers a PDU whose
//! format depends on whether it is sent on an *advertising channel* or a *data channel*.
//!
//! ```notrust
//! LSB                                                     MSB
//! +-----------+----------------+---------------+------------+
//! | Preamble  | Access Address |     PDU       |  CRC       |
//! | (1 octet) | (4 octets)     | (2-39 octets) | (3 octets) |
//! +-----------+----------------+---------------+------------+
//!                              \---------------/      ^
//!                                      |              |
//!                                      +--------------+
//!                                     CRC is calculated
//!                                       over the PDU
//!
//!                              \----------------------------/
//!                                    Data Whitening is
//!                                 applied to PDU and CRC
//! ```
//!
//! The 24-bit CRC value is transmitted MSb first. Length of the PDU depends on the kind of PDU
//! (advertising or data channel).
//!
//! ## Advertising Channel PDU
//!
//! Each advertising channel PDU consists of a 16-bit header and a variably-sized payload, the
//! length of which is stored in a header field.
//!
//! ```notrust
//! LSB                                           MSB
//! +-------------+---------------------------------+
//! |  Header     |             Payload             |
//! |  (16 bits)  |    (length stored in header)    |
//! +-------------+---------------------------------+
//! ```
//!
//! The header looks like this:
//!
//! ```notrust
//! LSB                                                                     MSB
//! +------------+------------+---------+---------+--------------+------------+
//! |  PDU Type  |     -      |  TxAdd  |  RxAdd  |    Length    |     -      |
//! |  (4 bits)  |  (2 bits)  | (1 bit) | (1 bit) |   (6 bits)   |  (2 bits)  |
//! +------------+------------+---------+---------+--------------+------------+
//! ```
//!
//! The `TxAdd` and `RxAdd` field are only used for some payloads, for all others, they should be
//! set to 0.
//!
//! Length may be in range 6 to 36 (inclusive).
//!
//! The data in `Payload` depends on the PDU Type. Refer to the spec or [`advertising::PduType`] for
//! details.
//!
//! [`advertising::PduType`]: advertising/enum.PduType.html
//!
//! ## Data Channel PDU
//!
//! A data channel PDU also contains a 16-bit header (but with a different layout) and a
//! variably-sized payload.
//!
//! If the connection is encrypted and the payload contains at least 1 octet, a Message Integrity
//! Check (MIC) is appended at the end.
//!
//! ```notrust
//! LSB                                          MSB
//! +-----------+----------------------+ - - - - - +
//! |  Header   |        Payload       |    MIC    |
//! | (16 bits) |    (0..=27 octets)   | (32 bits) |
//! +-----------+----------------------+ - - - - - +
//! ```
//!
//! Layout (in Bluetooth 4.2):
//!
//! ```notrust
//! LSB                                                                MSB
//! +----------+---------+---------+---------+------------+--------------+
//! |   LLID   |  NESN   |   SN    |   MD    |     -      |    Length    |
//! | (2 bits) | (1 bit) | (1 bit) | (1 bit) |  (3 bits)  |   (8 bits)   |
//! +----------+---------+---------+---------+------------+--------------+
//! ```
//!
//! Payload format depends on the value of the 2-bit `LLID` field:
//!
//! * `0b00`: Reserved value.
//! * `0b01`: LL Data PDU Continuation fragment or empty PDU.
//! * `0b10`: LL Data PDU Start of L2CAP message (or complete message if no fragmentation
//!   necessary).
//! * `0b11`: LL Control PDU.
//!
//! The `NESN` field specifies the **N**ext **E**xpected **S**equence **N**umber. The `SN` field
//! specifies the **S**equence **N**umber of this PDU.
//!
//! The `MD` field specifies that the device sending the packet has more data to send during this
//! *connection event*. When both slave and master send a packet with the `MD` bit set to 0, the
//! connection event ends.
//!
//! The `Length` field specifies the length of payload **and `MIC`**. For Bluetooth versions <4.2,
//! its maximum value is 31, resulting in a 27 octet Payload (the maximum) and a 32-bit `MIC`. 4.2
//! added the possibility of larger packets.
//!
//! # Scanning, initiating and the connection event loop
//!
//! Unlike a Peripheral, a Central doesn't just react to a single upcoming radio event: it drives
//! one of three independent activities at any given time — scanning the three advertising
//! channels for advertisers, initiating a connection to one particular advertiser, or running the
//! data-channel connection event loop of an established connection. [`LinkLayer::process`] is the
//! single entry point driving all three. The concurrency model keeps the radio ISR to setting a
//! flag: all actual work happens inside `process`, and the data-channel TX/IFS/RX sequence of one
//! connection event runs to completion inside a single `process` call rather than being spread
//! across several.

pub mod access_address;
pub mod advertising;
mod channel_map;
mod comp_id;
mod connection;
pub mod data;
mod device_address;
mod features;
pub mod filter;
pub mod llcp;
pub mod queue;
mod seq_num;

pub use self::access_address::AccessAddressGenerator;
pub use self::channel_map::ChannelMap;
pub use self::comp_id::*;
pub use self::connection::{ConnEvent, Connection};
pub use self::device_address::*;
pub use self::features::*;

use self::advertising::{AdvPdu, ConnectIndPayload, ConnectRequestData};
use crate::{
    bytes::{ByteReader, ByteWriter, FromBytes, ToBytes},
    config::{Config, ConfConsumer, ConfProducer},
    link::filter::AddressFilter,
    phy::{AdvertisingChannel, DataChannel},
    radio::{Radio, RadioEvent, RadioMode},
    time::{Duration, Instant, Sca, Timer},
    Error,
};
use rand_core::RngCore;

/// The CRC polynomial to use for CRC24 generation.
///
/// If your radio has hardware support for CRC generation, you may use (parts of) this value to
/// configure it (if necessary). The CRC should be computed only over the PDU. Also note that the
/// CRC, unlike every other field, is transmitted MSb first.
///
/// Counting from the least-significant bit (bit 0), bit `k` in this value is set if the term `x^k`
/// occurs in the CRC polynomial. This includes bit 24, which is usually not explicitly specified.
///
/// Written out, the polynomial is:
///
/// `x^24 + x^10 + x^9 + x^6 + x^4 + x^3 + x + 1`
pub const CRC_POLY: u32 = 0b00000001_00000000_00000110_01011011;

/// Min. size a data PDU payload buffer must have (assuming only the bare minimum PDU size is
/// supported).
///
/// Data channel PDUs are smaller than advertising channel PDUs, so this value is less than
/// `MIN_PAYLOAD_BUF`.
pub const MIN_DATA_PAYLOAD_BUF: usize = 27;

/// Min. size a data PDU buffer must have.
///
/// This is `MIN_DATA_PAYLOAD_BUF` plus the size of the data PDU header (2 Bytes).
pub const MIN_DATA_PDU_BUF: usize = MIN_DATA_PAYLOAD_BUF + 2;

/// Min. size a PDU payload buffer must have (to cover both advertising and data channels).
///
/// The Advertising PDU header has a length field that is limited to 37 octets, while data channel
/// PDUs in Bluetooth 4.0 and 4.1 only have a 5-bit length field, limiting the user payload to 27
/// octets (after subtracting the optional 4-Byte MIC). Bluetooth 4.2 added the optional Packet
/// Length Extension, which allows data channel PDUs containing up to 251 user payload bytes,
/// however this crate doesn't negotiate that yet.
pub const MIN_PAYLOAD_BUF: usize = 37;

/// Min. size a PDU buffer must have.
///
/// This is `MIN_PAYLOAD_BUF` plus the size of the advertising PDU header (2 Bytes).
pub const MIN_PDU_BUF: usize = MIN_PAYLOAD_BUF + 2;

/// Min. size of a raw packet buffer (preamble + access address + PDU + CRC), as handed to a radio
/// DMA buffer that needs room for the whole over-the-air packet rather than just header+payload.
pub const MIN_PACKET_BUF: usize = 1 + 4 + MIN_PDU_BUF + 3;

/// The advertising-channel access address. Fixed by the Bluetooth Core Spec for every advertiser
/// and scanner, regardless of role.
const ADV_ACCESS_ADDRESS: u32 = 0x8E89_BED6;

/// The fixed CRC seed used on advertising channel PDUs (there is no per-link `CRCInit` before a
/// connection exists).
const ADV_CRC_INIT: u32 = 0x0055_5555;

/// How long a single advertising channel is listened on while scanning before moving to the next.
const SCAN_CHANNEL_DWELL: Duration = Duration::from_micros(10_000);

/// Upper bound on how long a connection event's initial transmission may take to complete.
const TX_TIMEOUT: Duration = Duration::from_micros(1_000);

/// Extra margin added on top of the programmed RX window before giving up on a connection event.
const RX_POLL_MARGIN: Duration = Duration::from_micros(2_000);

/// HCI "Connection Timeout" reason code, used when the local supervision/consecutive-failure trip
/// fires rather than a peer- or host-initiated disconnect.
const REASON_CONNECTION_TIMEOUT: u8 = 0x08;

/// Parameters requested for a new connection, as supplied to [`LinkLayer::start_connect`].
///
/// Validated against the ranges allowed by the Bluetooth Core Spec, Vol 6, Part B, Section 4.5.1,
/// before being embedded into the `CONNECT_IND` sent to the peer.
#[derive(Debug, Copy, Clone)]
pub struct ConnParams {
    /// Connection event spacing. Must be in `[7.5ms, 4s]`.
    pub interval: Duration,
    /// Number of consecutive connection events the peer may skip. Must be `<= 499`.
    pub slave_latency: u16,
    /// Supervision timeout. Must be in `[100ms, 32s]` and satisfy
    /// `timeout > 2 * (1 + slave_latency) * interval`.
    pub supervision_timeout: Duration,
    /// Size of the transmit window following the anchor point of the first connection event.
    pub win_size: Duration,
    /// Offset of the transmit window from the anchor point of the first connection event.
    pub win_offset: Duration,
}

impl ConnParams {
    const MIN_INTERVAL: Duration = Duration::from_micros(7_500);
    const MAX_INTERVAL: Duration = Duration::from_micros(4_000_000);
    const MAX_SLAVE_LATENCY: u16 = 499;
    const MIN_SUPERVISION_TIMEOUT: Duration = Duration::from_micros(100_000);
    const MAX_SUPERVISION_TIMEOUT: Duration = Duration::from_micros(32_000_000);

    fn validate(&self) -> Result<(), Error> {
        if self.interval < Self::MIN_INTERVAL || self.interval > Self::MAX_INTERVAL {
            return Err(Error::InvalidParams);
        }
        if self.slave_latency > Self::MAX_SLAVE_LATENCY {
            return Err(Error::InvalidParams);
        }
        if self.supervision_timeout < Self::MIN_SUPERVISION_TIMEOUT
            || self.supervision_timeout > Self::MAX_SUPERVISION_TIMEOUT
        {
            return Err(Error::InvalidParams);
        }

        let multiplier = u64::from(1 + self.slave_latency);
        let min_timeout_us = u64::from(self.interval.as_micros()) * multiplier * 2;
        if u64::from(self.supervision_timeout.as_micros()) <= min_timeout_us {
            return Err(Error::InvalidParams);
        }

        Ok(())
    }
}

/// Channel-cycling state shared by scanning and initiating.
struct ScanParams {
    channel: AdvertisingChannel,
    scan_start: Instant,
    timeout: Option<Duration>,
}

/// What the Link-Layer is currently doing.
enum State<C: Config> {
    /// Radio is idle, no scan or connection in progress.
    Standby,
    /// Cycling the three advertising channels, reporting matching advertisers.
    Scanning(ScanParams),
    /// Like `Scanning`, but committed to sending `CONNECT_IND` to `target` as soon as it's seen.
    Initiating {
        scan: ScanParams,
        target: DeviceAddress,
        conn_params: ConnParams,
    },
    /// A data-channel connection is established (or was, until `disconnect_reason` is set and the
    /// pending `LL_TERMINATE_IND` gets transmitted).
    Connection {
        conn: Connection<C>,
        established: bool,
        disconnect_reason: Option<u8>,
    },
}

/// Result of a call to [`LinkLayer::process`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Event {
    /// Nothing of note happened this call.
    None,
    /// A connectable advertiser matching the active scan filter was observed.
    ScanMatch {
        addr: DeviceAddress,
        rssi_dbm: i8,
    },
    /// The scan/initiate deadline passed without (successfully connecting to) a match.
    ScanTimeout,
    /// The first data channel exchange of a new connection completed successfully.
    Connected,
    /// An L2CAP fragment (or an LL Control PDU) was processed on an established connection.
    DataReceived,
    /// The connection ended, whether by local request, peer request, or link loss.
    Disconnected { reason: u8 },
}

/// Returns the `n`-th advertising channel in the fixed 37, 38, 39 cycling order.
fn nth_adv_channel(n: u32) -> AdvertisingChannel {
    let mut channel = AdvertisingChannel::first();
    for _ in 0..n {
        channel = channel.cycle();
    }
    channel
}

/// Maps a sleep clock accuracy in parts per million to the 3-bit `SCA` field encoding used in
/// `CONNECT_IND` (Bluetooth Core Spec, Vol 6, Part B, Section 2.3.3.1, Table 2.4).
fn local_sca_code(ppm: u32) -> u8 {
    match ppm {
        0..=20 => 7,
        21..=30 => 6,
        31..=50 => 5,
        51..=75 => 4,
        76..=100 => 3,
        101..=150 => 2,
        151..=250 => 1,
        _ => 0,
    }
}

/// Outcome of running one connection event to completion.
enum ConnOutcome {
    Continue,
    FirstConnected,
    DataReceived,
    Ended(u8),
}

/// The BLE Link-Layer, in the Central (Master) role.
///
/// Owns the radio, the RNG used to generate access addresses and `CONNECT_IND` timing, and the
/// current scan/initiate/connection state. [`process`](LinkLayer::process) is the only method that
/// touches the radio or advances time-based state; every other method just validates parameters
/// and records the caller's intent.
pub struct LinkLayer<C: Config> {
    dev_addr: DeviceAddress,
    state: State<C>,
    timer: C::Timer,
    radio: C::Radio,
    rng: C::Rng,
    filter: C::Filter,
    pending_queues: Option<(ConfConsumer<C>, ConfProducer<C>)>,
}

impl<C: Config> LinkLayer<C> {
    /// Creates a new `LinkLayer` in `Standby`, ready to scan or connect.
    pub fn new(
        dev_addr: DeviceAddress,
        timer: C::Timer,
        radio: C::Radio,
        rng: C::Rng,
        filter: C::Filter,
    ) -> Self {
        trace!("LinkLayer::new, dev_addr = {:?}", dev_addr);
        Self {
            dev_addr,
            state: State::Standby,
            timer,
            radio,
            rng,
            filter,
            pending_queues: None,
        }
    }

    /// Returns this device's Link-Layer address.
    pub fn device_address(&self) -> DeviceAddress {
        self.dev_addr
    }

    /// Returns a mutable reference to the `Timer` used by the Link-Layer.
    pub fn timer(&mut self) -> &mut C::Timer {
        &mut self.timer
    }

    /// Returns a mutable reference to the `Radio` used by the Link-Layer.
    pub fn radio(&mut self) -> &mut C::Radio {
        &mut self.radio
    }

    /// Starts passively scanning the three advertising channels, reporting every connectable
    /// advertiser that passes the configured `AddressFilter` as [`Event::ScanMatch`].
    ///
    /// Fails with [`Error::Busy`] if a scan, initiation, or connection is already in progress.
    pub fn start_scan(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        if !matches!(self.state, State::Standby) {
            return Err(Error::Busy);
        }
        let now = self.timer.now();
        self.radio.reset();
        let channel = AdvertisingChannel::first();
        self.arm_adv_rx(channel);
        self.state = State::Scanning(ScanParams {
            channel,
            scan_start: now,
            timeout,
        });
        Ok(())
    }

    /// Starts scanning for `target` and sends `CONNECT_IND` to it as soon as a matching
    /// advertisement is observed, establishing a connection using `conn_params`.
    ///
    /// `tx`/`rx` are the application-facing halves of the packet queue that will back the
    /// resulting [`Connection`] once established.
    ///
    /// Fails with [`Error::InvalidParams`] if `conn_params` is out of range, or [`Error::Busy`] if
    /// a scan, initiation, or connection is already in progress.
    pub fn start_connect(
        &mut self,
        target: DeviceAddress,
        conn_params: ConnParams,
        tx: ConfConsumer<C>,
        rx: ConfProducer<C>,
        timeout: Option<Duration>,
    ) -> Result<(), Error> {
        if !matches!(self.state, State::Standby) {
            return Err(Error::Busy);
        }
        conn_params.validate()?;

        let now = self.timer.now();
        self.radio.reset();
        let channel = AdvertisingChannel::first();
        self.arm_adv_rx(channel);
        self.pending_queues = Some((tx, rx));
        self.state = State::Initiating {
            scan: ScanParams {
                channel,
                scan_start: now,
                timeout,
            },
            target,
            conn_params,
        };
        Ok(())
    }

    /// Stops an in-progress scan or initiation, returning to `Standby`.
    ///
    /// Idempotent in the sense described by the public API contract: the first call from a
    /// scanning/initiating state succeeds; a second call (or calling this while already idle or
    /// connected) returns [`Error::Busy`] as a no-op error.
    pub fn stop_scan(&mut self) -> Result<(), Error> {
        match self.state {
            State::Scanning(_) | State::Initiating { .. } => {
                self.radio.reset();
                self.pending_queues = None;
                self.state = State::Standby;
                Ok(())
            }
            _ => Err(Error::Busy),
        }
    }

    /// Queues `LL_TERMINATE_IND` for transmission at the next connection event; the connection
    /// transitions to `Standby` (firing [`Event::Disconnected`]) once that transmission completes,
    /// regardless of whether the peer acknowledges it.
    ///
    /// Fails with [`Error::NotConnected`] if no connection is established, or [`Error::Busy`] if a
    /// disconnect is already pending.
    pub fn disconnect(&mut self, reason: u8) -> Result<(), Error> {
        match &mut self.state {
            State::Connection {
                conn,
                disconnect_reason,
                ..
            } => {
                if disconnect_reason.is_some() {
                    return Err(Error::Busy);
                }
                conn.terminate(reason)?;
                *disconnect_reason = Some(reason);
                Ok(())
            }
            _ => Err(Error::NotConnected),
        }
    }

    /// Returns the current connection, if any.
    pub fn connection(&self) -> Option<&Connection<C>> {
        match &self.state {
            State::Connection { conn, .. } => Some(conn),
            _ => None,
        }
    }

    /// Returns a mutable reference to the current connection, if any.
    pub fn connection_mut(&mut self) -> Option<&mut Connection<C>> {
        match &mut self.state {
            State::Connection { conn, .. } => Some(conn),
            _ => None,
        }
    }

    /// Whether the Link-Layer is currently scanning or initiating.
    pub fn is_scanning(&self) -> bool {
        matches!(self.state, State::Scanning(_) | State::Initiating { .. })
    }

    /// Whether the first data channel exchange of an established connection has completed.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.state,
            State::Connection {
                established: true,
                ..
            }
        )
    }

    /// Drives the Link-Layer forward. Must be called repeatedly (eg. from the application main
    /// loop, whenever the radio raises an interrupt or a scheduled deadline arrives) for anything
    /// to happen; never blocks longer than a single connection event's bounded TX/IFS/RX sequence.
    pub fn process(&mut self, now: Instant) -> Event {
        if matches!(self.state, State::Standby) {
            return Event::None;
        }
        if matches!(self.state, State::Connection { .. }) {
            self.process_connection(now)
        } else {
            self.process_scanning(now)
        }
    }

    fn arm_adv_rx(&mut self, channel: AdvertisingChannel) {
        self.radio.set_freq_hz(u32::from(channel.freq()) * 1_000_000);
        self.radio.set_whitening_seed(channel.whitening_iv());
        self.radio.set_sync_word_32(ADV_ACCESS_ADDRESS);
        self.radio.set_crc_init_24(ADV_CRC_INIT);
        self.radio.set_mode(RadioMode::RxWithTimeout(SCAN_CHANNEL_DWELL));
    }

    fn process_scanning(&mut self, now: Instant) -> Event {
        let initiating_target = match &self.state {
            State::Initiating { target, .. } => Some(*target),
            State::Scanning(_) => None,
            _ => return Event::None,
        };

        let scan = match &mut self.state {
            State::Scanning(s) => s,
            State::Initiating { scan, .. } => scan,
            _ => return Event::None,
        };

        if let Some(timeout) = scan.timeout {
            if now.duration_since(scan.scan_start) >= timeout {
                self.radio.reset();
                self.pending_queues = None;
                self.state = State::Standby;
                return Event::ScanTimeout;
            }
        }

        let elapsed = now.duration_since(scan.scan_start);
        let slot = u32::from(elapsed.as_micros() / SCAN_CHANNEL_DWELL.as_micros()) % 3;
        let channel = nth_adv_channel(slot);
        let channel_changed = channel.rf_channel() != scan.channel.rf_channel();
        scan.channel = channel;

        if channel_changed {
            self.arm_adv_rx(channel);
        }

        let radio_event = self.radio.poll_irq();
        let rearm = channel_changed || !matches!(radio_event, RadioEvent::None);

        let matched = match radio_event {
            RadioEvent::RxDone(len) => {
                let mut buf = [0u8; MIN_PDU_BUF];
                let n = usize::from(self.radio.read_rx(&mut buf[..usize::from(len)]));
                let rssi = self.radio.rssi_dbm();
                match AdvPdu::from_bytes(&mut ByteReader::new(&buf[..n])) {
                    Ok(adv)
                        if adv.is_matchable() && self.filter.matches(adv.advertiser_address()) =>
                    {
                        Some((adv.advertiser_address(), rssi, adv.is_connectable()))
                    }
                    _ => None,
                }
            }
            _ => None,
        };

        if rearm {
            self.arm_adv_rx(channel);
        }

        match (matched, initiating_target) {
            (Some((addr, _, true)), Some(target)) if addr.raw() == target.raw() => {
                self.begin_connect(addr, now)
            }
            (Some((addr, rssi_dbm, _)), None) => Event::ScanMatch { addr, rssi_dbm },
            _ => Event::None,
        }
    }

    /// Builds and transmits `CONNECT_IND` to `peer`, establishing the connection on success.
    fn begin_connect(&mut self, peer: DeviceAddress, now: Instant) -> Event {
        let conn_params = match &self.state {
            State::Initiating { conn_params, .. } => *conn_params,
            _ => return Event::None,
        };

        let access_address = AccessAddressGenerator::new(&mut self.rng).generate();
        let crc_init = {
            let v = self.rng.next_u32() & 0x00FF_FFFF;
            if v == 0 {
                1
            } else {
                v
            }
        };
        let hop = 5 + (self.rng.next_u32() % 12) as u8;

        let payload = ConnectIndPayload {
            init_a: self.dev_addr,
            adv_a: peer,
            data: ConnectRequestData {
                access_address,
                crc_init,
                win_size: conn_params.win_size,
                win_offset: conn_params.win_offset,
                interval: conn_params.interval,
                slave_latency: conn_params.slave_latency,
                supervision_timeout: conn_params.supervision_timeout,
                channel_map: ChannelMap::with_all_channels(),
                hop,
                master_sca: Sca::from_raw(local_sca_code(C::LOCAL_SCA_PPM)),
            },
        };

        let header = payload.header();
        let mut buf = [0u8; 2 + 34];
        buf[..2].copy_from_slice(&header.to_raw());
        {
            let mut writer = ByteWriter::new(&mut buf[2..]);
            payload
                .to_bytes(&mut writer)
                .expect("CONNECT_IND always fits its fixed-size buffer");
        }

        self.radio.set_mode(RadioMode::Tx);
        let tx_deadline = now + TX_TIMEOUT;
        let sent = self.radio.submit_tx(&buf)
            && matches!(
                Self::poll_radio_event(&mut self.radio, &self.timer, tx_deadline),
                RadioEvent::TxDone
            );

        if !sent {
            // Missed the window; stay in `Initiating` and try again on the next match.
            return Event::None;
        }

        let connect_ind_end = self.timer.now();
        let (tx, rx) = match self.pending_queues.take() {
            Some(q) => q,
            None => return Event::None,
        };

        let conn = Connection::create(&payload, connect_ind_end, tx, rx);
        self.state = State::Connection {
            conn,
            established: false,
            disconnect_reason: None,
        };
        debug!("CONNECT_IND sent to {:?}, aa = {:#010x}", peer, access_address);
        Event::None
    }

    fn process_connection(&mut self, now: Instant) -> Event {
        let LinkLayer {
            state, radio, timer, ..
        } = self;

        let (conn, established, disconnect_reason) = match state {
            State::Connection {
                conn,
                established,
                disconnect_reason,
            } => (conn, established, disconnect_reason),
            _ => return Event::None,
        };

        if !now.has_passed(conn.anchor()) {
            return Event::None;
        }

        let outcome =
            Self::run_connection_event(conn, established, disconnect_reason, radio, timer, now);

        match outcome {
            ConnOutcome::Continue => Event::None,
            ConnOutcome::FirstConnected => Event::Connected,
            ConnOutcome::DataReceived => Event::DataReceived,
            ConnOutcome::Ended(reason) => {
                self.radio.reset();
                self.state = State::Standby;
                Event::Disconnected { reason }
            }
        }
    }

    /// Runs one full connection event: transmit, wait `T_IFS`, listen, and interpret the result.
    /// Tight-loops on `radio.poll_irq()` within the bounded bounds documented on [`TX_TIMEOUT`] and
    /// the connection's RX window; does not touch `self.state`, so the caller performs any
    /// resulting state transition once this returns.
    fn run_connection_event(
        conn: &mut Connection<C>,
        established: &mut bool,
        disconnect_reason: &mut Option<u8>,
        radio: &mut C::Radio,
        timer: &C::Timer,
        now: Instant,
    ) -> ConnOutcome {
        let (channel, tx_pdu) = conn.start_event();
        let mut scratch = [0u8; MIN_DATA_PDU_BUF];
        let len = tx_pdu.len();
        scratch[..len].copy_from_slice(tx_pdu);

        radio.set_freq_hz(u32::from(channel.freq()) * 1_000_000);
        radio.set_whitening_seed(channel.whitening_iv());
        radio.set_sync_word_32(conn.access_address());
        radio.set_crc_init_24(conn.crc_init());
        radio.set_mode(RadioMode::Tx);

        let tx_deadline = now + TX_TIMEOUT;
        let tx_done = radio.submit_tx(&scratch[..len])
            && matches!(
                Self::poll_radio_event(radio, timer, tx_deadline),
                RadioEvent::TxDone
            );

        if !tx_done {
            conn.register_rx_timeout();
            return Self::after_event_failure(conn, now);
        }

        if let Some(reason) = *disconnect_reason {
            return ConnOutcome::Ended(reason);
        }

        let ifs_deadline = timer.now() + Duration::T_IFS;
        while !timer.now().has_passed(ifs_deadline) {}

        let window = conn.rx_window();
        radio.set_mode(RadioMode::RxWithTimeout(window));
        let rx_deadline = timer.now() + window + RX_POLL_MARGIN;

        match Self::poll_radio_event(radio, timer, rx_deadline) {
            RadioEvent::RxDone(len) => {
                let mut buf = [0u8; MIN_DATA_PDU_BUF];
                let n = usize::from(radio.read_rx(&mut buf[..usize::from(len)]));
                conn.record_rssi(radio.rssi_dbm());
                match conn.process_rx(&buf[..n]) {
                    Ok(ConnEvent::Disconnected(reason)) => ConnOutcome::Ended(reason),
                    Ok(ConnEvent::Data) => Self::mark_established(established, ConnOutcome::DataReceived),
                    Ok(ConnEvent::Control) | Ok(ConnEvent::Empty) => {
                        Self::mark_established(established, ConnOutcome::Continue)
                    }
                    Err(_) => {
                        // Malformed PDU despite a valid CRC: protocol violation on an otherwise
                        // healthy radio link. Drop it and keep going.
                        ConnOutcome::Continue
                    }
                }
            }
            RadioEvent::CrcError => {
                conn.register_crc_error();
                Self::after_event_failure(conn, now)
            }
            RadioEvent::RxTimeout | RadioEvent::None => {
                conn.register_rx_timeout();
                Self::after_event_failure(conn, now)
            }
            RadioEvent::TxDone => ConnOutcome::Continue,
        }
    }

    fn mark_established(established: &mut bool, outcome: ConnOutcome) -> ConnOutcome {
        if !*established {
            *established = true;
            ConnOutcome::FirstConnected
        } else {
            outcome
        }
    }

    fn after_event_failure(conn: &Connection<C>, now: Instant) -> ConnOutcome {
        if conn.link_lost(now) {
            ConnOutcome::Ended(REASON_CONNECTION_TIMEOUT)
        } else {
            ConnOutcome::Continue
        }
    }

    /// Polls `radio.poll_irq()` until it returns something other than `RadioEvent::None`, or until
    /// `deadline` is reached (in which case `RadioEvent::None` is returned).
    fn poll_radio_event(radio: &mut C::Radio, timer: &C::Timer, deadline: Instant) -> RadioEvent {
        loop {
            match radio.poll_irq() {
                RadioEvent::None => {
                    if timer.now().has_passed(deadline) {
                        return RadioEvent::None;
                    }
                }
                other => return other,
            }
        }
    }
}
