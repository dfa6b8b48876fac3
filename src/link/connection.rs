//! Data-channel connection state, owned by a Central (Master) device.
//!
//! A Peripheral's `Connection` is built from the slave's perspective: it is handed a received
//! `CONNECT_REQ` and then reacts to whatever the master transmits. A Central drives the opposite
//! side of the exact same state machine — it picks the access address, the hop increment and the
//! channel map itself (via `CONNECT_IND`), and it is the one deciding, every `conn_interval`, to
//! transmit first and then open a listen window. The channel-hopping algorithm (`hop_channel`) and
//! the stop-and-wait sequence-number bookkeeping and LLCP dispatch keep their original shape; the
//! event-scheduling direction and the window-widening computation are new, since only a master
//! needs to compensate for the peer's sleep-clock drift.

use crate::{
    bytes::{ByteWriter, ToBytes},
    config::{Config, ConfConsumer, ConfProducer},
    link::{
        advertising::ConnectIndPayload,
        channel_map::ChannelMap,
        comp_id::CompanyId,
        data::{self, Header, Llid},
        features::FeatureSet,
        llcp::{self, FeatureRsp, Pdu as LlcpPdu, RawPdu as LlcpRawPdu, VersionInd},
        queue::{Consume, Consumer, Producer},
        SeqNum, MIN_DATA_PDU_BUF,
    },
    phy::DataChannel,
    time::{Duration, Instant, Sca},
    Error, BLUETOOTH_VERSION,
};

/// Extra margin added on top of the widened window to absorb radio/timer jitter.
const RX_WINDOW_JITTER: Duration = Duration::from_micros(16);

/// Outcome of processing one received data channel packet.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    /// Packet carried no new information (empty PDU, or a retransmission already seen).
    Empty,
    /// An L2CAP fragment was delivered to the RX queue.
    Data,
    /// An LL Control PDU was processed (and possibly answered).
    Control,
    /// The peer asked to terminate the connection, or we did.
    Disconnected(u8),
}

/// Owns the protocol state of a single, established data-channel connection.
///
/// Does not touch the radio directly: `link::LinkLayer::process` reads `channel()`,
/// `access_address()`, etc. to program the radio, and feeds received bytes back in via
/// `process_rx`.
pub struct Connection<C: Config> {
    access_address: u32,
    crc_init: u32,
    channel_map: ChannelMap,
    hop: u8,
    conn_interval: Duration,
    slave_latency: u16,
    supervision_timeout: Duration,
    master_sca: Sca,

    conn_event_count: u16,
    unmapped_channel: DataChannel,
    channel: DataChannel,
    anchor: Instant,
    window_widening: Duration,

    transmit_seq_num: SeqNum,
    next_expected_seq_num: SeqNum,
    awaiting_ack: bool,
    last_tx: [u8; MIN_DATA_PDU_BUF],
    last_tx_len: u8,
    pending_control: Option<([u8; MIN_DATA_PDU_BUF - 2], u8)>,

    last_rx_instant: Instant,

    consecutive_crc_errors: u8,
    total_crc_errors: u32,
    total_timeouts: u32,
    last_rssi_dbm: i8,

    tx: ConfConsumer<C>,
    rx: ConfProducer<C>,
}

impl<C: Config> Connection<C> {
    /// Creates the connection state resulting from transmitting `CONNECT_IND`.
    ///
    /// `connect_ind_end` is the instant at which the `CONNECT_IND` transmission completed; the
    /// first connection event's anchor point is computed relative to it using `LLData.WinOffset`.
    pub fn create(
        payload: &ConnectIndPayload,
        connect_ind_end: Instant,
        tx: ConfConsumer<C>,
        rx: ConfProducer<C>,
    ) -> Self {
        let data = &payload.data;
        let first_anchor = connect_ind_end + data.win_offset;

        Self {
            access_address: data.access_address,
            crc_init: data.crc_init,
            channel_map: data.channel_map,
            hop: data.hop,
            conn_interval: data.interval,
            slave_latency: data.slave_latency,
            supervision_timeout: data.supervision_timeout,
            master_sca: data.master_sca,

            conn_event_count: 0,
            unmapped_channel: DataChannel::new(0),
            channel: DataChannel::new(0),
            anchor: first_anchor,
            window_widening: Duration::from_micros(0),

            transmit_seq_num: SeqNum::ZERO,
            next_expected_seq_num: SeqNum::ZERO,
            awaiting_ack: false,
            last_tx: [0; MIN_DATA_PDU_BUF],
            last_tx_len: 2,
            pending_control: None,

            last_rx_instant: connect_ind_end,

            consecutive_crc_errors: 0,
            total_crc_errors: 0,
            total_timeouts: 0,
            last_rssi_dbm: 0,

            tx,
            rx,
        }
    }

    /// The data channel access address in use.
    pub fn access_address(&self) -> u32 {
        self.access_address
    }

    /// The CRC initialization value (`CRCInit`) in use.
    pub fn crc_init(&self) -> u32 {
        self.crc_init
    }

    /// The data channel selected for the current connection event.
    pub fn channel(&self) -> DataChannel {
        self.channel
    }

    /// The anchor point (nominal start) of the current connection event.
    pub fn anchor(&self) -> Instant {
        self.anchor
    }

    /// The negotiated connection interval.
    pub fn conn_interval(&self) -> Duration {
        self.conn_interval
    }

    /// Advances to the next connection event: hops the data channel, advances the anchor point,
    /// and returns the buffer that should be transmitted first.
    ///
    /// If the previous transmission is still unacknowledged, the same buffer is retransmitted
    /// unchanged (stop-and-wait).
    pub fn start_event(&mut self) -> (DataChannel, &[u8]) {
        self.hop_channel();
        self.conn_event_count = self.conn_event_count.wrapping_add(1);
        self.anchor += self.conn_interval;
        self.accumulate_window_widening();

        if !self.awaiting_ack {
            self.fill_next_tx();
        }

        (self.channel, &self.last_tx[..usize::from(self.last_tx_len)])
    }

    /// Implements the data channel hopping algorithm (Bluetooth Core Spec, Vol 6, Part B, Section
    /// 4.5.8.2, "Channel Selection algorithm #1").
    fn hop_channel(&mut self) -> DataChannel {
        let unmapped = (u16::from(self.unmapped_channel.index()) + u16::from(self.hop)) % 37;
        self.unmapped_channel = DataChannel::new(unmapped as u8);

        self.channel = if self.channel_map.is_used(self.unmapped_channel) {
            self.unmapped_channel
        } else {
            let remap_index = unmapped % u16::from(self.channel_map.num_used_channels());
            self.channel_map.by_index(remap_index as u8)
        };
        self.channel
    }

    /// Fills `last_tx` with the next outgoing PDU: a pending LLCP response if one is queued,
    /// otherwise the next packet from the application TX queue, otherwise an empty keep-alive PDU.
    fn fill_next_tx(&mut self) {
        let mut buf = [0u8; MIN_DATA_PDU_BUF];
        let (llid, len) = if let Some((ctrl, ctrl_len)) = self.pending_control.take() {
            buf[2..2 + usize::from(ctrl_len)].copy_from_slice(&ctrl[..usize::from(ctrl_len)]);
            (Llid::Control, ctrl_len)
        } else {
            let mut llid = Llid::DataCont;
            let mut len = 0u8;
            let copied = self.tx.consume_raw_with(|header, payload| {
                llid = header.llid();
                len = payload.len() as u8;
                buf[2..2 + payload.len()].copy_from_slice(payload);
                Consume::always(Ok::<(), Error>(()))
            });
            if copied.is_err() {
                llid = Llid::DataCont;
                len = 0;
            }
            (llid, len)
        };

        let mut header = Header::new(llid);
        header.set_payload_length(len);
        header.set_sn(self.transmit_seq_num);
        header.set_nesn(self.next_expected_seq_num);
        {
            let mut writer = ByteWriter::new(&mut buf[..2]);
            header.to_bytes(&mut writer).unwrap();
        }

        self.last_tx = buf;
        self.last_tx_len = 2 + len;
        self.awaiting_ack = true;
    }

    /// Processes a just-received data channel packet (header + payload, CRC already verified).
    pub fn process_rx(&mut self, packet: &[u8]) -> Result<ConnEvent, Error> {
        if packet.len() < 2 {
            return Err(Error::InvalidLength);
        }

        let mut raw_header = [0u8; 2];
        raw_header.copy_from_slice(&packet[..2]);
        let header = Header::parse(&raw_header);
        let payload_len = usize::from(header.payload_length());
        let payload = packet.get(2..2 + payload_len).ok_or(Error::InvalidLength)?;

        self.window_widening = Duration::from_micros(0);
        self.last_rx_instant = self.anchor;
        self.consecutive_crc_errors = 0;

        // The peer's NESN tells us whether our last transmission was received.
        if header.nesn() != self.transmit_seq_num {
            self.transmit_seq_num += SeqNum::ONE;
            self.awaiting_ack = false;
        }

        let is_new = header.sn() == self.next_expected_seq_num;
        if is_new {
            self.next_expected_seq_num += SeqNum::ONE;
        } else {
            // Retransmission of a PDU we've already processed; only the ack bookkeeping above
            // matters.
            return Ok(ConnEvent::Empty);
        }

        let pdu = data::Pdu::<&[u8]>::parse(header, payload)?;
        match pdu {
            data::Pdu::Control { data } => self.handle_control_pdu(data),
            data::Pdu::DataStart { message } | data::Pdu::DataCont { message }
                if message.is_empty() =>
            {
                Ok(ConnEvent::Empty)
            }
            data::Pdu::DataStart { message } => {
                self.deliver(Llid::DataStart, message)?;
                Ok(ConnEvent::Data)
            }
            data::Pdu::DataCont { message } => {
                self.deliver(Llid::DataCont, message)?;
                Ok(ConnEvent::Data)
            }
        }
    }

    fn deliver(&mut self, llid: Llid, message: &[u8]) -> Result<(), Error> {
        self.rx
            .produce_with(message.len() as u8, |writer| -> Result<Llid, Error> {
                writer.write_slice(message)?;
                Ok(llid)
            })
    }

    fn handle_control_pdu(&mut self, data: &[u8]) -> Result<ConnEvent, Error> {
        let raw = LlcpRawPdu::new(data).ok_or(Error::InvalidLength)?;

        match raw.decode() {
            Some(llcp::PduRef::TerminateInd(ind)) => {
                return Ok(ConnEvent::Disconnected(ind.error_code()));
            }
            Some(llcp::PduRef::FeatureReq(_)) => {
                self.queue_control_response(LlcpPdu::FeatureRsp(FeatureRsp::new(
                    FeatureSet::supported(),
                )))?;
            }
            Some(llcp::PduRef::VersionInd(_)) => {
                self.queue_control_response(LlcpPdu::VersionInd(VersionInd::new(
                    BLUETOOTH_VERSION,
                    CompanyId::INTERNAL,
                    0,
                )))?;
            }
            Some(_) | None => {
                self.queue_control_response(LlcpPdu::UnknownRsp(llcp::UnknownRsp::new(
                    raw.opcode(),
                )))?;
            }
        }
        Ok(ConnEvent::Control)
    }

    fn queue_control_response(&mut self, pdu: LlcpPdu) -> Result<(), Error> {
        let mut buf = [0u8; MIN_DATA_PDU_BUF - 2];
        let used = {
            let mut writer = ByteWriter::new(&mut buf);
            pdu.to_bytes(&mut writer)?;
            buf.len() - writer.space_left()
        };
        self.pending_control = Some((buf, used as u8));
        Ok(())
    }

    /// Queues `LL_TERMINATE_IND` for transmission at the next opportunity.
    pub fn terminate(&mut self, reason: u8) -> Result<(), Error> {
        self.queue_control_response(LlcpPdu::TerminateInd(llcp::TerminateInd::new(reason)))
    }

    /// Returns the RX listen window to use for the current connection event, including window
    /// widening to compensate for the peer's sleep-clock drift since the last successful receive.
    ///
    /// The window is `2 x (rx_timeout_base + window_widening)`: the anchor point is only accurate
    /// to within `window_widening` on either side, so the window must cover the drift in both
    /// directions.
    pub fn rx_window(&self) -> Duration {
        let half = RX_WINDOW_JITTER + self.window_widening;
        half + half
    }

    /// Compounds `window_widening` by one more connection event's worth of drift:
    /// `window_widening_us += ceil(conn_interval_us * (1 + slave_latency) * (local_sca_ppm +
    /// peer_sca_ppm) / 1e6)`.
    ///
    /// `peer_sca_ppm` comes from the 3-bit SCA field this device generated into `CONNECT_IND`
    /// (there is no other channel for the peer to advertise its own accuracy in this role); it is
    /// not reset until a PDU is actually received, so repeated missed events keep compounding.
    fn accumulate_window_widening(&mut self) {
        let multiplier = u64::from(1 + self.slave_latency);
        let interval_us = u64::from(self.conn_interval.as_micros());
        let total_ppm = u64::from(C::LOCAL_SCA_PPM) + u64::from(self.master_sca.ppm());
        let added_us = (multiplier * interval_us * total_ppm + 999_999) / 1_000_000;
        let added = Duration::from_micros(added_us.min(u64::from(u32::MAX)) as u32);
        self.window_widening += added;
    }

    /// Whether the connection supervision timeout has elapsed without a single packet received
    /// from the peer.
    pub fn supervision_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_rx_instant) > self.supervision_timeout
    }

    /// Records a missed connection event (CRC failure or RX timeout on the listen window).
    ///
    /// Counts toward both the consecutive-failure trip (§4.2: "Six consecutive RX failures: link
    /// stays up. Seventh: disconnection surfaced with `Timeout`") and the lifetime total exposed
    /// for diagnostics.
    pub fn register_crc_error(&mut self) {
        self.consecutive_crc_errors = self.consecutive_crc_errors.saturating_add(1);
        self.total_crc_errors = self.total_crc_errors.saturating_add(1);
    }

    /// Records a connection event where the RX window elapsed with nothing received at all.
    pub fn register_rx_timeout(&mut self) {
        self.consecutive_crc_errors = self.consecutive_crc_errors.saturating_add(1);
        self.total_timeouts = self.total_timeouts.saturating_add(1);
    }

    /// Records the RSSI observed on the most recent successful receive.
    pub fn record_rssi(&mut self, rssi_dbm: i8) {
        self.last_rssi_dbm = rssi_dbm;
    }

    /// RSSI, in dBm, of the most recently received packet.
    pub fn last_rssi_dbm(&self) -> i8 {
        self.last_rssi_dbm
    }

    /// Number of connection events in a row that have ended without a valid receive.
    pub fn consecutive_crc_errors(&self) -> u8 {
        self.consecutive_crc_errors
    }

    /// Lifetime count of CRC failures and RX timeouts observed on this connection.
    pub fn total_crc_errors(&self) -> u32 {
        self.total_crc_errors
    }

    /// Lifetime count of connection events whose RX window elapsed with nothing received.
    pub fn total_timeouts(&self) -> u32 {
        self.total_timeouts
    }

    /// Whether the link should be declared lost: either the consecutive-failure trip fired, or the
    /// supervision timeout elapsed without a single valid receive.
    pub fn link_lost(&self, now: Instant) -> bool {
        self.consecutive_crc_errors > 6 || self.supervision_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        link::{
            advertising::ConnectRequestData,
            channel_map::ChannelMap,
            device_address::{AddressKind, DeviceAddress},
            filter::AllowAll,
            queue::{PacketQueue, SimpleQueue},
        },
        phy::DataChannel,
        radio::{Radio, RadioEvent, RadioMode},
        time::Timer,
    };
    use core::marker::PhantomData;
    use rand_core::RngCore;

    struct NullRadio;
    impl Radio for NullRadio {
        fn set_freq_hz(&mut self, _freq_hz: u32) {}
        fn set_sync_word_32(&mut self, _access_address: u32) {}
        fn set_whitening_seed(&mut self, _seed: u8) {}
        fn set_crc_init_24(&mut self, _crc_init: u32) {}
        fn set_mode(&mut self, _mode: RadioMode) {}
        fn submit_tx(&mut self, _buf: &[u8]) -> bool {
            true
        }
        fn poll_irq(&mut self) -> RadioEvent {
            RadioEvent::None
        }
        fn read_rx(&mut self, _buf: &mut [u8]) -> u8 {
            0
        }
        fn rssi_dbm(&self) -> i8 {
            0
        }
        fn reset(&mut self) {}
    }

    struct ZeroTimer;
    impl Timer for ZeroTimer {
        fn now(&self) -> Instant {
            Instant::from_raw_micros(0)
        }
    }

    struct ZeroRng;
    impl RngCore for ZeroRng {
        fn next_u32(&mut self) -> u32 {
            0
        }
        fn next_u64(&mut self) -> u64 {
            0
        }
        fn fill_bytes(&mut self, dest: &mut [u8]) {
            for b in dest {
                *b = 0;
            }
        }
        fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
            self.fill_bytes(dest);
            Ok(())
        }
    }

    struct TestConfig<'a>(PhantomData<&'a ()>);
    impl<'a> Config for TestConfig<'a> {
        type Timer = ZeroTimer;
        type Radio = NullRadio;
        type PacketQueue = &'a mut SimpleQueue;
        type Rng = ZeroRng;
        type Filter = AllowAll;
    }

    fn conn_ind(channel_map: ChannelMap, hop: u8) -> ConnectIndPayload {
        ConnectIndPayload {
            init_a: DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Public),
            adv_a: DeviceAddress::new([6, 5, 4, 3, 2, 1], AddressKind::Random),
            data: ConnectRequestData {
                access_address: 0x1234_5678,
                crc_init: 0x0000_55,
                win_size: Duration::from_micros(1250),
                win_offset: Duration::from_micros(0),
                interval: Duration::from_micros(80 * 1250),
                slave_latency: 0,
                supervision_timeout: Duration::from_micros(6_000_000),
                channel_map,
                hop,
                master_sca: Sca::Ppm0To20,
            },
        }
    }

    macro_rules! new_connection {
        ($tx_q:ident, $rx_q:ident, $payload:expr) => {{
            let (_tx_p, tx_c) = (&mut $tx_q).split();
            let (rx_p, _rx_c) = (&mut $rx_q).split();
            Connection::<TestConfig<'_>>::create(&$payload, Instant::from_raw_micros(0), tx_c, rx_p)
        }};
    }

    #[test]
    fn hops_in_a_straight_walk_when_all_channels_used() {
        let payload = conn_ind(ChannelMap::with_all_channels(), 7);
        let mut tx_q = SimpleQueue::new();
        let mut rx_q = SimpleQueue::new();
        let mut conn = new_connection!(tx_q, rx_q, payload);

        let (ch, _) = conn.start_event();
        assert_eq!(ch, DataChannel::new(7));
        let (ch, _) = conn.start_event();
        assert_eq!(ch, DataChannel::new(14));
        let (ch, _) = conn.start_event();
        assert_eq!(ch, DataChannel::new(21));
    }

    #[test]
    fn remaps_unmapped_channels_into_the_used_set() {
        let payload = conn_ind(ChannelMap::from_raw([0b0001_1111, 0, 0, 0, 0]), 9);
        let mut tx_q = SimpleQueue::new();
        let mut rx_q = SimpleQueue::new();
        let mut conn = new_connection!(tx_q, rx_q, payload);

        // unmapped = 9, 9 % 5 == 4
        let (ch, _) = conn.start_event();
        assert_eq!(ch, DataChannel::new(4));
        // unmapped = 18, 18 % 5 == 3
        let (ch, _) = conn.start_event();
        assert_eq!(ch, DataChannel::new(3));
    }

    #[test]
    fn six_consecutive_failures_keep_the_link_up_the_seventh_trips_it() {
        let payload = conn_ind(ChannelMap::with_all_channels(), 7);
        let mut tx_q = SimpleQueue::new();
        let mut rx_q = SimpleQueue::new();
        let mut conn = new_connection!(tx_q, rx_q, payload);

        for _ in 0..6 {
            conn.register_crc_error();
        }
        assert!(!conn.link_lost(Instant::from_raw_micros(0)));

        conn.register_crc_error();
        assert!(conn.link_lost(Instant::from_raw_micros(0)));
        assert_eq!(conn.total_crc_errors(), 7);
    }

    #[test]
    fn a_valid_receive_resets_the_consecutive_failure_count() {
        let payload = conn_ind(ChannelMap::with_all_channels(), 7);
        let mut tx_q = SimpleQueue::new();
        let mut rx_q = SimpleQueue::new();
        let mut conn = new_connection!(tx_q, rx_q, payload);

        for _ in 0..4 {
            conn.register_crc_error();
        }
        assert_eq!(conn.consecutive_crc_errors(), 4);

        // An empty data PDU with matching SN/NESN (both zero, as initialized by `create`).
        let mut header = Header::new(Llid::DataCont);
        header.set_payload_length(0);
        header.set_sn(SeqNum::ZERO);
        header.set_nesn(SeqNum::ZERO);
        let mut raw = [0u8; 2];
        {
            let mut writer = ByteWriter::new(&mut raw);
            header.to_bytes(&mut writer).unwrap();
        }

        conn.process_rx(&raw).unwrap();
        assert_eq!(conn.consecutive_crc_errors(), 0);
    }
}
