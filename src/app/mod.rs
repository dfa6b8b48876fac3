//! Application-level state machine: scan, connect, exchange text, disconnect.
//!
//! This is the only layer in the stack that is allowed to make policy decisions (retry counts,
//! timeouts, auto-reconnect) rather than just speaking a wire protocol correctly. It drives
//! [`LinkLayer`] and [`AttClient`] from a single non-blocking [`App::process`] tick and never
//! sleeps in place; every timeout is a deadline compared against the `now` passed into that tick.
//!
//! # States
//!
//! ```notrust
//! Init ---------------------------------> Idle
//! Idle ----------- scan()/connect() -----> Scanning
//! Scanning ------- advertiser matched ----> Connecting     (only when connect() set a target)
//! Scanning ------- scan_timeout ----------> Idle
//! Connecting ----- first data exchange ---> Connected
//! Connecting ----- ll_failed / 5s timeout -> Scanning (retry, up to max_retries) or Error
//! Connected ------ send_text() -----------> Sending
//! Sending -------- last fragment acked ---> Connected, or Disconnecting if configured
//! Sending -------- write failed ----------> Error
//! Connected/Sending/Disconnecting -------> Idle           (link torn down, any cause)
//! Disconnecting -- ll_disconnected / 1s --> Idle
//! Error ---------- 3s elapsed ------------> Idle (retry counter reset)
//! Idle ----------- peer disconnect, auto_reconnect, reason != local -> Scanning
//! ```
//!
//! Every transition records the instant it was entered so the state's own timeout can be checked
//! against it on a later tick; nothing here blocks waiting for a deadline to arrive.

use crate::{
    att::{AttClient, ClientEvent, PeerClass},
    config::{ConfConsumer, ConfProducer, Config},
    l2cap,
    link::{
        data::Pdu,
        queue::{Consume, Consumer, Producer},
        ConnParams, DeviceAddress, Event as LlEvent, LinkLayer,
    },
    time::{Duration, Instant},
    Error,
};

/// HCI "Connection Timeout" reason code; used when this layer gives up on a connection attempt
/// that never completed its first data exchange.
const REASON_CONNECTION_TIMEOUT: u8 = 0x08;

/// HCI "Connection Terminated by Local Host" reason code; used for application-requested
/// disconnects so [`App::on_disconnected`](App) can tell them apart from peer- or
/// supervision-initiated ones.
const REASON_LOCAL_HOST: u8 = 0x16;

/// Application-level connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    /// Not yet started; moves to `Idle` on the first [`App::process`] call.
    Init,
    /// No scan, connection attempt, or connection in progress.
    Idle,
    /// Scanning the advertising channels, optionally for a specific target.
    Scanning,
    /// `CONNECT_IND` was sent; waiting for the first successful data channel exchange.
    Connecting,
    /// A connection is established and idle (no write in flight).
    Connected,
    /// A fragmented characteristic write is in progress.
    Sending,
    /// `LL_TERMINATE_IND` has been queued; waiting for the link to actually go down.
    Disconnecting,
    /// The last operation failed; waiting out a fixed back-off before returning to `Idle`.
    Error,
}

/// Why a connection ended, as reported to [`EventHandler::on_disconnected`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    /// The application called [`App::disconnect`].
    User,
    /// The peer, or the local supervision/consecutive-failure trip, ended the link; carries the
    /// HCI-style reason code.
    Peer(u8),
}

/// Policy knobs for the application state machine. All fields have the defaults described on
/// [`AppConfig::default`]; override only what needs to differ.
#[derive(Debug, Clone, Copy)]
pub struct AppConfig {
    /// Deadline for finding a matching advertiser at all, from the moment scanning starts.
    /// `None` scans forever.
    pub scan_timeout: Option<Duration>,
    /// Deadline for completing the first data channel exchange after `CONNECT_IND` is sent.
    pub connect_timeout: Duration,
    /// Number of times a failed connection attempt is retried (by re-scanning) before giving up
    /// and entering `Error`.
    pub max_retries: u8,
    /// How long `Error` is held before automatically returning to `Idle` with the retry counter
    /// reset.
    pub error_backoff: Duration,
    /// Idle-link threshold purely for diagnostics: the Link-Layer already fills every connection
    /// event with an empty PDU when nothing else is queued, so no explicit keep-alive write is
    /// ever needed; this only controls how often [`Stats::keepalives`] is incremented.
    pub idle_keepalive: Duration,
    /// Deadline for the peer to acknowledge a locally-initiated disconnect before the application
    /// gives up waiting and declares `Idle` anyway.
    pub disconnect_timeout: Duration,
    /// Whether a peer- or supervision-initiated disconnect (not a user-requested one) should
    /// trigger an automatic re-scan for the same target.
    pub auto_reconnect: bool,
    /// Whether a completed text send should be followed by an automatic disconnect.
    pub disconnect_after_send: bool,
    /// Connection parameters proposed in `CONNECT_IND` for every connection attempt.
    pub conn_params: ConnParams,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            scan_timeout: None,
            connect_timeout: Duration::from_secs(5),
            max_retries: 3,
            error_backoff: Duration::from_secs(3),
            idle_keepalive: Duration::from_secs(10),
            disconnect_timeout: Duration::from_secs(1),
            auto_reconnect: false,
            disconnect_after_send: false,
            conn_params: ConnParams {
                interval: Duration::from_millis(30),
                slave_latency: 0,
                supervision_timeout: Duration::from_millis(4_000),
                win_size: Duration::from_micros(2_500),
                win_offset: Duration::from_micros(1_250),
            },
        }
    }
}

/// Connection/transaction counters exposed through [`App::status`] for the `status` console
/// command.
#[derive(Debug, Clone, Copy, Default)]
pub struct Stats {
    /// Number of times [`App::connect`] was called.
    pub connect_attempts: u32,
    /// Number of connections that reached `Connected`.
    pub connects: u32,
    /// Number of times a connection (established or not) ended.
    pub disconnects: u32,
    /// Number of failed connection attempts that were retried.
    pub retries: u32,
    /// Number of times the idle-link diagnostic threshold was crossed.
    pub keepalives: u32,
    /// Number of errors surfaced to [`EventHandler::on_error`].
    pub errors: u32,
}

/// A snapshot of the application state, for the `status` console command.
#[derive(Debug, Clone, Copy)]
pub struct Status {
    /// Current application state.
    pub state: AppState,
    /// Address passed to the most recent [`App::connect`] call, if any.
    pub target: Option<DeviceAddress>,
    /// RSSI of the most recently received packet, if connected.
    pub rssi_dbm: Option<i8>,
    /// Currently negotiated ATT MTU, if connected.
    pub mtu: Option<u16>,
    /// Peer classification, if connected.
    pub peer_class: Option<PeerClass>,
    /// Running counters.
    pub stats: Stats,
}

/// Event sink the application registers once at startup.
///
/// All methods have empty default bodies, so implementations only need to override the events
/// they care about. Delivery is unidirectional: the stack never expects a return value or calls
/// back into `App` from inside a handler.
#[allow(unused_variables)]
pub trait EventHandler {
    /// An application state transition occurred.
    fn on_state_changed(&mut self, old: AppState, new: AppState) {}
    /// A connectable advertiser passed the scan filter.
    fn on_scan_match(&mut self, addr: DeviceAddress, rssi_dbm: i8) {}
    /// The first data channel exchange with `addr` completed.
    fn on_connected(&mut self, addr: DeviceAddress) {}
    /// The connection ended.
    fn on_disconnected(&mut self, cause: DisconnectCause) {}
    /// A notification or indication addressed to the peer's RX characteristic arrived.
    fn on_text_received(&mut self, text: &[u8]) {}
    /// An operation failed and the failure is visible to the application.
    fn on_error(&mut self, err: Error) {}
}

/// Supplies a fresh pair of packet queues for each connection attempt.
///
/// [`App`] calls [`uplink`](QueueSource::uplink) and [`downlink`](QueueSource::downlink) exactly
/// once per [`connect`](App::connect)/retry, immediately before handing the Link-Layer-facing
/// halves to [`LinkLayer::start_connect`]; the application-facing halves are kept until the
/// connection ends. Implementations typically wrap a pair of `'static mut` [`SimpleQueue`]s (the
/// same storage a board support package already needs for `Config::PacketQueue`) and re-split
/// them on every call — safe as long as the previous connection's halves have already been
/// dropped, which `App` guarantees by construction.
///
/// [`SimpleQueue`]: crate::link::queue::SimpleQueue
pub trait QueueSource<C: Config> {
    /// Splits the uplink queue (application PDUs bound for the radio), returning the
    /// application-facing producer and the Link-Layer-facing consumer.
    fn uplink(&mut self) -> (ConfProducer<C>, ConfConsumer<C>);

    /// Splits the downlink queue (reassembled data arriving from the radio), returning the
    /// Link-Layer-facing producer and the application-facing consumer.
    fn downlink(&mut self) -> (ConfProducer<C>, ConfConsumer<C>);
}

/// Steps of the fixed bring-up sequence run once per connection, before the application's own
/// traffic starts: negotiate MTU, classify the peer, then (class A only) run the placeholder
/// authentication handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bringup {
    NotStarted,
    Mtu,
    Classify,
    Auth,
    Done,
}

/// Drives scan → connect → write → disconnect against a single peripheral.
///
/// Owns the Link-Layer, the ATT client, and the L2CAP reassembler for the one connection this
/// stack ever maintains at a time. [`process`](App::process) is the only method that advances
/// time-based state or touches the radio (via the owned [`LinkLayer`]); every other method just
/// validates the caller's request against the current state and records intent.
pub struct App<C: Config, H: EventHandler, Q: QueueSource<C>> {
    ll: LinkLayer<C>,
    att: AttClient,
    reassembler: l2cap::Reassembler,
    handler: H,
    queues: Q,
    config: AppConfig,

    state: AppState,
    state_entered_at: Instant,
    target: Option<DeviceAddress>,
    retry_count: u8,
    pending_reconnect: Option<DeviceAddress>,
    disconnect_cause: Option<DisconnectCause>,
    bringup: Bringup,
    last_activity: Instant,

    app_tx: Option<ConfProducer<C>>,
    app_rx: Option<ConfConsumer<C>>,

    stats: Stats,
}

impl<C: Config, H: EventHandler, Q: QueueSource<C>> App<C, H, Q> {
    /// Creates a new application state machine in `Init`, wrapping an already-constructed
    /// [`LinkLayer`].
    pub fn new(ll: LinkLayer<C>, handler: H, queues: Q, config: AppConfig) -> Self {
        Self {
            ll,
            att: AttClient::new(),
            reassembler: l2cap::Reassembler::new(),
            handler,
            queues,
            config,
            state: AppState::Init,
            state_entered_at: Instant::from_raw_micros(0),
            target: None,
            retry_count: 0,
            pending_reconnect: None,
            disconnect_cause: None,
            bringup: Bringup::Done,
            last_activity: Instant::from_raw_micros(0),
            app_tx: None,
            app_rx: None,
            stats: Stats::default(),
        }
    }

    /// The current application state.
    pub fn state(&self) -> AppState {
        self.state
    }

    /// A snapshot of the application state, target, and running counters.
    pub fn status(&self) -> Status {
        let conn = self.ll.connection();
        Status {
            state: self.state,
            target: self.target,
            rssi_dbm: conn.map(|c| c.last_rssi_dbm()),
            mtu: conn.map(|_| self.att.mtu()),
            peer_class: conn.map(|_| self.att.peer_class()),
            stats: self.stats,
        }
    }

    /// Starts scanning for `target` and connects to it as soon as it is seen.
    ///
    /// Fails with [`Error::Busy`] unless called from `Idle`.
    pub fn connect(&mut self, target: DeviceAddress, now: Instant) -> Result<(), Error> {
        if self.state != AppState::Idle {
            return Err(Error::Busy);
        }
        self.retry_count = 0;
        self.stats.connect_attempts += 1;
        self.begin_connect(target, now)
    }

    /// Starts passive scanning with no target; matching advertisers are reported through
    /// [`EventHandler::on_scan_match`] but never connected to automatically.
    ///
    /// Fails with [`Error::Busy`] unless called from `Idle`.
    pub fn scan(&mut self, now: Instant) -> Result<(), Error> {
        if self.state != AppState::Idle {
            return Err(Error::Busy);
        }
        self.ll.start_scan(self.config.scan_timeout)?;
        self.target = None;
        self.enter(AppState::Scanning, now);
        Ok(())
    }

    /// Queues `text` to be written to the peer's TX characteristic, fragmented at `mtu - 3`
    /// bytes per write.
    ///
    /// Fails with [`Error::NotConnected`] unless called from `Connected`.
    pub fn send_text(&mut self, text: &[u8], now: Instant) -> Result<(), Error> {
        if self.state != AppState::Connected {
            return Err(Error::NotConnected);
        }
        let tx = self.app_tx.as_mut().ok_or(Error::NotConnected)?;
        self.att.begin_text_send(tx, text, now)?;
        self.last_activity = now;
        self.enter(AppState::Sending, now);
        Ok(())
    }

    /// Queues `LL_TERMINATE_IND` for the current connection.
    ///
    /// Fails with [`Error::NotConnected`] if no connection is established, or [`Error::Busy`] if
    /// a disconnect is already pending.
    pub fn disconnect(&mut self, now: Instant) -> Result<(), Error> {
        if self.state == AppState::Disconnecting {
            return Err(Error::Busy);
        }
        self.ll.disconnect(REASON_LOCAL_HOST)?;
        self.disconnect_cause = Some(DisconnectCause::User);
        self.enter(AppState::Disconnecting, now);
        Ok(())
    }

    /// Advances the state machine. Must be called repeatedly (eg. from the application main
    /// loop); never blocks and is safe to call with the same `now` value more than once.
    pub fn process(&mut self, now: Instant) {
        match self.state {
            AppState::Init => self.enter(AppState::Idle, now),
            AppState::Idle => self.tick_idle(now),
            AppState::Scanning => self.tick_scanning(now),
            AppState::Connecting => self.tick_connecting(now),
            AppState::Connected | AppState::Sending => self.tick_connected_or_sending(now),
            AppState::Disconnecting => self.tick_disconnecting(now),
            AppState::Error => self.tick_error(now),
        }
    }

    fn begin_connect(&mut self, target: DeviceAddress, now: Instant) -> Result<(), Error> {
        let (app_tx, ll_tx) = self.queues.uplink();
        let (ll_rx, app_rx) = self.queues.downlink();
        match self
            .ll
            .start_connect(target, self.config.conn_params, ll_tx, ll_rx, self.config.scan_timeout)
        {
            Ok(()) => {
                self.app_tx = Some(app_tx);
                self.app_rx = Some(app_rx);
                self.att = AttClient::new();
                self.reassembler.reset();
                self.bringup = Bringup::NotStarted;
                self.target = Some(target);
                self.last_activity = now;
                self.enter(AppState::Scanning, now);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn tick_idle(&mut self, now: Instant) {
        if let Some(target) = self.pending_reconnect.take() {
            self.retry_count = 0;
            let _ = self.begin_connect(target, now);
        }
    }

    fn tick_scanning(&mut self, now: Instant) {
        match self.ll.process(now) {
            LlEvent::ScanMatch { addr, rssi_dbm } => self.handler.on_scan_match(addr, rssi_dbm),
            LlEvent::ScanTimeout => {
                self.stats.errors += 1;
                self.handler.on_error(Error::Timeout);
                self.app_tx = None;
                self.app_rx = None;
                self.enter(AppState::Idle, now);
                return;
            }
            _ => {}
        }

        if self.target.is_some() && self.ll.connection().is_some() {
            self.enter(AppState::Connecting, now);
        }
    }

    fn tick_connecting(&mut self, now: Instant) {
        match self.ll.process(now) {
            LlEvent::Connected => {
                self.stats.connects += 1;
                self.retry_count = 0;
                if let Some(target) = self.target {
                    self.handler.on_connected(target);
                }
                self.last_activity = now;
                self.enter(AppState::Connected, now);
                self.advance_bringup(now);
                return;
            }
            LlEvent::Disconnected { .. } => {
                self.on_connect_failed(now);
                return;
            }
            _ => {}
        }

        if now.duration_since(self.state_entered_at) >= self.config.connect_timeout {
            // The connection never completed its first exchange. Queue a terminate and treat the
            // attempt as failed immediately; if `disconnect` itself can't be issued (eg. the
            // Connection already vanished between this check and the call), fail right away
            // rather than spinning here forever.
            if self.ll.disconnect(REASON_CONNECTION_TIMEOUT).is_err() {
                self.on_connect_failed(now);
            }
        }
    }

    fn on_connect_failed(&mut self, now: Instant) {
        self.app_tx = None;
        self.app_rx = None;
        self.stats.retries += 1;
        if self.retry_count < self.config.max_retries {
            self.retry_count += 1;
            match self.target {
                Some(target) => {
                    let _ = self.begin_connect(target, now);
                }
                None => self.enter(AppState::Idle, now),
            }
        } else {
            self.stats.errors += 1;
            self.handler.on_error(Error::Timeout);
            self.enter(AppState::Error, now);
        }
    }

    fn tick_connected_or_sending(&mut self, now: Instant) {
        if let LlEvent::Disconnected { reason } = self.ll.process(now) {
            self.on_disconnected(reason, now);
            return;
        }

        self.pump_rx(now);
        if self.att.poll_timeout(now) {
            self.stats.errors += 1;
            self.handler.on_error(Error::Timeout);
        }

        if now.duration_since(self.last_activity) >= self.config.idle_keepalive {
            // The Link-Layer already fills every connection event with an empty PDU when there is
            // nothing else queued, so there is nothing to transmit here; this only exists to keep
            // the diagnostic counter current.
            self.stats.keepalives += 1;
            self.last_activity = now;
        }

        if self.state == AppState::Sending {
            self.pump_text_send(now);
        }
    }

    fn pump_text_send(&mut self, now: Instant) {
        let App { att, app_tx, .. } = self;
        let tx = match app_tx.as_mut() {
            Some(tx) => tx,
            None => return,
        };
        match att.poll_text_send(tx, now) {
            Ok(true) => {
                self.last_activity = now;
                if self.config.disconnect_after_send {
                    let _ = self.disconnect(now);
                } else {
                    self.enter(AppState::Connected, now);
                }
            }
            Ok(false) => {}
            Err(_) => {
                self.stats.errors += 1;
                self.handler.on_error(Error::ProtocolError);
                self.enter(AppState::Error, now);
            }
        }
    }

    fn on_disconnected(&mut self, reason: u8, now: Instant) {
        self.app_tx = None;
        self.app_rx = None;
        self.stats.disconnects += 1;

        let cause = match self.disconnect_cause.take() {
            Some(DisconnectCause::User) => DisconnectCause::User,
            _ => DisconnectCause::Peer(reason),
        };
        self.handler.on_disconnected(cause);
        self.enter(AppState::Idle, now);

        if let DisconnectCause::Peer(r) = cause {
            if self.config.auto_reconnect && r != REASON_LOCAL_HOST {
                self.pending_reconnect = self.target;
            }
        }
    }

    fn tick_disconnecting(&mut self, now: Instant) {
        if let LlEvent::Disconnected { reason } = self.ll.process(now) {
            self.on_disconnected(reason, now);
            return;
        }

        if now.duration_since(self.state_entered_at) >= self.config.disconnect_timeout {
            // The peer never acknowledged; the supervision timer on its side will eventually tear
            // the link down regardless, but the application doesn't wait for that.
            self.app_tx = None;
            self.app_rx = None;
            self.stats.disconnects += 1;
            self.handler.on_disconnected(DisconnectCause::User);
            self.enter(AppState::Idle, now);
        }
    }

    fn tick_error(&mut self, now: Instant) {
        if now.duration_since(self.state_entered_at) >= self.config.error_backoff {
            self.retry_count = 0;
            self.enter(AppState::Idle, now);
        }
    }

    /// Kicks off the next step of the bring-up sequence, if any is pending and nothing else is
    /// currently using the transaction slot.
    fn advance_bringup(&mut self, now: Instant) {
        if self.bringup != Bringup::NotStarted || self.att.is_busy() {
            return;
        }
        let App { att, app_tx, .. } = self;
        if let Some(tx) = app_tx.as_mut() {
            if att.begin_mtu_exchange(tx, now).is_ok() {
                self.bringup = Bringup::Mtu;
            }
        }
    }

    /// Drains every reassembled L2CAP SDU waiting in the downlink queue through the ATT client,
    /// advancing the bring-up sequence and delivering text to the application as it goes.
    fn pump_rx(&mut self, now: Instant) {
        let App {
            reassembler,
            att,
            app_tx,
            app_rx,
            handler,
            stats,
            bringup,
            ..
        } = self;
        let (rx, tx) = match (app_rx.as_mut(), app_tx.as_mut()) {
            (Some(rx), Some(tx)) => (rx, tx),
            _ => return,
        };

        while rx.has_data() {
            let result: Result<(), Error> = rx.consume_pdu_with(|_, pdu| {
                let (is_start, message) = match pdu {
                    Pdu::DataStart { message } => (true, message),
                    Pdu::DataCont { message } => (false, message),
                    Pdu::Control { .. } => return Consume::always(Ok(())),
                };

                let sdu = if is_start {
                    reassembler.process_start(message)
                } else {
                    reassembler.process_cont(message)
                };

                match sdu {
                    Ok(Some(sdu)) => {
                        let event = att.handle_sdu(tx, sdu, now);
                        advance_on_client_event(event, bringup, att, tx, *handler, stats, now);
                        Consume::always(Ok(()))
                    }
                    Ok(None) => Consume::always(Ok(())),
                    Err(e) => Consume::always(Err(e)),
                }
            });

            if result.is_err() {
                break;
            }
        }
    }
}

/// Reacts to one [`ClientEvent`]: advances the bring-up sequence, or delivers received text and
/// errors to the application. Free function (rather than a method) so [`App::pump_rx`] can call
/// it after destructuring `self` into disjoint field borrows.
fn advance_on_client_event<H: EventHandler, P: Producer>(
    event: ClientEvent<'_>,
    bringup: &mut Bringup,
    att: &mut AttClient,
    tx: &mut P,
    handler: &mut H,
    stats: &mut Stats,
    now: Instant,
) {
    match event {
        ClientEvent::MtuNegotiated(_) => {
            if *bringup == Bringup::Mtu && att.begin_classification(tx, now).is_ok() {
                *bringup = Bringup::Classify;
            }
        }
        ClientEvent::Classified(class) => {
            if *bringup == Bringup::Classify {
                if class == PeerClass::A && att.begin_auth(tx, now).is_ok() {
                    *bringup = Bringup::Auth;
                } else {
                    *bringup = Bringup::Done;
                }
            }
        }
        ClientEvent::TextReceived(text) => handler.on_text_received(text),
        ClientEvent::Error(_) => stats.errors += 1,
        ClientEvent::Timeout | ClientEvent::None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        link::{
            filter::AllowAll,
            queue::{PacketQueue, SimpleQueue},
            AddressKind,
        },
        radio::{Radio, RadioEvent, RadioMode},
        time::Timer,
    };
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

    enum TestConfig {}
    impl Config for TestConfig {
        type Timer = ZeroTimer;
        type Radio = NullRadio;
        type PacketQueue = &'static mut SimpleQueue;
        type Rng = ZeroRng;
        type Filter = AllowAll;
    }

    // `QueueSource` implementations need storage that outlives every connection attempt; real
    // applications get this for free from the same `'static` queues their `Config::PacketQueue`
    // already names. A test has no such storage lying around, so it declares its own, exactly
    // the way a board support package's `static mut` resources would.
    static mut UPLINK: SimpleQueue = SimpleQueue::new();
    static mut DOWNLINK: SimpleQueue = SimpleQueue::new();

    struct StaticQueues;
    impl QueueSource<TestConfig> for StaticQueues {
        fn uplink(&mut self) -> (ConfProducer<TestConfig>, ConfConsumer<TestConfig>) {
            unsafe { (&mut UPLINK).split() }
        }
        fn downlink(&mut self) -> (ConfProducer<TestConfig>, ConfConsumer<TestConfig>) {
            unsafe { (&mut DOWNLINK).split() }
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        errors: u32,
        disconnects: u32,
    }
    impl EventHandler for RecordingHandler {
        fn on_error(&mut self, _err: Error) {
            self.errors += 1;
        }
        fn on_disconnected(&mut self, _cause: DisconnectCause) {
            self.disconnects += 1;
        }
    }

    fn new_app() -> App<TestConfig, RecordingHandler, StaticQueues> {
        let ll = LinkLayer::<TestConfig>::new(
            DeviceAddress::new([1, 2, 3, 4, 5, 6], AddressKind::Public),
            ZeroTimer,
            NullRadio,
            ZeroRng,
            AllowAll,
        );
        App::new(ll, RecordingHandler::default(), StaticQueues, AppConfig::default())
    }

    fn t(micros: u32) -> Instant {
        Instant::from_raw_micros(micros)
    }

    #[test]
    fn starts_idle_after_first_tick() {
        let mut app = new_app();
        assert_eq!(app.state(), AppState::Init);
        app.process(t(0));
        assert_eq!(app.state(), AppState::Idle);
    }

    #[test]
    fn send_text_requires_a_connection() {
        let mut app = new_app();
        app.process(t(0));
        assert_eq!(app.send_text(b"hi", t(0)), Err(Error::NotConnected));
    }

    #[test]
    fn disconnect_requires_a_connection() {
        let mut app = new_app();
        app.process(t(0));
        assert_eq!(app.disconnect(t(0)), Err(Error::NotConnected));
    }

    #[test]
    fn scan_timeout_surfaces_an_error_and_returns_to_idle() {
        let mut app = new_app();
        app.process(t(0));
        app.config.scan_timeout = Some(Duration::from_micros(1_000));
        app.scan(t(0)).unwrap();
        assert_eq!(app.state(), AppState::Scanning);

        app.process(t(2_000));
        assert_eq!(app.state(), AppState::Idle);
        assert_eq!(app.status().stats.errors, 1);
    }

    #[test]
    fn a_second_connect_attempt_while_busy_is_rejected() {
        let mut app = new_app();
        app.process(t(0));
        let target = DeviceAddress::new([6, 5, 4, 3, 2, 1], AddressKind::Random);
        app.connect(target, t(0)).unwrap();
        assert_eq!(app.connect(target, t(0)), Err(Error::Busy));
    }
}
