//! Relay board actuation.
//!
//! Each machine owns three consecutive 1-indexed channels; ON means the pair
//! is faulted. The board handle is a two-state link (`Disconnected` or
//! `Connected`) guarded by one mutex. A failed write drops the link and the
//! next attempt reacquires it, so an absent board degrades to a no-op that
//! keeps trying on every write. After [`RelayActuator::shutdown`] the
//! actuator is closed: writes are refused and the board is never reopened.

use std::{
    collections::BTreeMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};
use video_ingest::MachineId;

/// Channel count of the supported boards.
pub const RELAY_CHANNELS: u8 = 16;
pub const CHANNELS_PER_MACHINE: usize = 3;

const TEST_PULSE: Duration = Duration::from_secs(1);
const TEST_GAP: Duration = Duration::from_millis(500);

/// An open relay board.
pub trait RelayBoard: Send {
    /// Drive 1-indexed `channel` on or off.
    fn set_state(&mut self, channel: u8, on: bool) -> anyhow::Result<()>;
}

/// Locates and opens the board. Returns [`RelayError::BoardNotFound`] when
/// no board is attached.
pub trait RelayBoardOpener: Send + Sync {
    fn open(&self) -> Result<Box<dyn RelayBoard>, RelayError>;
}

/// Opener used when no relay backend is compiled in.
pub struct NoRelayBoard;

impl RelayBoardOpener for NoRelayBoard {
    fn open(&self) -> Result<Box<dyn RelayBoard>, RelayError> {
        Err(RelayError::BoardNotFound)
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("relay board not found")]
    BoardNotFound,
    #[error("relay actuator is shut down")]
    Closed,
    #[error("relay channel {channel} write failed: {reason}")]
    Write { channel: u8, reason: String },
    #[error("{machine_id}: start channel {start} leaves no room for three relays (1..=14)")]
    InvalidRange { machine_id: MachineId, start: u8 },
    #[error("relay channel {channel} is outside 1..=16")]
    InvalidChannel { channel: u8 },
    #[error("{machine_id}: relay block overlaps {other}")]
    Overlap {
        machine_id: MachineId,
        other: MachineId,
    },
    #[error("{0}: no relay block configured")]
    UnknownMachine(MachineId),
    #[error("relay channel(s) {channels:?} could not be written")]
    ChannelsFailed { channels: Vec<u8> },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RelaySettings {
    /// Attempts per channel write.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

enum BoardLink {
    Disconnected,
    Connected(Box<dyn RelayBoard>),
}

pub struct RelayActuator {
    opener: Arc<dyn RelayBoardOpener>,
    settings: RelaySettings,
    link: Mutex<BoardLink>,
    closed: AtomicBool,
    machines: RwLock<BTreeMap<MachineId, [u8; CHANNELS_PER_MACHINE]>>,
}

impl RelayActuator {
    pub fn new(opener: Arc<dyn RelayBoardOpener>, settings: RelaySettings) -> Self {
        Self {
            opener,
            settings,
            link: Mutex::new(BoardLink::Disconnected),
            closed: AtomicBool::new(false),
            machines: RwLock::new(BTreeMap::new()),
        }
    }

    /// Open the board and drive every channel OFF. Returns whether a board
    /// is connected.
    pub fn initialize(&self) -> bool {
        info!("initializing relay board");
        {
            let mut link = self.lock_link();
            self.reacquire(&mut link);
        }
        match self.reset_all() {
            Ok(()) => true,
            Err(RelayError::BoardNotFound) => {
                error!("relay board not found; relay outputs disabled until it appears");
                false
            }
            Err(err) => {
                warn!("relay board connected but reset failed: {err}");
                self.is_connected()
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(*self.lock_link(), BoardLink::Connected(_))
    }

    pub fn settings(&self) -> RelaySettings {
        self.settings
    }

    /// Assign `start..start+3` to `machine_id` and drive the block OFF.
    /// Write failures while clearing the block are logged, not returned.
    pub fn configure_machine(
        &self,
        machine_id: MachineId,
        start: u8,
    ) -> Result<[u8; CHANNELS_PER_MACHINE], RelayError> {
        if start < 1 || start > RELAY_CHANNELS - 2 {
            return Err(RelayError::InvalidRange { machine_id, start });
        }
        let channels = [start, start + 1, start + 2];
        {
            let mut machines = self.machines.write().unwrap_or_else(PoisonError::into_inner);
            if let Some((&other, _)) = machines.iter().find(|(id, block)| {
                **id != machine_id && block.iter().any(|ch| channels.contains(ch))
            }) {
                return Err(RelayError::Overlap { machine_id, other });
            }
            machines.insert(machine_id, channels);
        }
        info!("{machine_id}: relays {channels:?} (pair1..pair3)");

        if let Err(err) = self.set_machine_relays(machine_id, [false; CHANNELS_PER_MACHINE]) {
            warn!("{machine_id}: could not clear relay block: {err}");
        }
        Ok(channels)
    }

    pub fn machine_channels(&self, machine_id: MachineId) -> Option<[u8; CHANNELS_PER_MACHINE]> {
        self.machines
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&machine_id)
            .copied()
    }

    /// Drive the machine's block from a fault vector (`true` = ON). Every
    /// channel is attempted even when another one fails.
    pub fn set_machine_relays(
        &self,
        machine_id: MachineId,
        faults: [bool; CHANNELS_PER_MACHINE],
    ) -> Result<(), RelayError> {
        let channels = self
            .machine_channels(machine_id)
            .ok_or(RelayError::UnknownMachine(machine_id))?;

        let mut failed = Vec::new();
        for (pair, (channel, on)) in channels.into_iter().zip(faults).enumerate() {
            if let Err(err) = self.write_with_retry(channel, on) {
                debug!("{machine_id}: pair{} relay {channel}: {err}", pair + 1);
                failed.push(channel);
            }
        }

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RelayError::ChannelsFailed { channels: failed })
        }
    }

    pub fn reset_machine_relays(&self, machine_id: MachineId) -> Result<(), RelayError> {
        info!("{machine_id}: resetting relays to OFF");
        self.set_machine_relays(machine_id, [false; CHANNELS_PER_MACHINE])
    }

    /// Drive all channels OFF in a single pass. Idempotent.
    pub fn reset_all(&self) -> Result<(), RelayError> {
        let mut link = self.lock_link();
        if self.is_closed() {
            return Err(RelayError::Closed);
        }
        self.reacquire(&mut link);
        Self::reset_channels(&mut link)
    }

    fn reset_channels(link: &mut BoardLink) -> Result<(), RelayError> {
        let BoardLink::Connected(board) = link else {
            return Err(RelayError::BoardNotFound);
        };

        let mut failed = Vec::new();
        for channel in 1..=RELAY_CHANNELS {
            if let Err(err) = board.set_state(channel, false) {
                error!("failed to reset relay {channel}: {err}");
                metrics::counter!("monitor_relay_write_failures_total").increment(1);
                failed.push(channel);
            }
        }
        if failed.is_empty() {
            info!("all relays reset to OFF");
            Ok(())
        } else {
            Err(RelayError::ChannelsFailed { channels: failed })
        }
    }

    /// Pulse one channel ON for a second.
    pub fn test_relay(&self, channel: u8) -> Result<(), RelayError> {
        if !(1..=RELAY_CHANNELS).contains(&channel) {
            return Err(RelayError::InvalidChannel { channel });
        }
        info!("testing relay {channel}");
        self.write_with_retry(channel, true)?;
        thread::sleep(TEST_PULSE);
        self.write_with_retry(channel, false)
    }

    pub fn test_machine_relays(&self, machine_id: MachineId) -> Result<(), RelayError> {
        let channels = self
            .machine_channels(machine_id)
            .ok_or(RelayError::UnknownMachine(machine_id))?;
        for (pair, channel) in channels.into_iter().enumerate() {
            info!("{machine_id}: testing pair{} relay {channel}", pair + 1);
            self.test_relay(channel)?;
            thread::sleep(TEST_GAP);
        }
        Ok(())
    }

    /// Drive everything OFF, release the board and close the actuator.
    /// Writes still in flight on other threads become no-ops.
    pub fn shutdown(&self) {
        let mut link = self.lock_link();
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down relay board");
        if matches!(*link, BoardLink::Disconnected) {
            if let Ok(board) = self.opener.open() {
                *link = BoardLink::Connected(board);
            }
        }
        if let Err(err) = Self::reset_channels(&mut link) {
            warn!("relay reset during shutdown failed: {err}");
        }
        *link = BoardLink::Disconnected;
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn write_with_retry(&self, channel: u8, on: bool) -> Result<(), RelayError> {
        let attempts = self.settings.max_retries.max(1);
        let mut last_error = RelayError::BoardNotFound;

        for attempt in 1..=attempts {
            {
                let mut link = self.lock_link();
                if self.is_closed() {
                    return Err(RelayError::Closed);
                }
                self.reacquire(&mut link);
                let BoardLink::Connected(board) = &mut *link else {
                    return Err(RelayError::BoardNotFound);
                };
                match board.set_state(channel, on) {
                    Ok(()) => return Ok(()),
                    Err(err) => {
                        warn!("relay {channel} write failed (attempt {attempt}/{attempts}): {err}");
                        metrics::counter!("monitor_relay_write_failures_total").increment(1);
                        last_error = RelayError::Write {
                            channel,
                            reason: err.to_string(),
                        };
                        *link = BoardLink::Disconnected;
                    }
                }
            }
            if attempt < attempts {
                thread::sleep(self.settings.retry_delay);
            }
        }
        Err(last_error)
    }

    fn reacquire(&self, link: &mut BoardLink) {
        if matches!(link, BoardLink::Connected(_)) || self.is_closed() {
            return;
        }
        match self.opener.open() {
            Ok(board) => {
                info!("relay board connected");
                *link = BoardLink::Connected(board);
            }
            Err(RelayError::BoardNotFound) => {}
            Err(err) => debug!("relay board reacquire failed: {err}"),
        }
    }

    fn lock_link(&self) -> MutexGuard<'_, BoardLink> {
        self.link.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashSet;

    use super::*;

    /// In-memory board shared between the opener and the assertions.
    #[derive(Default)]
    pub(crate) struct BoardState {
        pub present: bool,
        pub states: [bool; RELAY_CHANNELS as usize + 1],
        pub failing: HashSet<u8>,
        pub writes: Vec<(u8, bool)>,
        pub opens: usize,
    }

    #[derive(Clone, Default)]
    pub(crate) struct MockOpener(pub Arc<Mutex<BoardState>>);

    impl MockOpener {
        pub fn present() -> Self {
            let opener = Self::default();
            opener.0.lock().unwrap().present = true;
            opener
        }
    }

    struct MockBoard(Arc<Mutex<BoardState>>);

    impl RelayBoard for MockBoard {
        fn set_state(&mut self, channel: u8, on: bool) -> anyhow::Result<()> {
            let mut state = self.0.lock().unwrap();
            state.writes.push((channel, on));
            if state.failing.contains(&channel) {
                anyhow::bail!("stuck channel");
            }
            state.states[channel as usize] = on;
            Ok(())
        }
    }

    impl RelayBoardOpener for MockOpener {
        fn open(&self) -> Result<Box<dyn RelayBoard>, RelayError> {
            let mut state = self.0.lock().unwrap();
            state.opens += 1;
            if state.present {
                Ok(Box::new(MockBoard(self.0.clone())))
            } else {
                Err(RelayError::BoardNotFound)
            }
        }
    }

    fn actuator(opener: &MockOpener) -> RelayActuator {
        actuator_with_delay(opener, Duration::ZERO)
    }

    fn actuator_with_delay(opener: &MockOpener, retry_delay: Duration) -> RelayActuator {
        RelayActuator::new(
            Arc::new(opener.clone()),
            RelaySettings {
                max_retries: 3,
                retry_delay,
            },
        )
    }

    #[test]
    fn failing_channel_does_not_block_the_others() {
        let opener = MockOpener::present();
        let relays = actuator(&opener);
        relays.configure_machine(MachineId(1), 6).unwrap();
        opener.0.lock().unwrap().failing.insert(7);

        let err = relays
            .set_machine_relays(MachineId(1), [true, true, true])
            .unwrap_err();
        assert!(matches!(err, RelayError::ChannelsFailed { ref channels } if channels == &[7]));

        let state = opener.0.lock().unwrap();
        assert!(state.states[6]);
        assert!(!state.states[7]);
        assert!(state.states[8]);
        let attempts_on_7 = state.writes.iter().filter(|(ch, on)| *ch == 7 && *on).count();
        assert_eq!(attempts_on_7, 3);
    }

    #[test]
    fn reset_all_is_idempotent() {
        let opener = MockOpener::present();
        let relays = actuator(&opener);
        relays.configure_machine(MachineId(2), 9).unwrap();
        relays
            .set_machine_relays(MachineId(2), [true, false, true])
            .unwrap();

        relays.reset_all().unwrap();
        relays.reset_all().unwrap();
        let state = opener.0.lock().unwrap();
        assert!(state.states.iter().all(|on| !on));
    }

    #[test]
    fn ranges_are_validated() {
        let relays = actuator(&MockOpener::present());
        assert!(matches!(
            relays.configure_machine(MachineId(1), 0),
            Err(RelayError::InvalidRange { .. })
        ));
        assert!(matches!(
            relays.configure_machine(MachineId(1), 15),
            Err(RelayError::InvalidRange { .. })
        ));
        assert_eq!(relays.configure_machine(MachineId(1), 14).unwrap(), [14, 15, 16]);
        assert!(matches!(
            relays.configure_machine(MachineId(2), 12),
            Err(RelayError::Overlap { other: MachineId(1), .. })
        ));
        relays.configure_machine(MachineId(1), 1).unwrap();
        assert_eq!(relays.machine_channels(MachineId(1)), Some([1, 2, 3]));
        assert!(matches!(
            relays.set_machine_relays(MachineId(5), [false; 3]),
            Err(RelayError::UnknownMachine(MachineId(5)))
        ));
    }

    #[test]
    fn absent_board_is_a_noop_that_keeps_reacquiring() {
        let opener = MockOpener::default();
        let relays = actuator(&opener);
        assert!(!relays.initialize());
        relays.configure_machine(MachineId(1), 1).unwrap();
        let opens_before = opener.0.lock().unwrap().opens;

        assert!(relays.set_machine_relays(MachineId(1), [true; 3]).is_err());
        assert_eq!(opener.0.lock().unwrap().opens, opens_before + 3);
        assert!(matches!(relays.reset_all(), Err(RelayError::BoardNotFound)));

        opener.0.lock().unwrap().present = true;
        relays.set_machine_relays(MachineId(1), [true; 3]).unwrap();
        assert!(relays.is_connected());
        assert!(opener.0.lock().unwrap().states[1..=3].iter().all(|on| *on));
    }

    #[test]
    fn shutdown_clears_and_releases() {
        let opener = MockOpener::present();
        let relays = actuator(&opener);
        assert!(relays.initialize());
        relays.configure_machine(MachineId(1), 4).unwrap();
        relays.set_machine_relays(MachineId(1), [true; 3]).unwrap();
        relays.shutdown();
        assert!(!relays.is_connected());
        assert!(opener.0.lock().unwrap().states.iter().all(|on| !on));
    }

    #[test]
    fn writes_in_flight_during_shutdown_leave_relays_off() {
        let opener = MockOpener::present();
        let relays = Arc::new(actuator_with_delay(&opener, Duration::from_millis(300)));
        assert!(relays.initialize());
        relays.configure_machine(MachineId(1), 1).unwrap();
        opener.0.lock().unwrap().failing.insert(1);

        let writer = {
            let relays = relays.clone();
            thread::spawn(move || relays.set_machine_relays(MachineId(1), [true, true, true]))
        };
        thread::sleep(Duration::from_millis(100));
        relays.shutdown();
        let opens_after_shutdown = opener.0.lock().unwrap().opens;

        let result = writer.join().unwrap();
        assert!(matches!(
            result,
            Err(RelayError::ChannelsFailed { ref channels }) if channels == &[1, 2, 3]
        ));
        let state = opener.0.lock().unwrap();
        assert!(state.states.iter().all(|on| !on));
        assert_eq!(state.opens, opens_after_shutdown);
        drop(state);

        assert!(relays.is_closed());
        assert!(!relays.is_connected());
        assert!(matches!(
            relays.set_machine_relays(MachineId(1), [true; 3]),
            Err(RelayError::ChannelsFailed { .. })
        ));
        assert!(matches!(relays.reset_all(), Err(RelayError::Closed)));
        assert!(opener.0.lock().unwrap().states.iter().all(|on| !on));
    }
}
