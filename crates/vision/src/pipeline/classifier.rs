//! Per-machine fault classification.
//!
//! Every cycle starts from zeroed slot counters: each detection above its
//! class threshold is placed by its box center into the same-class polygons,
//! and a pair is OK only with exactly one oil can and one bunk hole. Only the
//! fault records carry state from one cycle to the next.

use std::{
    path::Path,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use chrono::{DateTime, Local};
use ml_core::Detection;
use tracing::{debug, info, warn};
use video_ingest::MachineId;

use crate::pipeline::{
    boundaries::{BoundaryError, BoundarySet, PAIRS, SLOTS, SlotKey},
    config::ConfidenceThresholds,
    events::{EventBus, SystemEvent},
    relay::RelayActuator,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PairStatus {
    Ok,
    Fault,
}

impl PairStatus {
    pub fn label(self) -> &'static str {
        match self {
            PairStatus::Ok => "OK",
            PairStatus::Fault => "FAULT",
        }
    }

    pub fn is_fault(self) -> bool {
        self == PairStatus::Fault
    }
}

/// OK iff exactly one of each item landed in the pair's slots.
pub fn pair_status(oil_cans: u32, bunk_holes: u32) -> PairStatus {
    if oil_cans == 1 && bunk_holes == 1 {
        PairStatus::Ok
    } else {
        PairStatus::Fault
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FaultRecord {
    /// Set on entering FAULT, cleared on return to OK.
    pub first_fault_at: Option<DateTime<Local>>,
    /// Number of OK-to-FAULT entries since the last reset.
    pub fault_count: u64,
}

/// Snapshot published after every cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct MachineStats {
    pub total_cycles: u64,
    pub fault_count: u64,
    pub slot_counts: [u32; SLOTS],
    pub pair_statuses: [PairStatus; PAIRS],
    pub first_fault_at: [Option<DateTime<Local>>; PAIRS],
}

impl MachineStats {
    /// `HH:MM:SS` per pair, `-` while the pair is clear.
    pub fn fault_time_labels(&self) -> [String; PAIRS] {
        self.first_fault_at.map(|stamp| match stamp {
            Some(at) => at.format("%H:%M:%S").to_string(),
            None => "-".to_string(),
        })
    }
}

/// What one call to [`MachineClassifier::process`] decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CycleOutcome {
    pub statuses: [PairStatus; PAIRS],
    /// Relay vector, `true` = ON.
    pub faults: [bool; PAIRS],
    pub changed: bool,
}

#[derive(Default)]
struct ClassifierState {
    slot_counts: [u32; SLOTS],
    statuses: Option<[PairStatus; PAIRS]>,
    records: [FaultRecord; PAIRS],
    total_cycles: u64,
    fault_count: u64,
}

impl ClassifierState {
    fn stats(&self) -> MachineStats {
        MachineStats {
            total_cycles: self.total_cycles,
            fault_count: self.fault_count,
            slot_counts: self.slot_counts,
            pair_statuses: self.statuses.unwrap_or([PairStatus::Fault; PAIRS]),
            first_fault_at: self.records.map(|r| r.first_fault_at),
        }
    }
}

pub struct MachineClassifier {
    machine_id: MachineId,
    name: String,
    thresholds: ConfidenceThresholds,
    boundaries: RwLock<Arc<BoundarySet>>,
    state: Mutex<ClassifierState>,
    /// `None` when the machine's relay block could not be configured.
    relays: Option<Arc<RelayActuator>>,
    relays_healthy: AtomicBool,
    bus: EventBus,
}

impl MachineClassifier {
    pub fn new(
        machine_id: MachineId,
        name: impl Into<String>,
        thresholds: ConfidenceThresholds,
        relays: Option<Arc<RelayActuator>>,
        bus: EventBus,
    ) -> Self {
        let name = name.into();
        info!("{machine_id}: classifier ready ({name})");
        Self {
            machine_id,
            name,
            thresholds,
            boundaries: RwLock::new(Arc::new(BoundarySet::empty())),
            state: Mutex::new(ClassifierState::default()),
            relays,
            relays_healthy: AtomicBool::new(true),
            bus,
        }
    }

    pub fn machine_id(&self) -> MachineId {
        self.machine_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thresholds(&self) -> ConfidenceThresholds {
        self.thresholds
    }

    /// Current boundary snapshot.
    pub fn boundaries(&self) -> Arc<BoundarySet> {
        self.boundaries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Swap in a new snapshot; cycles already running keep the old one.
    pub fn set_boundaries(&self, boundaries: BoundarySet) {
        *self.boundaries.write().unwrap_or_else(PoisonError::into_inner) = Arc::new(boundaries);
        info!("{}: boundaries updated", self.machine_id);
    }

    /// Replace the boundaries from `path`. A missing file yields empty
    /// boundaries; a malformed one leaves the current set in place.
    pub fn load_boundaries(&self, path: &Path) -> Result<(), BoundaryError> {
        let boundaries = BoundarySet::load_or_empty(path)?;
        if boundaries.is_empty() {
            warn!(
                "{}: no boundaries in {}; every pair will report FAULT",
                self.machine_id,
                path.display()
            );
        } else {
            info!("{}: loaded boundaries from {}", self.machine_id, path.display());
        }
        self.set_boundaries(boundaries);
        Ok(())
    }

    pub fn save_boundaries(&self, path: &Path) -> Result<(), BoundaryError> {
        self.boundaries().save(path)?;
        info!("{}: saved boundaries to {}", self.machine_id, path.display());
        Ok(())
    }

    /// Classify against the current boundary snapshot.
    pub fn process(&self, detections: &[Detection]) -> CycleOutcome {
        let boundaries = self.boundaries();
        self.process_with(detections, &boundaries)
    }

    /// Classify against an explicit snapshot, update fault bookkeeping, drive
    /// the relays and publish events.
    pub fn process_with(&self, detections: &[Detection], boundaries: &BoundarySet) -> CycleOutcome {
        let span = tracing::debug_span!("classify", machine = %self.machine_id);
        let _guard = span.enter();

        let counts = count_slots(detections, boundaries, &self.thresholds);
        let statuses: [PairStatus; PAIRS] =
            std::array::from_fn(|pair| pair_status(counts[pair * 2], counts[pair * 2 + 1]));
        let faults = statuses.map(PairStatus::is_fault);

        let (changed, stats) = {
            let mut guard = self.lock_state();
            let state = &mut *guard;
            state.total_cycles += 1;
            state.slot_counts = counts;
            let changed = state.statuses != Some(statuses);
            state.statuses = Some(statuses);

            let now = Local::now();
            for (pair, status) in statuses.into_iter().enumerate() {
                let record = &mut state.records[pair];
                match status {
                    PairStatus::Fault if record.first_fault_at.is_none() => {
                        record.first_fault_at = Some(now);
                        record.fault_count += 1;
                        state.fault_count += 1;
                        metrics::counter!(
                            "monitor_pair_faults_total",
                            "machine" => self.machine_id.to_string(),
                            "pair" => (pair + 1).to_string()
                        )
                        .increment(1);
                    }
                    PairStatus::Fault => {}
                    PairStatus::Ok => record.first_fault_at = None,
                }
            }
            (changed, state.stats())
        };

        if changed {
            debug!(
                "{}: pairs {} / {} / {}",
                self.machine_id,
                statuses[0].label(),
                statuses[1].label(),
                statuses[2].label()
            );
            self.bus.publish(SystemEvent::PairStatusChanged {
                machine_id: self.machine_id,
                statuses,
            });
        }

        self.drive_relays(faults);

        self.bus.publish(SystemEvent::StatsUpdated {
            machine_id: self.machine_id,
            stats,
        });

        CycleOutcome {
            statuses,
            faults,
            changed,
        }
    }

    /// `None` until the first cycle.
    pub fn pair_statuses(&self) -> Option<[PairStatus; PAIRS]> {
        self.lock_state().statuses
    }

    pub fn fault_records(&self) -> [FaultRecord; PAIRS] {
        self.lock_state().records
    }

    /// Counters from the most recent cycle, indexed like [`SlotKey::ALL`].
    pub fn slot_counts(&self) -> [u32; SLOTS] {
        self.lock_state().slot_counts
    }

    pub fn stats(&self) -> MachineStats {
        self.lock_state().stats()
    }

    /// Clear cycle and fault counters and fault stamps.
    pub fn reset_stats(&self) {
        let mut state = self.lock_state();
        state.total_cycles = 0;
        state.fault_count = 0;
        state.records = [FaultRecord::default(); PAIRS];
        info!("{}: statistics reset", self.machine_id);
    }

    fn drive_relays(&self, faults: [bool; PAIRS]) {
        let Some(relays) = self.relays.as_ref() else {
            return;
        };
        match relays.set_machine_relays(self.machine_id, faults) {
            Ok(()) => {
                if !self.relays_healthy.swap(true, Ordering::Relaxed) {
                    info!("{}: relay writes recovered", self.machine_id);
                }
            }
            Err(err) => {
                if self.relays_healthy.swap(false, Ordering::Relaxed) {
                    warn!("{}: relay update failed: {err}", self.machine_id);
                }
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, ClassifierState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Slot hits for one cycle. Detections are only tested against polygons of
/// their own class.
pub fn count_slots(
    detections: &[Detection],
    boundaries: &BoundarySet,
    thresholds: &ConfidenceThresholds,
) -> [u32; SLOTS] {
    let mut counts = [0u32; SLOTS];
    for detection in detections {
        let class = detection.class();
        if detection.score < thresholds.for_class(class) {
            continue;
        }
        let (x, y) = detection.center();
        for pair in 0..PAIRS {
            let slot = SlotKey::new(pair, class);
            if boundaries.contains(slot, [x, y]) {
                counts[slot.index()] += 1;
            }
        }
    }
    counts
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crossbeam_channel::Receiver;
    use ml_core::ItemClass;
    use proptest::prelude::*;

    use super::*;
    use crate::pipeline::relay::{RelaySettings, tests::MockOpener};

    const OC: i64 = 0;
    const BH: i64 = 1;

    fn square(cx: i32, cy: i32) -> Vec<[i32; 2]> {
        vec![
            [cx - 20, cy - 20],
            [cx + 20, cy - 20],
            [cx + 20, cy + 20],
            [cx - 20, cy + 20],
        ]
    }

    fn boundaries() -> BoundarySet {
        let mut set = BoundarySet::empty();
        set.set_polygon(SlotKey::new(0, ItemClass::OilCan), square(100, 100));
        set.set_polygon(SlotKey::new(0, ItemClass::BunkHole), square(200, 100));
        set.set_polygon(SlotKey::new(1, ItemClass::OilCan), square(100, 300));
        set.set_polygon(SlotKey::new(1, ItemClass::BunkHole), square(200, 300));
        set
    }

    fn det_at(x: f32, y: f32, score: f32, class_id: i64) -> Detection {
        Detection {
            bbox_xyxy: [x - 10.0, y - 10.0, x + 10.0, y + 10.0],
            score,
            class_id,
        }
    }

    struct Rig {
        classifier: MachineClassifier,
        board: MockOpener,
        events: Receiver<SystemEvent>,
    }

    fn rig() -> Rig {
        let board = MockOpener::present();
        let relays = Arc::new(RelayActuator::new(
            Arc::new(board.clone()),
            RelaySettings {
                max_retries: 1,
                retry_delay: Duration::ZERO,
            },
        ));
        relays.configure_machine(MachineId(1), 6).unwrap();
        let (bus, events) = EventBus::new(64, true);
        let classifier = MachineClassifier::new(
            MachineId(1),
            "Machine 1",
            ConfidenceThresholds::default(),
            Some(relays),
            bus,
        );
        classifier.set_boundaries(boundaries());
        Rig {
            classifier,
            board,
            events,
        }
    }

    impl Rig {
        fn relay(&self, channel: usize) -> bool {
            self.board.0.lock().unwrap().states[channel]
        }
    }

    #[test]
    fn matched_pair_is_ok_and_relay_off() {
        let rig = rig();
        let outcome = rig.classifier.process(&[
            det_at(100.0, 100.0, 0.5, OC),
            det_at(200.0, 100.0, 0.5, BH),
        ]);
        assert_eq!(outcome.statuses[0], PairStatus::Ok);
        assert!(!outcome.faults[0]);
        assert!(!rig.relay(6));
        assert!(rig.relay(7));
        assert_eq!(rig.classifier.fault_records()[0], FaultRecord::default());
    }

    #[test]
    fn missing_bunk_hole_faults_the_pair() {
        let rig = rig();
        let outcome = rig.classifier.process(&[det_at(100.0, 100.0, 0.5, OC)]);
        assert_eq!(outcome.statuses[0], PairStatus::Fault);
        assert!(outcome.faults[0]);
        assert!(rig.relay(6));
        let record = rig.classifier.fault_records()[0];
        assert!(record.first_fault_at.is_some());
        assert_eq!(record.fault_count, 1);
    }

    #[test]
    fn no_detections_faults_everything() {
        let rig = rig();
        let outcome = rig.classifier.process(&[]);
        assert_eq!(outcome.faults, [true; PAIRS]);
        assert_eq!(rig.classifier.stats().fault_count, 3);
    }

    #[test]
    fn low_confidence_duplicates_and_wrong_class_are_handled() {
        let rig = rig();
        // Below the 0.40 oil-can threshold.
        let outcome = rig.classifier.process(&[
            det_at(100.0, 100.0, 0.39, OC),
            det_at(200.0, 100.0, 0.5, BH),
        ]);
        assert_eq!(outcome.statuses[0], PairStatus::Fault);

        let outcome = rig.classifier.process(&[
            det_at(100.0, 100.0, 0.9, OC),
            det_at(105.0, 100.0, 0.8, OC),
            det_at(200.0, 100.0, 0.5, BH),
        ]);
        assert_eq!(outcome.statuses[0], PairStatus::Fault);
        assert_eq!(rig.classifier.slot_counts()[..2], [2, 1]);

        // A bunk hole inside the oil-can polygon does not count there.
        rig.classifier.process(&[det_at(100.0, 100.0, 0.9, BH)]);
        assert_eq!(rig.classifier.slot_counts(), [0; SLOTS]);
    }

    #[test]
    fn ok_fault_ok_counts_once_and_clears_stamp() {
        let rig = rig();
        let ok = [det_at(100.0, 100.0, 0.5, OC), det_at(200.0, 100.0, 0.5, BH)];
        rig.classifier.process(&ok);
        rig.classifier.process(&ok[..1]);
        rig.classifier.process(&ok[..1]);
        rig.classifier.process(&ok);

        let record = rig.classifier.fault_records()[0];
        assert_eq!(record.fault_count, 1);
        assert!(record.first_fault_at.is_none());
        assert!(!rig.relay(6));

        let stats = rig.classifier.stats();
        assert_eq!(stats.total_cycles, 4);
        assert_eq!(stats.fault_time_labels()[0], "-");
        assert_ne!(stats.fault_time_labels()[2], "-");

        rig.classifier.reset_stats();
        let stats = rig.classifier.stats();
        assert_eq!((stats.total_cycles, stats.fault_count), (0, 0));
    }

    #[test]
    fn status_events_only_on_change() {
        let rig = rig();
        let ok = [det_at(100.0, 100.0, 0.5, OC), det_at(200.0, 100.0, 0.5, BH)];
        assert!(rig.classifier.process(&ok).changed);
        assert!(!rig.classifier.process(&ok).changed);
        assert!(rig.classifier.process(&[]).changed);

        let changes = rig
            .events
            .try_iter()
            .filter(|e| matches!(e, SystemEvent::PairStatusChanged { .. }))
            .count();
        assert_eq!(changes, 2);
    }

    #[test]
    fn missing_relay_block_still_classifies() {
        let (bus, _events) = EventBus::new(8, false);
        let classifier = MachineClassifier::new(
            MachineId(4),
            "Machine 4",
            ConfidenceThresholds::default(),
            None,
            bus,
        );
        classifier.set_boundaries(boundaries());
        let outcome = classifier.process(&[
            det_at(100.0, 100.0, 0.5, OC),
            det_at(200.0, 100.0, 0.5, BH),
        ]);
        assert_eq!(outcome.statuses[0], PairStatus::Ok);
    }

    #[test]
    fn boundary_reload_from_disk() {
        let rig = rig();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("machine1_boundaries.json");
        rig.classifier.save_boundaries(&path).unwrap();

        rig.classifier.set_boundaries(BoundarySet::empty());
        assert!(rig.classifier.boundaries().is_empty());
        rig.classifier.load_boundaries(&path).unwrap();
        assert_eq!(*rig.classifier.boundaries(), boundaries());

        std::fs::write(&path, "{").unwrap();
        assert!(rig.classifier.load_boundaries(&path).is_err());
        assert_eq!(*rig.classifier.boundaries(), boundaries());
    }

    proptest! {
        #[test]
        fn only_one_and_one_is_ok(oc in 0u32..5, bh in 0u32..5) {
            let expected = if (oc, bh) == (1, 1) { PairStatus::Ok } else { PairStatus::Fault };
            prop_assert_eq!(pair_status(oc, bh), expected);
        }

        #[test]
        fn counts_drive_status(oc in 0usize..4, bh in 0usize..4) {
            let mut detections = Vec::new();
            detections.extend((0..oc).map(|i| det_at(95.0 + i as f32, 100.0, 0.9, OC)));
            detections.extend((0..bh).map(|i| det_at(195.0 + i as f32, 100.0, 0.9, BH)));
            let counts = count_slots(&detections, &boundaries(), &ConfidenceThresholds::default());
            prop_assert_eq!(counts[0] as usize, oc);
            prop_assert_eq!(counts[1] as usize, bh);
            prop_assert_eq!(
                pair_status(counts[0], counts[1]) == PairStatus::Ok,
                oc == 1 && bh == 1
            );
        }
    }
}
