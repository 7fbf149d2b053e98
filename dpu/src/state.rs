/*!
Front-end state tracking and per-cycle bookkeeping.

The FPGA latches register changes on sync pulses: all parameters take effect
on the long pulse (first frame of a cycle), while `sensor_sel` and
`ccd_read_en` also take effect on the short pulses. The [`FeeStateTracker`]
mirrors that behaviour: a major update refreshes the whole [`FeeState`] from
the register map, a minor update refreshes only the two short-pulse
parameters.

[`CycleInternals`] carries everything the readout loop tracks across
iterations: the remaining cycle count, the current frame number, the
expected last-packet flags and the CCD clear-out rotation state.
*/

use shared::mode::{CcdSide, FeeMode};
use shared::packet::PacketType;
use shared::protocol::{CCD_ROWS, SENSOR_SEL_E_SIDE, SENSOR_SEL_F_SIDE};
use shared::{RegisterMap, Result, SharedError};

/// Snapshot of the front-end parameters the DPU acts on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FeeState {
    pub v_start: u16,
    pub v_end: u16,
    pub h_end: u16,
    pub n_final_dump: u16,
    pub ccd_mode_config: u8,
    pub ccd_readout_order: u8,
    pub sync_sel: u8,
    pub digitise_en: bool,
    pub dg_en: bool,
    pub int_sync_period: u16,
    pub sensor_sel: u8,
    pub ccd_read_en: u8,
}

impl FeeState {
    /// The FPGA mode, decoded
    pub fn mode(&self) -> Result<FeeMode> {
        FeeMode::try_from(self.ccd_mode_config)
    }

    /// DUMP is not an FPGA mode: full image mode with digitisation disabled
    pub fn is_dump_mode(&self) -> bool {
        self.ccd_mode_config == FeeMode::FullImage as u8 && !self.digitise_en
    }

    /// True when the front-end runs on its internal clock
    pub fn internal_sync(&self) -> bool {
        self.sync_sel != 0
    }
}

/// Tracks the effective front-end state across sync pulses
#[derive(Debug, Default)]
pub struct FeeStateTracker {
    state: FeeState,
}

impl FeeStateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> FeeState {
        self.state
    }

    /// Long pulse: every tracked parameter is refreshed from the register map
    pub fn major_update(&mut self, registers: &RegisterMap) -> Result<FeeState> {
        self.state = FeeState {
            v_start: registers.value_of("v_start")? as u16,
            v_end: registers.value_of("v_end")? as u16,
            h_end: registers.value_of("h_end")? as u16,
            n_final_dump: registers.value_of("n_final_dump")? as u16,
            ccd_mode_config: registers.value_of("ccd_mode_config")? as u8,
            ccd_readout_order: registers.value_of("ccd_readout_order")? as u8,
            sync_sel: registers.value_of("sync_sel")? as u8,
            digitise_en: registers.value_of("digitise_en")? != 0,
            dg_en: registers.value_of("dg_en")? != 0,
            int_sync_period: registers.value_of("int_sync_period")? as u16,
            sensor_sel: registers.value_of("sensor_sel")? as u8,
            ccd_read_en: registers.value_of("ccd_read_en")? as u8,
        };
        Ok(self.state)
    }

    /// Short pulse: only `sensor_sel` and `ccd_read_en` take effect
    pub fn minor_update(&mut self, registers: &RegisterMap) -> Result<FeeState> {
        self.state.sensor_sel = registers.value_of("sensor_sel")? as u8;
        self.state.ccd_read_en = registers.value_of("ccd_read_en")? as u8;
        Ok(self.state)
    }
}

/// How to leave the current observation when the cycle count runs out
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DumpTransition {
    /// Go to dump mode on the external clock
    #[default]
    External,
    /// Go back to internal sync dump mode
    InternalSync,
}

/// State the readout loop carries across iterations
#[derive(Debug, Clone)]
pub struct CycleInternals {
    /// Remaining readout cycles requested by the user. At 0 the front-end is
    /// sent to dump mode; negative means idle, nothing to count down.
    pub num_cycles: i32,

    /// Current frame number, taken from the housekeeping packet. -1 until
    /// the first housekeeping packet arrives.
    pub frame_number: i8,

    /// Whether a last-packet flag is expected, per packet class and CCD side
    pub expected_last_packet_flags: [bool; 4],

    /// Derived: front-end is in dump mode
    pub dump_mode: bool,

    /// Derived: front-end runs on its internal clock
    pub internal_sync: bool,

    /// How to go to dump mode when `num_cycles` reaches 0
    pub dump_transition: DumpTransition,

    /// Error flags are cleared once per readout
    pub clear_error_flags: bool,

    /// Number of cycles per slice for downstream processing
    pub slicing_num_cycles: i32,

    /// CCD clear-out rotation in internal sync dump mode, as CCD numbers
    pub current_ccd_readout_order: [u8; 4],

    /// Position within the atomic block of four clear-outs (0 to 3)
    pub cycle_count: u8,
}

impl CycleInternals {
    pub fn new(default_ccd_readout_order: [u8; 4]) -> Self {
        CycleInternals {
            num_cycles: -1,
            frame_number: -1,
            expected_last_packet_flags: [false; 4],
            dump_mode: false,
            internal_sync: false,
            dump_transition: DumpTransition::External,
            clear_error_flags: false,
            slicing_num_cycles: 0,
            current_ccd_readout_order: default_ccd_readout_order,
            cycle_count: 0,
        }
    }

    /// Re-derive the cached mode flags from the effective front-end state
    pub fn update_from(&mut self, state: &FeeState) {
        self.dump_mode = state.is_dump_mode();
        self.internal_sync = state.internal_sync();
    }

    /// Recompute the expected last-packet flags. Only done on the long
    /// pulse; the flags stay fixed for the rest of the readout cycle, like
    /// the register values they derive from.
    pub fn refresh_expected_flags(&mut self, state: &FeeState) {
        self.expected_last_packet_flags = expected_last_packet_flags(state);
    }

    /// Restart the clear-out rotation from the given order
    pub fn reset_int_sync_dump_mode(&mut self, ccd_readout_order: [u8; 4]) {
        self.current_ccd_readout_order = ccd_readout_order;
        self.cycle_count = 0;
    }

    /// True when the loop is rotating CCD clear-outs: internal sync, dump
    /// mode, no user cycle count pending
    pub fn int_sync_cycle_dump_mode(&self) -> bool {
        self.internal_sync && self.dump_mode && self.num_cycles < 0
    }

    /// First readout of a cycle (long pulse)
    pub fn is_major_pulse(&self) -> bool {
        self.frame_number == 0
    }

    pub fn is_minor_pulse(&self) -> bool {
        (1..=3).contains(&self.frame_number)
    }

    /// Last readout of a cycle. On the internal clock every readout is a
    /// complete cycle.
    pub fn is_end_of_cycle(&self) -> bool {
        self.internal_sync || self.frame_number == 3
    }
}

/// Decoded housekeeping memory area of the front-end
#[derive(Debug, Clone)]
pub struct HousekeepingData {
    pub frame_counter: u16,
    pub timecode: u8,
    pub error_flags: u32,
    pub raw: Vec<u8>,
}

impl HousekeepingData {
    /// Decode the raw housekeeping memory block. Only the fields the DPU
    /// acts on are decoded; the block is kept raw for storage.
    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < shared::protocol::HK_MEMORY_SIZE {
            return Err(SharedError::new(format!(
                "housekeeping data too short: {} bytes",
                raw.len()
            )));
        }
        Ok(HousekeepingData {
            frame_counter: u16::from_be_bytes([raw[0x00], raw[0x01]]),
            timecode: raw[0x02] & 0x3F,
            error_flags: u32::from_be_bytes([raw[0x8C], raw[0x8D], raw[0x8E], raw[0x8F]]),
            raw: raw.to_vec(),
        })
    }
}

/// Which last-packet flags to expect given the readout geometry and the
/// selected CCD sides.
///
/// Flag order: data/E, data/F, overscan/E, overscan/F. A data packet stream
/// is expected when the readout starts inside the CCD, an overscan stream
/// when it extends beyond the last CCD row.
pub fn expected_last_packet_flags(state: &FeeState) -> [bool; 4] {
    let e_side = state.sensor_sel & SENSOR_SEL_E_SIDE != 0;
    let f_side = state.sensor_sel & SENSOR_SEL_F_SIDE != 0;
    let data_packet = state.v_start < CCD_ROWS;
    let overscan_packet = state.v_end > CCD_ROWS - 1;

    [
        data_packet && e_side,
        data_packet && f_side,
        overscan_packet && e_side,
        overscan_packet && f_side,
    ]
}

/// Index into the last-packet flag arrays for a packet class and CCD side
pub fn last_packet_index(packet_type: PacketType, ccd_side: CcdSide) -> usize {
    packet_type as usize * 2 + ccd_side as usize
}

/// All expected last packets have been seen (and none that were not
/// expected)
pub fn got_all_last_packets(actual: &[bool; 4], expected: &[bool; 4]) -> bool {
    actual == expected
}

/// Rotate a CCD readout order by one position
pub fn rotate_readout_order(order: [u8; 4]) -> [u8; 4] {
    [order[1], order[2], order[3], order[0]]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_image_state() -> FeeState {
        FeeState {
            v_start: 0,
            v_end: 4509,
            ccd_mode_config: FeeMode::FullImage as u8,
            digitise_en: true,
            sensor_sel: shared::protocol::SENSOR_SEL_BOTH_SIDES,
            ..FeeState::default()
        }
    }

    #[test]
    fn test_expected_flags_full_image_both_sides() {
        // full CCD readout without overscan: data packets on both sides,
        // no overscan packets
        let state = full_image_state();
        assert_eq!(
            expected_last_packet_flags(&state),
            [true, true, false, false]
        );
    }

    #[test]
    fn test_expected_flags_with_overscan() {
        let state = FeeState {
            v_end: 4539,
            ..full_image_state()
        };
        assert_eq!(expected_last_packet_flags(&state), [true, true, true, true]);
    }

    #[test]
    fn test_expected_flags_single_side() {
        let state = FeeState {
            sensor_sel: SENSOR_SEL_E_SIDE,
            ..full_image_state()
        };
        assert_eq!(
            expected_last_packet_flags(&state),
            [true, false, false, false]
        );

        let state = FeeState {
            sensor_sel: SENSOR_SEL_F_SIDE,
            v_start: 4510,
            v_end: 4539,
            ..full_image_state()
        };
        // readout entirely in the overscan region
        assert_eq!(
            expected_last_packet_flags(&state),
            [false, false, false, true]
        );
    }

    #[test]
    fn test_last_packet_index() {
        assert_eq!(last_packet_index(PacketType::Data, CcdSide::E), 0);
        assert_eq!(last_packet_index(PacketType::Data, CcdSide::F), 1);
        assert_eq!(last_packet_index(PacketType::Overscan, CcdSide::E), 2);
        assert_eq!(last_packet_index(PacketType::Overscan, CcdSide::F), 3);
    }

    #[test]
    fn test_got_all_last_packets() {
        let expected = [true, true, false, false];
        assert!(!got_all_last_packets(&[false, false, false, false], &expected));
        assert!(!got_all_last_packets(&[true, false, false, false], &expected));
        assert!(got_all_last_packets(&[true, true, false, false], &expected));
    }

    #[test]
    fn test_rotation() {
        assert_eq!(rotate_readout_order([1, 2, 3, 4]), [2, 3, 4, 1]);
        assert_eq!(rotate_readout_order([2, 3, 4, 1]), [3, 4, 1, 2]);
    }

    #[test]
    fn test_dump_mode_detection() {
        let mut state = full_image_state();
        assert!(!state.is_dump_mode());
        state.digitise_en = false;
        assert!(state.is_dump_mode());
        state.ccd_mode_config = FeeMode::On as u8;
        assert!(!state.is_dump_mode());
    }

    #[test]
    fn test_tracker_minor_update_keeps_major_fields() {
        let mut registers = RegisterMap::new();
        registers.set_value("reg_0_config", "v_start", 100).unwrap();
        registers.set_value("reg_5_config", "sensor_sel", 0b11).unwrap();

        let mut tracker = FeeStateTracker::new();
        tracker.major_update(&registers).unwrap();
        assert_eq!(tracker.state().v_start, 100);
        assert_eq!(tracker.state().sensor_sel, 0b11);

        // a change to v_start only takes effect on the long pulse
        registers.set_value("reg_0_config", "v_start", 200).unwrap();
        registers.set_value("reg_5_config", "sensor_sel", 0b10).unwrap();
        tracker.minor_update(&registers).unwrap();
        assert_eq!(tracker.state().v_start, 100);
        assert_eq!(tracker.state().sensor_sel, 0b10);

        tracker.major_update(&registers).unwrap();
        assert_eq!(tracker.state().v_start, 200);
    }

    #[test]
    fn test_internals_cycle_predicates() {
        let mut internals = CycleInternals::new([1, 2, 3, 4]);
        assert_eq!(internals.num_cycles, -1);
        assert!(!internals.is_major_pulse());

        internals.frame_number = 0;
        assert!(internals.is_major_pulse());
        assert!(!internals.is_end_of_cycle());

        internals.frame_number = 3;
        assert!(internals.is_minor_pulse());
        assert!(internals.is_end_of_cycle());

        internals.internal_sync = true;
        internals.frame_number = 1;
        assert!(internals.is_end_of_cycle());
    }

    #[test]
    fn test_expected_flags_fixed_between_long_pulses() {
        let mut internals = CycleInternals::new([1, 2, 3, 4]);
        let mut state = full_image_state();
        internals.refresh_expected_flags(&state);
        assert_eq!(internals.expected_last_packet_flags, [true, true, false, false]);

        // a sensor_sel change picked up on a short pulse must not move the
        // flags until the next long pulse
        state.sensor_sel = SENSOR_SEL_E_SIDE;
        internals.update_from(&state);
        assert_eq!(internals.expected_last_packet_flags, [true, true, false, false]);

        internals.refresh_expected_flags(&state);
        assert_eq!(internals.expected_last_packet_flags, [true, false, false, false]);
    }

    #[test]
    fn test_int_sync_cycle_dump_mode_gate() {
        let mut internals = CycleInternals::new([1, 2, 3, 4]);
        internals.internal_sync = true;
        internals.dump_mode = true;
        assert!(internals.int_sync_cycle_dump_mode());

        // a pending user cycle count suspends the clear-out rotation
        internals.num_cycles = 2;
        assert!(!internals.int_sync_cycle_dump_mode());
    }

    #[test]
    fn test_housekeeping_decode() {
        let mut raw = vec![0u8; shared::protocol::HK_MEMORY_SIZE];
        raw[0x00] = 0x01;
        raw[0x01] = 0x2C; // frame counter 300
        raw[0x02] = 0x15;
        raw[0x8F] = 0x04; // one error flag set
        let hk = HousekeepingData::decode(&raw).unwrap();
        assert_eq!(hk.frame_counter, 300);
        assert_eq!(hk.timecode, 0x15);
        assert_eq!(hk.error_flags, 4);

        assert!(HousekeepingData::decode(&[0u8; 4]).is_err());
    }
}
