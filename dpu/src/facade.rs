/*!
Client-facing commanding verbs.

The [`DpuFacade`] is the only way into the readout processor: every verb
enqueues a command and blocks until the matching response arrives. Normal
commands are answered from inside the commanding window and can take up to a
full readout cycle; priority commands are answered from the tracked state
within the current readout.

Each mode verb takes a parameter struct whose `Default` carries the nominal
observation values, so a call site only spells out what deviates:

```no_run
# use dpu::facade::{command_channels, FullImageParams};
# let (facade, _channels) = command_channels();
facade.set_full_image_mode(FullImageParams {
    v_end: 4509,
    num_cycles: 3,
    ..FullImageParams::default()
})?;
# Ok::<(), shared::SharedError>(())
```
*/

use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::debug;

use shared::protocol::{DEFAULT_CCD_READOUT_ORDER, SENSOR_SEL_BOTH_SIDES};
use shared::{Result, SharedError};

use crate::commands::{
    Command, CommandEnvelope, CommandResponse, PrioCommand, DUMP_MODE_INT_SYNC_PERIOD,
};
use crate::controller::{CommandReply, ProcessorChannels};
use crate::state::DumpTransition;

/// Nominal VGD voltage of the CCDs
pub const DEFAULT_VGD: f64 = 19.90;

/// Internal sync period for nominal internal sync observations
pub const DEFAULT_INT_SYNC_PERIOD: u16 = 6250;

/// Create the facade and the matching processor channel ends
pub fn command_channels() -> (DpuFacade, ProcessorChannels) {
    let (priority_tx, priority_rx) = unbounded();
    let (command_tx, command_rx) = unbounded();
    let (response_tx, response_rx) = unbounded();
    let (prio_response_tx, prio_response_rx) = unbounded();
    (
        DpuFacade {
            priority_tx,
            command_tx: command_tx.clone(),
            response_rx,
            prio_response_rx,
        },
        ProcessorChannels {
            priority_rx,
            command_rx,
            command_tx,
            response_tx,
            prio_response_tx,
        },
    )
}

/// Handle used by clients to command the readout processor
pub struct DpuFacade {
    priority_tx: Sender<PrioCommand>,
    command_tx: Sender<CommandEnvelope>,
    response_rx: Receiver<CommandReply>,
    prio_response_rx: Receiver<CommandReply>,
}

impl DpuFacade {
    fn call(&self, envelope: CommandEnvelope) -> Result<CommandResponse> {
        let name = envelope.command.name();
        debug!("Queueing command {name}");
        self.command_tx
            .send(envelope)
            .map_err(|_| SharedError::new("the readout processor is gone"))?;
        await_reply(&self.response_rx, name)
    }

    fn call_prio(&self, command: PrioCommand) -> Result<CommandResponse> {
        let name = command.name();
        debug!("Queueing priority command {name}");
        self.priority_tx
            .send(command)
            .map_err(|_| SharedError::new("the readout processor is gone"))?;
        await_reply(&self.prio_response_rx, name)
    }

    // priority verbs, answered within the current readout

    /// The effective FPGA mode, as tracked across the sync pulses
    pub fn get_mode(&self) -> Result<u8> {
        expect_mode(self.call_prio(PrioCommand::GetMode)?)
    }

    /// 0 for the external clock, 1 for the internal clock
    pub fn get_sync_mode(&self) -> Result<u32> {
        expect_value(self.call_prio(PrioCommand::GetSyncMode)?)
    }

    pub fn is_dump_mode(&self) -> Result<bool> {
        expect_flag(self.call_prio(PrioCommand::IsDumpMode)?)
    }

    /// Snapshot of the local register mirror
    pub fn get_register_map(&self) -> Result<Vec<u8>> {
        expect_register_map(self.call_prio(PrioCommand::GetRegisterMap)?)
    }

    pub fn get_slicing(&self) -> Result<i32> {
        expect_int(self.call_prio(PrioCommand::GetSlicing)?)
    }

    pub fn set_slicing(&self, num_cycles: i32) -> Result<i32> {
        expect_int(self.call_prio(PrioCommand::SetSlicing { num_cycles })?)
    }

    // normal verbs, dispatched inside the commanding window

    /// Re-read the full register map from the front-end
    pub fn sync_register_map(&self) -> Result<Vec<u8>> {
        expect_register_map(self.call(CommandEnvelope::plain(Command::SyncRegisterMap))?)
    }

    /// Read the mode register from the front-end itself instead of the
    /// tracked state. Goes over the link, so it waits for the commanding
    /// window like any other command.
    pub fn get_mode_from_device(&self) -> Result<u8> {
        expect_mode(self.call(CommandEnvelope::plain(Command::GetMode))?)
    }

    pub fn set_on_mode(&self) -> Result<u8> {
        expect_mode(self.call(CommandEnvelope::plain(Command::SetOnMode))?)
    }

    pub fn set_standby_mode(&self) -> Result<u8> {
        expect_mode(self.call(CommandEnvelope::plain(Command::SetStandbyMode))?)
    }

    pub fn set_immediate_on_mode(&self) -> Result<u8> {
        expect_mode(self.call(CommandEnvelope::plain(Command::SetImmediateOnMode))?)
    }

    pub fn set_dump_mode(&self, params: DumpModeParams) -> Result<u8> {
        let envelope = CommandEnvelope {
            command: Command::SetDumpMode {
                v_start: params.v_start,
                v_end: params.v_end,
                sensor_sel: params.sensor_sel,
                ccd_readout_order: params.ccd_readout_order,
                n_final_dump: params.n_final_dump,
                sync_sel: params.sync_sel,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: DumpTransition::External,
            respond: true,
        };
        expect_mode(self.call(envelope)?)
    }

    pub fn set_dump_mode_int_sync(&self, params: DumpModeIntSyncParams) -> Result<u8> {
        let envelope = CommandEnvelope {
            command: Command::SetDumpModeIntSync {
                v_start: params.v_start,
                v_end: params.v_end,
                sensor_sel: params.sensor_sel,
                ccd_readout_order: params.ccd_readout_order,
                n_final_dump: params.n_final_dump,
                int_sync_period: params.int_sync_period,
                sync_sel: params.sync_sel,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: DumpTransition::InternalSync,
            respond: true,
        };
        expect_mode(self.call(envelope)?)
    }

    pub fn set_full_image_mode(&self, params: FullImageParams) -> Result<u8> {
        let envelope = CommandEnvelope {
            command: Command::SetFullImageMode {
                v_start: params.v_start,
                v_end: params.v_end,
                sensor_sel: params.sensor_sel,
                ccd_readout_order: params.ccd_readout_order,
                n_final_dump: params.n_final_dump,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: params.dump_transition,
            respond: true,
        };
        expect_mode(self.call(envelope)?)
    }

    pub fn set_full_image_mode_int_sync(&self, params: FullImageIntSyncParams) -> Result<u8> {
        let envelope = CommandEnvelope {
            command: Command::SetFullImageModeIntSync {
                v_start: params.v_start,
                v_end: params.v_end,
                sensor_sel: params.sensor_sel,
                ccd_readout_order: params.ccd_readout_order,
                n_final_dump: params.n_final_dump,
                int_sync_period: params.int_sync_period,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: params.dump_transition,
            respond: true,
        };
        expect_mode(self.call(envelope)?)
    }

    pub fn set_full_image_pattern_mode(&self, params: FullImagePatternParams) -> Result<u8> {
        let envelope = CommandEnvelope {
            command: Command::SetFullImagePatternMode {
                v_start: params.v_start,
                v_end: params.v_end,
                sensor_sel: params.sensor_sel,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: DumpTransition::External,
            respond: true,
        };
        expect_mode(self.call(envelope)?)
    }

    pub fn set_high_precision_hk(&self, enable: bool) -> Result<bool> {
        expect_flag(self.call(CommandEnvelope::plain(Command::SetHighPrecisionHk { enable }))?)
    }

    /// Put the front-end on its internal clock
    pub fn set_internal_sync(&self, int_sync_period: u16) -> Result<()> {
        self.call(CommandEnvelope::plain(Command::InternalClock {
            int_sync_period,
        }))?;
        Ok(())
    }

    /// Put the front-end back on the external clock
    pub fn set_external_sync(&self) -> Result<()> {
        self.call(CommandEnvelope::plain(Command::ExternalClock))?;
        Ok(())
    }

    pub fn set_register_value(
        &self,
        register: impl Into<String>,
        field: impl Into<String>,
        value: u32,
    ) -> Result<()> {
        self.call(CommandEnvelope::plain(Command::SetRegisterValue {
            register: register.into(),
            field: field.into(),
            value,
        }))?;
        Ok(())
    }

    pub fn set_readout_order(&self, ccd_readout_order: u8) -> Result<()> {
        self.call(CommandEnvelope::plain(Command::SetReadoutOrder {
            ccd_readout_order,
        }))?;
        Ok(())
    }

    pub fn reset(&self) -> Result<u8> {
        expect_mode(self.call(CommandEnvelope::plain(Command::Reset))?)
    }

    pub fn clear_error_flags(&self) -> Result<u32> {
        expect_value(self.call(CommandEnvelope::plain(Command::ClearErrorFlags))?)
    }

    pub fn set_reverse_clocking(&self, params: ReverseClockingParams) -> Result<bool> {
        let envelope = CommandEnvelope {
            command: Command::SetReverseClocking {
                v_start: params.v_start,
                v_end: params.v_end,
                sensor_sel: params.sensor_sel,
                ccd_readout_order: params.ccd_readout_order,
                n_final_dump: params.n_final_dump,
                img_clk_dir: params.img_clk_dir,
                reg_clk_dir: params.reg_clk_dir,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: params.dump_transition,
            respond: true,
        };
        expect_flag(self.call(envelope)?)
    }

    pub fn set_charge_injection(&self, params: ChargeInjectionParams) -> Result<bool> {
        let envelope = CommandEnvelope {
            command: Command::SetChargeInjection {
                v_start: params.v_start,
                v_end: params.v_end,
                n_final_dump: params.n_final_dump,
                sensor_sel: params.sensor_sel,
                ccd_readout_order: params.ccd_readout_order,
                charge_injection_width: params.charge_injection_width,
                charge_injection_gap: params.charge_injection_gap,
            },
            num_cycles: cycles(params.num_cycles),
            dump_transition: DumpTransition::External,
            respond: true,
        };
        expect_flag(self.call(envelope)?)
    }

    pub fn set_vgd(&self, voltage: f64) -> Result<bool> {
        expect_flag(self.call(CommandEnvelope::plain(Command::SetVgd { voltage }))?)
    }

    /// Write the camera specific FPGA default register values
    pub fn set_fpga_defaults(&self) -> Result<bool> {
        expect_flag(self.call(CommandEnvelope::plain(Command::SetFpgaDefaults))?)
    }
}

/// Dump mode on the external clock
#[derive(Debug, Clone)]
pub struct DumpModeParams {
    pub v_start: u16,
    pub v_end: u16,
    pub sensor_sel: u8,
    pub ccd_readout_order: u8,
    pub n_final_dump: u16,
    pub sync_sel: u8,
    pub num_cycles: i32,
}

impl Default for DumpModeParams {
    fn default() -> Self {
        DumpModeParams {
            v_start: 0,
            v_end: 0,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            ccd_readout_order: DEFAULT_CCD_READOUT_ORDER,
            n_final_dump: 4510,
            sync_sel: 0,
            num_cycles: 0,
        }
    }
}

/// Dump mode on the internal clock, with fast clear-out readouts
#[derive(Debug, Clone)]
pub struct DumpModeIntSyncParams {
    pub v_start: u16,
    pub v_end: u16,
    pub sensor_sel: u8,
    pub ccd_readout_order: u8,
    pub n_final_dump: u16,
    pub int_sync_period: u16,
    pub sync_sel: u8,
    pub num_cycles: i32,
}

impl Default for DumpModeIntSyncParams {
    fn default() -> Self {
        DumpModeIntSyncParams {
            v_start: 0,
            v_end: 0,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            ccd_readout_order: DEFAULT_CCD_READOUT_ORDER,
            n_final_dump: 4510,
            int_sync_period: DUMP_MODE_INT_SYNC_PERIOD,
            sync_sel: 1,
            num_cycles: 0,
        }
    }
}

/// Full image observation on the external clock
#[derive(Debug, Clone)]
pub struct FullImageParams {
    pub v_start: u16,
    pub v_end: u16,
    pub sensor_sel: u8,
    pub ccd_readout_order: u8,
    pub n_final_dump: u16,
    pub num_cycles: i32,
    pub dump_transition: DumpTransition,
}

impl Default for FullImageParams {
    fn default() -> Self {
        FullImageParams {
            v_start: 0,
            v_end: 1,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            ccd_readout_order: DEFAULT_CCD_READOUT_ORDER,
            n_final_dump: 0,
            num_cycles: 0,
            dump_transition: DumpTransition::External,
        }
    }
}

/// Full image observation on the internal clock
#[derive(Debug, Clone)]
pub struct FullImageIntSyncParams {
    pub v_start: u16,
    pub v_end: u16,
    pub sensor_sel: u8,
    pub ccd_readout_order: u8,
    pub n_final_dump: u16,
    pub int_sync_period: u16,
    pub num_cycles: i32,
    pub dump_transition: DumpTransition,
}

impl Default for FullImageIntSyncParams {
    fn default() -> Self {
        FullImageIntSyncParams {
            v_start: 0,
            v_end: 1,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            ccd_readout_order: DEFAULT_CCD_READOUT_ORDER,
            n_final_dump: 0,
            int_sync_period: DEFAULT_INT_SYNC_PERIOD,
            num_cycles: 0,
            dump_transition: DumpTransition::InternalSync,
        }
    }
}

/// Full image pattern observation (synthetic data from the FPGA)
#[derive(Debug, Clone)]
pub struct FullImagePatternParams {
    pub v_start: u16,
    pub v_end: u16,
    pub sensor_sel: u8,
    pub num_cycles: i32,
}

impl Default for FullImagePatternParams {
    fn default() -> Self {
        FullImagePatternParams {
            v_start: 0,
            v_end: 1,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            num_cycles: 0,
        }
    }
}

/// Reverse clocking of the image or register clocks
#[derive(Debug, Clone)]
pub struct ReverseClockingParams {
    pub v_start: u16,
    pub v_end: u16,
    pub sensor_sel: u8,
    pub ccd_readout_order: u8,
    pub n_final_dump: u16,
    pub img_clk_dir: u8,
    pub reg_clk_dir: u8,
    pub num_cycles: i32,
    pub dump_transition: DumpTransition,
}

impl Default for ReverseClockingParams {
    fn default() -> Self {
        ReverseClockingParams {
            v_start: 0,
            v_end: 4509,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            ccd_readout_order: DEFAULT_CCD_READOUT_ORDER,
            n_final_dump: 0,
            img_clk_dir: 1,
            reg_clk_dir: 0,
            num_cycles: 0,
            dump_transition: DumpTransition::External,
        }
    }
}

/// Charge injection observation
#[derive(Debug, Clone)]
pub struct ChargeInjectionParams {
    pub v_start: u16,
    pub v_end: u16,
    pub n_final_dump: u16,
    pub sensor_sel: u8,
    pub ccd_readout_order: u8,
    pub charge_injection_width: u16,
    pub charge_injection_gap: u16,
    pub num_cycles: i32,
}

impl Default for ChargeInjectionParams {
    fn default() -> Self {
        ChargeInjectionParams {
            v_start: 0,
            v_end: 4509,
            n_final_dump: 0,
            sensor_sel: SENSOR_SEL_BOTH_SIDES,
            ccd_readout_order: DEFAULT_CCD_READOUT_ORDER,
            charge_injection_width: 0,
            charge_injection_gap: 0,
            num_cycles: 0,
        }
    }
}

/// A cycle count of 0 means "leave the current count untouched"
fn cycles(num_cycles: i32) -> Option<i32> {
    (num_cycles != 0).then_some(num_cycles)
}

// The response wait is deliberately unbounded: a wedged processor wedges its
// callers, and the supervisor's liveness check is the place that notices.
fn await_reply(rx: &Receiver<CommandReply>, name: &'static str) -> Result<CommandResponse> {
    let (replied_name, result) = rx
        .recv()
        .map_err(|_| SharedError::new(format!("no response for command {name}")))?;
    if replied_name != name {
        debug!("Response for {replied_name} answers a call to {name}");
    }
    result.map_err(SharedError::Generic)
}

fn expect_mode(response: CommandResponse) -> Result<u8> {
    match response {
        CommandResponse::Mode(mode) => Ok(mode),
        other => Err(unexpected(other)),
    }
}

fn expect_flag(response: CommandResponse) -> Result<bool> {
    match response {
        CommandResponse::Flag(flag) => Ok(flag),
        other => Err(unexpected(other)),
    }
}

fn expect_value(response: CommandResponse) -> Result<u32> {
    match response {
        CommandResponse::Value(value) => Ok(value),
        other => Err(unexpected(other)),
    }
}

fn expect_int(response: CommandResponse) -> Result<i32> {
    match response {
        CommandResponse::Int(value) => Ok(value),
        other => Err(unexpected(other)),
    }
}

fn expect_register_map(response: CommandResponse) -> Result<Vec<u8>> {
    match response {
        CommandResponse::RegisterMap(snapshot) => Ok(snapshot),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: CommandResponse) -> SharedError {
    SharedError::new(format!("unexpected command response: {response:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_num_cycles_mapping() {
        assert_eq!(cycles(0), None);
        assert_eq!(cycles(3), Some(3));
        assert_eq!(cycles(-1), Some(-1));
    }

    #[test]
    fn test_defaults_match_nominal_observation() {
        let dump = DumpModeParams::default();
        assert_eq!(dump.n_final_dump, 4510);
        assert_eq!(dump.sync_sel, 0);

        let dump_int = DumpModeIntSyncParams::default();
        assert_eq!(dump_int.int_sync_period, DUMP_MODE_INT_SYNC_PERIOD);
        assert_eq!(dump_int.sync_sel, 1);

        let full_image = FullImageParams::default();
        assert_eq!(full_image.v_end, 1);
        assert_eq!(full_image.dump_transition, DumpTransition::External);

        let int_sync = FullImageIntSyncParams::default();
        assert_eq!(int_sync.int_sync_period, DEFAULT_INT_SYNC_PERIOD);
        assert_eq!(int_sync.dump_transition, DumpTransition::InternalSync);

        let reverse = ReverseClockingParams::default();
        assert_eq!(reverse.img_clk_dir, 1);
        assert_eq!(reverse.reg_clk_dir, 0);
    }

    #[test]
    fn test_call_roundtrip() {
        let (facade, channels) = command_channels();

        let responder = thread::spawn(move || {
            let envelope = channels.command_rx.recv().unwrap();
            assert_eq!(envelope.num_cycles, Some(5));
            assert!(envelope.respond);
            channels
                .response_tx
                .send((envelope.command.name(), Ok(CommandResponse::Mode(5))))
                .unwrap();

            let prio = channels.priority_rx.recv().unwrap();
            channels
                .prio_response_tx
                .send((prio.name(), Ok(CommandResponse::Flag(true))))
                .unwrap();
        });

        let mode = facade
            .set_full_image_mode(FullImageParams {
                num_cycles: 5,
                ..FullImageParams::default()
            })
            .unwrap();
        assert_eq!(mode, 5);

        assert!(facade.is_dump_mode().unwrap());
        responder.join().unwrap();
    }

    #[test]
    fn test_get_mode_from_device_queues_a_register_read() {
        let (facade, channels) = command_channels();

        let responder = thread::spawn(move || {
            let envelope = channels.command_rx.recv().unwrap();
            assert!(matches!(envelope.command, Command::GetMode));
            assert!(envelope.respond);
            channels
                .response_tx
                .send((envelope.command.name(), Ok(CommandResponse::Mode(4))))
                .unwrap();
        });

        assert_eq!(facade.get_mode_from_device().unwrap(), 4);
        responder.join().unwrap();
    }

    #[test]
    fn test_command_error_is_reported() {
        let (facade, channels) = command_channels();

        let responder = thread::spawn(move || {
            let envelope = channels.command_rx.recv().unwrap();
            channels
                .response_tx
                .send((
                    envelope.command.name(),
                    Err("register write failed".to_string()),
                ))
                .unwrap();
        });

        let result = facade.set_on_mode();
        assert!(result.is_err());
        responder.join().unwrap();
    }
}
