/*!
The closed command set of the readout processor.

Normal commands ([`Command`]) touch the front-end over the link and are
dispatched at most once per readout cycle, inside the safe commanding
window. Priority commands ([`PrioCommand`]) answer from the tracked state
and never touch the link, so they can run as soon as the queue is drained.

Every register command follows the same read-modify-write discipline: fetch
the register word from the front-end (reconciling the local mirror), update
the named fields in the mirror, write the word back.
*/

use tracing::{debug, info, warn};

use shared::mode::FeeMode;
use shared::protocol::REGISTER_SPACE_SIZE;
use shared::{RegisterMap, Result};

use crate::config::FpgaDefault;
use crate::state::{CycleInternals, DumpTransition, FeeState};
use crate::transport::PacketTransport;

/// Internal sync period used for the dump mode clear-out readouts
pub const DUMP_MODE_INT_SYNC_PERIOD: u16 = 600;

/// Response of an executed command
#[derive(Debug, Clone, PartialEq)]
pub enum CommandResponse {
    None,
    Mode(u8),
    Flag(bool),
    Value(u32),
    Int(i32),
    RegisterMap(Vec<u8>),
}

/// A normal command plus its dispatch options
#[derive(Debug, Clone)]
pub struct CommandEnvelope {
    pub command: Command,
    /// Readout cycles to count down before going to dump mode. `None`
    /// leaves the current count untouched.
    pub num_cycles: Option<i32>,
    /// How to go to dump mode when the count runs out
    pub dump_transition: DumpTransition,
    /// Whether the sender is blocked on a response
    pub respond: bool,
}

impl CommandEnvelope {
    /// An envelope with no cycle count and a pending response
    pub fn plain(command: Command) -> Self {
        CommandEnvelope {
            command,
            num_cycles: None,
            dump_transition: DumpTransition::External,
            respond: true,
        }
    }
}

/// Commands that are sent to the front-end over the link
#[derive(Debug, Clone)]
pub enum Command {
    SetOnMode,
    SetStandbyMode,
    SetImmediateOnMode,
    SetDumpMode {
        v_start: u16,
        v_end: u16,
        sensor_sel: u8,
        ccd_readout_order: u8,
        n_final_dump: u16,
        sync_sel: u8,
    },
    SetDumpModeIntSync {
        v_start: u16,
        v_end: u16,
        sensor_sel: u8,
        ccd_readout_order: u8,
        n_final_dump: u16,
        int_sync_period: u16,
        sync_sel: u8,
    },
    SetFullImageMode {
        v_start: u16,
        v_end: u16,
        sensor_sel: u8,
        ccd_readout_order: u8,
        n_final_dump: u16,
    },
    SetFullImageModeIntSync {
        v_start: u16,
        v_end: u16,
        sensor_sel: u8,
        ccd_readout_order: u8,
        n_final_dump: u16,
        int_sync_period: u16,
    },
    SetFullImagePatternMode {
        v_start: u16,
        v_end: u16,
        sensor_sel: u8,
    },
    SetHighPrecisionHk {
        enable: bool,
    },
    InternalClock {
        int_sync_period: u16,
    },
    ExternalClock,
    SetRegisterValue {
        register: String,
        field: String,
        value: u32,
    },
    SetReadoutOrder {
        ccd_readout_order: u8,
    },
    Reset,
    ClearErrorFlags,
    SetReverseClocking {
        v_start: u16,
        v_end: u16,
        sensor_sel: u8,
        ccd_readout_order: u8,
        n_final_dump: u16,
        img_clk_dir: u8,
        reg_clk_dir: u8,
    },
    SetChargeInjection {
        v_start: u16,
        v_end: u16,
        n_final_dump: u16,
        sensor_sel: u8,
        ccd_readout_order: u8,
        charge_injection_width: u16,
        charge_injection_gap: u16,
    },
    SetVgd {
        voltage: f64,
    },
    SetFpgaDefaults,
    SyncRegisterMap,
    GetMode,
}

impl Command {
    /// Stable command name, used in responses, logs and stored items
    pub fn name(&self) -> &'static str {
        match self {
            Command::SetOnMode => "set_on_mode",
            Command::SetStandbyMode => "set_standby_mode",
            Command::SetImmediateOnMode => "set_immediate_on_mode",
            Command::SetDumpMode { .. } => "set_dump_mode",
            Command::SetDumpModeIntSync { .. } => "set_dump_mode_int_sync",
            Command::SetFullImageMode { .. } => "set_full_image_mode",
            Command::SetFullImageModeIntSync { .. } => "set_full_image_mode_int_sync",
            Command::SetFullImagePatternMode { .. } => "set_full_image_pattern_mode",
            Command::SetHighPrecisionHk { .. } => "set_high_precision_hk",
            Command::InternalClock { .. } => "internal_clock",
            Command::ExternalClock => "external_clock",
            Command::SetRegisterValue { .. } => "set_register_value",
            Command::SetReadoutOrder { .. } => "set_readout_order",
            Command::Reset => "reset",
            Command::ClearErrorFlags => "clear_error_flags",
            Command::SetReverseClocking { .. } => "set_reverse_clocking",
            Command::SetChargeInjection { .. } => "set_charge_injection",
            Command::SetVgd { .. } => "set_vgd",
            Command::SetFpgaDefaults => "set_fpga_defaults",
            Command::SyncRegisterMap => "sync_register_map",
            Command::GetMode => "get_mode",
        }
    }

    /// Execute this command against the front-end, keeping the local
    /// register map in sync
    pub fn execute(
        &self,
        transport: &mut dyn PacketTransport,
        registers: &mut RegisterMap,
        fpga_defaults: &[FpgaDefault],
    ) -> Result<CommandResponse> {
        match self {
            Command::SetOnMode => {
                info!("Commanding front-end into ON mode");
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::On as u32)],
                )?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
            Command::SetStandbyMode => {
                info!("Commanding front-end into STANDBY mode");
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::StandBy as u32)],
                )?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
            Command::SetImmediateOnMode => {
                info!("Commanding front-end into IMMEDIATE ON mode");
                read_register_from_fee(transport, registers, "reg_21_config")?;
                registers.set_value(
                    "reg_21_config",
                    "ccd_mode_config",
                    FeeMode::ImmediateOn as u32,
                )?;
                write_register_on_fee(transport, registers, "reg_21_config")?;
                Ok(CommandResponse::Mode(FeeMode::ImmediateOn as u8))
            }
            Command::SetDumpMode {
                v_start,
                v_end,
                sensor_sel,
                ccd_readout_order,
                n_final_dump,
                sync_sel,
            } => {
                info!(
                    "Commanding front-end into dump mode, v_start={v_start}, v_end={v_end}, \
                     sensor_sel={sensor_sel}"
                );
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_3_config",
                    &[
                        ("n_final_dump", *n_final_dump as u32),
                        ("charge_injection_en", 0),
                        ("img_clk_dir", 0),
                        ("reg_clk_dir", 0),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[
                        ("sensor_sel", *sensor_sel as u32),
                        ("digitise_en", 0),
                        ("dg_en", 1),
                        ("sync_sel", *sync_sel as u32),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImage as u32)],
                )?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
            Command::SetDumpModeIntSync {
                v_start,
                v_end,
                sensor_sel,
                ccd_readout_order,
                n_final_dump,
                int_sync_period,
                sync_sel,
            } => {
                info!(
                    "Commanding front-end into internal sync dump mode, v_start={v_start}, \
                     v_end={v_end}, n_final_dump={n_final_dump}"
                );
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_3_config",
                    &[
                        ("n_final_dump", *n_final_dump as u32),
                        ("charge_injection_en", 0),
                        ("img_clk_dir", 0),
                        ("reg_clk_dir", 0),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_4_config",
                    &[("int_sync_period", *int_sync_period as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[
                        ("sensor_sel", *sensor_sel as u32),
                        ("digitise_en", 0),
                        ("dg_en", 1),
                        ("sync_sel", *sync_sel as u32),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImage as u32)],
                )?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
            Command::SetFullImageMode {
                v_start,
                v_end,
                sensor_sel,
                ccd_readout_order,
                n_final_dump,
            } => {
                info!(
                    "Commanding front-end into full image mode, v_start={v_start}, v_end={v_end}"
                );
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_3_config",
                    &[("n_final_dump", *n_final_dump as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[
                        ("sensor_sel", *sensor_sel as u32),
                        ("digitise_en", 1),
                        ("dg_en", 0),
                        ("sync_sel", 0),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImage as u32)],
                )?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
            Command::SetFullImageModeIntSync {
                v_start,
                v_end,
                sensor_sel,
                ccd_readout_order,
                n_final_dump,
                int_sync_period,
            } => {
                info!(
                    "Commanding front-end into internal sync full image mode, v_start={v_start}, \
                     v_end={v_end}, int_sync_period={int_sync_period}"
                );
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_3_config",
                    &[("n_final_dump", *n_final_dump as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_4_config",
                    &[("int_sync_period", *int_sync_period as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[
                        ("sensor_sel", *sensor_sel as u32),
                        ("digitise_en", 1),
                        ("dg_en", 0),
                        ("sync_sel", 1),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImage as u32)],
                )?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
            Command::SetFullImagePatternMode {
                v_start,
                v_end,
                sensor_sel,
            } => {
                info!("Commanding front-end into full image pattern mode");
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[("sensor_sel", *sensor_sel as u32)],
                )?;
                // send data to the DPU, dump gate low
                set_register(transport, registers, "reg_5_config", &[("digitise_en", 1)])?;
                set_register(transport, registers, "reg_5_config", &[("dg_en", 0)])?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImagePattern as u32)],
                )?;
                Ok(CommandResponse::Mode(FeeMode::FullImagePattern as u8))
            }
            Command::SetHighPrecisionHk { enable } => {
                info!("Commanding front-end high precision HK: {enable}");
                read_register_from_fee(transport, registers, "reg_5_config")?;
                registers.set_value("reg_5_config", "high_precision_hk_en", *enable as u32)?;
                write_register_on_fee(transport, registers, "reg_5_config")?;
                Ok(CommandResponse::Flag(*enable))
            }
            Command::InternalClock { int_sync_period } => {
                info!("Commanding front-end onto the internal clock, int_sync_period={int_sync_period}ms");
                set_register(
                    transport,
                    registers,
                    "reg_4_config",
                    &[("int_sync_period", *int_sync_period as u32)],
                )?;
                set_register(transport, registers, "reg_5_config", &[("sync_sel", 1)])?;
                Ok(CommandResponse::None)
            }
            Command::ExternalClock => {
                info!("Commanding front-end onto the external clock");
                set_register(transport, registers, "reg_5_config", &[("sync_sel", 0)])?;
                Ok(CommandResponse::None)
            }
            Command::SetRegisterValue {
                register,
                field,
                value,
            } => {
                info!("Setting register value {register}:{field} = {value}");
                set_register(transport, registers, register, &[(field.as_str(), *value)])?;
                Ok(CommandResponse::None)
            }
            Command::SetReadoutOrder { ccd_readout_order } => {
                info!("Setting CCD readout order to 0x{ccd_readout_order:02X}");
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                Ok(CommandResponse::None)
            }
            Command::Reset => {
                info!("Commanding front-end reset");
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", 0x07)],
                )?;
                Ok(CommandResponse::Mode(0x07))
            }
            Command::ClearErrorFlags => {
                // debug level because this command is sent on each readout
                debug!("Commanding front-end to clear error flags");
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("clear_error_flag", 1)],
                )?;
                Ok(CommandResponse::Value(
                    registers.value_of("clear_error_flag")?,
                ))
            }
            Command::SetReverseClocking {
                v_start,
                v_end,
                sensor_sel,
                ccd_readout_order,
                n_final_dump,
                img_clk_dir,
                reg_clk_dir,
            } => {
                info!("Commanding front-end to reverse clocking");
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_3_config",
                    &[
                        ("n_final_dump", *n_final_dump as u32),
                        ("img_clk_dir", *img_clk_dir as u32),
                        ("reg_clk_dir", *reg_clk_dir as u32),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[
                        ("sensor_sel", *sensor_sel as u32),
                        ("digitise_en", 1),
                        ("dg_en", 0),
                        ("sync_sel", 0),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImage as u32)],
                )?;
                Ok(CommandResponse::Flag(true))
            }
            Command::SetChargeInjection {
                v_start,
                v_end,
                n_final_dump,
                sensor_sel,
                ccd_readout_order,
                charge_injection_width,
                charge_injection_gap,
            } => {
                info!("Commanding front-end to configure charge injection");
                set_register(
                    transport,
                    registers,
                    "reg_0_config",
                    &[("v_start", *v_start as u32), ("v_end", *v_end as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_1_config",
                    &[
                        ("charge_injection_width", *charge_injection_width as u32),
                        ("charge_injection_gap", *charge_injection_gap as u32),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_2_config",
                    &[("ccd_readout_order", *ccd_readout_order as u32)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_3_config",
                    &[
                        ("n_final_dump", *n_final_dump as u32),
                        ("charge_injection_en", 1),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_5_config",
                    &[
                        ("sensor_sel", *sensor_sel as u32),
                        ("digitise_en", 1),
                        ("dg_en", 0),
                    ],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_21_config",
                    &[("ccd_mode_config", FeeMode::FullImage as u32)],
                )?;
                Ok(CommandResponse::Flag(true))
            }
            Command::SetVgd { voltage } => {
                info!("Setting VGD to {voltage} V");
                let converted = vgd_to_dac(*voltage);
                // DAC low nibble goes into reg_19, the high byte into reg_20
                set_register(
                    transport,
                    registers,
                    "reg_19_config",
                    &[("ccd_vgd_config", converted & 0b1111)],
                )?;
                set_register(
                    transport,
                    registers,
                    "reg_20_config",
                    &[("ccd_vgd_config", (converted >> 4) & 0xFF)],
                )?;
                Ok(CommandResponse::Flag(true))
            }
            Command::SetFpgaDefaults => {
                info!("Setting camera specific FPGA defaults");
                for default in fpga_defaults {
                    info!(
                        "Set default value for {} (0x{:08X})",
                        default.register, default.value
                    );
                    registers.set_register_data(&default.register, default.value.to_be_bytes())?;
                    write_register_on_fee(transport, registers, &default.register)?;
                }
                Ok(CommandResponse::Flag(true))
            }
            Command::SyncRegisterMap => {
                info!("Reading the full register map from the front-end");
                let data = transport.read_memory(0, REGISTER_SPACE_SIZE)?;
                registers.set_data(0, &data)?;
                Ok(CommandResponse::RegisterMap(registers.snapshot()))
            }
            Command::GetMode => {
                info!("Requesting mode from the front-end");
                read_register_from_fee(transport, registers, "reg_21_config")?;
                Ok(CommandResponse::Mode(
                    registers.value_of("ccd_mode_config")? as u8,
                ))
            }
        }
    }
}

/// Commands answered from the tracked state, never touching the link.
///
/// Mode changes take effect in the front-end only on the long pulse, so
/// these answer from the effective state rather than the register mirror.
#[derive(Debug, Clone)]
pub enum PrioCommand {
    GetMode,
    GetSyncMode,
    IsDumpMode,
    GetRegisterMap,
    GetSlicing,
    SetSlicing { num_cycles: i32 },
}

impl PrioCommand {
    pub fn name(&self) -> &'static str {
        match self {
            PrioCommand::GetMode => "get_mode",
            PrioCommand::GetSyncMode => "get_sync_mode",
            PrioCommand::IsDumpMode => "is_dump_mode",
            PrioCommand::GetRegisterMap => "get_register_map",
            PrioCommand::GetSlicing => "get_slicing",
            PrioCommand::SetSlicing { .. } => "set_slicing",
        }
    }

    pub fn execute(
        &self,
        state: &FeeState,
        internals: &mut CycleInternals,
        registers: &RegisterMap,
    ) -> CommandResponse {
        match self {
            PrioCommand::GetMode => CommandResponse::Mode(state.ccd_mode_config),
            PrioCommand::GetSyncMode => CommandResponse::Value(state.sync_sel as u32),
            PrioCommand::IsDumpMode => {
                CommandResponse::Flag(!state.digitise_en && state.dg_en && state.is_dump_mode())
            }
            PrioCommand::GetRegisterMap => CommandResponse::RegisterMap(registers.snapshot()),
            PrioCommand::GetSlicing => CommandResponse::Int(internals.slicing_num_cycles),
            PrioCommand::SetSlicing { num_cycles } => {
                info!("Set slicing parameter: num_cycles = {num_cycles}");
                internals.slicing_num_cycles = *num_cycles;
                CommandResponse::Int(*num_cycles)
            }
        }
    }
}

/// Convert a VGD voltage to the 12-bit DAC value (5.983 mV per bit)
pub fn vgd_to_dac(voltage: f64) -> u32 {
    (voltage / 5.983 * 1000.0) as u32
}

/// Read a register word from the front-end, reconciling the local mirror
/// when it disagrees
pub fn read_register_from_fee(
    transport: &mut dyn PacketTransport,
    registers: &mut RegisterMap,
    register: &str,
) -> Result<[u8; 4]> {
    let address = RegisterMap::register_address(register)?;
    let rx_data = transport.read_register(address)?;
    let local = registers.get_register_data(register)?;

    if rx_data != local {
        warn!(
            "Data received for {register} is different from local copy: {} != {}",
            hex::encode(rx_data),
            hex::encode(local)
        );
        registers.set_register_data(register, rx_data)?;
    }

    Ok(rx_data)
}

/// Write the local register word to the front-end. The local mirror is
/// assumed to be up to date.
pub fn write_register_on_fee(
    transport: &mut dyn PacketTransport,
    registers: &RegisterMap,
    register: &str,
) -> Result<()> {
    let address = RegisterMap::register_address(register)?;
    let data = registers.get_register_data(register)?;
    transport.write_register(address, data)
}

/// Read-modify-write a set of fields in one register
pub fn set_register(
    transport: &mut dyn PacketTransport,
    registers: &mut RegisterMap,
    register: &str,
    fields: &[(&str, u32)],
) -> Result<()> {
    read_register_from_fee(transport, registers, register)?;
    for (field, value) in fields {
        registers.set_value(register, field, *value)?;
    }
    write_register_on_fee(transport, registers, register)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ChannelTransport;

    #[test]
    fn test_set_on_mode_writes_register() {
        let (mut transport, link) = ChannelTransport::pair();
        let mut registers = RegisterMap::new();

        let response = Command::SetOnMode
            .execute(&mut transport, &mut registers, &[])
            .unwrap();
        assert_eq!(response, CommandResponse::Mode(FeeMode::On as u8));

        link.memory.with(|mem| {
            assert_eq!(mem.write_log.len(), 1);
            assert_eq!(mem.write_log[0].0, 0x054);
        });
    }

    #[test]
    fn test_dump_mode_register_settings() {
        let (mut transport, link) = ChannelTransport::pair();
        let mut registers = RegisterMap::new();

        let command = Command::SetDumpMode {
            v_start: 0,
            v_end: 0,
            sensor_sel: 0b11,
            ccd_readout_order: 0b1110_0100,
            n_final_dump: 4510,
            sync_sel: 0,
        };
        let response = command.execute(&mut transport, &mut registers, &[]).unwrap();
        assert_eq!(response, CommandResponse::Mode(FeeMode::FullImage as u8));

        // dump mode: digitisation off, dump gate high, full image mode
        assert_eq!(registers.value_of("digitise_en").unwrap(), 0);
        assert_eq!(registers.value_of("dg_en").unwrap(), 1);
        assert_eq!(registers.value_of("n_final_dump").unwrap(), 4510);
        link.memory.with(|mem| {
            assert_eq!(
                mem.registers.value_of("ccd_mode_config").unwrap(),
                FeeMode::FullImage as u32
            );
        });
    }

    #[test]
    fn test_read_register_reconciles_mirror() {
        let (mut transport, link) = ChannelTransport::pair();
        let mut registers = RegisterMap::new();

        // the remote disagrees with the local mirror
        link.memory.with(|mem| {
            mem.registers
                .set_value("reg_0_config", "v_start", 123)
                .unwrap();
        });

        read_register_from_fee(&mut transport, &mut registers, "reg_0_config").unwrap();
        assert_eq!(registers.value_of("v_start").unwrap(), 123);
    }

    #[test]
    fn test_vgd_conversion() {
        // 17 V = 2841 = 0xB19: low nibble into reg_19, high byte into reg_20
        let dac = vgd_to_dac(17.0);
        assert_eq!(dac, 2841);
        assert_eq!(dac & 0b1111, 0x9);
        assert_eq!((dac >> 4) & 0xFF, 0xB1);
    }

    #[test]
    fn test_vgd_command_splits_registers() {
        let (mut transport, _link) = ChannelTransport::pair();
        let mut registers = RegisterMap::new();

        Command::SetVgd { voltage: 17.0 }
            .execute(&mut transport, &mut registers, &[])
            .unwrap();

        let dac = vgd_to_dac(17.0);
        assert_eq!(
            registers.get_value("reg_19_config", "ccd_vgd_config").unwrap(),
            dac & 0b1111
        );
        assert_eq!(
            registers.get_value("reg_20_config", "ccd_vgd_config").unwrap(),
            (dac >> 4) & 0xFF
        );
    }

    #[test]
    fn test_fpga_defaults() {
        let (mut transport, link) = ChannelTransport::pair();
        let mut registers = RegisterMap::new();
        let defaults = vec![FpgaDefault {
            register: "reg_4_config".to_string(),
            value: 0x186A_0000,
        }];

        Command::SetFpgaDefaults
            .execute(&mut transport, &mut registers, &defaults)
            .unwrap();

        assert_eq!(registers.value_of("int_sync_period").unwrap(), 0x186A);
        link.memory.with(|mem| {
            assert_eq!(mem.write_log, vec![(0x010, [0x18, 0x6A, 0x00, 0x00])]);
        });
    }

    #[test]
    fn test_sync_register_map_pulls_remote_state() {
        let (mut transport, link) = ChannelTransport::pair();
        let mut registers = RegisterMap::new();

        link.memory.with(|mem| {
            mem.registers
                .set_value("reg_21_config", "ccd_mode_config", 4)
                .unwrap();
        });

        let response = Command::SyncRegisterMap
            .execute(&mut transport, &mut registers, &[])
            .unwrap();
        assert_eq!(registers.value_of("ccd_mode_config").unwrap(), 4);
        match response {
            CommandResponse::RegisterMap(snapshot) => {
                assert_eq!(snapshot.len(), REGISTER_SPACE_SIZE)
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_prio_commands_use_tracked_state() {
        let mut internals = CycleInternals::new([1, 2, 3, 4]);
        let registers = RegisterMap::new();
        let state = FeeState {
            ccd_mode_config: FeeMode::FullImage as u8,
            digitise_en: false,
            dg_en: true,
            sync_sel: 1,
            ..FeeState::default()
        };

        assert_eq!(
            PrioCommand::GetMode.execute(&state, &mut internals, &registers),
            CommandResponse::Mode(FeeMode::FullImage as u8)
        );
        assert_eq!(
            PrioCommand::IsDumpMode.execute(&state, &mut internals, &registers),
            CommandResponse::Flag(true)
        );
        assert_eq!(
            PrioCommand::GetSyncMode.execute(&state, &mut internals, &registers),
            CommandResponse::Value(1)
        );

        assert_eq!(
            PrioCommand::SetSlicing { num_cycles: 5 }.execute(&state, &mut internals, &registers),
            CommandResponse::Int(5)
        );
        assert_eq!(internals.slicing_num_cycles, 5);
        assert_eq!(
            PrioCommand::GetSlicing.execute(&state, &mut internals, &registers),
            CommandResponse::Int(5)
        );
    }
}
