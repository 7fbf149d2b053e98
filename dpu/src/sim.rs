/*!
A synthetic front-end for development and tests.

The simulator owns the front-end side of a [`ChannelTransport`] pair and
behaves like the FPGA as far as the readout loop is concerned: it emits a
timecode and a housekeeping packet on every sync pulse, produces image and
overscan data when the registers say digitisation is enabled, and refreshes
the housekeeping memory area. Register writes from the DPU land in the
shared register space and take effect on the next readout, so mode commands
behave like they do against real hardware.

[`ChannelTransport`]: crate::transport::ChannelTransport
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

use shared::mode::CcdSide;
use shared::packet::{
    pack_type_field, DataPacket, DataPacketHeader, DataPacketType, PacketType, TimecodePacket,
};
use shared::protocol::{DATA_PROTOCOL_ID, HK_MEMORY_ADDRESS, HK_MEMORY_SIZE};

use crate::state::{expected_last_packet_flags, FeeState};
use crate::transport::FeeLink;

/// Logical address used for simulated data-class packets
const LOGICAL_ADDRESS: u8 = 0x50;

/// Number of data packets per stream before the last-packet flag is raised
const PACKETS_PER_STREAM: u16 = 3;

/// Synthetic front-end, driving one side of an in-process link
pub struct FeeSimulator {
    link: FeeLink,
    quit: Arc<AtomicBool>,
    frame_period: Duration,
    timecode: u8,
    frame_number: u8,
    frame_counter: u16,
}

impl FeeSimulator {
    pub fn new(link: FeeLink, frame_period: Duration) -> Self {
        FeeSimulator {
            link,
            quit: Arc::new(AtomicBool::new(false)),
            frame_period,
            timecode: 0,
            frame_number: 0,
            frame_counter: 0,
        }
    }

    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    /// Run the simulator on its own thread
    pub fn spawn(self) -> SimulatorHandle {
        let quit = self.quit.clone();
        let join = thread::spawn(move || self.run());
        SimulatorHandle {
            quit,
            join: Some(join),
        }
    }

    /// Emit readouts until asked to quit
    pub fn run(mut self) {
        info!("🚀 Front-end simulator running");
        while !self.quit.load(Ordering::Relaxed) {
            self.emit_readout();
            thread::sleep(self.frame_period);
        }
        info!("🛑 Front-end simulator stopped");
    }

    /// One readout: timecode, housekeeping packet, data streams, updated
    /// housekeeping memory
    fn emit_readout(&mut self) {
        let state = self.effective_state();
        let mode = state.ccd_mode_config;

        self.link
            .send_packet(TimecodePacket { timecode: self.timecode }.to_bytes());
        self.refresh_hk_memory();
        self.link.send_packet(self.hk_packet(mode).to_bytes());

        let produces_data = state.mode().map(|m| m.produces_data()).unwrap_or(false);
        if produces_data && state.digitise_en {
            self.emit_data_streams(&state, mode);
        }

        debug!(
            "Simulated readout: frame {}, timecode {}, mode {}",
            self.frame_number, self.timecode, mode
        );

        self.timecode = (self.timecode + 1) & 0x3F;
        self.frame_counter = self.frame_counter.wrapping_add(1);
        // on the internal clock every readout is frame 0
        if state.internal_sync() {
            self.frame_number = 0;
        } else {
            self.frame_number = (self.frame_number + 1) % 4;
        }
    }

    /// What the FPGA latched for this readout, straight from the shared
    /// register space
    fn effective_state(&self) -> FeeState {
        self.link.memory.with(|mem| {
            let regs = &mem.registers;
            let value = |field: &str| regs.value_of(field).unwrap_or(0);
            FeeState {
                v_start: value("v_start") as u16,
                v_end: value("v_end") as u16,
                h_end: value("h_end") as u16,
                n_final_dump: value("n_final_dump") as u16,
                ccd_mode_config: value("ccd_mode_config") as u8,
                ccd_readout_order: value("ccd_readout_order") as u8,
                sync_sel: value("sync_sel") as u8,
                digitise_en: value("digitise_en") != 0,
                dg_en: value("dg_en") != 0,
                int_sync_period: value("int_sync_period") as u16,
                sensor_sel: value("sensor_sel") as u8,
                ccd_read_en: value("ccd_read_en") as u8,
            }
        })
    }

    fn hk_packet(&self, mode: u8) -> DataPacket {
        let data = self.hk_memory_block();
        DataPacket {
            header: DataPacketHeader {
                logical_address: LOGICAL_ADDRESS,
                protocol_id: DATA_PROTOCOL_ID,
                data_length: data.len() as u16,
                packet_type: DataPacketType(pack_type_field(
                    PacketType::Housekeeping,
                    self.frame_number,
                    0,
                    CcdSide::E,
                    false,
                    mode,
                )),
                frame_counter: self.frame_counter,
                sequence_counter: 0,
            },
            data: Bytes::from(data),
        }
    }

    /// One packet stream per expected last-packet flag, the final packet
    /// carrying the flag
    fn emit_data_streams(&self, state: &FeeState, mode: u8) {
        let expected = expected_last_packet_flags(state);
        let mut sequence = 0u16;
        for (slot, expected) in expected.iter().enumerate() {
            if !expected {
                continue;
            }
            let packet_type = if slot < 2 {
                PacketType::Data
            } else {
                PacketType::Overscan
            };
            let ccd_side = if slot % 2 == 0 { CcdSide::E } else { CcdSide::F };

            for n in 0..PACKETS_PER_STREAM {
                let last = n == PACKETS_PER_STREAM - 1;
                let payload = Bytes::from(vec![n as u8; 32]);
                let packet = DataPacket {
                    header: DataPacketHeader {
                        logical_address: LOGICAL_ADDRESS,
                        protocol_id: DATA_PROTOCOL_ID,
                        data_length: payload.len() as u16,
                        packet_type: DataPacketType(pack_type_field(
                            packet_type,
                            self.frame_number,
                            0,
                            ccd_side,
                            last,
                            mode,
                        )),
                        frame_counter: self.frame_counter,
                        sequence_counter: sequence,
                    },
                    data: payload,
                };
                self.link.send_packet(packet.to_bytes());
                sequence += 1;
            }
        }
    }

    fn hk_memory_block(&self) -> Vec<u8> {
        let mut block = vec![0u8; HK_MEMORY_SIZE];
        block[0x00..0x02].copy_from_slice(&self.frame_counter.to_be_bytes());
        block[0x02] = self.timecode;
        block
    }

    /// Refresh the housekeeping area of the shared register space so a
    /// memory read after the data phase sees this readout
    fn refresh_hk_memory(&self) {
        let block = self.hk_memory_block();
        self.link.memory.with(|mem| {
            let _ = mem.registers.set_data(HK_MEMORY_ADDRESS, &block);
        });
    }
}

/// Supervises the simulator thread
pub struct SimulatorHandle {
    quit: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SimulatorHandle {
    pub fn stop(&mut self) {
        self.quit.store(true, Ordering::Relaxed);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for SimulatorHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ChannelTransport, PacketTransport};
    use shared::mode::FeeMode;
    use shared::packet::LinkPacket;

    #[test]
    fn test_readout_starts_with_timecode_and_hk() {
        let (mut transport, link) = ChannelTransport::pair();
        let mut sim = FeeSimulator::new(link, Duration::from_millis(1));

        sim.emit_readout();

        let raw = transport
            .read_packet(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        assert!(matches!(
            LinkPacket::classify(&raw).unwrap(),
            LinkPacket::Timecode(_)
        ));

        let raw = transport
            .read_packet(Duration::from_millis(10))
            .unwrap()
            .unwrap();
        match LinkPacket::classify(&raw).unwrap() {
            LinkPacket::Housekeeping(packet) => {
                assert_eq!(packet.header.packet_type.frame_number(), 0);
                assert_eq!(packet.data.len(), HK_MEMORY_SIZE);
            }
            other => panic!("unexpected packet: {other:?}"),
        }

        // no data in ON mode
        assert!(transport
            .read_packet(Duration::from_millis(10))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_data_streams_follow_registers() {
        let (mut transport, link) = ChannelTransport::pair();

        link.memory.with(|mem| {
            let regs = &mut mem.registers;
            regs.set_value("reg_0_config", "v_start", 0).unwrap();
            regs.set_value("reg_0_config", "v_end", 4509).unwrap();
            regs.set_value("reg_5_config", "sensor_sel", 0b11).unwrap();
            regs.set_value("reg_5_config", "digitise_en", 1).unwrap();
            regs.set_value("reg_21_config", "ccd_mode_config", FeeMode::FullImage as u32)
                .unwrap();
        });

        let mut sim = FeeSimulator::new(link, Duration::from_millis(1));
        sim.emit_readout();

        // skip timecode and housekeeping
        transport.read_packet(Duration::from_millis(10)).unwrap();
        transport.read_packet(Duration::from_millis(10)).unwrap();

        let mut last_flags = Vec::new();
        while let Some(raw) = transport.read_packet(Duration::from_millis(10)).unwrap() {
            if let LinkPacket::Data(packet) = LinkPacket::classify(&raw).unwrap() {
                if packet.header.packet_type.last_packet() {
                    last_flags.push((
                        packet.header.packet_type.packet_type().unwrap(),
                        packet.header.packet_type.ccd_side(),
                    ));
                }
            }
        }

        // both sides deliver a data stream, no overscan for v_end = 4509
        assert_eq!(
            last_flags,
            vec![
                (PacketType::Data, CcdSide::E),
                (PacketType::Data, CcdSide::F),
            ]
        );
    }

    #[test]
    fn test_frame_number_cycles_on_external_clock() {
        let (_transport, link) = ChannelTransport::pair();
        let mut sim = FeeSimulator::new(link, Duration::from_millis(1));

        let frames: Vec<u8> = (0..6)
            .map(|_| {
                let frame = sim.frame_number;
                sim.emit_readout();
                frame
            })
            .collect();
        assert_eq!(frames, vec![0, 1, 2, 3, 0, 1]);
    }
}
