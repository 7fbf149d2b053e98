/*!
The readout loop and its supervisor.

The [`ReadoutProcessor`] synchronises to the sync pulses of the front-end.
Each iteration handles one readout: timecode, housekeeping packet, data
packets, updated housekeeping, and finally the commanding window in which
queued commands are sent to the front-end. Priority commands are answered
from the tracked state at two points in the cycle so a client never waits
for the data phase to finish.

Commanding is only safe inside a window of the readout cycle; the front-end
silently discards register writes outside of it. The loop therefore
dispatches at most one normal command per readout, after the data phase.

A transient error (missed timecode, late data) ends the iteration but the
commanding window of that readout is still honoured; the loop resynchronises
on the next sync pulse.
*/

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use serde_json::json;
use tracing::{debug, error, info, warn};

use shared::packet::{is_timecode, DataPacket, LinkPacket, TimecodePacket};
use shared::protocol::{
    CCD_ROWS, HK_MEMORY_ADDRESS, HK_MEMORY_SIZE, REGISTER_SPACE_SIZE, SENSOR_SEL_BOTH_SIDES,
};

use crate::commands::{
    self, Command, CommandEnvelope, CommandResponse, PrioCommand, DUMP_MODE_INT_SYNC_PERIOD,
};
use crate::config::DpuConfig;
use crate::error::ReadoutError;
use crate::monitor::{MonitoringHub, MonitoringTopic};
use crate::state::{
    rotate_readout_order, CycleInternals, DumpTransition, FeeStateTracker, HousekeepingData,
};
use crate::storage::{Storage, StorageItem};
use crate::transport::PacketTransport;

/// A command name paired with its outcome, sent back to the facade
pub type CommandReply = (&'static str, Result<CommandResponse, String>);

/// The processor ends of the command and response channels
pub struct ProcessorChannels {
    pub priority_rx: Receiver<PrioCommand>,
    pub command_rx: Receiver<CommandEnvelope>,
    /// Used by the loop itself to enqueue the dump transition command
    pub command_tx: Sender<CommandEnvelope>,
    pub response_tx: Sender<CommandReply>,
    pub prio_response_tx: Sender<CommandReply>,
}

/// The readout loop, owning the link, the register mirror and the sinks
pub struct ReadoutProcessor {
    transport: Box<dyn PacketTransport>,
    storage: Box<dyn Storage>,
    hub: MonitoringHub,
    config: DpuConfig,
    channels: ProcessorChannels,
    quit: Arc<AtomicBool>,
    register_map: shared::RegisterMap,
    tracker: FeeStateTracker,
    internals: CycleInternals,
    registration_open: bool,
}

impl ReadoutProcessor {
    pub fn new(
        config: DpuConfig,
        transport: Box<dyn PacketTransport>,
        storage: Box<dyn Storage>,
        hub: MonitoringHub,
        channels: ProcessorChannels,
    ) -> Self {
        let internals = CycleInternals::new(config.camera.default_ccd_readout_order);
        ReadoutProcessor {
            transport,
            storage,
            hub,
            config,
            channels,
            quit: Arc::new(AtomicBool::new(false)),
            register_map: shared::RegisterMap::new(),
            tracker: FeeStateTracker::new(),
            internals,
            registration_open: false,
        }
    }

    /// Shared flag that asks the loop to finish the current readout and stop
    pub fn quit_flag(&self) -> Arc<AtomicBool> {
        self.quit.clone()
    }

    /// Run the readout loop until asked to quit or a fatal error occurs
    pub fn run(mut self) -> Result<(), ReadoutError> {
        self.transport.configure()?;

        match self.initialise_register_map() {
            Ok(()) => {}
            Err(ReadoutError::Aborted) => {
                info!("🛑 Readout processor stopped before initialisation completed");
                let _ = self.storage.unregister();
                return Ok(());
            }
            Err(err) => {
                warn!("Could not synchronise the register map during startup: {err}");
            }
        }

        info!("🚀 Readout processor running");

        while !self.quit.load(Ordering::Relaxed) {
            let head = self.readout_head();

            // The commanding window of this readout is honoured even when
            // the head of the cycle failed.
            self.process_priority_commands();

            let dispatch = if self.internals.int_sync_cycle_dump_mode()
                && self.internals.cycle_count != 0
            {
                // mid clear-out rotation, commanding is suspended until all
                // four CCDs have been cleared
                Ok(())
            } else {
                self.dispatch_command()
            };

            for result in [head, dispatch] {
                if let Err(err) = result {
                    if err.is_transient() {
                        if !err.is_silent() {
                            warn!("Readout cycle incomplete: {err}");
                        }
                    } else {
                        error!("Readout processor failed: {err}");
                        let _ = self.storage.unregister();
                        return Err(err);
                    }
                }
            }
        }

        let _ = self.storage.unregister();
        info!("🛑 Readout processor stopped");
        Ok(())
    }

    /// Everything from the timecode up to and including the clear-out
    /// rotation. The commanding window handling runs after this, whether it
    /// succeeded or not.
    fn readout_head(&mut self) -> Result<(), ReadoutError> {
        let (timecode, received_at) = self.read_timecode()?;
        let hk_packet = self.read_housekeeping_packet()?;

        self.internals.frame_number = hk_packet.header.packet_type.frame_number() as i8;
        self.internals.clear_error_flags = true;

        if self.internals.is_major_pulse() {
            self.start_cycle_registration();
            let state = self.tracker.major_update(&self.register_map)?;
            self.internals.refresh_expected_flags(&state);
        } else {
            self.tracker.minor_update(&self.register_map)?;
        }
        let state = self.tracker.state();
        self.internals.update_from(&state);

        let frame = self.internals.frame_number;
        self.save(StorageItem::Timecode {
            frame,
            timecode: timecode.timecode,
            timestamp: chrono::Utc::now(),
        });
        self.hub.publish(
            MonitoringTopic::SyncTimecode,
            json!({"timecode": timecode.timecode, "frame_number": frame}),
        );
        self.hub.publish(
            MonitoringTopic::SyncHkPacket,
            json!({
                "type_field": hk_packet.header.packet_type.0,
                "frame_counter": hk_packet.header.frame_counter,
            }),
        );
        self.save(StorageItem::HousekeepingPacket {
            frame,
            packet: hk_packet,
        });

        self.process_priority_commands();

        if self.internals.is_major_pulse() {
            // published every cycle, negative values serve as an idle
            // heartbeat for downstream consumers; the decrement has no floor
            self.hub
                .publish(MonitoringTopic::NumCycles, json!(self.internals.num_cycles));
            self.internals.num_cycles -= 1;
            self.save(StorageItem::SlicingParameter {
                value: self.internals.slicing_num_cycles,
            });
        }

        if self.internals.is_end_of_cycle() && self.internals.num_cycles == 0 {
            self.enqueue_dump_transition();
        }

        self.read_data_packets(received_at)?;

        // give the front-end time to refresh the housekeeping memory area
        thread::sleep(self.config.timing.hk_settle());
        self.read_updated_housekeeping()?;

        if self.internals.int_sync_cycle_dump_mode() {
            self.rotate_ccd_clear_out()?;
        }

        Ok(())
    }

    /// Wait for the next sync pulse
    fn read_timecode(&mut self) -> Result<(TimecodePacket, Instant), ReadoutError> {
        let raw = self
            .transport
            .read_packet(self.config.timing.timecode_timeout())?
            .ok_or(ReadoutError::TimecodeTimeout)?;
        let received_at = Instant::now();
        if raw.len() <= 1 {
            return Err(ReadoutError::NoBytesReceived);
        }
        match LinkPacket::classify(&raw) {
            Ok(LinkPacket::Timecode(timecode)) => {
                debug!("Received timecode {}", timecode.timecode);
                Ok((timecode, received_at))
            }
            Ok(other) => Err(ReadoutError::UnexpectedPacket {
                expected: "timecode packet",
                got: other.class_name(),
            }),
            Err(_) => Err(ReadoutError::UnexpectedPacket {
                expected: "timecode packet",
                got: "undecodable packet",
            }),
        }
    }

    /// The housekeeping packet follows right after the timecode and carries
    /// the frame number of this readout
    fn read_housekeeping_packet(&mut self) -> Result<DataPacket, ReadoutError> {
        let raw = self
            .transport
            .read_packet(self.config.timing.packet_timeout())?
            .ok_or(ReadoutError::NoBytesReceived)?;
        if raw.len() <= 1 {
            return Err(ReadoutError::NoBytesReceived);
        }
        match LinkPacket::classify(&raw) {
            Ok(LinkPacket::Housekeeping(packet)) => Ok(packet),
            Ok(other) => Err(ReadoutError::UnexpectedPacket {
                expected: "housekeeping packet",
                got: other.class_name(),
            }),
            Err(_) => Err(ReadoutError::UnexpectedPacket {
                expected: "housekeeping packet",
                got: "undecodable packet",
            }),
        }
    }

    /// Open the registration for a new readout cycle. The filenames of the
    /// previous cycle are announced before the new registration replaces
    /// them. A storage backend that refuses the registration costs this
    /// cycle its archive, nothing else.
    fn start_cycle_registration(&mut self) {
        let previous: Vec<String> = self
            .storage
            .filenames()
            .iter()
            .map(|p| p.display().to_string())
            .collect();

        match self.storage.new_registration() {
            Ok(()) => self.registration_open = true,
            Err(err) => {
                warn!("Could not open a storage registration for this cycle: {err}");
                self.registration_open = false;
            }
        }

        self.save(StorageItem::RegisterMap {
            snapshot: self.register_map.snapshot(),
        });
        self.hub.publish(
            MonitoringTopic::RegisterMap,
            json!({"register_map": hex::encode(self.register_map.as_bytes())}),
        );
        if !previous.is_empty() {
            self.hub
                .publish(MonitoringTopic::FilesReady, json!(previous));
        }
        // the counter itself may run negative, the archived value never does
        self.save(StorageItem::NumCycles {
            value: self.internals.num_cycles.max(0),
        });
    }

    /// Answer every queued priority command from the tracked state
    fn process_priority_commands(&mut self) {
        while let Ok(command) = self.channels.priority_rx.try_recv() {
            let name = command.name();
            let state = self.tracker.state();
            let response = command.execute(&state, &mut self.internals, &self.register_map);
            if self
                .channels
                .prio_response_tx
                .send((name, Ok(response)))
                .is_err()
            {
                debug!("Priority response receiver is gone");
            }
        }
    }

    /// The user cycle count ran out: send the front-end to dump mode
    fn enqueue_dump_transition(&mut self) {
        let order = self
            .config
            .camera
            .encode_readout_order(&self.config.camera.default_ccd_readout_order);

        let command = match self.internals.dump_transition {
            DumpTransition::External => Command::SetDumpMode {
                v_start: 0,
                v_end: 0,
                sensor_sel: SENSOR_SEL_BOTH_SIDES,
                ccd_readout_order: order,
                n_final_dump: CCD_ROWS,
                sync_sel: 0,
            },
            DumpTransition::InternalSync => {
                self.internals
                    .reset_int_sync_dump_mode(self.config.camera.default_ccd_readout_order);
                Command::SetDumpModeIntSync {
                    v_start: 0,
                    v_end: 0,
                    sensor_sel: SENSOR_SEL_BOTH_SIDES,
                    ccd_readout_order: order,
                    n_final_dump: CCD_ROWS,
                    int_sync_period: DUMP_MODE_INT_SYNC_PERIOD,
                    sync_sel: 1,
                }
            }
        };

        info!("Observation finished, sending the front-end to dump mode");
        let envelope = CommandEnvelope {
            command,
            num_cycles: None,
            dump_transition: self.internals.dump_transition,
            respond: false,
        };
        if self.channels.command_tx.send(envelope).is_err() {
            warn!("Command queue is gone, cannot send the front-end to dump mode");
        }
    }

    /// Collect image and overscan data until every expected last-packet flag
    /// has been seen
    fn read_data_packets(&mut self, timecode_at: Instant) -> Result<(), ReadoutError> {
        if self.internals.dump_mode {
            debug!("Front-end is in dump mode, no data expected");
            return Ok(());
        }
        let state = self.tracker.state();
        let produces_data = state.mode().map(|m| m.produces_data()).unwrap_or(false);
        if !produces_data {
            return Ok(());
        }

        let deadline = timecode_at + self.config.timing.data_deadline();
        let expected = self.internals.expected_last_packet_flags;
        let mut actual = [false; 4];
        let mut index = 0u32;
        let frame = self.internals.frame_number;

        loop {
            if let Some(raw) = self
                .transport
                .read_packet(self.config.timing.packet_timeout())?
            {
                match LinkPacket::classify(&raw) {
                    Ok(LinkPacket::Data(packet)) => {
                        let type_field = packet.header.packet_type;
                        let slot = crate::state::last_packet_index(
                            type_field.packet_type().map_err(ReadoutError::Shared)?,
                            type_field.ccd_side(),
                        );
                        actual[slot] = type_field.last_packet();
                        self.hub.publish(
                            MonitoringTopic::SyncDataPacket,
                            json!({
                                "type_field": type_field.0,
                                "sequence_counter": packet.header.sequence_counter,
                            }),
                        );
                        self.save(StorageItem::DataPacket {
                            frame,
                            index,
                            packet,
                        });
                        index += 1;
                    }
                    Ok(LinkPacket::Timecode(_)) => {
                        return Err(ReadoutError::UnexpectedPacket {
                            expected: "data packet",
                            got: "timecode packet",
                        });
                    }
                    Ok(LinkPacket::Housekeeping(_)) => {
                        return Err(ReadoutError::UnexpectedPacket {
                            expected: "data packet",
                            got: "housekeeping packet",
                        });
                    }
                    Ok(other) => {
                        debug!("Ignoring {} during the data phase", other.class_name());
                    }
                    Err(_) => {
                        return Err(ReadoutError::UnexpectedPacket {
                            expected: "data packet",
                            got: "undecodable packet",
                        });
                    }
                }
            }

            if crate::state::got_all_last_packets(&actual, &expected) {
                debug!("All expected last packets received ({index} data packets)");
                return Ok(());
            }
            if Instant::now() > deadline {
                return Err(ReadoutError::DataDeadlineExceeded);
            }
        }
    }

    /// Read the refreshed housekeeping memory area of the front-end
    fn read_updated_housekeeping(&mut self) -> Result<(), ReadoutError> {
        let raw = self
            .transport
            .read_memory(HK_MEMORY_ADDRESS, HK_MEMORY_SIZE)?;
        self.register_map.set_data(HK_MEMORY_ADDRESS, &raw)?;
        let hk = HousekeepingData::decode(&raw)?;

        if hk.error_flags != 0 {
            warn!(
                "Front-end reports error flags 0x{:08X} in frame {}",
                hk.error_flags, hk.frame_counter
            );
        }

        let frame = self.internals.frame_number;
        self.save(StorageItem::HousekeepingData {
            frame,
            data: raw,
            timestamp: chrono::Utc::now(),
        });
        self.hub.publish(
            MonitoringTopic::SyncErrorFlags,
            json!({"error_flags": hk.error_flags, "frame_counter": hk.frame_counter}),
        );
        self.hub.publish(
            MonitoringTopic::SyncHkData,
            json!({"data": hex::encode(&hk.raw)}),
        );
        Ok(())
    }

    /// In internal sync dump mode the CCDs are cleared out in turn: rotate
    /// the readout order once per readout, four readouts form one atomic
    /// block
    fn rotate_ccd_clear_out(&mut self) -> Result<(), ReadoutError> {
        self.internals.current_ccd_readout_order =
            rotate_readout_order(self.internals.current_ccd_readout_order);
        let encoded = self
            .config
            .camera
            .encode_readout_order(&self.internals.current_ccd_readout_order);

        debug!(
            "Clear-out rotation: readout order {:?} (0x{encoded:02X})",
            self.internals.current_ccd_readout_order
        );
        commands::set_register(
            &mut *self.transport,
            &mut self.register_map,
            "reg_2_config",
            &[("ccd_readout_order", encoded as u32)],
        )
        .map_err(|source| ReadoutError::Command {
            name: "set_readout_order",
            source,
        })?;

        self.internals.cycle_count = (self.internals.cycle_count + 1) % 4;
        Ok(())
    }

    /// Send at most one queued command to the front-end. The error flags of
    /// the front-end are cleared first, once per readout.
    fn dispatch_command(&mut self) -> Result<(), ReadoutError> {
        if self.internals.clear_error_flags {
            if let Err(err) = Command::ClearErrorFlags.execute(
                &mut *self.transport,
                &mut self.register_map,
                &self.config.fpga_defaults,
            ) {
                warn!("Could not clear the front-end error flags: {err}");
            }
            self.internals.clear_error_flags = false;
        }

        let envelope = match self.channels.command_rx.try_recv() {
            Ok(envelope) => envelope,
            Err(_) => return Ok(()),
        };

        if let Some(num_cycles) = envelope.num_cycles {
            self.internals.num_cycles = num_cycles;
        }
        self.internals.dump_transition = envelope.dump_transition;

        let name = envelope.command.name();
        let rendered = format!("{:?}", envelope.command);
        let result = envelope.command.execute(
            &mut *self.transport,
            &mut self.register_map,
            &self.config.fpga_defaults,
        );

        self.save(StorageItem::Command {
            frame: self.internals.frame_number,
            rendered,
        });

        match result {
            Ok(response) => {
                if envelope.respond {
                    let _ = self.channels.response_tx.send((name, Ok(response)));
                }
                Ok(())
            }
            Err(source) => {
                if envelope.respond {
                    let _ = self
                        .channels
                        .response_tx
                        .send((name, Err(source.to_string())));
                }
                Err(ReadoutError::Command { name, source })
            }
        }
    }

    /// Synchronise the local register mirror with the front-end.
    ///
    /// The register map can only be read inside the commanding window, so
    /// this waits for a sync pulse and then for a guard interval that covers
    /// the remainder of the readout before issuing the read.
    fn initialise_register_map(&mut self) -> Result<(), ReadoutError> {
        info!("Waiting for the first timecode from the front-end");
        loop {
            if self.quit.load(Ordering::Relaxed) {
                return Err(ReadoutError::Aborted);
            }
            if let Some(raw) = self.transport.read_packet(Duration::from_millis(200))? {
                if is_timecode(&raw) {
                    break;
                }
            }
        }

        // discard traffic until the commanding window is guaranteed open
        let guard_end = Instant::now() + self.config.timing.init_guard();
        loop {
            let remaining = guard_end.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            if self.quit.load(Ordering::Relaxed) {
                return Err(ReadoutError::Aborted);
            }
            self.transport
                .read_packet(remaining.min(Duration::from_millis(200)))?;
        }

        let data = self.transport.read_memory(0, REGISTER_SPACE_SIZE)?;
        self.register_map.set_data(0, &data)?;
        let state = self.tracker.major_update(&self.register_map)?;
        self.internals.update_from(&state);
        self.internals.refresh_expected_flags(&state);

        info!("✅ Register map synchronised with the front-end");
        Ok(())
    }

    /// Storage is fire and forget: a failed save loses that item, the
    /// readout itself carries on.
    fn save(&mut self, item: StorageItem) {
        // nothing is stored before the first cycle registration opens
        if !self.registration_open || !self.config.processor.enable_storage {
            return;
        }
        if let Err(err) = self.storage.save(item) {
            warn!("Could not store readout item: {err}");
        }
    }
}

/// Supervises the readout thread: start, liveness, orderly stop
pub struct ProcessorHandle {
    quit: Arc<AtomicBool>,
    join: Option<JoinHandle<Result<(), ReadoutError>>>,
    cycle_period: Duration,
}

impl ProcessorHandle {
    /// Run the processor on its own thread
    pub fn spawn(processor: ReadoutProcessor) -> Self {
        let quit = processor.quit_flag();
        let cycle_period = processor.config.timing.cycle_period();
        let join = thread::spawn(move || processor.run());
        ProcessorHandle {
            quit,
            join: Some(join),
            cycle_period,
        }
    }

    /// Ask the loop to finish the current readout and stop
    pub fn request_quit(&self) {
        self.quit.store(true, Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        self.join.as_ref().map(|j| !j.is_finished()).unwrap_or(false)
    }

    /// Stop the processor and collect its result. The loop only checks the
    /// quit flag between readouts, so a full cycle period is granted before
    /// escalating; a thread that still does not finish is abandoned.
    pub fn stop(&mut self) -> Option<Result<(), ReadoutError>> {
        self.request_quit();

        let join = self.join.take()?;
        if !wait_for_finish(&join, self.cycle_period) {
            warn!("Readout processor did not stop within one cycle, waiting one more");
            if !wait_for_finish(&join, self.cycle_period) {
                error!("Readout processor is not responding, abandoning the thread");
                return None;
            }
        }

        match join.join() {
            Ok(result) => Some(result),
            Err(_) => {
                error!("Readout processor thread panicked");
                Some(Err(ReadoutError::Shared(shared::SharedError::new(
                    "readout processor thread panicked",
                ))))
            }
        }
    }
}

fn wait_for_finish(join: &JoinHandle<Result<(), ReadoutError>>, period: Duration) -> bool {
    let deadline = Instant::now() + period;
    while Instant::now() < deadline {
        if join.is_finished() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    join.is_finished()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade;
    use crate::storage::MemoryStorage;
    use crate::transport::{ChannelTransport, FeeLink};

    fn test_processor() -> (
        ReadoutProcessor,
        crate::facade::DpuFacade,
        MemoryStorage,
        FeeLink,
    ) {
        let (facade, channels) = facade::command_channels();
        let (transport, link) = ChannelTransport::pair();
        let storage = MemoryStorage::new();
        let mut config = DpuConfig::new();
        config.timing.timecode_timeout_ms = 5;
        config.timing.packet_timeout_ms = 5;
        let processor = ReadoutProcessor::new(
            config,
            Box::new(transport),
            Box::new(storage.clone()),
            MonitoringHub::new(),
            channels,
        );
        (processor, facade, storage, link)
    }

    #[test]
    fn test_dispatch_applies_envelope_options() {
        let (mut processor, _facade, _storage, _link) = test_processor();

        processor
            .channels
            .command_tx
            .send(CommandEnvelope {
                command: Command::SetOnMode,
                num_cycles: Some(3),
                dump_transition: DumpTransition::InternalSync,
                respond: false,
            })
            .unwrap();

        processor.dispatch_command().unwrap();
        assert_eq!(processor.internals.num_cycles, 3);
        assert_eq!(
            processor.internals.dump_transition,
            DumpTransition::InternalSync
        );
    }

    #[test]
    fn test_dump_transition_external() {
        let (mut processor, _facade, _storage, _link) = test_processor();

        processor.internals.num_cycles = 0;
        processor.enqueue_dump_transition();

        let envelope = processor.channels.command_rx.try_recv().unwrap();
        assert!(!envelope.respond);
        match envelope.command {
            Command::SetDumpMode {
                n_final_dump,
                sync_sel,
                ..
            } => {
                assert_eq!(n_final_dump, CCD_ROWS);
                assert_eq!(sync_sel, 0);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_dump_transition_internal_sync_resets_rotation() {
        let (mut processor, _facade, _storage, _link) = test_processor();

        processor.internals.dump_transition = DumpTransition::InternalSync;
        processor.internals.current_ccd_readout_order = [3, 4, 1, 2];
        processor.internals.cycle_count = 2;
        processor.enqueue_dump_transition();

        assert_eq!(processor.internals.current_ccd_readout_order, [1, 2, 3, 4]);
        assert_eq!(processor.internals.cycle_count, 0);

        let envelope = processor.channels.command_rx.try_recv().unwrap();
        match envelope.command {
            Command::SetDumpModeIntSync {
                int_sync_period,
                sync_sel,
                ..
            } => {
                assert_eq!(int_sync_period, DUMP_MODE_INT_SYNC_PERIOD);
                assert_eq!(sync_sel, 1);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_clear_error_flags_once_per_readout() {
        let (mut processor, _facade, _storage, _link) = test_processor();

        processor.internals.clear_error_flags = true;
        processor.dispatch_command().unwrap();
        assert!(!processor.internals.clear_error_flags);
        assert_eq!(
            processor.register_map.value_of("clear_error_flag").unwrap(),
            1
        );
    }

    #[test]
    fn test_rotation_writes_next_order() {
        let (mut processor, _facade, _storage, _link) = test_processor();

        processor.rotate_ccd_clear_out().unwrap();
        assert_eq!(processor.internals.current_ccd_readout_order, [2, 3, 4, 1]);
        assert_eq!(processor.internals.cycle_count, 1);
        assert_eq!(
            processor.register_map.value_of("ccd_readout_order").unwrap(),
            0b0011_1001
        );

        for _ in 0..3 {
            processor.rotate_ccd_clear_out().unwrap();
        }
        assert_eq!(processor.internals.current_ccd_readout_order, [1, 2, 3, 4]);
        assert_eq!(processor.internals.cycle_count, 0);
    }

    #[test]
    fn test_housekeeping_during_data_phase_aborts_the_readout() {
        use bytes::Bytes;
        use shared::mode::{CcdSide, FeeMode};
        use shared::packet::{pack_type_field, DataPacketHeader, DataPacketType, PacketType};
        use shared::protocol::DATA_PROTOCOL_ID;

        let (mut processor, _facade, _storage, link) = test_processor();

        processor
            .register_map
            .set_value("reg_0_config", "v_end", 4509)
            .unwrap();
        processor
            .register_map
            .set_value("reg_5_config", "sensor_sel", SENSOR_SEL_BOTH_SIDES as u32)
            .unwrap();
        processor
            .register_map
            .set_value("reg_5_config", "digitise_en", 1)
            .unwrap();
        processor
            .register_map
            .set_value("reg_21_config", "ccd_mode_config", FeeMode::FullImage as u32)
            .unwrap();
        let state = processor.tracker.major_update(&processor.register_map).unwrap();
        processor.internals.update_from(&state);
        processor.internals.refresh_expected_flags(&state);

        let stray_hk = DataPacket {
            header: DataPacketHeader {
                logical_address: 0x50,
                protocol_id: DATA_PROTOCOL_ID,
                data_length: 4,
                packet_type: DataPacketType(pack_type_field(
                    PacketType::Housekeeping,
                    0,
                    0,
                    CcdSide::E,
                    false,
                    FeeMode::FullImage as u8,
                )),
                frame_counter: 1,
                sequence_counter: 0,
            },
            data: Bytes::from_static(&[0, 0, 0, 0]),
        };
        link.send_packet(stray_hk.to_bytes());

        let err = processor.read_data_packets(Instant::now()).unwrap_err();
        assert!(matches!(
            err,
            ReadoutError::UnexpectedPacket {
                got: "housekeeping packet",
                ..
            }
        ));
        assert!(err.is_transient());
    }
}
