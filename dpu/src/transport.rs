/*!
Link transport between the DPU and the front-end.

The readout loop only sees the [`PacketTransport`] trait: packet reads with a
timeout, register reads/writes and memory map reads. The in-process
[`ChannelTransport`] backs the front-end simulator and the test suite; packet
traffic flows through a bounded crossbeam channel and the remote register
space lives behind a shared handle so both sides can inspect it.
*/

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use shared::RegisterMap;
use shared::Result;

/// Default capacity of the in-process packet channel
pub const PACKET_CHANNEL_CAPACITY: usize = 10000;

/// The link the readout processor talks over
pub trait PacketTransport: Send {
    /// Prepare the link for traffic
    fn configure(&mut self) -> Result<()>;

    /// Read the next packet. Returns `Ok(None)` when no packet arrived
    /// within the timeout.
    fn read_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;

    /// Read a single 32-bit register word from the front-end
    fn read_register(&mut self, address: u16) -> Result<[u8; 4]>;

    /// Write a single 32-bit register word to the front-end
    fn write_register(&mut self, address: u16, data: [u8; 4]) -> Result<()>;

    /// Read a range of the front-end memory map
    fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>>;
}

/// The register space of the simulated front-end, plus a log of every
/// register write the DPU performed (used by tests to assert on commanding)
#[derive(Debug, Default)]
pub struct RemoteMemory {
    pub registers: RegisterMap,
    pub write_log: Vec<(u16, [u8; 4])>,
}

/// Cloneable handle on the simulated front-end register space
#[derive(Debug, Clone, Default)]
pub struct RemoteMemoryHandle(Arc<Mutex<RemoteMemory>>);

impl RemoteMemoryHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a closure against the remote memory
    pub fn with<R>(&self, f: impl FnOnce(&mut RemoteMemory) -> R) -> R {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn read_register(&self, address: u16) -> Result<[u8; 4]> {
        self.with(|mem| {
            let data = mem.registers.get_data(address as u32, 4)?;
            let mut word = [0u8; 4];
            word.copy_from_slice(data);
            Ok(word)
        })
    }

    pub fn write_register(&self, address: u16, data: [u8; 4]) -> Result<()> {
        self.with(|mem| {
            mem.registers.set_data(address as u32, &data)?;
            mem.write_log.push((address, data));
            Ok(())
        })
    }

    pub fn read_range(&self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.with(|mem| mem.registers.get_data(address, length).map(|d| d.to_vec()))
    }
}

/// The front-end side of an in-process link
#[derive(Clone)]
pub struct FeeLink {
    /// Packets pushed here arrive at the DPU transport
    pub packets: Sender<Vec<u8>>,
    /// The simulated front-end register space
    pub memory: RemoteMemoryHandle,
}

impl FeeLink {
    /// Push a packet towards the DPU, dropping it when the channel is full
    pub fn send_packet(&self, packet: Vec<u8>) {
        if self.packets.try_send(packet).is_err() {
            tracing::debug!("packet channel full, dropping packet");
        }
    }
}

/// In-process transport backed by a crossbeam channel and a shared register
/// space
pub struct ChannelTransport {
    packet_rx: Receiver<Vec<u8>>,
    remote: RemoteMemoryHandle,
}

impl ChannelTransport {
    /// Create a connected transport/front-end pair
    pub fn pair() -> (ChannelTransport, FeeLink) {
        let (tx, rx) = bounded::<Vec<u8>>(PACKET_CHANNEL_CAPACITY);
        let memory = RemoteMemoryHandle::new();
        (
            ChannelTransport {
                packet_rx: rx,
                remote: memory.clone(),
            },
            FeeLink {
                packets: tx,
                memory,
            },
        )
    }
}

impl PacketTransport for ChannelTransport {
    fn configure(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_packet(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        match self.packet_rx.recv_timeout(timeout) {
            Ok(packet) => Ok(Some(packet)),
            // A disconnected front-end looks like silence; the readout loop
            // keeps cycling until it is told to quit.
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => Ok(None),
        }
    }

    fn read_register(&mut self, address: u16) -> Result<[u8; 4]> {
        self.remote.read_register(address)
    }

    fn write_register(&mut self, address: u16, data: [u8; 4]) -> Result<()> {
        self.remote.write_register(address, data)
    }

    fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>> {
        self.remote.read_range(address, length)
    }
}

impl std::fmt::Debug for ChannelTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelTransport")
            .field("queued_packets", &self.packet_rx.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_read_with_timeout() {
        let (mut transport, link) = ChannelTransport::pair();

        link.send_packet(vec![0x91, 0x01]);
        let packet = transport.read_packet(Duration::from_millis(10)).unwrap();
        assert_eq!(packet, Some(vec![0x91, 0x01]));

        let packet = transport.read_packet(Duration::from_millis(10)).unwrap();
        assert_eq!(packet, None);
    }

    #[test]
    fn test_register_access_and_write_log() {
        let (mut transport, link) = ChannelTransport::pair();

        transport
            .write_register(0x054, [0x00, 0x00, 0x00, 0x05])
            .unwrap();
        assert_eq!(
            transport.read_register(0x054).unwrap(),
            [0x00, 0x00, 0x00, 0x05]
        );

        link.memory.with(|mem| {
            assert_eq!(mem.write_log, vec![(0x054, [0x00, 0x00, 0x00, 0x05])]);
            assert_eq!(
                mem.registers
                    .get_value("reg_21_config", "ccd_mode_config")
                    .unwrap(),
                5
            );
        });
    }

    #[test]
    fn test_memory_map_read() {
        let (mut transport, link) = ChannelTransport::pair();

        link.memory.with(|mem| {
            mem.registers.set_data(0x700, &[0xAB, 0xCD, 0x00, 0x00]).unwrap();
        });
        let data = transport.read_memory(0x700, 4).unwrap();
        assert_eq!(data, vec![0xAB, 0xCD, 0x00, 0x00]);
    }
}
