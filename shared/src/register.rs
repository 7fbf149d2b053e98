/*!
Local mirror of the front-end register space.

The [`RegisterMap`] covers the critical, general and housekeeping areas of the
front-end memory map (0x800 bytes). The windowing area is much larger and is
not mirrored. Registers are 32-bit big-endian words; named fields are bit
ranges within a word, described by a static field table.

The register map has a single writer, the readout controller. Everything else
only ever sees snapshots.
*/

use tracing::debug;

use crate::error::{Result, SharedError};
use crate::protocol::REGISTER_SPACE_SIZE;

/// Descriptor of a named bit-field within a 32-bit register word
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterField {
    /// Name of the register, e.g. `reg_0_config`
    pub register: &'static str,
    /// Name of the field within the register, e.g. `v_start`
    pub field: &'static str,
    /// Byte address of the register word in the memory map
    pub address: u16,
    /// Bit offset of the field within the 32-bit word
    pub offset: u8,
    /// Width of the field in bits
    pub width: u8,
}

const fn field(
    register: &'static str,
    field: &'static str,
    address: u16,
    offset: u8,
    width: u8,
) -> RegisterField {
    RegisterField {
        register,
        field,
        address,
        offset,
        width,
    }
}

/// The register fields the DPU components act on. Addresses and bit layout
/// follow the front-end FPGA register definition.
pub const FIELD_TABLE: &[RegisterField] = &[
    field("reg_0_config", "v_start", 0x000, 0, 16),
    field("reg_0_config", "v_end", 0x000, 16, 16),
    field("reg_1_config", "charge_injection_width", 0x004, 0, 16),
    field("reg_1_config", "charge_injection_gap", 0x004, 16, 16),
    field("reg_2_config", "parallel_toi_period", 0x008, 0, 12),
    field("reg_2_config", "parallel_clk_overlap", 0x008, 12, 12),
    field("reg_2_config", "ccd_readout_order", 0x008, 24, 8),
    field("reg_3_config", "n_final_dump", 0x00C, 0, 16),
    field("reg_3_config", "h_end", 0x00C, 16, 12),
    field("reg_3_config", "charge_injection_en", 0x00C, 28, 1),
    field("reg_3_config", "tri_level_clk_en", 0x00C, 29, 1),
    field("reg_3_config", "img_clk_dir", 0x00C, 30, 1),
    field("reg_3_config", "reg_clk_dir", 0x00C, 31, 1),
    field("reg_4_config", "data_packet_size", 0x010, 0, 16),
    field("reg_4_config", "int_sync_period", 0x010, 16, 16),
    field("reg_5_config", "sensor_sel", 0x014, 0, 2),
    field("reg_5_config", "digitise_en", 0x014, 2, 1),
    field("reg_5_config", "dg_en", 0x014, 3, 1),
    field("reg_5_config", "sync_sel", 0x014, 4, 1),
    field("reg_5_config", "ccd_read_en", 0x014, 5, 4),
    field("reg_5_config", "high_precision_hk_en", 0x014, 9, 1),
    field("reg_19_config", "ccd_vgd_config", 0x04C, 28, 4),
    field("reg_20_config", "ccd_vgd_config", 0x050, 0, 8),
    field("reg_21_config", "ccd_mode_config", 0x054, 0, 4),
    field("reg_21_config", "clear_error_flag", 0x054, 4, 1),
];

/// Byte-backed mirror of the front-end register space
#[derive(Debug, Clone)]
pub struct RegisterMap {
    memory: Vec<u8>,
}

impl Default for RegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterMap {
    /// Create a zero-initialised register map
    pub fn new() -> Self {
        RegisterMap {
            memory: vec![0u8; REGISTER_SPACE_SIZE],
        }
    }

    fn lookup(register: &str, field_name: &str) -> Result<&'static RegisterField> {
        FIELD_TABLE
            .iter()
            .find(|f| f.register == register && f.field == field_name)
            .ok_or_else(|| SharedError::field_not_found(register, field_name))
    }

    fn lookup_unique(field_name: &str) -> Result<&'static RegisterField> {
        let mut matches = FIELD_TABLE.iter().filter(|f| f.field == field_name);
        let first = matches
            .next()
            .ok_or_else(|| SharedError::new(format!("unknown field name: {field_name}")))?;
        if matches.next().is_some() {
            return Err(SharedError::new(format!(
                "field name is ambiguous: {field_name}"
            )));
        }
        Ok(first)
    }

    /// Return the byte address of the given register word
    pub fn register_address(register: &str) -> Result<u16> {
        FIELD_TABLE
            .iter()
            .find(|f| f.register == register)
            .map(|f| f.address)
            .ok_or_else(|| SharedError::UnknownRegister(register.to_string()))
    }

    fn word(&self, address: u16) -> u32 {
        let addr = address as usize;
        u32::from_be_bytes([
            self.memory[addr],
            self.memory[addr + 1],
            self.memory[addr + 2],
            self.memory[addr + 3],
        ])
    }

    fn set_word(&mut self, address: u16, value: u32) {
        let addr = address as usize;
        self.memory[addr..addr + 4].copy_from_slice(&value.to_be_bytes());
    }

    /// Read the current value of a named field
    pub fn get_value(&self, register: &str, field_name: &str) -> Result<u32> {
        let field = Self::lookup(register, field_name)?;
        let word = self.word(field.address);
        Ok((word >> field.offset) & mask(field.width))
    }

    /// Set the value of a named field, leaving the other bits of the register
    /// word untouched
    pub fn set_value(&mut self, register: &str, field_name: &str, value: u32) -> Result<()> {
        let field = Self::lookup(register, field_name)?;
        let old = self.word(field.address);
        let m = mask(field.width) << field.offset;
        let new = (old & !m) | ((value << field.offset) & m);
        if new != old {
            debug!(
                "set new value for register {}:{}: 0x{:08X} (was 0x{:08X})",
                register, field_name, new, old
            );
        }
        self.set_word(field.address, new);
        Ok(())
    }

    /// Read a field by its name alone. Fails when the name is not unique
    /// across registers (e.g. `ccd_vgd_config`).
    pub fn value_of(&self, field_name: &str) -> Result<u32> {
        let field = Self::lookup_unique(field_name)?;
        self.get_value(field.register, field.field)
    }

    /// Return the 4 byte data word of the given register
    pub fn get_register_data(&self, register: &str) -> Result<[u8; 4]> {
        let address = Self::register_address(register)? as usize;
        let mut data = [0u8; 4];
        data.copy_from_slice(&self.memory[address..address + 4]);
        Ok(data)
    }

    /// Replace the 4 byte data word of the given register
    pub fn set_register_data(&mut self, register: &str, data: [u8; 4]) -> Result<()> {
        let address = Self::register_address(register)? as usize;
        self.memory[address..address + 4].copy_from_slice(&data);
        Ok(())
    }

    /// Read a range of bytes from the mirrored memory map
    pub fn get_data(&self, address: u32, length: usize) -> Result<&[u8]> {
        let addr = address as usize;
        if addr + length > self.memory.len() {
            return Err(SharedError::AddressOutOfRange(format!(
                "0x{address:04X} + {length}"
            )));
        }
        Ok(&self.memory[addr..addr + length])
    }

    /// Write a range of bytes into the mirrored memory map. The address must
    /// be 32-bit aligned.
    pub fn set_data(&mut self, address: u32, data: &[u8]) -> Result<()> {
        if address & 0x03 != 0 {
            return Err(SharedError::AddressOutOfRange(format!(
                "address 0x{address:04X} is not 32-bit aligned"
            )));
        }
        let addr = address as usize;
        if addr + data.len() > self.memory.len() {
            return Err(SharedError::AddressOutOfRange(format!(
                "0x{address:04X} + {}",
                data.len()
            )));
        }
        self.memory[addr..addr + data.len()].copy_from_slice(data);
        Ok(())
    }

    /// Snapshot the full register space
    pub fn snapshot(&self) -> Vec<u8> {
        self.memory.clone()
    }

    /// Borrow the full register space
    pub fn as_bytes(&self) -> &[u8] {
        &self.memory
    }
}

fn mask(width: u8) -> u32 {
    if width >= 32 {
        u32::MAX
    } else {
        (1u32 << width) - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_roundtrip() {
        let mut map = RegisterMap::new();

        map.set_value("reg_0_config", "v_start", 100).unwrap();
        map.set_value("reg_0_config", "v_end", 4509).unwrap();

        assert_eq!(map.get_value("reg_0_config", "v_start").unwrap(), 100);
        assert_eq!(map.get_value("reg_0_config", "v_end").unwrap(), 4509);

        // setting one field leaves the other untouched
        map.set_value("reg_0_config", "v_start", 0).unwrap();
        assert_eq!(map.get_value("reg_0_config", "v_end").unwrap(), 4509);
    }

    #[test]
    fn test_field_width_masking() {
        let mut map = RegisterMap::new();

        map.set_value("reg_21_config", "ccd_mode_config", 0xFF).unwrap();
        assert_eq!(map.get_value("reg_21_config", "ccd_mode_config").unwrap(), 0xF);
        assert_eq!(map.get_value("reg_21_config", "clear_error_flag").unwrap(), 0);
    }

    #[test]
    fn test_unknown_field() {
        let map = RegisterMap::new();
        assert!(matches!(
            map.get_value("reg_0_config", "no_such_field"),
            Err(SharedError::FieldNotFound { .. })
        ));
        assert!(map.get_value("reg_99_config", "v_start").is_err());
    }

    #[test]
    fn test_unique_field_lookup() {
        let mut map = RegisterMap::new();
        map.set_value("reg_5_config", "sensor_sel", 0b11).unwrap();
        assert_eq!(map.value_of("sensor_sel").unwrap(), 0b11);

        // ccd_vgd_config exists in two registers
        assert!(map.value_of("ccd_vgd_config").is_err());
    }

    #[test]
    fn test_memory_map_access() {
        let mut map = RegisterMap::new();

        map.set_data(0x0, &[0x12, 0x34, 0x56, 0x78]).unwrap();
        assert_eq!(map.get_data(0x0, 4).unwrap(), &[0x12, 0x34, 0x56, 0x78]);

        // unaligned writes are rejected
        assert!(map.set_data(0x2, &[0, 0, 0, 0]).is_err());
        // out of range access is rejected
        assert!(map.get_data(0x7FE, 4).is_err());

        assert_eq!(map.snapshot().len(), REGISTER_SPACE_SIZE);
    }

    #[test]
    fn test_full_sync_replaces_mirror() {
        let mut map = RegisterMap::new();
        let mut data = vec![0u8; REGISTER_SPACE_SIZE];
        data[0x054] = 0x00;
        data[0x057] = 0x05; // ccd_mode_config = FULL_IMAGE
        map.set_data(0, &data).unwrap();
        assert_eq!(map.get_value("reg_21_config", "ccd_mode_config").unwrap(), 5);
    }
}
