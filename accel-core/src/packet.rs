//! Command packets.
//!
//! A packet is an opcode plus a variable-length payload of 32-bit words.
//! The payload layout depends on the opcode; typed views below decode the
//! few layouts the execution core needs. Kernel-start style packets carry
//! one or more CU mask words followed by the register map destined for the
//! selected CU's register file.

use thiserror::Error;

/// Low byte of a configured CU address word encodes the handshake/adapter.
pub const CU_ADDR_MASK: u32 = !0xff;

/// Adapter kind bit inside the low byte: set for the ACC adapter.
pub const CU_ACC_ADAPTER: u32 = 0x1;

/// Sentinel address for a free-running CU; never scheduled.
pub const CU_FREE_RUNNING: u32 = u32::MAX;

/// Command opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// One-time scheduler configuration.
    Configure,
    /// Initialize CUs: store timeout budgets and preload register files.
    InitCu,
    /// Start a kernel on a hard CU.
    StartCu,
    /// Start a kernel on a hard CU with an address/value pair register map.
    ExecWrite,
    /// Asynchronous buffer-to-buffer copy through the DMA engine.
    StartCopy,
    /// Configure a range of soft (emulated) CUs.
    SkConfig,
    /// Unconfigure a range of soft CUs.
    SkUnconfig,
    /// Start a kernel on a soft CU.
    SkStart,
    /// Anything this scheduler does not understand.
    Unknown(u32),
}

impl Opcode {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            0 => Opcode::Configure,
            1 => Opcode::InitCu,
            2 => Opcode::StartCu,
            3 => Opcode::ExecWrite,
            4 => Opcode::StartCopy,
            5 => Opcode::SkConfig,
            6 => Opcode::SkUnconfig,
            7 => Opcode::SkStart,
            other => Opcode::Unknown(other),
        }
    }

    pub fn as_raw(self) -> u32 {
        match self {
            Opcode::Configure => 0,
            Opcode::InitCu => 1,
            Opcode::StartCu => 2,
            Opcode::ExecWrite => 3,
            Opcode::StartCopy => 4,
            Opcode::SkConfig => 5,
            Opcode::SkUnconfig => 6,
            Opcode::SkStart => 7,
            Opcode::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Error)]
pub enum PacketError {
    #[error("{opcode:?} payload too short: {got} words, need {need}")]
    Truncated {
        opcode: Opcode,
        need: usize,
        got: usize,
    },
    #[error("{0:?} does not carry a register map")]
    NoRegmap(Opcode),
}

bitflags::bitflags! {
    /// Feature bits in the configure payload.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConfigFlags: u32 {
        /// An embedded scheduler co-processor is present.
        const ERT = 1 << 0;
        /// Caller prefers polling over CU interrupts.
        const POLLING = 1 << 1;
        /// Route CU completion through the interrupt controller.
        const CU_ISR = 1 << 2;
        /// Enable the CU DMA block.
        const CU_DMA = 1 << 3;
        /// Enable command-queue interrupts to the co-processor.
        const CQ_INT = 1 << 4;
    }
}

/// One unit of work: opcode plus payload words.
///
/// `extra_cu_masks` mirrors the packed header field of the wire format:
/// kernel-start payloads carry `1 + extra_cu_masks` CU mask words before
/// the register map.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    pub opcode: u32,
    pub extra_cu_masks: u8,
    pub data: Vec<u32>,
}

/// Payload word offsets, per opcode.
const INIT_CU_MASK_OFFSET: usize = 2; // run timeout, reset timeout first
const CONFIG_FIXED_WORDS: usize = 5; // slot size, cus, shift, base, flags
const COPY_WORDS: usize = 5;

impl Packet {
    pub fn new(opcode: Opcode, data: Vec<u32>) -> Self {
        Self {
            opcode: opcode.as_raw(),
            extra_cu_masks: 0,
            data,
        }
    }

    pub fn opcode(&self) -> Opcode {
        Opcode::from_raw(self.opcode)
    }

    /// Payload size in words.
    pub fn count(&self) -> usize {
        self.data.len()
    }

    /// Payload plus the header word.
    pub fn packet_size(&self) -> usize {
        self.count() + 1
    }

    /// Number of CU mask words, zero for opcodes that carry none.
    pub fn cu_mask_count(&self) -> usize {
        match self.opcode() {
            Opcode::StartCu | Opcode::ExecWrite | Opcode::SkStart | Opcode::InitCu => {
                1 + self.extra_cu_masks as usize
            }
            _ => 0,
        }
    }

    fn cu_mask_offset(&self) -> usize {
        match self.opcode() {
            Opcode::InitCu => INIT_CU_MASK_OFFSET,
            _ => 0,
        }
    }

    /// CU mask word `mask` (zero when the payload does not reach it).
    pub fn cu_mask_word(&self, mask: usize) -> u32 {
        if mask >= self.cu_mask_count() {
            return 0;
        }
        self.data
            .get(self.cu_mask_offset() + mask)
            .copied()
            .unwrap_or(0)
    }

    /// Register map: payload words after the CU masks.
    pub fn regmap(&self) -> Result<&[u32], PacketError> {
        let masks = self.cu_mask_count();
        if masks == 0 {
            return Err(PacketError::NoRegmap(self.opcode()));
        }
        let start = self.cu_mask_offset() + masks;
        if start > self.data.len() {
            return Err(PacketError::Truncated {
                opcode: self.opcode(),
                need: start,
                got: self.data.len(),
            });
        }
        Ok(&self.data[start..])
    }

    /// Decode a configure payload.
    pub fn as_configure(&self) -> Result<ConfigurePayload<'_>, PacketError> {
        let need = CONFIG_FIXED_WORDS;
        if self.data.len() < need {
            return Err(PacketError::Truncated {
                opcode: self.opcode(),
                need,
                got: self.data.len(),
            });
        }
        let num_cus = self.data[1] as usize;
        if self.data.len() < need + num_cus {
            return Err(PacketError::Truncated {
                opcode: self.opcode(),
                need: need + num_cus,
                got: self.data.len(),
            });
        }
        Ok(ConfigurePayload {
            slot_size: self.data[0] as usize,
            num_cus,
            cu_shift: self.data[2],
            cu_base_addr: self.data[3],
            flags: ConfigFlags::from_bits_truncate(self.data[4]),
            cu_addrs: &self.data[need..need + num_cus],
        })
    }

    /// Decode an init-CU payload header (timeouts precede the masks).
    pub fn as_init_cu(&self) -> Result<InitCuPayload, PacketError> {
        if self.data.len() < INIT_CU_MASK_OFFSET + self.cu_mask_count() {
            return Err(PacketError::Truncated {
                opcode: self.opcode(),
                need: INIT_CU_MASK_OFFSET + self.cu_mask_count(),
                got: self.data.len(),
            });
        }
        Ok(InitCuPayload {
            run_timeout_us: self.data[0],
            reset_timeout_us: self.data[1],
        })
    }

    /// Decode a copy payload.
    pub fn as_copy(&self) -> Result<CopyPayload, PacketError> {
        if self.data.len() < COPY_WORDS {
            return Err(PacketError::Truncated {
                opcode: self.opcode(),
                need: COPY_WORDS,
                got: self.data.len(),
            });
        }
        Ok(CopyPayload {
            src: self.data[0],
            dst: self.data[1],
            src_offset: self.data[2],
            dst_offset: self.data[3],
            size: self.data[4],
        })
    }

    /// Decode a soft-kernel configure/unconfigure payload.
    pub fn as_sk_range(&self) -> Result<SkRange, PacketError> {
        if self.data.len() < 2 {
            return Err(PacketError::Truncated {
                opcode: self.opcode(),
                need: 2,
                got: self.data.len(),
            });
        }
        Ok(SkRange {
            start_cuidx: self.data[0] as usize,
            num_cus: self.data[1] as usize,
        })
    }

    // Builders, used by callers and throughout the test suites.

    pub fn configure(
        slot_size: usize,
        cu_shift: u32,
        cu_base_addr: u32,
        flags: ConfigFlags,
        cu_addrs: &[u32],
    ) -> Self {
        let mut data = vec![
            slot_size as u32,
            cu_addrs.len() as u32,
            cu_shift,
            cu_base_addr,
            flags.bits(),
        ];
        data.extend_from_slice(cu_addrs);
        Packet::new(Opcode::Configure, data)
    }

    pub fn init_cu(run_timeout_us: u32, reset_timeout_us: u32, cu_mask: u32, regmap: &[u32]) -> Self {
        let mut data = vec![run_timeout_us, reset_timeout_us, cu_mask];
        data.extend_from_slice(regmap);
        Packet::new(Opcode::InitCu, data)
    }

    pub fn start_cu(cu_mask: u32, regmap: &[u32]) -> Self {
        let mut data = vec![cu_mask];
        data.extend_from_slice(regmap);
        Packet::new(Opcode::StartCu, data)
    }

    pub fn exec_write(cu_mask: u32, pairs: &[u32]) -> Self {
        let mut data = vec![cu_mask];
        data.extend_from_slice(pairs);
        Packet::new(Opcode::ExecWrite, data)
    }

    pub fn start_copy(src: u32, dst: u32, src_offset: u32, dst_offset: u32, size: u32) -> Self {
        Packet::new(
            Opcode::StartCopy,
            vec![src, dst, src_offset, dst_offset, size],
        )
    }

    pub fn sk_config(start_cuidx: usize, num_cus: usize) -> Self {
        Packet::new(
            Opcode::SkConfig,
            vec![start_cuidx as u32, num_cus as u32],
        )
    }

    pub fn sk_unconfig(start_cuidx: usize, num_cus: usize) -> Self {
        Packet::new(
            Opcode::SkUnconfig,
            vec![start_cuidx as u32, num_cus as u32],
        )
    }

    pub fn sk_start(cu_mask: u32, regmap: &[u32]) -> Self {
        let mut data = vec![cu_mask];
        data.extend_from_slice(regmap);
        Packet::new(Opcode::SkStart, data)
    }
}

/// Configure payload view.
#[derive(Debug)]
pub struct ConfigurePayload<'a> {
    pub slot_size: usize,
    pub num_cus: usize,
    pub cu_shift: u32,
    pub cu_base_addr: u32,
    pub flags: ConfigFlags,
    /// One address word per CU; low byte encodes the adapter kind.
    pub cu_addrs: &'a [u32],
}

#[derive(Debug, Clone, Copy)]
pub struct InitCuPayload {
    pub run_timeout_us: u32,
    pub reset_timeout_us: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct CopyPayload {
    pub src: u32,
    pub dst: u32,
    pub src_offset: u32,
    pub dst_offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SkRange {
    pub start_cuidx: usize,
    pub num_cus: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcode_raw_round_trip() {
        for raw in 0..8 {
            assert_eq!(Opcode::from_raw(raw).as_raw(), raw);
        }
        assert_eq!(Opcode::from_raw(42), Opcode::Unknown(42));
    }

    #[test]
    fn start_cu_regmap_follows_masks() {
        let pkt = Packet::start_cu(0b11, &[7, 8, 9]);
        assert_eq!(pkt.cu_mask_count(), 1);
        assert_eq!(pkt.cu_mask_word(0), 0b11);
        assert_eq!(pkt.regmap().unwrap(), &[7, 8, 9]);
    }

    #[test]
    fn extra_masks_shift_regmap() {
        let mut pkt = Packet::start_cu(0b1, &[0xffff_0000, 1, 2]);
        pkt.extra_cu_masks = 1;
        assert_eq!(pkt.cu_mask_count(), 2);
        assert_eq!(pkt.cu_mask_word(1), 0xffff_0000);
        assert_eq!(pkt.regmap().unwrap(), &[1, 2]);
    }

    #[test]
    fn init_cu_masks_follow_timeouts() {
        let pkt = Packet::init_cu(1000, 500, 0b100, &[1, 2]);
        let hdr = pkt.as_init_cu().unwrap();
        assert_eq!(hdr.run_timeout_us, 1000);
        assert_eq!(hdr.reset_timeout_us, 500);
        assert_eq!(pkt.cu_mask_word(0), 0b100);
        assert_eq!(pkt.regmap().unwrap(), &[1, 2]);
    }

    #[test]
    fn configure_payload_round_trip() {
        let pkt = Packet::configure(4096, 12, 0x8000_0000, ConfigFlags::POLLING, &[0x100, 0x200]);
        let cfg = pkt.as_configure().unwrap();
        assert_eq!(cfg.slot_size, 4096);
        assert_eq!(cfg.num_cus, 2);
        assert_eq!(cfg.flags, ConfigFlags::POLLING);
        assert_eq!(cfg.cu_addrs, &[0x100, 0x200]);
    }

    #[test]
    fn truncated_configure_is_rejected() {
        let pkt = Packet::new(Opcode::Configure, vec![4096, 9, 0]);
        assert!(pkt.as_configure().is_err());
    }

    #[test]
    fn copy_has_no_regmap() {
        let pkt = Packet::start_copy(1, 2, 0, 0, 64);
        assert!(matches!(pkt.regmap(), Err(PacketError::NoRegmap(_))));
        let copy = pkt.as_copy().unwrap();
        assert_eq!(copy.size, 64);
    }
}
