//! Hardware memory-protection services.
//!
//! On AMD parts with memory encryption active, every physical address placed
//! in a page-table entry or in CR3 carries the encryption bit. Hardened mode
//! means supervisor execution/access prevention are on, which also turns on
//! non-executable user data mappings.

#[cfg(target_os = "none")]
use bit_field::BitField;

pub trait HardwareSecurity {
    /// Apply the platform's encryption tag to a physical address.
    fn tag_physical(&self, addr: u64) -> u64;

    /// Strip the tag again (for addresses read back out of page tables).
    fn untag_physical(&self, addr: u64) -> u64;

    fn is_hardened_mode(&self) -> bool;

    /// Entropy for stack canaries.
    fn random_u64(&mut self) -> u64;
}

/// Mask-based implementation with a software generator.
pub struct SoftwareSecurity {
    encryption_mask: u64,
    hardened: bool,
    state: u64,
}

impl SoftwareSecurity {
    pub fn new(seed: u64) -> Self {
        SoftwareSecurity { encryption_mask: 0, hardened: false, state: seed | 1 }
    }

    /// Tag with encryption bit `bit` (the C-bit position).
    pub fn with_encryption_bit(mut self, bit: u32) -> Self {
        self.encryption_mask = 1 << bit;
        self
    }

    pub fn hardened(mut self, hardened: bool) -> Self {
        self.hardened = hardened;
        self
    }
}

impl HardwareSecurity for SoftwareSecurity {
    fn tag_physical(&self, addr: u64) -> u64 {
        addr | self.encryption_mask
    }

    fn untag_physical(&self, addr: u64) -> u64 {
        addr & !self.encryption_mask
    }

    fn is_hardened_mode(&self) -> bool {
        self.hardened
    }

    fn random_u64(&mut self) -> u64 {
        // xorshift64*
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }
}

/// Probes the running CPU.
#[cfg(target_os = "none")]
pub struct X86Security {
    encryption_mask: u64,
    hardened: bool,
    rdrand: Option<x86_64::instructions::random::RdRand>,
    fallback: SoftwareSecurity,
}

#[cfg(target_os = "none")]
impl X86Security {
    const SME_LEAF: u32 = 0x8000_001F;
    const MSR_SYSCFG: u32 = 0xC001_0010;
    const SYSCFG_MEM_ENCRYPT: usize = 23;

    pub fn detect() -> Self {
        use core::arch::x86_64::__cpuid;
        use x86_64::registers::control::{Cr4, Cr4Flags};
        use x86_64::registers::model_specific::Msr;

        let max_ext = unsafe { __cpuid(0x8000_0000) }.eax;
        let mut encryption_mask = 0;
        if max_ext >= Self::SME_LEAF {
            let leaf = unsafe { __cpuid(Self::SME_LEAF) };
            if leaf.eax.get_bit(0) {
                let syscfg = unsafe { Msr::new(Self::MSR_SYSCFG).read() };
                if syscfg.get_bit(Self::SYSCFG_MEM_ENCRYPT) {
                    let cbit = leaf.ebx.get_bits(0..6);
                    encryption_mask = 1u64 << cbit;
                }
            }
        }

        let cr4 = Cr4::read();
        let hardened = cr4.contains(
            Cr4Flags::SUPERVISOR_MODE_EXECUTION_PROTECTION
                | Cr4Flags::SUPERVISOR_MODE_ACCESS_PREVENTION,
        );

        let rdrand = x86_64::instructions::random::RdRand::new();
        let seed = rdrand.and_then(|r| r.get_u64()).unwrap_or(0x5EED_0F5E_C0DE_D00D);

        crate::log_info!(
            "security: encryption mask {:#x}, hardened {}, rdrand {}",
            encryption_mask,
            hardened,
            rdrand.is_some()
        );
        X86Security { encryption_mask, hardened, rdrand, fallback: SoftwareSecurity::new(seed) }
    }
}

#[cfg(target_os = "none")]
impl HardwareSecurity for X86Security {
    fn tag_physical(&self, addr: u64) -> u64 {
        addr | self.encryption_mask
    }

    fn untag_physical(&self, addr: u64) -> u64 {
        addr & !self.encryption_mask
    }

    fn is_hardened_mode(&self) -> bool {
        self.hardened
    }

    fn random_u64(&mut self) -> u64 {
        match self.rdrand.and_then(|r| r.get_u64()) {
            Some(v) => v,
            None => self.fallback.random_u64(),
        }
    }
}
