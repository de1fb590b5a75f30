//! Classic BPF programs for the capture socket.

use libc::sock_filter;

const fn insn(code: u16, jt: u8, jf: u8, k: u32) -> sock_filter {
    sock_filter { code, jt, jf, k }
}

const BPF_LD_H_ABS: u16 = 0x28;
const BPF_LD_B_ABS: u16 = 0x30;
const BPF_JEQ_K: u16 = 0x15;
const BPF_RET_K: u16 = 0x06;

const ETHERTYPE_OFFSET: u32 = 0x0c;
const ETHERTYPE_IPV4: u32 = 0x0800;
const IP_PROTOCOL_OFFSET: u32 = 0x17;
const IPPROTO_TCP: u32 = 0x06;

/// Accept IPv4 packets (truncated to 256 KiB), and pass everything else
/// whole.
const PASS_ALL: [sock_filter; 4] = [
    insn(BPF_LD_H_ABS, 0, 0, ETHERTYPE_OFFSET),
    insn(BPF_JEQ_K, 0, 1, ETHERTYPE_IPV4),
    insn(BPF_RET_K, 0, 0, 0x0004_0000),
    insn(BPF_RET_K, 0, 0, 0xffff_ffff),
];

/// Only IPv4 that isn't TCP.
const IPV4_ONLY: [sock_filter; 7] = [
    insn(BPF_LD_H_ABS, 0, 0, ETHERTYPE_OFFSET),
    insn(BPF_JEQ_K, 0, 3, ETHERTYPE_IPV4),
    insn(BPF_LD_B_ABS, 0, 0, IP_PROTOCOL_OFFSET),
    insn(BPF_JEQ_K, 0, 1, IPPROTO_TCP),
    insn(BPF_RET_K, 0, 0, 0),
    insn(BPF_RET_K, 0, 0, 0xffff_ffff),
    insn(BPF_RET_K, 0, 0, 0),
];

/// Filter attached to the capture socket.
///
/// The SLIP interface has no link header, so the ethertype loads in these
/// programs read into the IP header. `PassAll` lets every frame through
/// either way, which is what the announce detection relies on.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum FilterProgram {
    #[default]
    PassAll,
    Ipv4Only,
}

impl FilterProgram {
    pub fn instructions(&self) -> &'static [sock_filter] {
        match self {
            Self::PassAll => &PASS_ALL,
            Self::Ipv4Only => &IPV4_ONLY,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::FilterProgram;

    fn returns(program: FilterProgram) -> Vec<u32> {
        program
            .instructions()
            .iter()
            .filter(|insn| insn.code == 0x06)
            .map(|insn| insn.k)
            .collect()
    }

    #[test]
    fn pass_all_never_rejects() {
        assert_eq!(FilterProgram::PassAll.instructions().len(), 4);
        assert!(returns(FilterProgram::PassAll).iter().all(|k| *k > 0));
    }

    #[test]
    fn ipv4_only_jumps_stay_in_bounds() {
        let instructions = FilterProgram::Ipv4Only.instructions();
        assert_eq!(instructions.len(), 7);
        for (i, insn) in instructions.iter().enumerate() {
            if insn.code == 0x15 {
                assert!(i + 1 + (insn.jt as usize) < instructions.len());
                assert!(i + 1 + (insn.jf as usize) < instructions.len());
            }
        }
        // last instruction must be a return
        assert_eq!(instructions[6].code, 0x06);
    }
}
