//! Classic BPF interpreter.
//!
//! Loads past the end of the packet, division by zero and jumps out of the
//! program all reject the packet.

use super::insn::*;

#[inline(always)]
fn load(pkt: &[u8], off: u32, sz: u16) -> Option<u32> {
    let off = off as usize;
    match sz {
        BPF_W => {
            let b = pkt.get(off..off.checked_add(4)?)?;
            Some(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
        }
        BPF_H => {
            let b = pkt.get(off..off.checked_add(2)?)?;
            Some(u16::from_be_bytes([b[0], b[1]]) as u32)
        }
        BPF_B => pkt.get(off).map(|&b| b as u32),
        _ => None,
    }
}

#[inline(always)]
fn alu(op: u16, a: u32, v: u32) -> Option<u32> {
    Some(match op {
        BPF_ADD => a.wrapping_add(v),
        BPF_SUB => a.wrapping_sub(v),
        BPF_MUL => a.wrapping_mul(v),
        BPF_DIV => a.checked_div(v)?,
        BPF_MOD => a.checked_rem(v)?,
        BPF_AND => a & v,
        BPF_OR => a | v,
        BPF_XOR => a ^ v,
        BPF_LSH => a.checked_shl(v).unwrap_or(0),
        BPF_RSH => a.checked_shr(v).unwrap_or(0),
        BPF_NEG => a.wrapping_neg(),
        _ => return None,
    })
}

/// Runs `prog` over `pkt`. Returns the number of bytes to accept, 0 to
/// reject.
pub fn run(prog: &[Instruction], pkt: &[u8]) -> u32 {
    run_inner(prog, pkt).unwrap_or(0)
}

fn run_inner(prog: &[Instruction], pkt: &[u8]) -> Option<u32> {
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut mem = [0u32; BPF_MEMWORDS];
    let mut pc = 0usize;
    let wirelen = pkt.len() as u32;

    loop {
        let insn = prog.get(pc)?;
        pc += 1;
        let code = insn.code;
        let k = insn.k;
        match class(code) {
            BPF_LD => {
                a = match mode(code) {
                    BPF_ABS => load(pkt, k, size(code))?,
                    BPF_IND => load(pkt, x.checked_add(k)?, size(code))?,
                    BPF_LEN => wirelen,
                    BPF_IMM => k,
                    BPF_MEM => *mem.get(k as usize)?,
                    _ => return None,
                };
            }
            BPF_LDX => {
                x = match mode(code) {
                    BPF_IMM => k,
                    BPF_LEN => wirelen,
                    BPF_MEM => *mem.get(k as usize)?,
                    BPF_MSH => (*pkt.get(k as usize)? as u32 & 0x0f) << 2,
                    _ => return None,
                };
            }
            BPF_ST => *mem.get_mut(k as usize)? = a,
            BPF_STX => *mem.get_mut(k as usize)? = x,
            BPF_ALU => {
                let v = if src(code) == BPF_X { x } else { k };
                a = alu(op(code), a, v)?;
            }
            BPF_JMP => {
                let v = if src(code) == BPF_X { x } else { k };
                let taken = match op(code) {
                    BPF_JA => {
                        pc = pc.checked_add(k as usize)?;
                        continue;
                    }
                    BPF_JEQ => a == v,
                    BPF_JGT => a > v,
                    BPF_JGE => a >= v,
                    BPF_JSET => a & v != 0,
                    _ => return None,
                };
                let off = if taken { insn.jt } else { insn.jf };
                pc += off as usize;
            }
            BPF_RET => {
                return Some(match rval(code) {
                    BPF_A => a,
                    BPF_X => x,
                    _ => k,
                });
            }
            _ => match miscop(code) {
                BPF_TAX => x = a,
                BPF_TXA => a = x,
                _ => return None,
            },
        }
    }
}
