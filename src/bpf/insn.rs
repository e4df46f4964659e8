//! Classic BPF instruction encoding.

use std::fmt;

// Instruction classes
pub const BPF_LD: u16 = 0x00;
pub const BPF_LDX: u16 = 0x01;
pub const BPF_ST: u16 = 0x02;
pub const BPF_STX: u16 = 0x03;
pub const BPF_ALU: u16 = 0x04;
pub const BPF_JMP: u16 = 0x05;
pub const BPF_RET: u16 = 0x06;
pub const BPF_MISC: u16 = 0x07;

// ld/ldx fields
pub const BPF_W: u16 = 0x00;
pub const BPF_H: u16 = 0x08;
pub const BPF_B: u16 = 0x10;

pub const BPF_IMM: u16 = 0x00;
pub const BPF_ABS: u16 = 0x20;
pub const BPF_IND: u16 = 0x40;
pub const BPF_MEM: u16 = 0x60;
pub const BPF_LEN: u16 = 0x80;
pub const BPF_MSH: u16 = 0xa0;

// alu/jmp fields
pub const BPF_ADD: u16 = 0x00;
pub const BPF_SUB: u16 = 0x10;
pub const BPF_MUL: u16 = 0x20;
pub const BPF_DIV: u16 = 0x30;
pub const BPF_OR: u16 = 0x40;
pub const BPF_AND: u16 = 0x50;
pub const BPF_LSH: u16 = 0x60;
pub const BPF_RSH: u16 = 0x70;
pub const BPF_NEG: u16 = 0x80;
pub const BPF_MOD: u16 = 0x90;
pub const BPF_XOR: u16 = 0xa0;

pub const BPF_JA: u16 = 0x00;
pub const BPF_JEQ: u16 = 0x10;
pub const BPF_JGT: u16 = 0x20;
pub const BPF_JGE: u16 = 0x30;
pub const BPF_JSET: u16 = 0x40;

pub const BPF_K: u16 = 0x00;
pub const BPF_X: u16 = 0x08;

// ret
pub const BPF_A: u16 = 0x10;

// misc
pub const BPF_TAX: u16 = 0x00;
pub const BPF_TXA: u16 = 0x80;

/// Number of scratch memory words.
pub const BPF_MEMWORDS: usize = 16;

#[inline(always)]
pub const fn class(code: u16) -> u16 {
    code & 0x07
}

#[inline(always)]
pub const fn size(code: u16) -> u16 {
    code & 0x18
}

#[inline(always)]
pub const fn mode(code: u16) -> u16 {
    code & 0xe0
}

#[inline(always)]
pub const fn op(code: u16) -> u16 {
    code & 0xf0
}

#[inline(always)]
pub const fn src(code: u16) -> u16 {
    code & 0x08
}

#[inline(always)]
pub const fn rval(code: u16) -> u16 {
    code & 0x18
}

#[inline(always)]
pub const fn miscop(code: u16) -> u16 {
    code & 0xf8
}

/// One filter-machine instruction, layout-compatible with `struct bpf_insn`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Instruction {
    pub code: u16,
    /// Relative jump taken when the condition holds.
    pub jt: u8,
    /// Relative jump taken otherwise.
    pub jf: u8,
    pub k: u32,
}

const _: () = assert!(std::mem::size_of::<Instruction>() == 8);

impl Instruction {
    pub const fn new(code: u16, jt: u8, jf: u8, k: u32) -> Self {
        Self { code, jt, jf, k }
    }

    /// A non-jump instruction.
    pub const fn stmt(code: u16, k: u32) -> Self {
        Self::new(code, 0, 0, k)
    }

    pub const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self::new(code, jt, jf, k)
    }

    pub const fn is_ret(&self) -> bool {
        class(self.code) == BPF_RET
    }

    /// Writes the instruction the way `tcpdump -d` does, resolving jump
    /// targets relative to `pc`.
    pub fn display_at(&self, pc: usize) -> Disasm<'_> {
        Disasm { insn: self, pc }
    }

    fn mnemonic(&self) -> (&'static str, String) {
        let code = self.code;
        let k = self.k;
        let ind = |m: &'static str| (m, format!("[x + {k}]"));
        let operand = || {
            if src(code) == BPF_X {
                "x".to_string()
            } else {
                format!("#0x{k:x}")
            }
        };
        match class(code) {
            BPF_LD => match (mode(code), size(code)) {
                (BPF_ABS, BPF_W) => ("ld", format!("[{k}]")),
                (BPF_ABS, BPF_H) => ("ldh", format!("[{k}]")),
                (BPF_ABS, BPF_B) => ("ldb", format!("[{k}]")),
                (BPF_IND, BPF_W) => ind("ld"),
                (BPF_IND, BPF_H) => ind("ldh"),
                (BPF_IND, BPF_B) => ind("ldb"),
                (BPF_LEN, _) => ("ld", "#pktlen".to_string()),
                (BPF_IMM, _) => ("ld", format!("#0x{k:x}")),
                (BPF_MEM, _) => ("ld", format!("M[{k}]")),
                _ => ("unimp", format!("0x{code:x}")),
            },
            BPF_LDX => match (mode(code), size(code)) {
                (BPF_IMM, _) => ("ldx", format!("#0x{k:x}")),
                (BPF_LEN, _) => ("ldx", "#pktlen".to_string()),
                (BPF_MEM, _) => ("ldx", format!("M[{k}]")),
                (BPF_MSH, BPF_B) => ("ldxb", format!("4*([{k}]&0xf)")),
                _ => ("unimp", format!("0x{code:x}")),
            },
            BPF_ST => ("st", format!("M[{k}]")),
            BPF_STX => ("stx", format!("M[{k}]")),
            BPF_RET => match rval(code) {
                BPF_A => ("ret", "a".to_string()),
                BPF_X => ("ret", "x".to_string()),
                _ => ("ret", format!("#{k}")),
            },
            BPF_JMP => {
                let m = match op(code) {
                    BPF_JA => return ("ja", String::new()),
                    BPF_JEQ => "jeq",
                    BPF_JGT => "jgt",
                    BPF_JGE => "jge",
                    BPF_JSET => "jset",
                    _ => return ("unimp", format!("0x{code:x}")),
                };
                (m, operand())
            }
            BPF_ALU => {
                let m = match op(code) {
                    BPF_ADD => "add",
                    BPF_SUB => "sub",
                    BPF_MUL => "mul",
                    BPF_DIV => "div",
                    BPF_MOD => "mod",
                    BPF_AND => "and",
                    BPF_OR => "or",
                    BPF_XOR => "xor",
                    BPF_LSH => "lsh",
                    BPF_RSH => "rsh",
                    BPF_NEG => return ("neg", String::new()),
                    _ => return ("unimp", format!("0x{code:x}")),
                };
                (m, operand())
            }
            _ => match miscop(code) {
                BPF_TAX => ("tax", String::new()),
                BPF_TXA => ("txa", String::new()),
                _ => ("unimp", format!("0x{code:x}")),
            },
        }
    }
}

pub struct Disasm<'a> {
    insn: &'a Instruction,
    pc: usize,
}

impl fmt::Display for Disasm<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let insn = self.insn;
        let (m, operand) = insn.mnemonic();
        let next = self.pc + 1;
        if class(insn.code) == BPF_JMP {
            if op(insn.code) == BPF_JA {
                return write!(f, "({:03}) {m:<8} {}", self.pc, next + insn.k as usize);
            }
            if m != "unimp" {
                return write!(
                    f,
                    "({:03}) {m:<8} {operand:<16} jt {}\tjf {}",
                    self.pc,
                    next + insn.jt as usize,
                    next + insn.jf as usize
                );
            }
        }
        if operand.is_empty() {
            write!(f, "({:03}) {m}", self.pc)
        } else {
            write!(f, "({:03}) {m:<8} {operand}", self.pc)
        }
    }
}

impl fmt::Display for Instruction {
    /// The `{ code, jt, jf, k }` form accepted by `tcpdump -dd` consumers.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ 0x{:x}, {}, {}, 0x{:08x} }}",
            self.code, self.jt, self.jf, self.k
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disasm() {
        let ldh = Instruction::stmt(BPF_LD | BPF_H | BPF_ABS, 12);
        assert_eq!(ldh.display_at(0).to_string(), "(000) ldh      [12]");
        let jeq = Instruction::jump(BPF_JMP | BPF_JEQ | BPF_K, 0x800, 0, 3);
        assert_eq!(
            jeq.display_at(1).to_string(),
            "(001) jeq      #0x800           jt 2\tjf 5"
        );
        let msh = Instruction::stmt(BPF_LDX | BPF_B | BPF_MSH, 14);
        assert_eq!(msh.display_at(7).to_string(), "(007) ldxb     4*([14]&0xf)");
        let ret = Instruction::stmt(BPF_RET | BPF_K, 65535);
        assert_eq!(ret.display_at(9).to_string(), "(009) ret      #65535");
        let tax = Instruction::stmt(BPF_MISC | BPF_TAX, 0);
        assert_eq!(tax.display_at(3).to_string(), "(003) tax");
    }

    #[test]
    fn test_c_form() {
        let ldh = Instruction::stmt(BPF_LD | BPF_H | BPF_ABS, 12);
        assert_eq!(ldh.to_string(), "{ 0x28, 0, 0, 0x0000000c }");
    }
}
