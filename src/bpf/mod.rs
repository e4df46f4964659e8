//! Classic BPF: filter expressions compiled by libpcap and an interpreter
//! for the resulting programs.
//!
//! ```ignore
//! let prog = bpf::compile(65535, "tcp and dst port 80")?;
//! if prog.execute(pkt) != 0 {
//!     // keep it
//! }
//! println!("{}", prog.disassemble());
//! ```

pub mod insn;
pub mod vm;

use std::fmt;
use std::sync::Arc;

use pcap::{BpfInstruction, Capture, Linktype};
use thiserror::Error;

use crate::ring::Batch;

pub use insn::Instruction;
use insn::*;

/// Largest program the kernel and libpcap accept.
pub const MAX_INSNS: usize = 4096;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Rejected by libpcap, with its message.
    #[error("{0}")]
    Pcap(String),
    #[error("{0}")]
    Semantic(String),
    #[error("program too long: {0} instructions")]
    TooLong(usize),
    #[error("invalid instruction at {pc}: {msg}")]
    Invalid { pc: usize, msg: String },
}

impl From<pcap::Error> for CompileError {
    fn from(err: pcap::Error) -> Self {
        CompileError::Pcap(err.to_string())
    }
}

/// An immutable, validated filter program.
///
/// Cloning is cheap: the instructions are shared.
#[derive(Clone, PartialEq, Eq)]
pub struct Program {
    insns: Arc<[Instruction]>,
    snaplen: u32,
}

impl Program {
    /// Wraps a raw program, after checking that it cannot misbehave.
    ///
    /// An empty program accepts everything.
    pub fn new(insns: Vec<Instruction>) -> Result<Self, CompileError> {
        validate(&insns)?;
        Ok(Self {
            insns: insns.into(),
            snaplen: u32::MAX,
        })
    }

    /// The empty program, accepting every packet with `snaplen`.
    pub fn accept_all(snaplen: u32) -> Self {
        Self {
            insns: Arc::from([]),
            snaplen,
        }
    }

    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insns.is_empty()
    }

    pub fn insns(&self) -> &[Instruction] {
        &self.insns
    }

    /// Capture length returned for accepted packets.
    pub fn snaplen(&self) -> u32 {
        self.snaplen
    }

    #[inline]
    pub fn execute(&self, pkt: &[u8]) -> u32 {
        if self.insns.is_empty() {
            return self.snaplen;
        }
        vm::run(&self.insns, pkt)
    }

    /// Runs the program over every packet, replacing the contents of
    /// `results` with one verdict per packet.
    pub fn execute_many<'a>(
        &self,
        pkts: impl IntoIterator<Item = &'a [u8]>,
        results: &mut Vec<u32>,
    ) {
        results.clear();
        results.extend(pkts.into_iter().map(|pkt| self.execute(pkt)));
    }

    pub fn execute_batch(&self, batch: &Batch<'_>, results: &mut Vec<u32>) {
        self.execute_many(batch.iter(), results);
    }

    /// `tcpdump -d` style listing, one instruction per line.
    pub fn disassemble(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (pc, insn) in self.insns.iter().enumerate() {
            writeln!(f, "{}", insn.display_at(pc))?;
        }
        Ok(())
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program")
            .field("len", &self.insns.len())
            .field("snaplen", &self.snaplen)
            .finish()
    }
}

/// Compiles a pcap filter expression for Ethernet frames, optimized.
/// Matching packets yield `snaplen`, others 0.
pub fn compile(snaplen: u32, expr: &str) -> Result<Program, CompileError> {
    if snaplen == 0 {
        return Err(CompileError::Semantic("snaplen must be positive".into()));
    }
    let cap = Capture::dead(Linktype::ETHERNET)?;
    let bpf = cap.compile(expr, true)?;
    let mut insns = bpf
        .get_instructions()
        .iter()
        .map(from_pcap)
        .collect::<Result<Vec<_>, _>>()?;
    // The dead capture has its own snaplen baked into every accepting ret.
    for insn in insns.iter_mut() {
        if insn.code == BPF_RET | BPF_K && insn.k != 0 {
            insn.k = snaplen;
        }
    }
    validate(&insns)?;
    Ok(Program {
        insns: insns.into(),
        snaplen,
    })
}

/// libpcap instructions print as `code jt jf k`.
fn from_pcap(insn: &BpfInstruction) -> Result<Instruction, CompileError> {
    let text = insn.to_string();
    let mut fields = text.split_whitespace();
    let code = fields.next().and_then(|f| f.parse().ok());
    let jt = fields.next().and_then(|f| f.parse().ok());
    let jf = fields.next().and_then(|f| f.parse().ok());
    let k = fields.next().and_then(|f| f.parse().ok());
    match (code, jt, jf, k) {
        (Some(code), Some(jt), Some(jf), Some(k)) => Ok(Instruction { code, jt, jf, k }),
        _ => Err(CompileError::Pcap(format!("unreadable instruction {text:?}"))),
    }
}

fn validate(insns: &[Instruction]) -> Result<(), CompileError> {
    if insns.len() > MAX_INSNS {
        return Err(CompileError::TooLong(insns.len()));
    }
    let invalid = |pc, msg: &str| CompileError::Invalid {
        pc,
        msg: msg.to_string(),
    };
    let mem = |pc, k: u32| {
        if (k as usize) < BPF_MEMWORDS {
            Ok(())
        } else {
            Err(invalid(pc, "scratch index out of range"))
        }
    };
    let target = |pc: usize, off: usize| {
        if pc + 1 + off < insns.len() {
            Ok(())
        } else {
            Err(invalid(pc, "jump out of program"))
        }
    };

    for (pc, insn) in insns.iter().enumerate() {
        let code = insn.code;
        match class(code) {
            BPF_LD | BPF_LDX => {
                let ldx = class(code) == BPF_LDX;
                match mode(code) {
                    BPF_ABS | BPF_IND if !ldx => {
                        if size(code) == 0x18 {
                            return Err(invalid(pc, "bad load size"));
                        }
                    }
                    BPF_IMM | BPF_LEN => {}
                    BPF_MEM => mem(pc, insn.k)?,
                    BPF_MSH if ldx && size(code) == BPF_B => {}
                    _ => return Err(invalid(pc, "bad load mode")),
                }
            }
            BPF_ST | BPF_STX => mem(pc, insn.k)?,
            BPF_ALU => match op(code) {
                BPF_DIV | BPF_MOD if src(code) == BPF_K && insn.k == 0 => {
                    return Err(invalid(pc, "division by zero"));
                }
                BPF_ADD | BPF_SUB | BPF_MUL | BPF_DIV | BPF_MOD | BPF_AND | BPF_OR
                | BPF_XOR | BPF_LSH | BPF_RSH | BPF_NEG => {}
                _ => return Err(invalid(pc, "unknown alu op")),
            },
            BPF_JMP => match op(code) {
                BPF_JA => target(pc, insn.k as usize)?,
                BPF_JEQ | BPF_JGT | BPF_JGE | BPF_JSET => {
                    target(pc, insn.jt as usize)?;
                    target(pc, insn.jf as usize)?;
                }
                _ => return Err(invalid(pc, "unknown jump")),
            },
            BPF_RET => {}
            _ => match miscop(code) {
                BPF_TAX | BPF_TXA => {}
                _ => return Err(invalid(pc, "unknown misc op")),
            },
        }
    }
    match insns.last() {
        Some(last) if !last.is_ret() => Err(invalid(insns.len() - 1, "program does not end with ret")),
        _ => Ok(()),
    }
}
