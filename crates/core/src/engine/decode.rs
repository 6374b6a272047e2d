// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! RV32I decoder with the LR.W/SC.W pair, Zicsr, MRET and WFI.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
}

impl AluOp {
    pub fn apply(self, a: u32, b: u32) -> u32 {
        match self {
            AluOp::Add => a.wrapping_add(b),
            AluOp::Sub => a.wrapping_sub(b),
            AluOp::Sll => a << (b & 0x1F),
            AluOp::Slt => ((a as i32) < (b as i32)) as u32,
            AluOp::Sltu => (a < b) as u32,
            AluOp::Xor => a ^ b,
            AluOp::Srl => a >> (b & 0x1F),
            AluOp::Sra => ((a as i32) >> (b & 0x1F)) as u32,
            AluOp::Or => a | b,
            AluOp::And => a & b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOp {
    Eq,
    Ne,
    Lt,
    Ge,
    Ltu,
    Geu,
}

impl BranchOp {
    pub fn taken(self, a: u32, b: u32) -> bool {
        match self {
            BranchOp::Eq => a == b,
            BranchOp::Ne => a != b,
            BranchOp::Lt => (a as i32) < (b as i32),
            BranchOp::Ge => (a as i32) >= (b as i32),
            BranchOp::Ltu => a < b,
            BranchOp::Geu => a >= b,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    Write,
    Set,
    Clear,
}

/// Source operand of a CSR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrSrc {
    Reg(u8),
    Imm(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Lui { rd: u8, imm: u32 },
    Auipc { rd: u8, imm: u32 },
    Jal { rd: u8, offset: i32 },
    Jalr { rd: u8, rs1: u8, offset: i32 },
    Branch { op: BranchOp, rs1: u8, rs2: u8, offset: i32 },
    /// `size` is 1, 2 or 4 bytes.
    Load { rd: u8, rs1: u8, offset: i32, size: usize, signed: bool },
    Store { rs1: u8, rs2: u8, offset: i32, size: usize },
    OpImm { op: AluOp, rd: u8, rs1: u8, imm: i32 },
    Op { op: AluOp, rd: u8, rs1: u8, rs2: u8 },
    LrW { rd: u8, rs1: u8 },
    ScW { rd: u8, rs1: u8, rs2: u8 },
    Csr { op: CsrOp, rd: u8, src: CsrSrc, csr: u16 },
    Fence,
    Ecall,
    Ebreak,
    Mret,
    Wfi,
    Illegal(u32),
}

fn imm_i(inst: u32) -> i32 {
    (inst as i32) >> 20
}

fn imm_s(inst: u32) -> i32 {
    (((inst & 0xFE00_0000) as i32) >> 20) | ((inst >> 7) & 0x1F) as i32
}

fn imm_b(inst: u32) -> i32 {
    (((inst & 0x8000_0000) as i32) >> 19)
        | (((inst >> 7) & 1) << 11) as i32
        | (((inst >> 25) & 0x3F) << 5) as i32
        | (((inst >> 8) & 0xF) << 1) as i32
}

fn imm_j(inst: u32) -> i32 {
    (((inst & 0x8000_0000) as i32) >> 11)
        | (inst & 0x000F_F000) as i32
        | (((inst >> 20) & 1) << 11) as i32
        | (((inst >> 21) & 0x3FF) << 1) as i32
}

pub fn decode(inst: u32) -> Instruction {
    let opcode = inst & 0x7F;
    let rd = ((inst >> 7) & 0x1F) as u8;
    let funct3 = (inst >> 12) & 0x7;
    let rs1 = ((inst >> 15) & 0x1F) as u8;
    let rs2 = ((inst >> 20) & 0x1F) as u8;
    let funct7 = inst >> 25;

    match opcode {
        0x37 => Instruction::Lui {
            rd,
            imm: inst & 0xFFFF_F000,
        },
        0x17 => Instruction::Auipc {
            rd,
            imm: inst & 0xFFFF_F000,
        },
        0x6F => Instruction::Jal {
            rd,
            offset: imm_j(inst),
        },
        0x67 if funct3 == 0 => Instruction::Jalr {
            rd,
            rs1,
            offset: imm_i(inst),
        },
        0x63 => {
            let op = match funct3 {
                0 => BranchOp::Eq,
                1 => BranchOp::Ne,
                4 => BranchOp::Lt,
                5 => BranchOp::Ge,
                6 => BranchOp::Ltu,
                7 => BranchOp::Geu,
                _ => return Instruction::Illegal(inst),
            };
            Instruction::Branch {
                op,
                rs1,
                rs2,
                offset: imm_b(inst),
            }
        }
        0x03 => {
            let (size, signed) = match funct3 {
                0 => (1, true),
                1 => (2, true),
                2 => (4, true),
                4 => (1, false),
                5 => (2, false),
                _ => return Instruction::Illegal(inst),
            };
            Instruction::Load {
                rd,
                rs1,
                offset: imm_i(inst),
                size,
                signed,
            }
        }
        0x23 => {
            let size = match funct3 {
                0 => 1,
                1 => 2,
                2 => 4,
                _ => return Instruction::Illegal(inst),
            };
            Instruction::Store {
                rs1,
                rs2,
                offset: imm_s(inst),
                size,
            }
        }
        0x13 => {
            let imm = imm_i(inst);
            let op = match (funct3, funct7) {
                (0, _) => AluOp::Add,
                (2, _) => AluOp::Slt,
                (3, _) => AluOp::Sltu,
                (4, _) => AluOp::Xor,
                (6, _) => AluOp::Or,
                (7, _) => AluOp::And,
                (1, 0x00) => AluOp::Sll,
                (5, 0x00) => AluOp::Srl,
                (5, 0x20) => AluOp::Sra,
                _ => return Instruction::Illegal(inst),
            };
            let imm = match op {
                AluOp::Sll | AluOp::Srl | AluOp::Sra => imm & 0x1F,
                _ => imm,
            };
            Instruction::OpImm { op, rd, rs1, imm }
        }
        0x33 => {
            let op = match (funct3, funct7) {
                (0, 0x00) => AluOp::Add,
                (0, 0x20) => AluOp::Sub,
                (1, 0x00) => AluOp::Sll,
                (2, 0x00) => AluOp::Slt,
                (3, 0x00) => AluOp::Sltu,
                (4, 0x00) => AluOp::Xor,
                (5, 0x00) => AluOp::Srl,
                (5, 0x20) => AluOp::Sra,
                (6, 0x00) => AluOp::Or,
                (7, 0x00) => AluOp::And,
                _ => return Instruction::Illegal(inst),
            };
            Instruction::Op { op, rd, rs1, rs2 }
        }
        // AMO major opcode; only the word-sized LR/SC pair is modeled.
        0x2F if funct3 == 2 => match funct7 >> 2 {
            0x02 if rs2 == 0 => Instruction::LrW { rd, rs1 },
            0x03 => Instruction::ScW { rd, rs1, rs2 },
            _ => Instruction::Illegal(inst),
        },
        0x0F => Instruction::Fence,
        0x73 => {
            let csr = (inst >> 20) as u16;
            let op = match funct3 & 0x3 {
                1 => CsrOp::Write,
                2 => CsrOp::Set,
                3 => CsrOp::Clear,
                _ => {
                    return match inst {
                        0x0000_0073 => Instruction::Ecall,
                        0x0010_0073 => Instruction::Ebreak,
                        0x3020_0073 => Instruction::Mret,
                        0x1050_0073 => Instruction::Wfi,
                        _ => Instruction::Illegal(inst),
                    }
                }
            };
            let src = if funct3 & 0x4 != 0 {
                CsrSrc::Imm(rs1)
            } else {
                CsrSrc::Reg(rs1)
            };
            Instruction::Csr { op, rd, src, csr }
        }
        _ => Instruction::Illegal(inst),
    }
}
