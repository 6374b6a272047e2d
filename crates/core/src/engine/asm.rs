// Multicore Virtual Platform
// Copyright (C) 2026 Andrii Shylenko
//
// This software is released under the MIT License.
// See the LICENSE file in the project root for full license information.

//! Minimal RV32 encoder for hand-assembled test programs.

fn r_type(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn i_type(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
    (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
}

fn s_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 5) & 0x7F) << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | ((imm & 0x1F) << 7) | 0x23
}

fn b_type(imm: i32, rs2: u32, rs1: u32, funct3: u32) -> u32 {
    let imm = imm as u32;
    (((imm >> 12) & 1) << 31)
        | (((imm >> 5) & 0x3F) << 25)
        | (rs2 << 20)
        | (rs1 << 15)
        | (funct3 << 12)
        | (((imm >> 1) & 0xF) << 8)
        | (((imm >> 11) & 1) << 7)
        | 0x63
}

pub fn lui(rd: u32, value: u32) -> u32 {
    (value & 0xFFFF_F000) | (rd << 7) | 0x37
}

pub fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(imm, rs1, 0, rd, 0x13)
}

/// Loads a full 32-bit constant.
pub fn li(rd: u32, value: u32) -> [u32; 2] {
    let hi = value.wrapping_add(0x800) & 0xFFFF_F000;
    let lo = value.wrapping_sub(hi) as i32;
    [lui(rd, hi), addi(rd, rd, lo)]
}

pub fn add(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0, rs2, rs1, 0, rd, 0x33)
}

pub fn lw(rd: u32, rs1: u32, offset: i32) -> u32 {
    i_type(offset, rs1, 2, rd, 0x03)
}

pub fn lh(rd: u32, rs1: u32, offset: i32) -> u32 {
    i_type(offset, rs1, 1, rd, 0x03)
}

pub fn lb(rd: u32, rs1: u32, offset: i32) -> u32 {
    i_type(offset, rs1, 0, rd, 0x03)
}

pub fn lbu(rd: u32, rs1: u32, offset: i32) -> u32 {
    i_type(offset, rs1, 4, rd, 0x03)
}

/// Stores `src` at `base + offset`.
pub fn sw(src: u32, base: u32, offset: i32) -> u32 {
    s_type(offset, src, base, 2)
}

pub fn sb(src: u32, base: u32, offset: i32) -> u32 {
    s_type(offset, src, base, 0)
}

pub fn bne(rs1: u32, rs2: u32, offset: i32) -> u32 {
    b_type(offset, rs2, rs1, 1)
}

pub fn jal(rd: u32, offset: i32) -> u32 {
    let imm = offset as u32;
    (((imm >> 20) & 1) << 31)
        | (((imm >> 1) & 0x3FF) << 21)
        | (((imm >> 11) & 1) << 20)
        | (((imm >> 12) & 0xFF) << 12)
        | (rd << 7)
        | 0x6F
}

pub fn lr_w(rd: u32, rs1: u32) -> u32 {
    r_type(0x02 << 2, 0, rs1, 2, rd, 0x2F)
}

pub fn sc_w(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x03 << 2, rs2, rs1, 2, rd, 0x2F)
}

pub fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    (csr << 20) | (rs1 << 15) | (1 << 12) | (rd << 7) | 0x73
}

pub fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    (csr << 20) | (rs1 << 15) | (2 << 12) | (rd << 7) | 0x73
}

pub fn csrrwi(rd: u32, csr: u32, imm: u32) -> u32 {
    (csr << 20) | ((imm & 0x1F) << 15) | (5 << 12) | (rd << 7) | 0x73
}

pub fn csrrsi(rd: u32, csr: u32, imm: u32) -> u32 {
    (csr << 20) | ((imm & 0x1F) << 15) | (6 << 12) | (rd << 7) | 0x73
}

pub fn ecall() -> u32 {
    0x0000_0073
}

pub fn mret() -> u32 {
    0x3020_0073
}

pub fn wfi() -> u32 {
    0x1050_0073
}

/// Little-endian image of `words`.
pub fn program(words: &[u32]) -> Vec<u8> {
    words.iter().flat_map(|w| w.to_le_bytes()).collect()
}

#[test]
fn test_encoder_matches_decoder() {
    use super::decode::{decode, Instruction};
    assert_eq!(addi(1, 0, 5), 0x0050_0093);
    assert_eq!(jal(0, -4), 0xFFDF_F06F);
    assert_eq!(sw(5, 2, -8), 0xFE51_2C23);
    assert_eq!(lr_w(5, 10), 0x1005_22AF);
    assert_eq!(
        decode(bne(5, 0, -8)),
        Instruction::Branch {
            op: super::decode::BranchOp::Ne,
            rs1: 5,
            rs2: 0,
            offset: -8
        }
    );
    let [hi, lo] = li(7, 0xDEAD_BEEF);
    assert_eq!(decode(hi), Instruction::Lui { rd: 7, imm: 0xDEAD_C000 });
    assert!(matches!(decode(lo), Instruction::OpImm { imm: -273, .. }));
}
