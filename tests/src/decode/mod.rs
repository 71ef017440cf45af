//! Decoder tests, cross-checked against iced-x86 where the two
//! decoders overlap.

use dynx86_core::{CpuMode, FlatMemory, SegReg};
use dynx86_decode::{decode, next_eip, DecodeError, DecodedInsn, OpFamily, MAX_INSN_LEN};
use iced_x86::{Code, Decoder, DecoderOptions};
use proptest::prelude::*;

fn decode_bytes(bytes: &[u8], mode: CpuMode) -> Result<DecodedInsn, DecodeError> {
    let mut mem = FlatMemory::new(64);
    mem.load(0, bytes);
    decode(&mem, 0, 0, mode)
}

fn iced_len(bytes: &[u8], bitness: u32) -> usize {
    let mut d = Decoder::new(bitness, bytes, DecoderOptions::NONE);
    let insn = d.decode();
    assert_ne!(insn.code(), Code::INVALID, "iced rejects {bytes:02x?}");
    insn.len()
}

const PMODE32: CpuMode = CpuMode {
    code32: true,
    stack32: true,
    protected: true,
    v86: false,
    cpl: 0,
};

/// Encodings with a well-defined meaning on a 386, in 16-bit code.
const REAL_MODE_CASES: &[&[u8]] = &[
    &[0x01, 0xC0],
    &[0x03, 0x47, 0x10],
    &[0x81, 0x06, 0x34, 0x12, 0x78, 0x56],
    &[0x83, 0xC3, 0x05],
    &[0x66, 0x05, 0x01, 0x02, 0x03, 0x04],
    &[0x67, 0x8B, 0x04, 0x24],
    &[0x67, 0x8B, 0x44, 0x8B, 0x10],
    &[0x67, 0x8B, 0x05, 0x01, 0x02, 0x03, 0x04],
    &[0x67, 0x8B, 0x84, 0x8B, 0x01, 0x02, 0x03, 0x04],
    &[0x8B, 0x86, 0x00, 0x01],
    &[0xB8, 0x01, 0x00],
    &[0xB4, 0x4C],
    &[0xC7, 0x06, 0x00, 0x00, 0x01, 0x00],
    &[0xE8, 0x00, 0x00],
    &[0xEA, 0x00, 0x00, 0x00, 0xF0],
    &[0x66, 0xEA, 0x00, 0x00, 0x00, 0x00, 0x08, 0x00],
    &[0x9A, 0x00, 0x00, 0x00, 0x00],
    &[0xC8, 0x10, 0x00, 0x01],
    &[0x0F, 0x84, 0x00, 0x00],
    &[0x66, 0x0F, 0x84, 0x00, 0x00, 0x00, 0x00],
    &[0x0F, 0xB6, 0xC3],
    &[0x0F, 0xBF, 0x07],
    &[0x0F, 0xA4, 0xC3, 0x04],
    &[0x0F, 0xAD, 0xC3],
    &[0x0F, 0xBA, 0xE0, 0x03],
    &[0x0F, 0xAF, 0xC3],
    &[0x0F, 0x94, 0xC0],
    &[0xF3, 0xA4],
    &[0xF2, 0xAE],
    &[0x26, 0x8A, 0x07],
    &[0x2E, 0xFF, 0x26, 0x00, 0x10],
    &[0xD9, 0xE8],
    &[0xDD, 0x06, 0x00, 0x00],
    &[0xDF, 0x2E, 0x00, 0x00],
    &[0xDB, 0x2E, 0x00, 0x00],
    &[0xDE, 0xC1],
    &[0xF6, 0xC3, 0x01],
    &[0xF7, 0xD8],
    &[0xF7, 0x06, 0x00, 0x00, 0x34, 0x12],
    &[0xF7, 0x36, 0x00, 0x00],
    &[0xC0, 0xE0, 0x03],
    &[0xD3, 0xE8],
    &[0xCD, 0x21],
    &[0xE4, 0x60],
    &[0x0F, 0x01, 0x16, 0x00, 0x00],
    &[0x0F, 0x20, 0xC0],
    &[0xA1, 0x34, 0x12],
    &[0x67, 0xA1, 0x01, 0x02, 0x03, 0x04],
    &[0x6B, 0xC3, 0x05],
    &[0x69, 0xC3, 0x34, 0x12],
    &[0x8D, 0x40, 0x01],
    &[0xD4, 0x0A],
    &[0x8E, 0xD8],
    &[0xC4, 0x1E, 0x00, 0x00],
    &[0x62, 0x06, 0x00, 0x00],
    &[0xE2, 0xFE],
    &[0x68, 0x34, 0x12],
    &[0x6A, 0xFF],
    &[0xC2, 0x04, 0x00],
];

#[test]
fn test_lengths_match_iced_real_mode() {
    for bytes in REAL_MODE_CASES {
        let insn = decode_bytes(bytes, CpuMode::REAL)
            .unwrap_or_else(|e| panic!("{bytes:02x?}: {e}"));
        assert_eq!(insn.len as usize, iced_len(bytes, 16), "{bytes:02x?}");
        assert_eq!(insn.len as usize, bytes.len(), "{bytes:02x?}");
    }
}

#[test]
fn test_lengths_match_iced_protected_32() {
    let cases: &[&[u8]] = &[
        &[0xB8, 0x78, 0x56, 0x34, 0x12],
        &[0x66, 0xB8, 0x34, 0x12],
        &[0x8B, 0x44, 0x24, 0x08],
        &[0x8B, 0x04, 0x8D, 0x00, 0x10, 0x00, 0x00],
        &[0x67, 0x8B, 0x47, 0x10],
        &[0xE9, 0x00, 0x00, 0x00, 0x00],
        &[0x0F, 0x85, 0x10, 0x00, 0x00, 0x00],
        &[0x81, 0x3D, 0x00, 0x10, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00],
        &[0xC7, 0x44, 0x24, 0x04, 0x01, 0x00, 0x00, 0x00],
        &[0xA3, 0x00, 0x10, 0x00, 0x00],
        &[0xFF, 0x24, 0x85, 0x00, 0x10, 0x00, 0x00],
    ];
    for bytes in cases {
        let insn = decode_bytes(bytes, PMODE32).unwrap_or_else(|e| panic!("{bytes:02x?}: {e}"));
        assert_eq!(insn.len as usize, iced_len(bytes, 32), "{bytes:02x?}");
        assert_eq!(insn.len as usize, bytes.len(), "{bytes:02x?}");
    }
}

#[test]
fn test_families() {
    let cases: &[(&[u8], OpFamily)] = &[
        (&[0x01, 0xC0], OpFamily::Alu),
        (&[0x40], OpFamily::IncDec),
        (&[0xFE, 0xC0], OpFamily::IncDec),
        (&[0x50], OpFamily::Push),
        (&[0x8F, 0x06, 0x00, 0x00], OpFamily::Pop),
        (&[0xB8, 0x00, 0x00], OpFamily::Mov),
        (&[0x8E, 0xD8], OpFamily::MovSeg),
        (&[0x74, 0x00], OpFamily::Jcc),
        (&[0xEB, 0x00], OpFamily::JmpNear),
        (&[0xC3], OpFamily::RetNear),
        (&[0xCB], OpFamily::FarControl),
        (&[0xE2, 0x00], OpFamily::Loop),
        (&[0xFC], OpFamily::FlagOp),
        (&[0x0F, 0x9C, 0xC0], OpFamily::SetCc),
        (&[0xD1, 0xE0], OpFamily::Shift),
        (&[0xF7, 0xE3], OpFamily::Unary),
        (&[0xFF, 0xE0], OpFamily::Group5),
        (&[0xA4], OpFamily::String),
        (&[0xD9, 0xE8], OpFamily::Fpu),
        (&[0xF4], OpFamily::System),
        (&[0xEE], OpFamily::Io),
        (&[0x27], OpFamily::Bcd),
        (&[0xCD, 0x10], OpFamily::Interrupt),
        (&[0x90], OpFamily::Nop),
    ];
    for (bytes, family) in cases {
        let insn = decode_bytes(bytes, CpuMode::REAL).unwrap();
        assert_eq!(insn.family, *family, "{bytes:02x?}");
    }
}

#[test]
fn test_operands() {
    let insn = decode_bytes(&[0x26, 0x8B, 0x47, 0xFE], CpuMode::REAL).unwrap();
    let mem = insn.mem.unwrap();
    assert_eq!(mem.segment, SegReg::Es);
    assert_eq!(mem.base, Some(3));
    assert_eq!(mem.disp as u16, 0xFFFE);

    // [bp+si] defaults to SS.
    let insn = decode_bytes(&[0x8B, 0x02], CpuMode::REAL).unwrap();
    assert_eq!(insn.mem.unwrap().segment, SegReg::Ss);

    // Sign-extended imm8.
    let insn = decode_bytes(&[0x83, 0xC0, 0xFF], CpuMode::REAL).unwrap();
    assert_eq!(insn.imm, 0xFFFF_FFFF);

    let insn = decode_bytes(&[0x66, 0x05, 0x01, 0x02, 0x03, 0x04], CpuMode::REAL).unwrap();
    assert!(insn.op32);
    assert_eq!(insn.imm, 0x0403_0201);
}

#[test]
fn test_illegal_and_malformed() {
    assert!(matches!(
        decode_bytes(&[0x0F, 0x0B], CpuMode::REAL),
        Err(DecodeError::Illegal { opcode: 0x10B })
    ));
    // LEA with a register operand.
    assert!(matches!(decode_bytes(&[0x8D, 0xC0], CpuMode::REAL), Err(DecodeError::Illegal { .. })));
    // FF /7
    assert!(matches!(decode_bytes(&[0xFF, 0xF8], CpuMode::REAL), Err(DecodeError::Illegal { .. })));
    assert_eq!(decode_bytes(&[0x66; 16], CpuMode::REAL), Err(DecodeError::TooLong));
}

#[test]
fn test_privileged_outside_ring0() {
    let ring3 = CpuMode { cpl: 3, ..PMODE32 };
    assert!(matches!(
        decode_bytes(&[0xF4], ring3),
        Err(DecodeError::Privileged { opcode: 0xF4, cpl: 3 })
    ));
    assert!(decode_bytes(&[0xF4], PMODE32).is_ok());
}

#[test]
fn test_next_eip_wraps_16bit() {
    assert_eq!(next_eip(0xFFFE, 3, false), 0x0001);
    assert_eq!(next_eip(0xFFFE, 3, true), 0x1_0001);
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 4096,
        .. ProptestConfig::default()
    })]

    #[test]
    fn decode_never_panics_and_has_sane_length(
        bytes in proptest::collection::vec(any::<u8>(), 1..=16),
        code32 in any::<bool>(),
    ) {
        let mode = if code32 { PMODE32 } else { CpuMode::REAL };
        if let Ok(insn) = decode_bytes(&bytes, mode) {
            prop_assert!(insn.len >= 1, "len={} bytes={:02x?}", insn.len, bytes);
            prop_assert!(insn.len as u32 <= MAX_INSN_LEN, "len={} bytes={:02x?}", insn.len, bytes);
            // Decoding is pure: the same bytes decode the same way.
            prop_assert_eq!(decode_bytes(&bytes, mode), Ok(insn));
        }
    }
}
