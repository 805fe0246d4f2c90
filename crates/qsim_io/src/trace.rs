//! Binary instruction trace reader and writer.
//!
//! A trace file is a 4-byte little-endian qubit count followed by
//! concatenated instruction records:
//!
//! ```text
//! 2B   opcode (zero-based wire value)
//! 3x8B qubit operands (zero-padded past the true arity)
//! 1B   angle-present flag A (1 iff RX/RZ)
//! A=1: 1B word count N, Nx8B angle words, 2B sequence length L, LxB opcodes
//! 1B   correction array count C; per array: 2B length + that many opcodes
//! ```
//!
//! The reader proceeds field-by-field and reports the number of bytes
//! consumed; hitting EOF in the middle of a record is fatal. The writer
//! mirrors the reader byte-for-byte.

use crate::stream::{ByteSink, ByteSource};
use anyhow::{Context, Result, bail};
use qsim_core::fixed_point::Fpa;
use qsim_core::instruction::{Instruction, MAX_QUBITS};
use qsim_common::ids::QubitId;
use qsim_common::opcode::Opcode;
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::path::Path;

fn decode_gate_byte(b: u8) -> Result<Opcode> {
    Opcode::from_wire(b as u16)
        .with_context(|| format!("bad opcode byte {b} in unrolled sequence"))
}

pub struct TraceReader<R: Read> {
    src: R,
    qubit_count: u32,
    at_end: bool,
}

impl TraceReader<ByteSource> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref().to_path_buf();
        Self::new(ByteSource::open(path)?)
            .with_context(|| format!("reading trace header of \"{}\"", p.display()))
    }
}

impl<R: Read> TraceReader<R> {
    /// Wraps a byte stream and reads the qubit-count header.
    pub fn new(mut src: R) -> Result<Self> {
        let mut header = [0u8; 4];
        src.read_exact(&mut header).context("trace file has no qubit-count header")?;
        Ok(Self {
            src,
            qubit_count: u32::from_le_bytes(header),
            at_end: false,
        })
    }

    pub fn qubit_count(&self) -> u32 {
        self.qubit_count
    }

    /// True once a record boundary coincided with end-of-stream.
    pub fn at_end(&self) -> bool {
        self.at_end
    }

    /// Reads the next record. Returns the instruction and the number of
    /// bytes consumed, or `None` on a clean end-of-stream. EOF inside a
    /// record is an error.
    pub fn read_instruction(&mut self) -> Result<Option<(Instruction, u64)>> {
        if self.at_end {
            return Ok(None);
        }

        // The opcode field doubles as the EOF probe: zero bytes here is a
        // clean end of the trace.
        let mut op_bytes = [0u8; 2];
        let n = self.src.read(&mut op_bytes).context("reading opcode")?;
        if n == 0 {
            self.at_end = true;
            return Ok(None);
        }
        if n < 2 {
            self.src
                .read_exact(&mut op_bytes[n..])
                .context("unexpected EOF inside opcode field")?;
        }
        let mut consumed = 2u64;

        let wire = u16::from_le_bytes(op_bytes);
        let kind = match Opcode::from_wire(wire) {
            Some(k) => k,
            None => bail!("bad opcode {wire} in trace record"),
        };

        let mut qubits = [0 as QubitId; MAX_QUBITS];
        for q in &mut qubits {
            let mut buf = [0u8; 8];
            self.src.read_exact(&mut buf).context("unexpected EOF inside qubit operands")?;
            *q = i64::from_le_bytes(buf);
            consumed += 8;
        }

        let mut flag = [0u8; 1];
        self.src.read_exact(&mut flag).context("unexpected EOF at angle flag")?;
        consumed += 1;

        let mut angle = Fpa::zero();
        let mut urotseq = Vec::new();
        if flag[0] != 0 {
            let mut wc = [0u8; 1];
            self.src.read_exact(&mut wc).context("unexpected EOF at angle word count")?;
            consumed += 1;
            if wc[0] as usize != Fpa::NUM_WORDS {
                bail!("bad angle word count {} (expected {})", wc[0], Fpa::NUM_WORDS);
            }
            for i in 0..Fpa::NUM_WORDS {
                let mut buf = [0u8; 8];
                self.src.read_exact(&mut buf).context("unexpected EOF inside angle words")?;
                angle.set_word(i, u64::from_le_bytes(buf));
                consumed += 8;
            }

            let mut len_bytes = [0u8; 2];
            self.src
                .read_exact(&mut len_bytes)
                .context("unexpected EOF at sequence length")?;
            consumed += 2;
            let len = u16::from_le_bytes(len_bytes) as usize;
            urotseq.reserve(len);
            for _ in 0..len {
                let mut b = [0u8; 1];
                self.src
                    .read_exact(&mut b)
                    .context("unexpected EOF inside unrolled sequence")?;
                urotseq.push(decode_gate_byte(b[0])?);
                consumed += 1;
            }
        }

        let mut corr_count = [0u8; 1];
        self.src
            .read_exact(&mut corr_count)
            .context("unexpected EOF at correction count")?;
        consumed += 1;
        let mut corrections = VecDeque::with_capacity(corr_count[0] as usize);
        for _ in 0..corr_count[0] {
            let mut len_bytes = [0u8; 2];
            self.src
                .read_exact(&mut len_bytes)
                .context("unexpected EOF at correction length")?;
            consumed += 2;
            let len = u16::from_le_bytes(len_bytes) as usize;
            let mut seq = Vec::with_capacity(len);
            for _ in 0..len {
                let mut b = [0u8; 1];
                self.src
                    .read_exact(&mut b)
                    .context("unexpected EOF inside correction sequence")?;
                seq.push(decode_gate_byte(b[0])?);
                consumed += 1;
            }
            corrections.push_back(seq);
        }

        let inst = Instruction::from_parts(kind, qubits, angle, urotseq, corrections);
        Ok(Some((inst, consumed)))
    }
}

pub struct TraceWriter<W: Write> {
    sink: W,
}

impl TraceWriter<ByteSink> {
    pub fn create<P: AsRef<Path>>(path: P, qubit_count: u32) -> Result<Self> {
        Self::new(ByteSink::create(path)?, qubit_count)
    }

    pub fn finish(self) -> Result<()> {
        self.sink.finish()
    }
}

impl<W: Write> TraceWriter<W> {
    pub fn new(mut sink: W, qubit_count: u32) -> Result<Self> {
        sink.write_all(&qubit_count.to_le_bytes())
            .context("writing qubit-count header")?;
        Ok(Self { sink })
    }

    /// Writes one record; returns the number of bytes emitted.
    pub fn write_instruction(&mut self, inst: &Instruction) -> Result<u64> {
        let mut emitted = 0u64;
        self.sink.write_all(&inst.kind().wire().to_le_bytes())?;
        emitted += 2;
        for &q in inst.raw_qubits() {
            self.sink.write_all(&q.to_le_bytes())?;
            emitted += 8;
        }

        let has_angle = inst.kind().is_rotation();
        self.sink.write_all(&[has_angle as u8])?;
        emitted += 1;
        if has_angle {
            self.sink.write_all(&[Fpa::NUM_WORDS as u8])?;
            emitted += 1;
            for &w in inst.angle().words() {
                self.sink.write_all(&w.to_le_bytes())?;
                emitted += 8;
            }
            let len = u16::try_from(inst.urotseq().len()).context("unrolled sequence too long")?;
            self.sink.write_all(&len.to_le_bytes())?;
            emitted += 2;
            for &g in inst.urotseq() {
                self.sink.write_all(&[g.wire() as u8])?;
                emitted += 1;
            }
        }

        let corr_count =
            u8::try_from(inst.corrections().len()).context("too many correction arrays")?;
        self.sink.write_all(&[corr_count])?;
        emitted += 1;
        for seq in inst.corrections() {
            let len = u16::try_from(seq.len()).context("correction sequence too long")?;
            self.sink.write_all(&len.to_le_bytes())?;
            emitted += 2;
            for &g in seq {
                self.sink.write_all(&[g.wire() as u8])?;
                emitted += 1;
            }
        }
        Ok(emitted)
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_instructions() -> Vec<Instruction> {
        let mut rot = Instruction::new_rotation(
            Opcode::Rz,
            3,
            Fpa::from_angle(0.4176),
            vec![Opcode::H, Opcode::T, Opcode::Sdg, Opcode::H],
        );
        rot.push_correction(vec![Opcode::Tdg, Opcode::Z]);
        rot.push_correction(vec![Opcode::S]);
        vec![
            Instruction::new(Opcode::H, &[0]),
            Instruction::new(Opcode::Cx, &[1, 2]),
            rot,
            Instruction::new(Opcode::MSwap, &[7, 4]),
            Instruction::new(Opcode::Ccx, &[0, 1, 2]),
        ]
    }

    #[test]
    fn record_round_trip_preserves_bytes() {
        let mut writer = TraceWriter::new(Vec::new(), 8).unwrap();
        for inst in sample_instructions() {
            writer.write_instruction(&inst).unwrap();
        }
        let bytes = writer.into_inner();

        let mut reader = TraceReader::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(reader.qubit_count(), 8);

        let mut rewritten = TraceWriter::new(Vec::new(), reader.qubit_count()).unwrap();
        let mut total = 4u64;
        while let Some((inst, consumed)) = reader.read_instruction().unwrap() {
            let emitted = rewritten.write_instruction(&inst).unwrap();
            assert_eq!(consumed, emitted);
            total += consumed;
        }
        assert_eq!(rewritten.into_inner(), bytes);
        assert_eq!(total, bytes.len() as u64);
    }

    #[test]
    fn fields_survive_round_trip() {
        let mut writer = TraceWriter::new(Vec::new(), 8).unwrap();
        for inst in sample_instructions() {
            writer.write_instruction(&inst).unwrap();
        }
        let bytes = writer.into_inner();
        let mut reader = TraceReader::new(Cursor::new(&bytes)).unwrap();

        let originals = sample_instructions();
        let mut i = 0;
        while let Some((inst, _)) = reader.read_instruction().unwrap() {
            assert_eq!(inst.kind(), originals[i].kind());
            assert_eq!(inst.qubits(), originals[i].qubits());
            assert_eq!(inst.angle(), originals[i].angle());
            assert_eq!(inst.urotseq(), originals[i].urotseq());
            assert_eq!(inst.corrections(), originals[i].corrections());
            i += 1;
        }
        assert_eq!(i, originals.len());
        assert!(reader.at_end());
    }

    #[test]
    fn empty_trace_has_only_a_header() {
        let writer = TraceWriter::new(Vec::new(), 4).unwrap();
        let bytes = writer.into_inner();
        assert_eq!(bytes, vec![4, 0, 0, 0]);

        let mut reader = TraceReader::new(Cursor::new(&bytes)).unwrap();
        assert_eq!(reader.qubit_count(), 4);
        assert!(reader.read_instruction().unwrap().is_none());
        assert!(reader.at_end());
    }

    #[test]
    fn eof_mid_record_is_an_error() {
        let mut writer = TraceWriter::new(Vec::new(), 2).unwrap();
        writer.write_instruction(&Instruction::new(Opcode::Cx, &[0, 1])).unwrap();
        let mut bytes = writer.into_inner();
        bytes.truncate(bytes.len() - 5);

        let mut reader = TraceReader::new(Cursor::new(&bytes)).unwrap();
        assert!(reader.read_instruction().is_err());
    }

    #[test]
    fn bad_opcode_is_an_error() {
        let mut bytes = vec![2, 0, 0, 0];
        bytes.extend_from_slice(&999u16.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 25]);
        let mut reader = TraceReader::new(Cursor::new(&bytes)).unwrap();
        assert!(reader.read_instruction().is_err());
    }

    #[test]
    fn gzip_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trace.gz");

        let mut writer = TraceWriter::create(&path, 6).unwrap();
        for inst in sample_instructions() {
            writer.write_instruction(&inst).unwrap();
        }
        writer.finish().unwrap();

        let mut reader = TraceReader::open(&path).unwrap();
        assert_eq!(reader.qubit_count(), 6);
        let mut n = 0;
        while let Some((_, _)) = reader.read_instruction().unwrap() {
            n += 1;
        }
        assert_eq!(n, sample_instructions().len());
    }
}
