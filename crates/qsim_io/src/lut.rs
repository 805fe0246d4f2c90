//! Rotation lookup-table files.
//!
//! A LUT file has no header; each entry is:
//!
//! ```text
//! 1B  word count N
//! Nx8B angle words (little-endian, ascending word index)
//! 2B  sequence length L
//! LxB gate opcodes
//! ```
//!
//! Entries appear in order of nondecreasing angle magnitude, where the
//! magnitude of an angle in `[0, 2*pi)` is its distance to the nearest
//! multiple of `2*pi`.

use crate::stream::{ByteSink, ByteSource};
use anyhow::{Context, Result, bail};
use nom::IResult;
use nom::multi::count;
use nom::number::complete::{le_u8, le_u16, le_u64};
use qsim_core::fixed_point::Fpa;
use qsim_common::opcode::Opcode;
use std::f64::consts::PI;
use std::io::{Read, Write};
use std::path::Path;

#[derive(Clone, Debug, PartialEq)]
pub struct LutEntry {
    pub angle: Fpa,
    pub urotseq: Vec<Opcode>,
}

impl LutEntry {
    /// Distance of the angle to the nearest full turn; the sort key of the
    /// file format.
    pub fn magnitude(&self) -> f64 {
        let theta = self.angle.to_angle();
        theta.min(2.0 * PI - theta)
    }
}

fn parse_entry(input: &[u8]) -> IResult<&[u8], LutEntry> {
    let (input, word_count) = le_u8(input)?;
    let (input, words) = count(le_u64, word_count as usize)(input)?;
    let (input, seq_len) = le_u16(input)?;
    let (input, gate_bytes) = count(le_u8, seq_len as usize)(input)?;

    let mut angle = Fpa::zero();
    for (i, w) in words.into_iter().enumerate().take(Fpa::NUM_WORDS) {
        angle.set_word(i, w);
    }
    let mut urotseq = Vec::with_capacity(seq_len as usize);
    for b in gate_bytes {
        match Opcode::from_wire(b as u16) {
            Some(op) => urotseq.push(op),
            None => {
                return Err(nom::Err::Failure(nom::error::Error::new(
                    input,
                    nom::error::ErrorKind::Verify,
                )));
            }
        }
    }

    Ok((input, LutEntry { angle, urotseq }))
}

/// Parses an entire LUT byte buffer.
pub fn parse_lut(bytes: &[u8]) -> Result<Vec<LutEntry>> {
    let mut entries = Vec::new();
    let mut rest = bytes;
    while !rest.is_empty() {
        match parse_entry(rest) {
            Ok((tail, entry)) => {
                entries.push(entry);
                rest = tail;
            }
            Err(e) => bail!("malformed LUT entry at byte {}: {e}", bytes.len() - rest.len()),
        }
    }

    for pair in entries.windows(2) {
        if pair[1].magnitude() < pair[0].magnitude() {
            bail!(
                "LUT entries out of order: magnitude {} follows {}",
                pair[1].magnitude(),
                pair[0].magnitude()
            );
        }
    }
    Ok(entries)
}

pub fn read_lut<P: AsRef<Path>>(path: P) -> Result<Vec<LutEntry>> {
    let p = path.as_ref();
    let mut bytes = Vec::new();
    ByteSource::open(p)?
        .read_to_end(&mut bytes)
        .with_context(|| format!("reading LUT file \"{}\"", p.display()))?;
    parse_lut(&bytes).with_context(|| format!("parsing LUT file \"{}\"", p.display()))
}

pub fn write_lut<P: AsRef<Path>>(path: P, entries: &[LutEntry]) -> Result<()> {
    let mut sink = ByteSink::create(path)?;
    for e in entries {
        sink.write_all(&[Fpa::NUM_WORDS as u8])?;
        for &w in e.angle.words() {
            sink.write_all(&w.to_le_bytes())?;
        }
        let len = u16::try_from(e.urotseq.len()).context("LUT sequence too long")?;
        sink.write_all(&len.to_le_bytes())?;
        for &g in &e.urotseq {
            sink.write_all(&[g.wire() as u8])?;
        }
    }
    sink.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entries() -> Vec<LutEntry> {
        vec![
            LutEntry {
                angle: Fpa::from_angle(0.01),
                urotseq: vec![Opcode::T],
            },
            LutEntry {
                angle: Fpa::from_angle(2.0 * PI - 0.05),
                urotseq: vec![Opcode::Tdg, Opcode::H],
            },
            LutEntry {
                angle: Fpa::from_angle(1.5),
                urotseq: vec![],
            },
        ]
    }

    #[test]
    fn file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotations.bin.gz");
        write_lut(&path, &entries()).unwrap();
        let back = read_lut(&path).unwrap();
        assert_eq!(back, entries());
    }

    #[test]
    fn out_of_order_entries_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotations.bin");
        let mut es = entries();
        es.swap(0, 2);
        write_lut(&path, &es).unwrap();
        assert!(read_lut(&path).is_err());
    }

    #[test]
    fn truncated_entry_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rotations.bin");
        write_lut(&path, &entries()).unwrap();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 1);
        assert!(parse_lut(&bytes).is_err());
    }
}
