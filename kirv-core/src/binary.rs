//! Word-level SPIR-V containers and instruction encoding.
use std::fmt;

use num_traits::FromPrimitive;
use spirv::{Op, MAGIC_NUMBER, MAJOR_VERSION, MINOR_VERSION};

use crate::error::{anyhow, bail, Result};

/// The five-word header every SPIR-V module starts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpirvHeader {
    pub magic: u32,
    pub version: u32,
    pub generator: u32,
    pub bound: u32,
    pub schema: u32,
}
impl Default for SpirvHeader {
    fn default() -> Self {
        SpirvHeader {
            magic: MAGIC_NUMBER,
            version: ((MAJOR_VERSION as u32) << 16) | ((MINOR_VERSION as u32) << 8),
            generator: 0,
            bound: 0,
            schema: 0,
        }
    }
}
impl SpirvHeader {
    pub fn with_bound(bound: u32) -> Self {
        SpirvHeader {
            bound,
            ..Default::default()
        }
    }
    pub fn words(&self) -> [u32; 5] {
        [
            self.magic,
            self.version,
            self.generator,
            self.bound,
            self.schema,
        ]
    }
}

/// A complete SPIR-V module body as a word stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SpirvBinary(Vec<u32>);
impl From<Vec<u32>> for SpirvBinary {
    fn from(words: Vec<u32>) -> Self {
        SpirvBinary(words)
    }
}
impl From<&[u32]> for SpirvBinary {
    fn from(words: &[u32]) -> Self {
        SpirvBinary(words.to_owned())
    }
}
impl SpirvBinary {
    pub fn words(&self) -> &[u32] {
        &self.0
    }
    pub fn into_words(self) -> Vec<u32> {
        self.0
    }

    pub fn header(&self) -> Result<SpirvHeader> {
        if self.0.len() < 5 {
            bail!("spirv binary is shorter than its header");
        }
        if self.0[0] != MAGIC_NUMBER {
            bail!("unexpected magic number {:#010x}", self.0[0]);
        }
        Ok(SpirvHeader {
            magic: self.0[0],
            version: self.0[1],
            generator: self.0[2],
            bound: self.0[3],
            schema: self.0[4],
        })
    }

    /// Iterate the instructions following the module header.
    pub fn instrs(&self) -> Result<InstrIter<'_>> {
        self.header()?;
        Ok(InstrIter::new(&self.0[5..]))
    }
}

/// Encode a literal string operand: nul-terminated UTF-8, zero-padded to a
/// word boundary, `(len + 1 + 3) / 4` words total.
pub fn encode_string(s: &str) -> Vec<u32> {
    let bytes = s.as_bytes();
    let nword = bytes.len() / 4 + 1;
    let mut words = vec![0u32; nword];
    for (i, byte) in bytes.iter().enumerate() {
        words[i / 4] |= (*byte as u32) << ((i % 4) * 8);
    }
    words
}

/// Decode a nul-terminated string operand, returning the string and the
/// number of words it occupied.
pub fn decode_string(words: &[u32]) -> Result<(String, usize)> {
    let mut bytes = Vec::new();
    for (iword, word) in words.iter().enumerate() {
        for shift in &[0, 8, 16, 24] {
            let byte = ((word >> shift) & 0xFF) as u8;
            if byte == 0 {
                let s = String::from_utf8(bytes).map_err(|_| anyhow!("string is not utf-8"))?;
                return Ok((s, iword + 1));
            }
            bytes.push(byte);
        }
    }
    bail!("string is not nul-terminated")
}

/// One owned encoded instruction.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Instruction {
    words: Vec<u32>,
}
impl Instruction {
    pub fn opcode(&self) -> u32 {
        self.words[0] & 0xFFFF
    }
    pub fn op(&self) -> Result<Op> {
        Op::from_u32(self.opcode()).ok_or_else(|| anyhow!("unknown opcode {}", self.opcode()))
    }
    /// Word count including the leading count/opcode word.
    pub fn word_count(&self) -> usize {
        self.words.len()
    }
    pub fn words(&self) -> &[u32] {
        &self.words
    }
    pub fn operands(&self) -> Operands<'_> {
        Operands(&self.words[1..])
    }
    pub fn view(&self) -> InstrView<'_> {
        InstrView { words: &self.words }
    }
}
impl AsRef<[u32]> for Instruction {
    fn as_ref(&self) -> &[u32] {
        &self.words
    }
}
impl fmt::Debug for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Ok(op) => write!(f, "{:?} {:?}", op, &self.words[1..]),
            Err(_) => write!(f, "Op#{} {:?}", self.opcode(), &self.words[1..]),
        }
    }
}

/// Fluent encoder for a single instruction. The leading word-count field is
/// patched in by [`InstructionBuilder::build`].
pub struct InstructionBuilder {
    words: Vec<u32>,
}
impl InstructionBuilder {
    pub fn new(op: Op) -> InstructionBuilder {
        InstructionBuilder {
            words: vec![(op as u32) & 0xFFFF],
        }
    }
    pub fn push(mut self, word: u32) -> Self {
        self.words.push(word);
        self
    }
    pub fn push_list(mut self, words: &[u32]) -> Self {
        self.words.extend_from_slice(words);
        self
    }
    pub fn push_str(mut self, s: &str) -> Self {
        self.words.extend(encode_string(s));
        self
    }
    pub fn build(mut self) -> Instruction {
        debug_assert!(self.words.len() < (1 << 16), "instruction overflows u16 word count");
        self.words[0] |= (self.words.len() as u32) << 16;
        Instruction { words: self.words }
    }
}

/// Borrowed view of one encoded instruction inside a word stream.
#[derive(Clone, Copy)]
pub struct InstrView<'a> {
    words: &'a [u32],
}
impl<'a> InstrView<'a> {
    pub fn opcode(&self) -> u32 {
        self.words[0] & 0xFFFF
    }
    pub fn op(&self) -> Result<Op> {
        Op::from_u32(self.opcode()).ok_or_else(|| anyhow!("unknown opcode {}", self.opcode()))
    }
    pub fn word_count(&self) -> usize {
        self.words.len()
    }
    pub fn words(&self) -> &'a [u32] {
        self.words
    }
    pub fn operands(&self) -> Operands<'a> {
        Operands(&self.words[1..])
    }
    pub fn to_owned(&self) -> Instruction {
        Instruction {
            words: self.words.to_owned(),
        }
    }
}
impl<'a> fmt::Debug for InstrView<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.op() {
            Ok(op) => write!(f, "{:?} {:?}", op, &self.words[1..]),
            Err(_) => write!(f, "Op#{} {:?}", self.opcode(), &self.words[1..]),
        }
    }
}

/// Bounds-checked operand cursor over the tail of one instruction.
pub struct Operands<'a>(&'a [u32]);
impl<'a> Operands<'a> {
    pub fn len(&self) -> usize {
        self.0.len()
    }
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        if let Some((first, rest)) = self.0.split_first() {
            self.0 = rest;
            Ok(*first)
        } else {
            Err(anyhow!("operand is too short"))
        }
    }
    pub fn read_bool(&mut self) -> Result<bool> {
        self.read_u32().map(|x| x != 0)
    }
    pub fn read_f32(&mut self) -> Result<f32> {
        self.read_u32().map(f32::from_bits)
    }
    pub fn read_id(&mut self) -> Result<u32> {
        self.read_u32()
    }
    pub fn read_str(&mut self) -> Result<String> {
        let (s, nword) = decode_string(self.0)?;
        self.0 = &self.0[nword..];
        Ok(s)
    }
    pub fn read_enum<E: FromPrimitive>(&mut self) -> Result<E> {
        self.read_u32()
            .and_then(|x| E::from_u32(x).ok_or_else(|| anyhow!("invalid enum value {}", x)))
    }
    pub fn read_rest(&mut self) -> &'a [u32] {
        let rest = self.0;
        self.0 = &[];
        rest
    }
}

/// Instruction iterator over a raw word stream (header already stripped).
pub struct InstrIter<'a> {
    rest: &'a [u32],
}
impl<'a> InstrIter<'a> {
    pub fn new(words: &'a [u32]) -> InstrIter<'a> {
        InstrIter { rest: words }
    }
}
impl<'a> Iterator for InstrIter<'a> {
    type Item = Result<InstrView<'a>>;
    fn next(&mut self) -> Option<Self::Item> {
        let head = *self.rest.first()?;
        let len = (head >> 16) as usize;
        if len == 0 {
            self.rest = &[];
            return Some(Err(anyhow!("instruction length is zero")));
        }
        if len > self.rest.len() {
            self.rest = &[];
            return Some(Err(anyhow!("instruction is truncated")));
        }
        let (words, rest) = self.rest.split_at(len);
        self.rest = rest;
        Some(Ok(InstrView { words }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn instruction_word_count_matches_operands() {
        let instr = InstructionBuilder::new(Op::Decorate).push(3).push(4).build();
        assert_eq!(instr.word_count(), 3);
        assert_eq!(instr.opcode(), Op::Decorate as u32);
        let mut operands = instr.operands();
        assert_eq!(operands.read_u32().unwrap(), 3);
        assert_eq!(operands.read_u32().unwrap(), 4);
        assert!(operands.is_empty());
    }

    #[test]
    fn string_operands_round_trip() {
        for name in &["", "f", "main", "dilate3x3", "a_rather_long_entry_point"] {
            let words = encode_string(name);
            assert_eq!(words.len(), name.len() / 4 + 1);
            let (decoded, nword) = decode_string(&words).unwrap();
            assert_eq!(&decoded, name);
            assert_eq!(nword, words.len());
        }
    }

    #[test]
    fn instr_iter_reports_truncation() {
        let instr = InstructionBuilder::new(Op::Name).push(1).push_str("x").build();
        let mut words = instr.words().to_owned();
        words.pop();
        let mut iter = InstrIter::new(&words);
        assert!(iter.next().unwrap().is_err());
    }

    #[test]
    fn binary_header_checks_magic() {
        let binary = SpirvBinary::from(vec![0xDEADBEEF, 0, 0, 0, 0]);
        assert!(binary.header().is_err());
        let binary = SpirvBinary::from(SpirvHeader::with_bound(10).words().to_vec());
        assert_eq!(binary.header().unwrap().bound, 10);
    }
}
