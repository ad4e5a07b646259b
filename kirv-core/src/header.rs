//! Side-car descriptor header prefixed to every compiled kernel module.
//!
//! The header tells the host runtime how many uniform and storage buffers
//! each entry point binds, before the SPIR-V body is handed to the driver
//! verbatim. Layout, in little-endian `u32` words:
//!
//! ```text
//! [0] header word count + 1 (total length including this word)
//! [1] entry point count N
//! repeat N times:
//!   [0]   uniform_buffer_count
//!   [1]   storage_buffer_count
//!   [2]   padded_name_length (bytes, multiple of 4)
//!   [3..] entry point name, nul-terminated, zero-padded
//! ```
use crate::binary::{decode_string, encode_string, SpirvBinary};
use crate::error::{bail, Result};

/// Per-entry-point descriptor counts recorded in the side-car header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPointHeader {
    pub name: String,
    pub uniform_buffer_count: u32,
    pub storage_buffer_count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleHeader {
    pub entry_points: Vec<EntryPointHeader>,
}
impl ModuleHeader {
    pub fn encode(&self) -> Vec<u32> {
        let mut words = vec![0u32, self.entry_points.len() as u32];
        for entry_point in &self.entry_points {
            let name_words = encode_string(&entry_point.name);
            words.push(entry_point.uniform_buffer_count);
            words.push(entry_point.storage_buffer_count);
            words.push(name_words.len() as u32 * 4);
            words.extend(name_words);
        }
        words[0] = words.len() as u32;
        words
    }

    /// Parse a header off the front of `words`. Returns the header and the
    /// word offset at which the SPIR-V body starts.
    pub fn decode(words: &[u32]) -> Result<(ModuleHeader, usize)> {
        if words.len() < 2 {
            bail!("module header is truncated");
        }
        let total = words[0] as usize;
        if total < 2 || total > words.len() {
            bail!("module header length {} is out of bounds", total);
        }
        let entry_point_count = words[1] as usize;
        let mut entry_points = Vec::with_capacity(entry_point_count);
        let mut cursor = 2;
        for _ in 0..entry_point_count {
            if cursor + 3 > total {
                bail!("module header entry point record is truncated");
            }
            let uniform_buffer_count = words[cursor];
            let storage_buffer_count = words[cursor + 1];
            let padded_name_length = words[cursor + 2] as usize;
            if padded_name_length % 4 != 0 {
                bail!("entry point name length {} is not word-aligned", padded_name_length);
            }
            let name_words = padded_name_length / 4;
            cursor += 3;
            if cursor + name_words > total {
                bail!("entry point name overruns the header");
            }
            let (name, _) = decode_string(&words[cursor..cursor + name_words])?;
            cursor += name_words;
            entry_points.push(EntryPointHeader {
                name,
                uniform_buffer_count,
                storage_buffer_count,
            });
        }
        if cursor != total {
            bail!("module header has {} trailing words", total - cursor);
        }
        Ok((ModuleHeader { entry_points }, total))
    }
}

/// A compiled kernel: side-car header plus a standards-conformant SPIR-V
/// module. The runtime parses the header first and passes the body to the
/// SPIR-V loader untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelModule {
    pub header: ModuleHeader,
    pub body: SpirvBinary,
}
impl KernelModule {
    pub fn encode(&self) -> Vec<u32> {
        let mut words = self.header.encode();
        words.extend_from_slice(self.body.words());
        words
    }

    pub fn decode(words: &[u32]) -> Result<KernelModule> {
        let (header, body_offset) = ModuleHeader::decode(words)?;
        let body = SpirvBinary::from(&words[body_offset..]);
        body.header()?;
        Ok(KernelModule { header, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::binary::SpirvHeader;
    use pretty_assertions::assert_eq;

    fn sample_header() -> ModuleHeader {
        ModuleHeader {
            entry_points: vec![
                EntryPointHeader {
                    name: "blur_x".to_owned(),
                    uniform_buffer_count: 1,
                    storage_buffer_count: 2,
                },
                EntryPointHeader {
                    name: "f".to_owned(),
                    uniform_buffer_count: 0,
                    storage_buffer_count: 1,
                },
            ],
        }
    }

    #[test]
    fn header_round_trips() {
        let header = sample_header();
        let words = header.encode();
        assert_eq!(words[0] as usize, words.len());
        assert_eq!(words[1], 2);
        let (decoded, offset) = ModuleHeader::decode(&words).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(offset, words.len());
    }

    #[test]
    fn name_padding_is_word_aligned() {
        let header = sample_header();
        let words = header.encode();
        // "blur_x" is 6 bytes; nul plus padding rounds it to 8.
        assert_eq!(words[4], 8);
    }

    #[test]
    fn module_round_trips() {
        let module = KernelModule {
            header: sample_header(),
            body: SpirvBinary::from(SpirvHeader::with_bound(42).words().to_vec()),
        };
        let words = module.encode();
        let decoded = KernelModule::decode(&words).unwrap();
        assert_eq!(decoded, module);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let words = sample_header().encode();
        assert!(ModuleHeader::decode(&words[..words.len() - 2]).is_err());
    }
}
