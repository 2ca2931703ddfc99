//! Debug symbol tables, converted to an IDC script for the disassembler.

use std::fmt::Write as _;

use crate::artifact::Artifact;
use crate::engine::Context;
use crate::error::{ExtractError, Result};
use crate::formats::{u32_le, write_output};
use crate::naming::Destination;
use crate::registry::{Decoder, DecoderKind, Extraction};

const MAGIC: &[u8; 4] = b"SYM1";
const MAX_SYMBOLS: u32 = 1_000_000;

struct Symbol {
    addr: u32,
    name: String,
}

/// Detection is the parse itself: either the whole table reads cleanly or
/// the file is not a symbol table.
fn parse(data: &[u8]) -> Option<Vec<Symbol>> {
    if data.get(..4)? != MAGIC {
        return None;
    }
    let count = u32_le(data, 4)?;
    if count == 0 || count > MAX_SYMBOLS {
        return None;
    }

    let mut symbols = Vec::with_capacity(count.min(4096) as usize);
    let mut at = 8usize;
    for _ in 0..count {
        let addr = u32_le(data, at)?;
        let _stype = *data.get(at + 4)?;
        let nlen = *data.get(at + 5)? as usize;
        let raw = data.get(at + 6..at + 6 + nlen)?;
        if nlen == 0 || !raw.iter().all(|b| b.is_ascii_graphic()) {
            return None;
        }
        symbols.push(Symbol {
            addr,
            name: String::from_utf8_lossy(raw).into_owned(),
        });
        at += 6 + nlen;
    }
    Some(symbols)
}

pub struct SymDecoder;

impl Decoder for SymDecoder {
    fn kind(&self) -> DecoderKind {
        DecoderKind::Sym
    }

    fn detect(&self, artifact: &Artifact) -> bool {
        parse(artifact.bytes()).is_some()
    }

    fn extract(
        &self,
        artifact: &Artifact,
        dest: &Destination,
        _ctx: &Context,
    ) -> Result<Extraction> {
        let name = self.kind().name();
        let symbols = parse(artifact.bytes())
            .ok_or_else(|| ExtractError::decoder(name, artifact.path(), "bad symbol table"))?;

        let mut script = String::from("#include <idc.idc>\n\nstatic main() {\n");
        for sym in &symbols {
            let _ = writeln!(script, "    MakeName(0x{:08X}, \"{}\");", sym.addr, sym.name);
        }
        script.push_str("}\n");

        let path = dest.path().to_path_buf();
        write_output(name, &path, script.as_bytes())?;
        Ok(Extraction::terminal(vec![path]))
    }
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    pub(crate) fn build_sym(symbols: &[(u32, &str)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&(symbols.len() as u32).to_le_bytes());
        for &(addr, name) in symbols {
            out.extend_from_slice(&addr.to_le_bytes());
            out.push(0x02); // function
            out.push(name.len() as u8);
            out.extend_from_slice(name.as_bytes());
        }
        out
    }
}
