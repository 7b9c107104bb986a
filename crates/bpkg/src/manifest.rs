//! Line-oriented parser for the `bpkg` manifest text format
//! (`spec.md` §6). Field order and separators are strict; any
//! deviation is a [`BpkgError::ManifestParse`].

use crate::error::BpkgError;
use crate::hash::HEX_LEN;
use crate::tree::ChunkRecord;

/// Manifest fields as parsed, before the tree is built.
#[derive(Clone, Debug)]
pub struct ParsedManifest {
    pub ident: String,
    pub filename: String,
    pub size: u64,
    pub internal_hashes: Vec<String>,
    pub chunks: Vec<ChunkRecord>,
}

/// Parse the full text of a `bpkg` manifest file.
pub fn parse_manifest(text: &str) -> Result<ParsedManifest, BpkgError> {
    let mut lines = text.lines();

    let ident = expect_field(&mut lines, "ident")?;
    if ident.len() != 32 || !ident.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BpkgError::ManifestParse(format!(
            "ident must be 32 hex characters, got {ident:?}"
        )));
    }

    let filename = expect_field(&mut lines, "filename")?;

    let size: u64 = expect_field(&mut lines, "size")?
        .parse()
        .map_err(|_| BpkgError::ManifestParse("size is not a valid u64".to_owned()))?;

    let nhashes: u32 = expect_field(&mut lines, "nhashes")?
        .parse()
        .map_err(|_| BpkgError::ManifestParse("nhashes is not a valid u32".to_owned()))?;

    expect_literal(&mut lines, "hashes:")?;
    let mut internal_hashes = Vec::with_capacity(nhashes as usize);
    for _ in 0..nhashes {
        let line = next_nonempty(&mut lines)
            .ok_or_else(|| BpkgError::ManifestParse("unexpected end of hashes section".to_owned()))?;
        let hash = line.trim().to_owned();
        validate_hex_hash(&hash)?;
        internal_hashes.push(hash);
    }

    let nchunks: u32 = expect_field(&mut lines, "nchunks")?
        .parse()
        .map_err(|_| BpkgError::ManifestParse("nchunks is not a valid u32".to_owned()))?;
    if nhashes as u64 + 1 != nchunks as u64 {
        return Err(BpkgError::ManifestParse(format!(
            "nhashes ({nhashes}) must equal nchunks - 1 ({nchunks} - 1)"
        )));
    }

    expect_literal(&mut lines, "chunks:")?;
    let mut chunks = Vec::with_capacity(nchunks as usize);
    for _ in 0..nchunks {
        let line = next_nonempty(&mut lines)
            .ok_or_else(|| BpkgError::ManifestParse("unexpected end of chunks section".to_owned()))?;
        chunks.push(parse_chunk_line(line.trim())?);
    }

    Ok(ParsedManifest {
        ident,
        filename,
        size,
        internal_hashes,
        chunks,
    })
}

fn parse_chunk_line(line: &str) -> Result<ChunkRecord, BpkgError> {
    let mut parts = line.split(',');
    let hash = parts
        .next()
        .ok_or_else(|| BpkgError::ManifestParse(format!("malformed chunk line: {line:?}")))?
        .trim()
        .to_owned();
    validate_hex_hash(&hash)?;

    let offset: u64 = parts
        .next()
        .ok_or_else(|| BpkgError::ManifestParse(format!("malformed chunk line: {line:?}")))?
        .trim()
        .parse()
        .map_err(|_| BpkgError::ManifestParse(format!("bad chunk offset in {line:?}")))?;

    let size: u32 = parts
        .next()
        .ok_or_else(|| BpkgError::ManifestParse(format!("malformed chunk line: {line:?}")))?
        .trim()
        .parse()
        .map_err(|_| BpkgError::ManifestParse(format!("bad chunk size in {line:?}")))?;

    if parts.next().is_some() {
        return Err(BpkgError::ManifestParse(format!(
            "too many fields in chunk line: {line:?}"
        )));
    }

    Ok(ChunkRecord {
        expected_hash: hash,
        offset,
        size,
    })
}

fn validate_hex_hash(hash: &str) -> Result<(), BpkgError> {
    if hash.len() != HEX_LEN || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(BpkgError::ManifestParse(format!(
            "expected {HEX_LEN}-character hex hash, got {hash:?}"
        )));
    }
    Ok(())
}

fn expect_field<'a>(lines: &mut impl Iterator<Item = &'a str>, key: &str) -> Result<String, BpkgError> {
    let line = next_nonempty(lines)
        .ok_or_else(|| BpkgError::ManifestParse(format!("missing field {key:?}")))?;
    let prefix = format!("{key}:");
    line.strip_prefix(prefix.as_str())
        .map(str::trim)
        .map(str::to_owned)
        .ok_or_else(|| BpkgError::ManifestParse(format!("expected {prefix:?}, got {line:?}")))
}

fn expect_literal<'a>(lines: &mut impl Iterator<Item = &'a str>, literal: &str) -> Result<(), BpkgError> {
    let line = next_nonempty(lines)
        .ok_or_else(|| BpkgError::ManifestParse(format!("missing {literal:?} section header")))?;
    if line.trim() != literal {
        return Err(BpkgError::ManifestParse(format!(
            "expected {literal:?}, got {line:?}"
        )));
    }
    Ok(())
}

fn next_nonempty<'a>(lines: &mut impl Iterator<Item = &'a str>) -> Option<&'a str> {
    for line in lines {
        if !line.trim().is_empty() {
            return Some(line);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_manifest(chunk_hash: &str, root_hash: &str) -> String {
        format!(
            "ident:{}\nfilename:data.bin\nsize:32\nnhashes:1\nhashes:\n  {root_hash}\nnchunks:2\nchunks:\n  {chunk_hash},0,16\n  {chunk_hash},16,16\n",
            "0".repeat(32)
        )
    }

    #[test]
    fn parses_well_formed_manifest() {
        let chunk = "a".repeat(64);
        let root = "b".repeat(64);
        let text = sample_manifest(&chunk, &root);
        let parsed = parse_manifest(&text).unwrap();
        assert_eq!(parsed.ident, "0".repeat(32));
        assert_eq!(parsed.filename, "data.bin");
        assert_eq!(parsed.size, 32);
        assert_eq!(parsed.internal_hashes, vec![root]);
        assert_eq!(parsed.chunks.len(), 2);
        assert_eq!(parsed.chunks[0].offset, 0);
        assert_eq!(parsed.chunks[1].offset, 16);
    }

    #[test]
    fn rejects_field_separator_deviation() {
        let text = "ident :0000\n".to_owned();
        assert!(parse_manifest(&text).is_err());
    }

    #[test]
    fn rejects_nhashes_nchunks_mismatch() {
        let chunk = "a".repeat(64);
        let root = "b".repeat(64);
        let mut text = sample_manifest(&chunk, &root);
        text = text.replace("nchunks:2", "nchunks:4");
        assert!(parse_manifest(&text).is_err());
    }

    #[test]
    fn rejects_short_hash() {
        let text = format!(
            "ident:{}\nfilename:x\nsize:1\nnhashes:0\nhashes:\nnchunks:1\nchunks:\n  abcd,0,1\n",
            "0".repeat(32)
        );
        assert!(parse_manifest(&text).is_err());
    }
}
