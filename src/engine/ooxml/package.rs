use crate::engine::EngineError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::fs::{self, File, OpenOptions};
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

pub const CONTENT_TYPES: &str = "[Content_Types].xml";

const CFB_MAGIC: [u8; 8] = [0xD0, 0xCF, 0x11, 0xE0, 0xA1, 0xB1, 0x1A, 0xE1];

/// Uncompressed limits for a single part and for the whole package.
const MAX_PART_BYTES: u64 = 512 * 1024 * 1024;
const MAX_PACKAGE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// The parts of an OPC zip package, kept in archive order.
#[derive(Debug, Clone)]
pub struct Package {
    parts: Vec<(String, Vec<u8>)>,
}

impl Package {
    pub fn read(path: &Path) -> Result<Package, EngineError> {
        let mut bytes = Vec::new();
        File::open(path)?.read_to_end(&mut bytes)?;
        Package::from_bytes(path, bytes)
    }

    pub fn from_bytes(path: &Path, bytes: Vec<u8>) -> Result<Package, EngineError> {
        // Encrypted OOXML and legacy .xls both live in a compound file.
        if bytes.starts_with(&CFB_MAGIC) {
            let legacy = path
                .extension()
                .map(|e| e.eq_ignore_ascii_case("xls"))
                .unwrap_or(false);
            return Err(if legacy {
                EngineError::Unsupported("legacy .xls workbooks".to_string())
            } else {
                EngineError::Encrypted
            });
        }

        let mut archive = ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| EngineError::Corrupt(e.to_string()))?;
        let mut parts = Vec::new();
        let mut total: u64 = 0;
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            if entry.is_dir() {
                continue;
            }
            let name = entry.name().trim_start_matches('/').to_string();
            // Header sizes are untrusted: never allocate from them.
            if entry.size() > MAX_PART_BYTES {
                return Err(EngineError::Corrupt(format!(
                    "part {} declares {} bytes",
                    name,
                    entry.size()
                )));
            }
            let mut data = Vec::new();
            entry.take(MAX_PART_BYTES + 1).read_to_end(&mut data)?;
            total += data.len() as u64;
            if data.len() as u64 > MAX_PART_BYTES || total > MAX_PACKAGE_BYTES {
                return Err(EngineError::Corrupt(format!(
                    "part {} exceeds the package size limit",
                    name
                )));
            }
            parts.push((name, data));
        }
        Ok(Package { parts })
    }

    pub fn part(&self, name: &str) -> Option<&[u8]> {
        self.parts
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, d)| d.as_slice())
    }

    pub fn require(&self, name: &str) -> Result<&[u8], EngineError> {
        self.part(name).ok_or_else(|| EngineError::Malformed {
            part: name.to_string(),
            reason: "missing from package".to_string(),
        })
    }

    pub fn has_part(&self, name: &str) -> bool {
        self.part(name).is_some()
    }

    pub fn set_part(&mut self, name: &str, data: Vec<u8>) {
        match self
            .parts
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some((_, existing)) => *existing = data,
            None => self.parts.push((name.to_string(), data)),
        }
    }

    pub fn remove_part(&mut self, name: &str) -> bool {
        let before = self.parts.len();
        self.parts.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.parts.len() != before
    }

    pub fn part_names(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(n, _)| n.as_str())
    }

    /// Writes the package next to `path` and renames it into place.
    pub fn write_to(&self, path: &Path) -> Result<(), EngineError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = unique_tmp_path(path);
        match self.write_and_rename(&tmp_path, path) {
            Ok(()) => Ok(()),
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_and_rename(&self, tmp_path: &Path, target: &Path) -> Result<(), EngineError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(tmp_path)?;
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
        for (name, data) in &self.parts {
            writer.start_file(name.as_str(), options)?;
            writer.write_all(data)?;
        }
        let file = writer.finish()?;
        file.sync_all()?;
        drop(file);

        #[cfg(windows)]
        {
            if target.exists() {
                let _ = fs::remove_file(target);
            }
        }
        fs::rename(tmp_path, target)?;
        Ok(())
    }
}

fn unique_tmp_path(path: &Path) -> PathBuf {
    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("workbook");
    path.with_file_name(format!(".{}.tmp.{}.{}", file_name, pid, nanos))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relationship {
    pub id: String,
    pub rel_type: String,
    pub target: String,
    pub external: bool,
}

impl Relationship {
    /// Relationship types are URIs; compare on the final path segment.
    pub fn is(&self, kind: &str) -> bool {
        self.rel_type.rsplit('/').next() == Some(kind)
    }
}

pub fn xml_error(part: &str, e: impl std::fmt::Display) -> EngineError {
    EngineError::Malformed {
        part: part.to_string(),
        reason: e.to_string(),
    }
}

pub fn attr_value(e: &BytesStart, local: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == local)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// `xl/workbook.xml` -> `xl/_rels/workbook.xml.rels`
pub fn rels_path_for(part: &str) -> String {
    match part.rsplit_once('/') {
        Some((dir, file)) => format!("{}/_rels/{}.rels", dir, file),
        None => format!("_rels/{}.rels", part),
    }
}

/// Resolves a relationship target against the part that owns it.
pub fn resolve_target(source_part: &str, target: &str) -> String {
    if let Some(absolute) = target.strip_prefix('/') {
        return absolute.to_string();
    }
    let base = source_part.rsplit_once('/').map(|(d, _)| d).unwrap_or("");
    let mut segments: Vec<&str> = base.split('/').filter(|s| !s.is_empty()).collect();
    for segment in target.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    segments.join("/")
}

pub fn parse_relationships(part: &str, xml: &[u8]) -> Result<Vec<Relationship>, EngineError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut rels = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"Relationship" =>
            {
                rels.push(Relationship {
                    id: attr_value(e, b"Id").unwrap_or_default(),
                    rel_type: attr_value(e, b"Type").unwrap_or_default(),
                    target: attr_value(e, b"Target").unwrap_or_default(),
                    external: attr_value(e, b"TargetMode")
                        .map(|m| m.eq_ignore_ascii_case("External"))
                        .unwrap_or(false),
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(part, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(rels)
}

/// Relationships owned by `part`; a missing rels part means none.
pub fn relationships_of(package: &Package, part: &str) -> Result<Vec<Relationship>, EngineError> {
    let rels_part = rels_path_for(part);
    match package.part(&rels_part) {
        Some(xml) => parse_relationships(&rels_part, xml),
        None => Ok(Vec::new()),
    }
}

pub enum ElementAction {
    Keep,
    Drop,
    Replace(BytesStart<'static>),
}

/// Streams `xml` through a writer, letting `decide` keep, drop or replace
/// each element start. Dropping a start tag drops its whole subtree.
pub fn rewrite_elements<F>(part: &str, xml: &[u8], mut decide: F) -> Result<Vec<u8>, EngineError>
where
    F: FnMut(&BytesStart) -> ElementAction,
{
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len()));
    let mut buf = Vec::new();
    let mut skip_buf = Vec::new();
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| xml_error(part, e))?;
        match event {
            Event::Eof => break,
            Event::Start(e) => match decide(&e) {
                ElementAction::Keep => writer
                    .write_event(Event::Start(e))
                    .map_err(|e| xml_error(part, e))?,
                ElementAction::Drop => {
                    let end = e.name().as_ref().to_vec();
                    reader
                        .read_to_end_into(quick_xml::name::QName(&end), &mut skip_buf)
                        .map_err(|e| xml_error(part, e))?;
                    skip_buf.clear();
                }
                ElementAction::Replace(new) => writer
                    .write_event(Event::Start(new))
                    .map_err(|e| xml_error(part, e))?,
            },
            Event::Empty(e) => match decide(&e) {
                ElementAction::Keep => writer
                    .write_event(Event::Empty(e))
                    .map_err(|e| xml_error(part, e))?,
                ElementAction::Drop => {}
                ElementAction::Replace(new) => writer
                    .write_event(Event::Empty(new))
                    .map_err(|e| xml_error(part, e))?,
            },
            other => writer.write_event(other).map_err(|e| xml_error(part, e))?,
        }
        buf.clear();
    }
    Ok(writer.into_inner())
}

/// Copies an element start, replacing (or adding) one attribute.
pub fn with_attribute(e: &BytesStart, key: &str, value: &str) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut replaced = BytesStart::new(name);
    let mut found = false;
    for attr in e.attributes().flatten() {
        if attr.key.as_ref() == key.as_bytes() {
            replaced.push_attribute((key, value));
            found = true;
        } else {
            replaced.push_attribute((attr.key.as_ref(), attr.value.as_ref()));
        }
    }
    if !found {
        replaced.push_attribute((key, value));
    }
    replaced
}

/// Drops relationships matching `remove` from the rels part of `part`.
pub fn remove_relationships<F>(package: &mut Package, part: &str, remove: F) -> Result<(), EngineError>
where
    F: Fn(&Relationship) -> bool,
{
    let rels_part = rels_path_for(part);
    let Some(xml) = package.part(&rels_part) else {
        return Ok(());
    };
    let rewritten = rewrite_elements(&rels_part, xml, |e| {
        if e.local_name().as_ref() != b"Relationship" {
            return ElementAction::Keep;
        }
        let rel = Relationship {
            id: attr_value(e, b"Id").unwrap_or_default(),
            rel_type: attr_value(e, b"Type").unwrap_or_default(),
            target: attr_value(e, b"Target").unwrap_or_default(),
            external: false,
        };
        if remove(&rel) {
            ElementAction::Drop
        } else {
            ElementAction::Keep
        }
    })?;
    package.set_part(&rels_part, rewritten);
    Ok(())
}

/// Drops the `<Override>` entry for `part` from the content types.
pub fn remove_content_type_override(package: &mut Package, part: &str) -> Result<(), EngineError> {
    let Some(xml) = package.part(CONTENT_TYPES) else {
        return Ok(());
    };
    let part_name = format!("/{}", part);
    let rewritten = rewrite_elements(CONTENT_TYPES, xml, |e| {
        if e.local_name().as_ref() == b"Override"
            && attr_value(e, b"PartName")
                .map(|p| p.eq_ignore_ascii_case(&part_name))
                .unwrap_or(false)
        {
            ElementAction::Drop
        } else {
            ElementAction::Keep
        }
    })?;
    package.set_part(CONTENT_TYPES, rewritten);
    Ok(())
}

pub fn set_content_type_override(
    package: &mut Package,
    part: &str,
    content_type: &str,
) -> Result<(), EngineError> {
    let xml = package.require(CONTENT_TYPES)?;
    let part_name = format!("/{}", part);
    let rewritten = rewrite_elements(CONTENT_TYPES, xml, |e| {
        if e.local_name().as_ref() == b"Override"
            && attr_value(e, b"PartName")
                .map(|p| p.eq_ignore_ascii_case(&part_name))
                .unwrap_or(false)
        {
            ElementAction::Replace(with_attribute(e, "ContentType", content_type))
        } else {
            ElementAction::Keep
        }
    })?;
    package.set_part(CONTENT_TYPES, rewritten);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rels_path_for() {
        assert_eq!(rels_path_for("xl/workbook.xml"), "xl/_rels/workbook.xml.rels");
        assert_eq!(
            rels_path_for("xl/worksheets/sheet1.xml"),
            "xl/worksheets/_rels/sheet1.xml.rels"
        );
        assert_eq!(rels_path_for("workbook.xml"), "_rels/workbook.xml.rels");
    }

    #[test]
    fn test_resolve_target() {
        assert_eq!(
            resolve_target("xl/workbook.xml", "worksheets/sheet1.xml"),
            "xl/worksheets/sheet1.xml"
        );
        assert_eq!(
            resolve_target("xl/worksheets/sheet1.xml", "../pivotTables/pivotTable1.xml"),
            "xl/pivotTables/pivotTable1.xml"
        );
        assert_eq!(
            resolve_target("xl/workbook.xml", "/xl/worksheets/sheet2.xml"),
            "xl/worksheets/sheet2.xml"
        );
        assert_eq!(resolve_target("", "xl/workbook.xml"), "xl/workbook.xml");
    }

    #[test]
    fn test_parse_and_remove_relationships() {
        let xml = br#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/calcChain" Target="calcChain.xml"/><Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/externalLinkPath" Target="file:///C:/shared/rates.xlsx" TargetMode="External"/></Relationships>"#;
        let rels = parse_relationships("r", xml).unwrap();
        assert_eq!(rels.len(), 3);
        assert!(rels[0].is("worksheet"));
        assert!(rels[1].is("calcChain"));
        assert!(rels[2].external);

        let mut package = Package { parts: vec![] };
        package.set_part("xl/_rels/workbook.xml.rels", xml.to_vec());
        remove_relationships(&mut package, "xl/workbook.xml", |r| r.is("calcChain")).unwrap();
        let remaining =
            relationships_of(&package, "xl/workbook.xml").unwrap();
        assert_eq!(remaining.len(), 2);
        assert!(remaining.iter().all(|r| !r.is("calcChain")));
    }

    #[test]
    fn test_content_type_override_edits() {
        let xml = br#"<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.ms-excel.sheet.macroEnabled.main+xml"/><Override PartName="/xl/calcChain.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.calcChain+xml"/></Types>"#;
        let mut package = Package { parts: vec![] };
        package.set_part(CONTENT_TYPES, xml.to_vec());

        remove_content_type_override(&mut package, "xl/calcChain.xml").unwrap();
        set_content_type_override(&mut package, "xl/workbook.xml", "text/plain").unwrap();

        let text = String::from_utf8(package.part(CONTENT_TYPES).unwrap().to_vec()).unwrap();
        assert!(!text.contains("calcChain"));
        assert!(text.contains(r#"PartName="/xl/workbook.xml" ContentType="text/plain""#));
        assert!(text.contains(r#"<Default Extension="xml""#));
    }

    #[test]
    fn test_cfb_container_is_reported_as_encrypted() {
        let mut bytes = CFB_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 64]);
        let err = Package::from_bytes(Path::new("secret.xlsx"), bytes.clone()).unwrap_err();
        assert!(matches!(err, EngineError::Encrypted));
        let err = Package::from_bytes(Path::new("old.XLS"), bytes).unwrap_err();
        assert!(matches!(err, EngineError::Unsupported(_)));
    }

    fn stored_zip(name: &str, data: &[u8]) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        zip.start_file(name, options).unwrap();
        zip.write_all(data).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[test]
    fn test_oversized_declared_part_is_corrupt() {
        let mut bytes = stored_zip("xl/workbook.xml", b"<workbook/>");
        let declared = 0xFFFF_FFF0u32.to_le_bytes();
        // Uncompressed size sits at +22 in the local header and +24 in the
        // central directory entry.
        for (signature, offset) in [([0x50, 0x4B, 0x03, 0x04], 22), ([0x50, 0x4B, 0x01, 0x02], 24)] {
            let at = bytes.windows(4).position(|w| w == signature).unwrap();
            bytes[at + offset..at + offset + 4].copy_from_slice(&declared);
        }
        let result = Package::from_bytes(Path::new("bomb.xlsx"), bytes);
        assert!(matches!(result, Err(EngineError::Corrupt(_)) | Err(EngineError::Zip(_))));
    }

    #[test]
    fn test_small_package_reads_all_parts() {
        let bytes = stored_zip("xl/workbook.xml", b"<workbook/>");
        let package = Package::from_bytes(Path::new("ok.xlsx"), bytes).unwrap();
        assert_eq!(package.part("xl/workbook.xml"), Some(&b"<workbook/>"[..]));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        let err = Package::from_bytes(Path::new("x.xlsx"), b"not a zip".to_vec()).unwrap_err();
        assert!(matches!(err, EngineError::Corrupt(_)));
    }
}
