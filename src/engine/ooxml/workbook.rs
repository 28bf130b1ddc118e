use super::package::{attr_value, rewrite_elements, with_attribute, xml_error, ElementAction};
use crate::engine::EngineError;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SheetEntry {
    pub name: String,
    pub rel_id: String,
}

pub fn parse_sheet_entries(part: &str, xml: &[u8]) -> Result<Vec<SheetEntry>, EngineError> {
    let mut reader = Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut sheets = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"sheet" => {
                sheets.push(SheetEntry {
                    name: attr_value(e, b"name").unwrap_or_default(),
                    rel_id: attr_value(e, b"id").unwrap_or_default(),
                });
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(part, e)),
            _ => {}
        }
        buf.clear();
    }
    Ok(sheets)
}

/// Elements that follow `<calcPr>` in the workbook schema; a missing
/// `<calcPr>` is inserted before the first of these.
const AFTER_CALC_PR: [&[u8]; 9] = [
    b"oleSize",
    b"customWorkbookViews",
    b"pivotCaches",
    b"smartTagPr",
    b"smartTagTypes",
    b"webPublishing",
    b"fileRecoveryPr",
    b"webPublishObjects",
    b"extLst",
];

/// Marks the workbook for a full recalculation the next time it is loaded.
pub fn set_full_calc_on_load(part: &str, xml: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut found = false;
    let rewritten = rewrite_elements(part, xml, |e| {
        if e.local_name().as_ref() == b"calcPr" {
            found = true;
            ElementAction::Replace(with_attribute(e, "fullCalcOnLoad", "1"))
        } else {
            ElementAction::Keep
        }
    })?;
    if found {
        return Ok(rewritten);
    }
    insert_calc_pr(part, &rewritten)
}

fn insert_calc_pr(part: &str, xml: &[u8]) -> Result<Vec<u8>, EngineError> {
    let mut reader = Reader::from_reader(xml);
    let mut writer = Writer::new(Vec::with_capacity(xml.len() + 32));
    let mut buf = Vec::new();
    let mut depth = 0usize;
    let mut inserted = false;
    let calc_pr = || {
        let mut e = BytesStart::new("calcPr");
        e.push_attribute(("fullCalcOnLoad", "1"));
        Event::Empty(e)
    };
    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| xml_error(part, e))?;
        match &event {
            Event::Eof => break,
            Event::Start(e) | Event::Empty(e)
                if !inserted && depth == 1 && AFTER_CALC_PR.contains(&e.local_name().as_ref()) =>
            {
                writer.write_event(calc_pr()).map_err(|e| xml_error(part, e))?;
                inserted = true;
            }
            Event::End(e) if !inserted && depth == 1 && e.local_name().as_ref() == b"workbook" => {
                writer.write_event(calc_pr()).map_err(|e| xml_error(part, e))?;
                inserted = true;
            }
            _ => {}
        }
        match &event {
            Event::Start(_) => depth += 1,
            Event::End(_) => depth = depth.saturating_sub(1),
            _ => {}
        }
        writer.write_event(event).map_err(|e| xml_error(part, e))?;
        buf.clear();
    }
    Ok(writer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    const WORKBOOK: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Data" sheetId="1" r:id="rId1"/><sheet name="P&amp;L" sheetId="2" r:id="rId2"/></sheets><calcPr calcId="191029"/></workbook>"#;

    #[test]
    fn test_parse_sheet_entries() {
        let sheets = parse_sheet_entries("wb", WORKBOOK.as_bytes()).unwrap();
        assert_eq!(
            sheets,
            vec![
                SheetEntry {
                    name: "Data".to_string(),
                    rel_id: "rId1".to_string()
                },
                SheetEntry {
                    name: "P&L".to_string(),
                    rel_id: "rId2".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_full_calc_on_load_updates_existing_calc_pr() {
        let xml = set_full_calc_on_load("wb", WORKBOOK.as_bytes()).unwrap();
        let text = String::from_utf8(xml).unwrap();
        assert!(text.contains(r#"<calcPr calcId="191029" fullCalcOnLoad="1"/>"#));
    }

    #[test]
    fn test_full_calc_on_load_inserts_calc_pr() {
        let xml = r#"<workbook><sheets><sheet name="A" sheetId="1" r:id="rId1"/></sheets><extLst/></workbook>"#;
        let text = String::from_utf8(set_full_calc_on_load("wb", xml.as_bytes()).unwrap()).unwrap();
        assert_eq!(
            text,
            r#"<workbook><sheets><sheet name="A" sheetId="1" r:id="rId1"/></sheets><calcPr fullCalcOnLoad="1"/><extLst/></workbook>"#
        );

        let bare = r#"<workbook><sheets/></workbook>"#;
        let text = String::from_utf8(set_full_calc_on_load("wb", bare.as_bytes()).unwrap()).unwrap();
        assert_eq!(text, r#"<workbook><sheets/><calcPr fullCalcOnLoad="1"/></workbook>"#);
    }
}
