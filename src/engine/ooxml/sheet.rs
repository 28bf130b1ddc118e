use super::package::{attr_value, rewrite_elements, with_attribute, xml_error, ElementAction};
use crate::engine::{format_range_ref, parse_cell_ref, parse_range_ref, CellRef, EngineError, UsedRange};
use quick_xml::events::Event;
use quick_xml::Reader;

/// Everything the auditor needs from one worksheet part, collected in a
/// single pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SheetScan {
    rows: Option<(u32, u32)>,
    cols: Option<(u32, u32)>,
    pub non_blank: u64,
    pub last_data: Option<CellRef>,
    pub formulas: Vec<String>,
}

impl SheetScan {
    fn include_row(&mut self, row: u32) {
        self.rows = Some(match self.rows {
            None => (row, row),
            Some((lo, hi)) => (lo.min(row), hi.max(row)),
        });
    }

    fn include_col(&mut self, col: u32) {
        self.cols = Some(match self.cols {
            None => (col, col),
            Some((lo, hi)) => (lo.min(col), hi.max(col)),
        });
    }

    fn include_range(&mut self, range: &UsedRange) {
        self.include_row(range.first.row);
        self.include_row(range.last.row);
        self.include_col(range.first.col);
        self.include_col(range.last.col);
    }

    fn note_data(&mut self, cell: CellRef) {
        self.non_blank += 1;
        let later = match self.last_data {
            None => true,
            Some(last) => cell.row > last.row || (cell.row == last.row && cell.col > last.col),
        };
        if later {
            self.last_data = Some(cell);
        }
    }

    /// Empty sheets report `A1`, like a spreadsheet application does.
    pub fn used_range(&self) -> UsedRange {
        let (first_row, last_row) = self.rows.unwrap_or((1, 1));
        let (first_col, last_col) = self.cols.unwrap_or((1, 1));
        UsedRange {
            first: CellRef {
                row: first_row,
                col: first_col,
            },
            last: CellRef {
                row: last_row,
                col: last_col,
            },
        }
    }
}

pub fn scan_sheet(part: &str, xml: &[u8]) -> Result<SheetScan, EngineError> {
    scan_sheet_with(part, xml, true)
}

fn scan_sheet_with(part: &str, xml: &[u8], use_dimension: bool) -> Result<SheetScan, EngineError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut scan = SheetScan::default();

    let mut row: u32 = 0;
    let mut col: u32 = 0;
    let mut in_cell = false;
    let mut cell_has_data = false;
    let mut in_formula = false;
    let mut formula = String::new();

    loop {
        let event = reader.read_event_into(&mut buf).map_err(|e| xml_error(part, e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) => {
                let is_empty = matches!(event, Event::Empty(_));
                match e.local_name().as_ref() {
                    b"dimension" if use_dimension => {
                        if let Some(range) = attr_value(e, b"ref").and_then(|r| parse_range_ref(&r)) {
                            scan.include_range(&range);
                        }
                    }
                    b"row" => {
                        row = attr_value(e, b"r")
                            .and_then(|r| r.parse().ok())
                            .unwrap_or(row.saturating_add(1));
                        col = 0;
                        scan.include_row(row);
                    }
                    b"c" => {
                        match attr_value(e, b"r").and_then(|r| parse_cell_ref(&r)) {
                            Some(cell) => {
                                row = cell.row;
                                col = cell.col;
                            }
                            None => col = col.saturating_add(1),
                        }
                        scan.include_row(row);
                        scan.include_col(col);
                        in_cell = !is_empty;
                        cell_has_data = false;
                    }
                    b"v" | b"is" if in_cell => cell_has_data = true,
                    b"f" if in_cell => {
                        cell_has_data = true;
                        if !is_empty {
                            in_formula = true;
                            formula.clear();
                        }
                    }
                    _ => {}
                }
            }
            Event::Text(ref t) if in_formula => {
                let text = t.unescape().map_err(|e| xml_error(part, e))?;
                formula.push_str(&text);
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"f" if in_formula => {
                    in_formula = false;
                    if !formula.is_empty() {
                        scan.formulas.push(std::mem::take(&mut formula));
                    }
                }
                b"c" if in_cell => {
                    in_cell = false;
                    if cell_has_data {
                        scan.note_data(CellRef { row, col });
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(scan)
}

/// Rewrites a worksheet without the rows below `last_row`.
///
/// Merge ranges that start below the cut go with them and `<dimension>` is
/// shrunk to the remaining extent. Returns the new XML and the number of
/// rows removed from the used range.
pub fn purge_rows_after(part: &str, xml: &[u8], last_row: u32) -> Result<(Vec<u8>, u64), EngineError> {
    let before = scan_sheet(part, xml)?.used_range();
    let removed = u64::from(before.last.row.saturating_sub(last_row));

    let mut row: u32 = 0;
    let rewritten = rewrite_elements(part, xml, |e| match e.local_name().as_ref() {
        b"row" => {
            row = attr_value(e, b"r")
                .and_then(|r| r.parse().ok())
                .unwrap_or(row.saturating_add(1));
            if row > last_row {
                ElementAction::Drop
            } else {
                ElementAction::Keep
            }
        }
        b"mergeCell" => match attr_value(e, b"ref").and_then(|r| parse_range_ref(&r)) {
            Some(range) if range.first.row > last_row => ElementAction::Drop,
            _ => ElementAction::Keep,
        },
        _ => ElementAction::Keep,
    })?;

    // The stale <dimension> would otherwise widen the second scan.
    let after = scan_sheet_with(part, &rewritten, false)?.used_range();
    let dimension = format_range_ref(&after);
    let rewritten = rewrite_elements(part, &rewritten, |e| {
        if e.local_name().as_ref() == b"dimension" {
            ElementAction::Replace(with_attribute(e, "ref", &dimension))
        } else {
            ElementAction::Keep
        }
    })?;
    Ok((rewritten, removed))
}

const ANCHORS: [&[u8]; 3] = [b"twoCellAnchor", b"oneCellAnchor", b"absoluteAnchor"];

/// Counts drawing anchors (shapes, pictures, charts) in a drawing part.
pub fn count_anchors(part: &str, xml: &[u8]) -> Result<usize, EngineError> {
    count_elements(part, xml, &ANCHORS)
}

pub fn count_elements(part: &str, xml: &[u8], names: &[&[u8]]) -> Result<usize, EngineError> {
    let mut reader = Reader::from_reader(xml);
    let mut buf = Vec::new();
    let mut count = 0;
    loop {
        match reader.read_event_into(&mut buf).map_err(|e| xml_error(part, e))? {
            Event::Start(ref e) | Event::Empty(ref e) => {
                if names.contains(&e.local_name().as_ref()) {
                    count += 1;
                }
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;

    const GHOST_SHEET: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><dimension ref="A1:C6000"/><sheetData><row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1"><v>12</v></c></row><row r="2"><c r="A2"><f>SUM(B1:B1)&amp;"x"</f><v>12</v></c><c r="C2" s="3"/></row><row r="5999" s="2" customFormat="1"><c r="A5999" s="2"/></row><row r="6000" s="2" customFormat="1"/></sheetData><mergeCells count="2"><mergeCell ref="A1:B1"/><mergeCell ref="A5999:B6000"/></mergeCells></worksheet>"#;

    #[test]
    fn test_scan_counts_data_and_extent() {
        let scan = scan_sheet("s", GHOST_SHEET.as_bytes()).unwrap();
        let range = scan.used_range();
        assert_eq!(range.rows(), 6000);
        assert_eq!(range.columns(), 3);
        assert_eq!(scan.non_blank, 3);
        assert_eq!(scan.last_data, Some(CellRef { row: 2, col: 1 }));
        assert_eq!(scan.formulas, vec![r#"SUM(B1:B1)&"x""#.to_string()]);
    }

    #[test]
    fn test_cells_without_references_follow_previous() {
        let xml = r#"<worksheet><sheetData><row><c><v>1</v></c><c><v>2</v></c></row><row><c t="inlineStr"><is><t>x</t></is></c></row></sheetData></worksheet>"#;
        let scan = scan_sheet("s", xml.as_bytes()).unwrap();
        assert_eq!(scan.non_blank, 3);
        assert_eq!(scan.used_range().rows(), 2);
        assert_eq!(scan.used_range().columns(), 2);
        assert_eq!(scan.last_data, Some(CellRef { row: 2, col: 1 }));
    }

    #[test]
    fn test_implicit_row_after_last_row_index_saturates() {
        let xml = r#"<worksheet><sheetData><row r="4294967295"><c><v>1</v></c></row><row><c><v>2</v></c></row></sheetData></worksheet>"#;
        let scan = scan_sheet("s", xml.as_bytes()).unwrap();
        assert_eq!(scan.used_range().last.row, u32::MAX);
        assert_eq!(scan.non_blank, 2);

        let (_, removed) = purge_rows_after("s", xml.as_bytes(), 1).unwrap();
        assert_eq!(removed, u64::from(u32::MAX - 1));
    }

    #[test]
    fn test_empty_sheet_is_a1() {
        let scan = scan_sheet("s", b"<worksheet><sheetData/></worksheet>").unwrap();
        assert_eq!(scan.used_range().rows(), 1);
        assert_eq!(scan.non_blank, 0);
        assert_eq!(scan.last_data, None);
    }

    #[test]
    fn test_purge_rows_after_last_data() {
        let (xml, removed) = purge_rows_after("s", GHOST_SHEET.as_bytes(), 2).unwrap();
        assert_eq!(removed, 5998);
        let text = String::from_utf8(xml.clone()).unwrap();
        assert!(text.contains(r#"<dimension ref="A1:C2"/>"#));
        assert!(!text.contains("5999"));
        assert!(text.contains(r#"<mergeCell ref="A1:B1"/>"#));
        assert!(text.contains("&amp;"));

        let scan = scan_sheet("s", &xml).unwrap();
        assert_eq!(scan.used_range().rows(), 2);
        assert_eq!(scan.non_blank, 3);
    }

    #[test]
    fn test_count_anchors() {
        let xml = r#"<xdr:wsDr xmlns:xdr="http://schemas.openxmlformats.org/drawingml/2006/spreadsheetDrawing"><xdr:twoCellAnchor><xdr:sp/></xdr:twoCellAnchor><xdr:oneCellAnchor/><xdr:absoluteAnchor></xdr:absoluteAnchor></xdr:wsDr>"#;
        assert_eq!(count_anchors("d", xml.as_bytes()).unwrap(), 3);
    }
}
