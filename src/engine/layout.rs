//! Word boxes → table structure.
//!
//! Pure geometry, no model involved: words are banded into rows by their
//! vertical centre, and a row is split into cells wherever the horizontal
//! gap between neighbours is wider than the row's median word height.
//! That heuristic matches ruled and unruled tables where columns are
//! separated by clearly more space than words within a cell.

use crate::error::EngineError;
use crate::outcome::{BBox, TableResult};

/// Gap, in multiples of the median word height, that starts a new cell.
const CELL_GAP_FACTOR: f32 = 1.0;

/// One recognised word and its axis-aligned bounds in pixels.
#[derive(Debug, Clone, PartialEq)]
pub struct Word {
    pub text: String,
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl Word {
    fn center_y(&self) -> f32 {
        (self.top + self.bottom) / 2.0
    }

    fn height(&self) -> f32 {
        (self.bottom - self.top).max(0.0)
    }
}

struct Row<'a> {
    top: f32,
    bottom: f32,
    words: Vec<&'a Word>,
}

/// Build a [`TableResult`] from recognised words.
///
/// `detected` is the number of word regions the detector proposed; the
/// confidence is the share of them that produced text.
pub fn assemble(words: &[Word], detected: usize) -> Result<TableResult, EngineError> {
    let mut recognised: Vec<&Word> = words.iter().filter(|w| !w.text.trim().is_empty()).collect();
    if recognised.is_empty() {
        return Ok(TableResult::empty());
    }
    recognised.sort_by(|a, b| a.center_y().total_cmp(&b.center_y()));

    let mut rows: Vec<Row<'_>> = Vec::new();
    for &word in &recognised {
        match rows.last_mut() {
            Some(row) if word.center_y() >= row.top && word.center_y() <= row.bottom => {
                row.top = row.top.min(word.top);
                row.bottom = row.bottom.max(word.bottom);
                row.words.push(word);
            }
            _ => rows.push(Row {
                top: word.top,
                bottom: word.bottom,
                words: vec![word],
            }),
        }
    }

    let cells: Vec<Vec<String>> = rows.iter_mut().map(split_cells).collect();
    let csv = to_csv(&cells)?;
    let html = to_html(&cells);

    let total = detected.max(recognised.len());
    let confidence = recognised.len() as f32 / total as f32;

    Ok(TableResult {
        html: Some(html),
        cells: Some(cells),
        csv: Some(csv),
        bboxes: vec![union_box(&recognised)],
        confidence,
    })
}

fn split_cells(row: &mut Row<'_>) -> Vec<String> {
    row.words.sort_by(|a, b| a.left.total_cmp(&b.left));

    let mut heights: Vec<f32> = row.words.iter().map(|w| w.height()).collect();
    heights.sort_by(f32::total_cmp);
    let threshold = heights[heights.len() / 2] * CELL_GAP_FACTOR;

    let mut cells = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut prev_right: Option<f32> = None;
    for word in &row.words {
        if let Some(right) = prev_right {
            if word.left - right > threshold && !current.is_empty() {
                cells.push(current.join(" "));
                current.clear();
            }
        }
        current.push(word.text.trim());
        prev_right = Some(prev_right.map_or(word.right, |r| r.max(word.right)));
    }
    if !current.is_empty() {
        cells.push(current.join(" "));
    }
    cells
}

fn to_csv(rows: &[Vec<String>]) -> Result<String, EngineError> {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    for row in rows {
        writer
            .write_record(row)
            .map_err(|e| EngineError::Inference(format!("CSV encoding failed: {e}")))?;
    }
    let bytes = writer
        .into_inner()
        .map_err(|e| EngineError::Inference(format!("CSV encoding failed: {e}")))?;
    let text = String::from_utf8(bytes)
        .map_err(|e| EngineError::Inference(format!("CSV encoding failed: {e}")))?;
    Ok(text.trim_end_matches('\n').to_string())
}

fn to_html(rows: &[Vec<String>]) -> String {
    let mut html = String::from("<table>");
    for row in rows {
        html.push_str("<tr>");
        for cell in row {
            html.push_str("<td>");
            html.push_str(&escape_html(cell));
            html.push_str("</td>");
        }
        html.push_str("</tr>");
    }
    html.push_str("</table>");
    html
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

fn union_box(words: &[&Word]) -> BBox {
    let left = words.iter().map(|w| w.left).fold(f32::INFINITY, f32::min);
    let top = words.iter().map(|w| w.top).fold(f32::INFINITY, f32::min);
    let right = words.iter().map(|w| w.right).fold(f32::NEG_INFINITY, f32::max);
    let bottom = words.iter().map(|w| w.bottom).fold(f32::NEG_INFINITY, f32::max);
    let x = left.floor() as i64;
    let y = top.floor() as i64;
    BBox {
        x,
        y,
        w: (right.ceil() as i64 - x).max(0),
        h: (bottom.ceil() as i64 - y).max(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn word(text: &str, left: f32, top: f32, width: f32) -> Word {
        Word {
            text: text.into(),
            left,
            top,
            right: left + width,
            bottom: top + 10.0,
        }
    }

    #[test]
    fn test_two_by_two_grid() {
        let words = vec![
            word("Name", 10.0, 10.0, 40.0),
            word("Qty", 120.0, 11.0, 30.0),
            word("Bolt", 10.0, 40.0, 35.0),
            word("12", 120.0, 39.0, 20.0),
        ];
        let result = assemble(&words, 4).unwrap();
        assert_eq!(
            result.cells,
            Some(vec![
                vec!["Name".to_string(), "Qty".to_string()],
                vec!["Bolt".to_string(), "12".to_string()],
            ])
        );
        assert_eq!(result.csv.as_deref(), Some("Name,Qty\nBolt,12"));
        assert_eq!(result.confidence, 1.0);
        assert_eq!(result.bboxes, vec![BBox { x: 10, y: 10, w: 140, h: 40 }]);
    }

    #[test]
    fn test_close_words_share_a_cell() {
        let words = vec![
            word("hex", 10.0, 10.0, 30.0),
            word("nut", 44.0, 10.0, 30.0),
            word("M8", 200.0, 10.0, 20.0),
        ];
        let result = assemble(&words, 3).unwrap();
        assert_eq!(
            result.cells,
            Some(vec![vec!["hex nut".to_string(), "M8".to_string()]])
        );
    }

    #[test]
    fn test_csv_and_html_escape_content() {
        let words = vec![word("a,b", 0.0, 0.0, 20.0), word("<x>", 100.0, 0.0, 20.0)];
        let result = assemble(&words, 2).unwrap();
        assert_eq!(result.csv.as_deref(), Some("\"a,b\",<x>"));
        assert_eq!(
            result.html.as_deref(),
            Some("<table><tr><td>a,b</td><td>&lt;x&gt;</td></tr></table>")
        );
    }

    #[test]
    fn test_unrecognised_regions_lower_confidence() {
        let words = vec![word("1", 0.0, 0.0, 8.0), word(" ", 50.0, 0.0, 8.0)];
        let result = assemble(&words, 4).unwrap();
        assert_eq!(result.confidence, 0.25);
        assert!(result.validate().is_ok());
    }

    #[test]
    fn test_nothing_recognised_is_empty() {
        let result = assemble(&[], 3).unwrap();
        assert_eq!(result, TableResult::empty());
    }
}
