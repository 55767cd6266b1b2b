use crate::error::ClassifyError;
use crate::model::{EventCategory, LogEvent, RawLogLine};

/// Cheap containment pre-filter. Markers are tried in priority order and the
/// first hit decides the category, whatever else the line contains.
pub fn match_category(line: &str) -> Option<EventCategory> {
    EventCategory::ALL
        .into_iter()
        .find(|category| line.contains(category.marker()))
}

/// Classifies one raw line. Lines without a marker yield `Ok(None)`; a marked
/// line that does not decode is an error rather than a silent drop.
pub fn classify_line(
    line: &str,
    line_no: u64,
    host: &str,
) -> Result<Option<LogEvent>, ClassifyError> {
    let Some(category) = match_category(line) else {
        return Ok(None);
    };

    let raw: RawLogLine = serde_json::from_str(line).map_err(|source| ClassifyError {
        line_no,
        category,
        source,
    })?;

    Ok(Some(LogEvent::from_raw(category, raw, host)))
}
