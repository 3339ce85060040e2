use super::normalizer::{extract_title, is_begin_marker, is_end_marker, normalize_line};
use super::types::{DelimiterPolicy, Document, Segmentation, WorkUnit};

enum Emitted {
    Title(String),
    BeginMarker(String),
    Body(String),
}

impl Emitted {
    fn into_text(self) -> String {
        match self {
            Emitted::Title(text) | Emitted::BeginMarker(text) | Emitted::Body(text) => text,
        }
    }

    fn is_delimiter(&self) -> bool {
        !matches!(self, Emitted::Body(_))
    }
}

/// Scans document lines into work units.
///
/// Per line, in order: stop at the end marker; record a title line; emit the
/// normalized line if the body has started and the raw line is non-empty; start
/// the body at a beginning marker (emitted verbatim). The delimiters are then
/// removed according to `policy` and the sentinel is appended.
pub fn segment<I, S>(lines: I, policy: DelimiterPolicy) -> Segmentation
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut title = String::new();
    let mut beginning = false;
    let mut emitted = Vec::new();

    for line in lines {
        let line = line.as_ref();

        if is_end_marker(line) {
            break;
        }

        if let Some(found) = extract_title(line) {
            emitted.push(Emitted::Title(normalize_line(&found)));
            title = found;
        }

        if beginning && !line.is_empty() {
            emitted.push(Emitted::Body(normalize_line(line)));
        }

        if is_begin_marker(line) {
            emitted.push(Emitted::BeginMarker(line.to_string()));
            beginning = true;
        }
    }

    let mut units: Vec<WorkUnit> = match policy {
        DelimiterPolicy::DropLeadingTwo => emitted
            .into_iter()
            .skip(2)
            .map(|unit| WorkUnit(unit.into_text()))
            .collect(),
        DelimiterPolicy::DropEmittedDelimiters => emitted
            .into_iter()
            .filter(|unit| !unit.is_delimiter())
            .map(|unit| WorkUnit(unit.into_text()))
            .collect(),
    };
    units.push(WorkUnit::sentinel());

    tracing::debug!(
        "Segmented document '{}' into {} work units",
        title,
        units.len()
    );

    Segmentation { title, units }
}

impl Document {
    pub fn segment(&self, policy: DelimiterPolicy) -> Segmentation {
        segment(&self.lines, policy)
    }
}
