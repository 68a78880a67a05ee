//! Two-phase SQL templates: literal segments interleaved with named slots.
//!
//! A template is parsed once from text such as `SELECT {select} FROM "t" WHERE {where}`.
//! Build-time slots are filled when a resource is compiled; the remaining request-time
//! slots are filled per call into a fresh string. Filling never re-scans inserted text,
//! so values containing braces cannot be substituted twice.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum TemplateError {
    #[error("unknown slot '{{{0}}}'")]
    UnknownSlot(String),
    #[error("unterminated slot starting at byte {0}")]
    Unterminated(usize),
    #[error("unfilled slots: {0}")]
    Unfilled(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Slot {
    Select,
    Joins,
    Where,
    Limit,
    Offset,
    OrderBy,
    OrderHow,
    Updates,
    Cols,
    Vals,
}

impl Slot {
    pub fn name(&self) -> &'static str {
        match self {
            Slot::Select => "select",
            Slot::Joins => "joins",
            Slot::Where => "where",
            Slot::Limit => "limit",
            Slot::Offset => "offset",
            Slot::OrderBy => "orderby",
            Slot::OrderHow => "orderhow",
            Slot::Updates => "updates",
            Slot::Cols => "cols",
            Slot::Vals => "vals",
        }
    }

    fn from_name(name: &str) -> Option<Slot> {
        Some(match name {
            "select" => Slot::Select,
            "joins" => Slot::Joins,
            "where" => Slot::Where,
            "limit" => Slot::Limit,
            "offset" => Slot::Offset,
            "orderby" => Slot::OrderBy,
            "orderhow" => Slot::OrderHow,
            "updates" => Slot::Updates,
            "cols" => Slot::Cols,
            "vals" => Slot::Vals,
            _ => return None,
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Segment {
    Literal(String),
    Slot(Slot),
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryTemplate {
    segments: Vec<Segment>,
}

/// Values for one fill pass.
#[derive(Clone, Debug, Default)]
pub struct SlotValues(HashMap<Slot, String>);

impl SlotValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: Slot, value: impl Into<String>) -> Self {
        self.0.insert(slot, value.into());
        self
    }

    pub fn set(&mut self, slot: Slot, value: impl Into<String>) {
        self.0.insert(slot, value.into());
    }
}

impl QueryTemplate {
    /// Parses `{slot}` placeholders; `{{` and `}}` are literal braces.
    pub fn parse(src: &str) -> Result<Self, TemplateError> {
        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = src.char_indices().peekable();
        while let Some((pos, c)) = chars.next() {
            match c {
                '{' if matches!(chars.peek(), Some((_, '{'))) => {
                    chars.next();
                    literal.push('{');
                }
                '}' if matches!(chars.peek(), Some((_, '}'))) => {
                    chars.next();
                    literal.push('}');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for (_, n) in chars.by_ref() {
                        if n == '}' {
                            closed = true;
                            break;
                        }
                        name.push(n);
                    }
                    if !closed {
                        return Err(TemplateError::Unterminated(pos));
                    }
                    let slot = Slot::from_name(name.trim())
                        .ok_or_else(|| TemplateError::UnknownSlot(name.clone()))?;
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(Segment::Slot(slot));
                }
                other => literal.push(other),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }
        Ok(QueryTemplate { segments })
    }

    /// Returns a new template with every given slot replaced; other slots stay open.
    pub fn fill(&self, values: &SlotValues) -> QueryTemplate {
        let mut segments: Vec<Segment> = Vec::with_capacity(self.segments.len());
        for seg in &self.segments {
            let seg = match seg {
                Segment::Slot(slot) => match values.0.get(slot) {
                    Some(v) => Segment::Literal(v.clone()),
                    None => Segment::Slot(*slot),
                },
                lit => lit.clone(),
            };
            // Adjacent literals are merged so the segment list stays canonical.
            match (segments.last_mut(), seg) {
                (Some(Segment::Literal(prev)), Segment::Literal(next)) => prev.push_str(&next),
                (_, seg) => segments.push(seg),
            }
        }
        QueryTemplate { segments }
    }

    pub fn open_slots(&self) -> Vec<Slot> {
        let mut open = Vec::new();
        for seg in &self.segments {
            if let Segment::Slot(s) = seg {
                if !open.contains(s) {
                    open.push(*s);
                }
            }
        }
        open
    }

    pub fn has_slot(&self, slot: Slot) -> bool {
        self.segments.iter().any(|s| *s == Segment::Slot(slot))
    }

    /// Final pass: fills the given slots and fails if any slot is left open.
    pub fn render(&self, values: &SlotValues) -> Result<String, TemplateError> {
        let filled = self.fill(values);
        let open = filled.open_slots();
        if !open.is_empty() {
            let names: Vec<&str> = open.iter().map(Slot::name).collect();
            return Err(TemplateError::Unfilled(names.join(", ")));
        }
        Ok(filled.to_string())
    }
}

/// Open slots print as `{name}`, so a partially filled template reads like its source.
impl fmt::Display for QueryTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.segments {
            match seg {
                Segment::Literal(s) => f.write_str(s)?,
                Segment::Slot(slot) => write!(f, "{{{}}}", slot.name())?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_fill_keeps_unknown_slots() {
        let t = QueryTemplate::parse("SELECT {select} FROM \"t\" {joins} WHERE {where}").unwrap();
        let built = t.fill(&SlotValues::new().with(Slot::Select, "json_build_object('id', \"t\".\"id\")"));
        assert_eq!(
            built.to_string(),
            "SELECT json_build_object('id', \"t\".\"id\") FROM \"t\" {joins} WHERE {where}"
        );
        assert_eq!(built.open_slots(), vec![Slot::Joins, Slot::Where]);
        // the source template is untouched
        assert!(t.has_slot(Slot::Select));
    }

    #[test]
    fn filled_values_are_not_rescanned() {
        let t = QueryTemplate::parse("UPDATE \"t\" SET {updates} WHERE {where}").unwrap();
        let sql = t
            .render(
                &SlotValues::new()
                    .with(Slot::Updates, "\"doc\" = COALESCE(\"doc\", '{}'::jsonb) || $1::jsonb")
                    .with(Slot::Where, "1=1"),
            )
            .unwrap();
        assert_eq!(
            sql,
            "UPDATE \"t\" SET \"doc\" = COALESCE(\"doc\", '{}'::jsonb) || $1::jsonb WHERE 1=1"
        );
    }

    #[test]
    fn repeated_slot_filled_everywhere() {
        let t = QueryTemplate::parse("{where} AND ({where})").unwrap();
        let sql = t.render(&SlotValues::new().with(Slot::Where, "a")).unwrap();
        assert_eq!(sql, "a AND (a)");
    }

    #[test]
    fn render_fails_on_open_slots() {
        let t = QueryTemplate::parse("SELECT 1 LIMIT {limit} OFFSET {offset}").unwrap();
        let err = t.render(&SlotValues::new().with(Slot::Limit, "10")).unwrap_err();
        assert_eq!(err, TemplateError::Unfilled("offset".into()));
    }

    #[test]
    fn escaped_braces_and_bad_slots() {
        let t = QueryTemplate::parse("SELECT '{{}}'::jsonb").unwrap();
        assert_eq!(t.render(&SlotValues::new()).unwrap(), "SELECT '{}'::jsonb");
        assert_eq!(
            QueryTemplate::parse("SELECT {nope}").unwrap_err(),
            TemplateError::UnknownSlot("nope".into())
        );
        assert!(matches!(
            QueryTemplate::parse("SELECT {select"),
            Err(TemplateError::Unterminated(7))
        ));
    }
}
