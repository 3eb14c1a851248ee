//! Field-driven extraction for records that need no text generation.

use super::{ExtractedEntity, ExtractedRelationship};
use crate::connectors::{SourceRecord, SourceType};

pub(crate) struct Candidates {
    pub entities: Vec<ExtractedEntity>,
    pub relationships: Vec<ExtractedRelationship>,
}

impl Candidates {
    fn new() -> Self {
        Self {
            entities: Vec::new(),
            relationships: Vec::new(),
        }
    }

    fn entity(&mut self, entity: ExtractedEntity) {
        self.entities.push(entity);
    }

    /// Endpoints are `(name, type)` pairs.
    fn link(&mut self, (source, source_type): (&str, &str), (target, target_type): (&str, &str), relationship_type: &str) {
        self.relationships.push(
            ExtractedRelationship::new(source, target, relationship_type, 1.0)
                .with_endpoint_types(Some(source_type), Some(target_type)),
        );
    }
}

/// Heuristic extraction for contacts, calendar events, call log entries
/// and photos. Documents yield nothing here.
pub(crate) fn extract_structured(record: &SourceRecord) -> Candidates {
    let mut out = Candidates::new();
    match record.source {
        SourceType::Contacts => contact(record, &mut out),
        SourceType::Calendar => calendar_event(record, &mut out),
        SourceType::CallLog => call(record, &mut out),
        SourceType::Photos => photo(record, &mut out),
        SourceType::Documents => {}
    }
    out
}

fn tag(entity: ExtractedEntity, record: &SourceRecord) -> ExtractedEntity {
    entity
        .with_metadata("source", record.source.as_str())
        .with_metadata("source_id", record.id.as_str())
}

fn contact(record: &SourceRecord, out: &mut Candidates) {
    let name = record.field("name").unwrap_or(record.title.as_str()).trim();
    if name.is_empty() {
        return;
    }

    let organization = record.field("organization");
    let role = record.field("job_title");
    let description = match (role, organization) {
        (Some(role), Some(org)) => format!("{} at {}", role, org),
        (Some(role), None) => role.to_string(),
        (None, Some(org)) => format!("Works at {}", org),
        (None, None) => "Contact".to_string(),
    };

    let mut person = ExtractedEntity::new(name, "PERSON", 1.0).with_description(description);
    for key in ["email", "phone", "birthday"] {
        if let Some(value) = record.field(key) {
            person = person.with_metadata(key, value);
        }
    }
    if !record.content.trim().is_empty() {
        person = person.with_metadata("notes", record.content.trim());
    }
    out.entity(tag(person, record));

    if let Some(org) = organization {
        out.entity(tag(ExtractedEntity::new(org, "ORGANIZATION", 1.0), record));
        out.link((name, "PERSON"), (org, "ORGANIZATION"), "WORKS_AT");
    }
}

fn calendar_event(record: &SourceRecord, out: &mut Candidates) {
    let title = record.title.trim();
    if title.is_empty() {
        return;
    }

    let mut event = ExtractedEntity::new(title, "EVENT", 1.0);
    if !record.content.trim().is_empty() {
        event = event.with_description(record.content.trim());
    }
    for key in ["start", "end"] {
        if let Some(value) = record.field(key) {
            event = event.with_metadata(key, value);
        }
    }
    out.entity(tag(event, record));

    for attendee in record.field_list("attendees") {
        out.entity(tag(
            ExtractedEntity::new(attendee, "PERSON", 1.0).with_description(format!("Attended {}", title)),
            record,
        ));
        out.link((attendee, "PERSON"), (title, "EVENT"), "ATTENDED");
    }

    if let Some(location) = record.field("location") {
        out.entity(tag(ExtractedEntity::new(location, "LOCATION", 1.0), record));
        out.link((title, "EVENT"), (location, "LOCATION"), "LOCATED_AT");
    }
}

fn call(record: &SourceRecord, out: &mut Candidates) {
    let Some(name) = record.field("contact_name").or_else(|| record.field("number")) else {
        return;
    };
    let direction = record.field("direction").unwrap_or("unknown");
    let mut person =
        ExtractedEntity::new(name, "PERSON", 1.0).with_description(format!("Phone contact ({} call)", direction));
    for key in ["number", "duration_secs"] {
        if let Some(value) = record.field(key) {
            person = person.with_metadata(key, value);
        }
    }
    out.entity(tag(person, record));
}

fn photo(record: &SourceRecord, out: &mut Candidates) {
    let title = record.title.trim();
    if title.is_empty() {
        return;
    }

    let mut photo = ExtractedEntity::new(title, "PHOTO", 1.0);
    if !record.content.trim().is_empty() {
        photo = photo.with_description(record.content.trim());
    }
    if let Some(taken_at) = record.field("taken_at") {
        photo = photo.with_metadata("taken_at", taken_at);
    }
    out.entity(tag(photo, record));

    if let Some(location) = record.field("location") {
        out.entity(tag(ExtractedEntity::new(location, "LOCATION", 1.0), record));
        out.link((title, "PHOTO"), (location, "LOCATION"), "TAKEN_AT");
    }
    for person in record.field_list("people") {
        out.entity(tag(ExtractedEntity::new(person, "PERSON", 1.0), record));
        out.link((person, "PERSON"), (title, "PHOTO"), "APPEARS_IN");
    }
}
