use rmcp::schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// One of the four managed attachment fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum MetadataField {
    Title,
    Description,
    AltText,
    Caption,
}

impl MetadataField {
    pub const ALL: [MetadataField; 4] = [
        MetadataField::Title,
        MetadataField::Description,
        MetadataField::AltText,
        MetadataField::Caption,
    ];

    pub fn key(self) -> &'static str {
        match self {
            MetadataField::Title => "title",
            MetadataField::Description => "description",
            MetadataField::AltText => "alt_text",
            MetadataField::Caption => "caption",
        }
    }
}

/// Closed set of flags over the four metadata fields.
///
/// Used both for the persisted "fields to manage" option and for the
/// per-call "needs generation" result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct MetadataFieldSet {
    pub title: bool,
    pub description: bool,
    pub alt_text: bool,
    pub caption: bool,
}

impl MetadataFieldSet {
    pub fn all() -> Self {
        Self {
            title: true,
            description: true,
            alt_text: true,
            caption: true,
        }
    }

    pub fn of(fields: &[MetadataField]) -> Self {
        let mut set = Self::default();
        for field in fields {
            set.insert(*field);
        }
        set
    }

    pub fn contains(&self, field: MetadataField) -> bool {
        match field {
            MetadataField::Title => self.title,
            MetadataField::Description => self.description,
            MetadataField::AltText => self.alt_text,
            MetadataField::Caption => self.caption,
        }
    }

    pub fn insert(&mut self, field: MetadataField) {
        match field {
            MetadataField::Title => self.title = true,
            MetadataField::Description => self.description = true,
            MetadataField::AltText => self.alt_text = true,
            MetadataField::Caption => self.caption = true,
        }
    }

    pub fn is_empty(&self) -> bool {
        !(self.title || self.description || self.alt_text || self.caption)
    }

    pub fn iter(&self) -> impl Iterator<Item = MetadataField> + '_ {
        MetadataField::ALL
            .into_iter()
            .filter(move |field| self.contains(*field))
    }
}

/// Current values of the attachment fields, as read from the store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues {
    pub title: Option<String>,
    pub description: Option<String>,
    pub alt_text: Option<String>,
    pub caption: Option<String>,
}

impl FieldValues {
    pub fn get(&self, field: MetadataField) -> Option<&str> {
        match field {
            MetadataField::Title => self.title.as_deref(),
            MetadataField::Description => self.description.as_deref(),
            MetadataField::AltText => self.alt_text.as_deref(),
            MetadataField::Caption => self.caption.as_deref(),
        }
    }

    pub fn set(&mut self, field: MetadataField, value: Option<String>) {
        let slot = match field {
            MetadataField::Title => &mut self.title,
            MetadataField::Description => &mut self.description,
            MetadataField::AltText => &mut self.alt_text,
            MetadataField::Caption => &mut self.caption,
        };
        *slot = value;
    }

    /// Empty strings and missing values are both "not set".
    pub fn is_blank(&self, field: MetadataField) -> bool {
        self.get(field).is_none_or(str::is_empty)
    }
}

/// Computes which selected fields must be (re)generated for one attachment.
pub fn resolve_fields_to_generate(
    selected: MetadataFieldSet,
    override_existing: bool,
    current: &FieldValues,
) -> MetadataFieldSet {
    let mut needed = MetadataFieldSet::default();
    for field in selected.iter() {
        if override_existing || current.is_blank(field) {
            needed.insert(field);
        }
    }
    needed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(title: &str, description: &str, alt_text: &str, caption: &str) -> FieldValues {
        let wrap = |value: &str| Some(value.to_string());
        FieldValues {
            title: wrap(title),
            description: wrap(description),
            alt_text: wrap(alt_text),
            caption: wrap(caption),
        }
    }

    #[test]
    fn keeps_only_selected_blank_fields_without_override() {
        let selected = MetadataFieldSet::of(&[MetadataField::Title, MetadataField::AltText]);
        let current = values("", "", "x", "");

        let needed = resolve_fields_to_generate(selected, false, &current);

        assert_eq!(needed, MetadataFieldSet::of(&[MetadataField::Title]));
    }

    #[test]
    fn override_returns_selection_regardless_of_values() {
        let selected = MetadataFieldSet::of(&[MetadataField::Caption, MetadataField::Description]);
        let current = values("a", "b", "c", "d");

        assert_eq!(resolve_fields_to_generate(selected, true, &current), selected);
    }

    #[test]
    fn missing_values_count_as_blank() {
        let needed = resolve_fields_to_generate(MetadataFieldSet::all(), false, &FieldValues::default());
        assert_eq!(needed, MetadataFieldSet::all());
    }

    #[test]
    fn nothing_selected_yields_empty_set() {
        let needed = resolve_fields_to_generate(MetadataFieldSet::default(), true, &FieldValues::default());
        assert!(needed.is_empty());
    }

    #[test]
    fn iterates_in_fixed_order() {
        let set = MetadataFieldSet::of(&[MetadataField::Caption, MetadataField::Title]);
        let keys: Vec<_> = set.iter().map(MetadataField::key).collect();
        assert_eq!(keys, vec!["title", "caption"]);
    }

    #[test]
    fn field_set_round_trips_as_boolean_object() {
        let set = MetadataFieldSet::of(&[MetadataField::AltText]);
        let json = serde_json::to_value(set).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"title": false, "description": false, "alt_text": true, "caption": false})
        );
        let partial: MetadataFieldSet = serde_json::from_value(serde_json::json!({"caption": true})).unwrap();
        assert_eq!(partial, MetadataFieldSet::of(&[MetadataField::Caption]));
    }
}
