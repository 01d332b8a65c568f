//! Field Dictionary
//!
//! Maps field ids to acronyms and enumerated codes to display strings.
//! The dictionary is read-only once built and shared between decoders.

use std::collections::HashMap;

use super::DataType;

/// Definition of a single field.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FieldDefinition {
    name: String,
    data_type: DataType,
}

/// Field id → name/type lookup plus per-field enum display tables.
#[derive(Debug, Clone, Default)]
pub struct FieldDictionary {
    fields: HashMap<i16, FieldDefinition>,
    enums: HashMap<i16, HashMap<u16, String>>,
}

impl FieldDictionary {
    /// Create an empty dictionary.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Dictionary preloaded with common market-price fields.
    #[must_use]
    pub fn builtin() -> Self {
        let mut dict = Self::new();

        dict.insert_field(1, "PROD_PERM", DataType::UInt);
        dict.insert_field(3, "DSPLY_NAME", DataType::RmtesString);
        dict.insert_field(4, "RDN_EXCHID", DataType::Enum);
        dict.insert_field(6, "TRDPRC_1", DataType::Real);
        dict.insert_field(11, "NETCHNG_1", DataType::Real);
        dict.insert_field(15, "CURRENCY", DataType::Enum);
        dict.insert_field(16, "ACTIV_DATE", DataType::Date);
        dict.insert_field(22, "BID", DataType::Real);
        dict.insert_field(25, "ASK", DataType::Real);
        dict.insert_field(30, "BIDSIZE", DataType::Real);
        dict.insert_field(31, "ASKSIZE", DataType::Real);
        dict.insert_field(32, "ACVOL_1", DataType::Real);
        dict.insert_field(259, "RECORDTYPE", DataType::UInt);
        dict.insert_field(875, "VALUE_DT1", DataType::Date);
        dict.insert_field(1010, "VALUE_TS1", DataType::Time);
        dict.insert_field(1025, "QUOTIM", DataType::Time);
        dict.insert_field(3855, "QUOTIM_MS", DataType::UInt);

        for (code, display) in [
            (36, "AUD"),
            (124, "CAD"),
            (156, "CNY"),
            (392, "JPY"),
            (756, "CHF"),
            (826, "GBP"),
            (840, "USD"),
            (978, "EUR"),
        ] {
            dict.insert_enum(15, code, display);
        }

        dict
    }

    /// Register or replace a field definition.
    pub fn insert_field(&mut self, field_id: i16, name: impl Into<String>, data_type: DataType) {
        self.fields.insert(
            field_id,
            FieldDefinition {
                name: name.into(),
                data_type,
            },
        );
    }

    /// Register an enum display string for a field.
    pub fn insert_enum(&mut self, field_id: i16, code: u16, display: impl Into<String>) {
        self.enums
            .entry(field_id)
            .or_default()
            .insert(code, display.into());
    }

    /// Acronym of a field.
    #[must_use]
    pub fn name(&self, field_id: i16) -> Option<&str> {
        self.fields.get(&field_id).map(|f| f.name.as_str())
    }

    /// Dictionary data type of a field.
    #[must_use]
    pub fn data_type(&self, field_id: i16) -> Option<DataType> {
        self.fields.get(&field_id).map(|f| f.data_type)
    }

    /// Display string for an enumerated code.
    #[must_use]
    pub fn enum_display(&self, field_id: i16, code: u16) -> Option<&str> {
        self.enums
            .get(&field_id)
            .and_then(|table| table.get(&code))
            .map(String::as_str)
    }

    /// Look up a field id by acronym.
    #[must_use]
    pub fn field_id(&self, name: &str) -> Option<i16> {
        self.fields
            .iter()
            .find(|(_, def)| def.name == name)
            .map(|(id, _)| *id)
    }

    /// Number of field definitions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check whether the dictionary has no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
