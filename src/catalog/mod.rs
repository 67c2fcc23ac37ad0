//! Driver catalog
//!
//! A [`Library`] is the document the driver builder loads and saves: drivers,
//! stand-alone instruction sets and instructions, and the categories used to
//! group drivers by equipment family. [`DriverCatalog`] indexes a library for
//! the lookups the compiler and the CLI need.
//!
//! Instruction and parameter ids are stable UUID strings; authored sequences
//! refer to instructions by id only.

/// Built-in IEEE 488.2 and SCPI instruction sets.
pub mod standard;

use crate::error::AppResult;
use crate::instruction::Instruction;
use crate::transport::Terminator;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tracing::{debug, info};

pub use standard::{IEEE4882_MANDATED, SCPI_REQUIRED};

/// A named, ordered collection of instructions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstructionSet {
    /// Library id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Instructions in authoring order.
    #[serde(default)]
    pub instructions: Vec<Instruction>,
}

/// Groups instruction sets by equipment family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverCategory {
    /// Library id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Display name.
    pub name: String,
    /// Ids of instruction sets in this category
    #[serde(default)]
    pub instruction_sets: Vec<String>,
}

/// Runtime substitution slot a procedure author can bind before execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverVariable {
    /// Library id.
    #[serde(rename = "_id")]
    pub id: String,
    /// Name the procedure binds against.
    pub name: String,
    /// Value used when the procedure binds nothing.
    #[serde(default)]
    pub default_value: String,
}

/// One instrument model and the instruction sets it supports.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Driver {
    /// Maker, e.g. `Fluke`.
    #[serde(rename = "driverManufacturer")]
    pub manufacturer: String,
    /// Model, e.g. `8846A`.
    #[serde(rename = "driverModel")]
    pub model: String,
    /// Instrument class, e.g. `Digital Multimeter`.
    #[serde(rename = "driverNomenclature", default)]
    pub nomenclature: String,
    /// Query whose reply identifies the instrument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_query_command: Option<String>,
    /// Line terminator the instrument expects.
    #[serde(default)]
    pub terminator: Terminator,
    /// Reachable over GPIB.
    #[serde(default, rename = "isGPIB", skip_serializing_if = "Option::is_none")]
    pub is_gpib: Option<bool>,
    /// Implements the IEEE 488.2 common commands.
    #[serde(default, rename = "isIEEE4882", skip_serializing_if = "Option::is_none")]
    pub is_ieee4882: Option<bool>,
    /// Implements the required SCPI commands.
    #[serde(default, rename = "isSCPI", skip_serializing_if = "Option::is_none")]
    pub is_scpi: Option<bool>,
    /// Instruction sets specific to this driver.
    #[serde(default)]
    pub instruction_sets: Vec<InstructionSet>,
    /// Category ids this driver belongs to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub categories: Option<Vec<String>>,
    /// Variables the driver's instructions can reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Vec<DriverVariable>>,
}

impl Driver {
    /// The standard instruction sets this driver's capability flags imply.
    pub fn builtin_instruction_sets(&self) -> Vec<&'static InstructionSet> {
        let mut sets = Vec::new();
        if self.is_ieee4882.unwrap_or(false) {
            sets.push(&*IEEE4882_MANDATED);
        }
        if self.is_scpi.unwrap_or(false) {
            sets.push(&*SCPI_REQUIRED);
        }
        sets
    }

    /// Whether the driver is tagged with `category`, ignoring case.
    pub fn in_category(&self, category: &str) -> bool {
        self.categories
            .iter()
            .flatten()
            .any(|c| c.eq_ignore_ascii_case(category))
    }

    /// Variable defaults, keyed by variable name.
    pub fn variable_defaults(&self) -> HashMap<String, String> {
        self.variables
            .iter()
            .flatten()
            .map(|v| (v.name.clone(), v.default_value.clone()))
            .collect()
    }

    /// Identity summary used for device discovery.
    pub fn identity(&self) -> IdentityInfo {
        IdentityInfo {
            manufacturer: self.manufacturer.clone(),
            model: self.model.clone(),
            nomenclature: self.nomenclature.clone(),
            identity_query_command: self.identity_query_command.clone(),
        }
    }
}

/// What device discovery needs to know about a driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentityInfo {
    /// Maker.
    pub manufacturer: String,
    /// Model.
    pub model: String,
    /// Instrument class.
    pub nomenclature: String,
    /// Query whose reply identifies the instrument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_query_command: Option<String>,
}

/// The driver builder's library document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Library {
    /// Instrument drivers.
    #[serde(default)]
    pub drivers: Vec<Driver>,
    /// Shared instruction sets.
    #[serde(default)]
    pub instruction_sets: Vec<InstructionSet>,
    /// Standalone instructions.
    #[serde(default)]
    pub instructions: Vec<Instruction>,
    /// Driver categories.
    #[serde(default)]
    pub categories: Vec<DriverCategory>,
}

impl Library {
    /// Load a library from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let library: Library = serde_json::from_str(&text)?;
        info!(
            path = %path.as_ref().display(),
            drivers = library.drivers.len(),
            "Loaded driver library"
        );
        Ok(library)
    }

    /// Save the library as pretty-printed JSON
    pub fn save<P: AsRef<Path>>(&self, path: P) -> AppResult<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), text)?;
        debug!(path = %path.as_ref().display(), "Saved driver library");
        Ok(())
    }
}

/// One template problem found while validating a library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogIssue {
    /// Where the instruction lives, e.g. `Fluke 8846A / Measure / Read DC`
    pub location: String,
    /// What is wrong.
    pub message: String,
}

impl std::fmt::Display for CatalogIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.location, self.message)
    }
}

/// Lookup index over a [`Library`] plus the built-in instruction sets.
#[derive(Debug, Clone)]
pub struct DriverCatalog {
    library: Library,
    instructions: HashMap<String, Instruction>,
}

/// An empty library; only the built-in sets are indexed.
impl Default for DriverCatalog {
    fn default() -> Self {
        Self::new(Library::default())
    }
}

impl DriverCatalog {
    /// Index `library` for instruction lookups.
    pub fn new(library: Library) -> Self {
        let mut instructions = HashMap::new();
        let mut index = |instruction: &Instruction| {
            instructions
                .entry(instruction.id.clone())
                .or_insert_with(|| instruction.clone());
        };

        library.instructions.iter().for_each(&mut index);
        library
            .instruction_sets
            .iter()
            .flat_map(|s| &s.instructions)
            .for_each(&mut index);
        library
            .drivers
            .iter()
            .flat_map(|d| &d.instruction_sets)
            .flat_map(|s| &s.instructions)
            .for_each(&mut index);
        IEEE4882_MANDATED
            .instructions
            .iter()
            .chain(&SCPI_REQUIRED.instructions)
            .for_each(&mut index);

        Self {
            library,
            instructions,
        }
    }

    /// Load the library document at `path` and index it.
    pub fn load<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::new(Library::load(path)?))
    }

    /// The indexed library.
    pub fn library(&self) -> &Library {
        &self.library
    }

    /// Every driver in the library.
    pub fn drivers(&self) -> &[Driver] {
        &self.library.drivers
    }

    /// Case-insensitive lookup by manufacturer and model.
    pub fn driver(&self, manufacturer: &str, model: &str) -> Option<&Driver> {
        self.library.drivers.iter().find(|d| {
            d.manufacturer.eq_ignore_ascii_case(manufacturer) && d.model.eq_ignore_ascii_case(model)
        })
    }

    /// Any instruction by id: library, instruction sets, drivers, then the
    /// built-in sets.
    pub fn instruction(&self, id: &str) -> Option<&Instruction> {
        self.instructions.get(id)
    }

    /// Drivers tagged with `category`.
    pub fn drivers_in_category(&self, category: &str) -> Vec<&Driver> {
        self.library
            .drivers
            .iter()
            .filter(|d| d.in_category(category))
            .collect()
    }

    /// The library instruction sets a category names, in category order.
    pub fn category_instruction_sets(&self, category: &str) -> Vec<&InstructionSet> {
        let Some(category) = self
            .library
            .categories
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(category))
        else {
            return Vec::new();
        };
        category
            .instruction_sets
            .iter()
            .filter_map(|id| self.library.instruction_sets.iter().find(|s| &s.id == id))
            .collect()
    }

    /// Identity summaries of every driver.
    pub fn identity_infos(&self) -> Vec<IdentityInfo> {
        self.library.drivers.iter().map(Driver::identity).collect()
    }

    /// Every template problem in the library.
    pub fn validate(&self) -> Vec<CatalogIssue> {
        let mut issues = Vec::new();
        let mut check = |location: String, instruction: &Instruction| {
            issues.extend(instruction.validate().into_iter().map(|message| CatalogIssue {
                location: location.clone(),
                message,
            }));
        };

        for instruction in &self.library.instructions {
            check(instruction.name.clone(), instruction);
        }
        for set in &self.library.instruction_sets {
            for instruction in &set.instructions {
                check(format!("{} / {}", set.name, instruction.name), instruction);
            }
        }
        for driver in &self.library.drivers {
            for set in &driver.instruction_sets {
                for instruction in &set.instructions {
                    check(
                        format!(
                            "{} {} / {} / {}",
                            driver.manufacturer, driver.model, set.name, instruction.name
                        ),
                        instruction,
                    );
                }
            }
        }
        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruction::{DataType, InstructionKind};

    pub(crate) fn sample_library() -> Library {
        let measure = InstructionSet {
            id: "set-measure".into(),
            name: "Measure".into(),
            instructions: vec![
                Instruction::new("i-read-dc", "Read DC", InstructionKind::Query, "MEAS:VOLT:DC?")
                    .with_response_type(DataType::Number),
            ],
        };
        Library {
            drivers: vec![Driver {
                manufacturer: "Fluke".into(),
                model: "8846A".into(),
                nomenclature: "Digital Multimeter".into(),
                identity_query_command: Some("*IDN?".into()),
                terminator: Terminator::Lf,
                is_gpib: Some(true),
                is_ieee4882: Some(true),
                is_scpi: Some(false),
                instruction_sets: vec![measure.clone()],
                categories: Some(vec!["Multimeters".into()]),
                variables: Some(vec![DriverVariable {
                    id: "v1".into(),
                    name: "channel".into(),
                    default_value: "1".into(),
                }]),
            }],
            instruction_sets: vec![measure],
            instructions: vec![Instruction::new(
                "i-broken",
                "Broken",
                InstructionKind::Read,
                "",
            )],
            categories: vec![DriverCategory {
                id: "c1".into(),
                name: "Multimeters".into(),
                instruction_sets: vec!["set-measure".into(), "missing".into()],
            }],
        }
    }

    #[test]
    fn test_driver_lookup_is_case_insensitive() {
        let catalog = DriverCatalog::new(sample_library());
        assert!(catalog.driver("FLUKE", "8846a").is_some());
        assert!(catalog.driver("Keithley", "2000").is_none());
    }

    #[test]
    fn test_instruction_lookup_includes_builtins() {
        let catalog = DriverCatalog::new(sample_library());
        assert_eq!(catalog.instruction("i-read-dc").unwrap().command, "MEAS:VOLT:DC?");
        let idn = catalog.instruction("4caa1e38-6641-4781-b63b-e303b24577c6").unwrap();
        assert_eq!(idn.command, "*IDN?");
        assert!(catalog.instruction("nope").is_none());
    }

    #[test]
    fn test_categories() {
        let catalog = DriverCatalog::new(sample_library());
        assert_eq!(catalog.drivers_in_category("multimeters").len(), 1);
        let sets = catalog.category_instruction_sets("Multimeters");
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].name, "Measure");
        assert!(catalog.category_instruction_sets("Scopes").is_empty());
    }

    #[test]
    fn test_builtin_sets_follow_flags() {
        let library = sample_library();
        let sets = library.drivers[0].builtin_instruction_sets();
        assert_eq!(sets.len(), 1);
        assert_eq!(sets[0].id, standard::IEEE4882_SET_ID);
    }

    #[test]
    fn test_validate_collects_issues() {
        let catalog = DriverCatalog::new(sample_library());
        let issues = catalog.validate();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].location, "Broken");
        assert!(issues[0].message.contains("missing response data type"));
    }

    #[test]
    fn test_driver_json_field_names() {
        let value = serde_json::to_value(&sample_library().drivers[0]).unwrap();
        assert_eq!(value["driverManufacturer"], "Fluke");
        assert_eq!(value["isIEEE4882"], true);
        assert_eq!(value["terminator"], "Lf");
        assert_eq!(value["identityQueryCommand"], "*IDN?");
    }

    #[test]
    fn test_identity_infos() {
        let catalog = DriverCatalog::new(sample_library());
        let infos = catalog.identity_infos();
        assert_eq!(infos[0].nomenclature, "Digital Multimeter");
    }
}
