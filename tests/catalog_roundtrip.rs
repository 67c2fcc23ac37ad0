//! Library documents survive a save/load cycle.

use calseq::catalog::{Driver, DriverCatalog, InstructionSet, Library};
use calseq::instruction::{
    DataType, Instruction, InstructionKind, InstructionParameter, ListItem, ParameterKind,
};
use calseq::transport::Terminator;

fn range_instruction() -> Instruction {
    let mut range = InstructionParameter::new("p-range", ParameterKind::List, "Range?")
        .with_before_text(" ");
    range.list_items = Some(vec![
        ListItem {
            id: "li-1".into(),
            text: "100 mV".into(),
            value: "0.1".into(),
        },
        ListItem {
            id: "li-2".into(),
            text: "10 V".into(),
            value: "10".into(),
        },
    ]);
    Instruction::new("i-range", "Set Range", InstructionKind::Write, "VOLT:DC:RANG")
        .with_post_parameter(range)
}

fn driver() -> Driver {
    Driver {
        manufacturer: "Keysight".into(),
        model: "34465A".into(),
        nomenclature: "Digital Multimeter".into(),
        identity_query_command: Some("*IDN?".into()),
        terminator: Terminator::Lf,
        is_gpib: Some(true),
        is_ieee4882: Some(true),
        is_scpi: Some(true),
        instruction_sets: vec![InstructionSet {
            id: "set-dc".into(),
            name: "DC Voltage".into(),
            instructions: vec![
                range_instruction(),
                Instruction::new("i-read", "Read", InstructionKind::Query, "READ?")
                    .with_response_type(DataType::Number),
            ],
        }],
        categories: Some(vec!["Multimeters".into()]),
        variables: None,
    }
}

#[test]
fn test_library_save_load_preserves_drivers() {
    let library = Library {
        drivers: vec![driver()],
        ..Library::default()
    };
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.json");
    library.save(&path).unwrap();

    let loaded = Library::load(&path).unwrap();
    assert_eq!(loaded, library);
    let ids: Vec<&str> = loaded.drivers[0].instruction_sets[0]
        .instructions
        .iter()
        .map(|i| i.id.as_str())
        .collect();
    assert_eq!(ids, vec!["i-range", "i-read"]);
}

#[test]
fn test_loaded_catalog_resolves_driver_and_builtins() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("library.json");
    Library {
        drivers: vec![driver()],
        ..Library::default()
    }
    .save(&path)
    .unwrap();

    let catalog = DriverCatalog::load(&path).unwrap();
    let driver = catalog.driver("keysight", "34465a").unwrap();
    assert_eq!(driver.builtin_instruction_sets().len(), 2);
    assert!(catalog.instruction("i-read").is_some());
    assert!(catalog.validate().is_empty());
    assert_eq!(catalog.drivers_in_category("multimeters").len(), 1);
}
