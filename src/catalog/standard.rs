//! Instruction sets every IEEE-488.2 / SCPI instrument understands.
//!
//! The ids are fixed so authored sequences can reference these instructions
//! across catalogs.

use super::InstructionSet;
use crate::instruction::{DataType, Instruction, InstructionKind, InstructionParameter, ParameterKind};
use once_cell::sync::Lazy;

/// Id of the built-in IEEE 488.2 mandated command set.
pub const IEEE4882_SET_ID: &str = "ieee-488.2-mandated-commands";
/// Id of the built-in SCPI required command set.
pub const SCPI_SET_ID: &str = "scpi-required-commands";

fn write(id: &str, name: &str, command: &str) -> Instruction {
    Instruction::new(id, name, InstructionKind::Write, command)
}

fn query(id: &str, name: &str, command: &str, data_type: DataType) -> Instruction {
    Instruction::new(id, name, InstructionKind::Query, command).with_response_type(data_type)
}

/// Write instruction taking one number separated from the command by a space.
fn write_number(id: &str, name: &str, command: &str, parameter_id: &str, prompt: &str) -> Instruction {
    write(id, name, command).with_post_parameter(
        InstructionParameter::new(parameter_id, ParameterKind::Number, prompt).with_before_text(" "),
    )
}

fn ordered(name: &str, id: &str, instructions: Vec<Instruction>) -> InstructionSet {
    let instructions = instructions
        .into_iter()
        .enumerate()
        .map(|(i, mut instruction)| {
            instruction.order = Some(i as u32);
            instruction
        })
        .collect();
    InstructionSet {
        id: id.to_string(),
        name: name.to_string(),
        instructions,
    }
}

/// Commands mandated by IEEE 488.2.
pub static IEEE4882_MANDATED: Lazy<InstructionSet> = Lazy::new(|| {
    use DataType::{Boolean, Number, String};
    ordered(
        "IEEE 488.2 Mandated Commands",
        IEEE4882_SET_ID,
        vec![
            write("524afd49-7a68-47aa-8f30-3ad68c3466f0", "Clear Status Command", "*CLS"),
            write_number(
                "b345a42a-1661-42a4-acd8-6a1e6f9d17f7",
                "Standard Event Status Enable Command",
                "*ESE",
                "0be8ab1e-a8fe-4a9b-a9e0-70131d7998de",
                "Event status value?",
            ),
            query("96b52d35-b46b-4e5e-94ad-49ebaae34b5e", "Standard Event Status Enable Query", "*ESE?", Number),
            query("61b8b79a-1b18-47e6-b2de-93772c7562da", "Standard Event Status Register Query", "*ESR?", Number),
            query("4caa1e38-6641-4781-b63b-e303b24577c6", "Identification Query", "*IDN?", String),
            write("5a7821d5-bcad-44fe-958d-e5edcc90ee6d", "Operation Complete Command", "*OPC"),
            query("6d37157d-53ac-49dd-b930-e51de3042d11", "Operation Complete Query", "*OPC?", Boolean),
            write("232934f6-5832-4f9b-99bd-93c316bd7ca6", "Reset Command", "*RST"),
            write_number(
                "750e25a6-c3b5-484d-8bc8-92c47ac62b85",
                "Service Request Enable Command",
                "*SRE",
                "9f0f191d-1ad4-4628-833f-370611eb6ff2",
                "Service enable value?",
            ),
            query("e6bc632a-864f-4d7e-a64d-b2abbb5cd46e", "Service Request Enable Query", "*SRE?", Number),
            query("a3be687b-56f4-415f-8751-d346d85f0a4c", "Read Status Byte Query", "*STB?", Number),
            query("e6e36956-d36b-47e0-99d2-07f5f8c3c48c", "Self-Test Query", "*TST?", Number),
            write("f7019a3c-d33c-4007-afcd-5abadd9bd3a4", "Wait-to-Continue Command", "*WAI"),
        ],
    )
});

/// Commands required by SCPI.
pub static SCPI_REQUIRED: Lazy<InstructionSet> = Lazy::new(|| {
    use DataType::{Number, String};
    ordered(
        "SCPI Required Commands",
        SCPI_SET_ID,
        vec![
            query("faa3d671-213a-4e21-82f4-5c60644be34a", "System Error Query", "SYSTem:ERRor?", String),
            query("b3a43737-1968-4b69-8532-2adbaabb7ea4", "System Version Query", "SYSTem:VERSion?", String),
            query("aed334e4-9fcd-4b08-bac6-7e1e0f193761", "Status Operation Event Query", "STATus:OPERation:EVENt?", Number),
            query("85cdcc7a-f3fc-435f-98b2-5db8cab00f5c", "Status Operation Condition Query", "STATus:OPERation:CONDition?", Number),
            write_number(
                "cce0e9b2-340b-4b60-b1af-5b1efa6582a6",
                "Status Operation Enable Command",
                "STATus:OPERation:ENABle",
                "72663b5a-3035-4a55-9142-4004af9ec4cf",
                "Operation status value?",
            ),
            query("6f41f82a-94cc-4530-bc9a-7fdfbf3dff08", "Status Operation Enable Query", "STATus:OPERation:ENABle?", Number),
            query("76569773-162a-4021-baee-e8ea6d2d5fd8", "Status Questionable Event Query", "STATus:QUEStionable:EVENt?", Number),
            query("263b4eeb-5f3e-42c7-bdda-602ce36253ee", "Status Questionable Condition Query", "STATus:QUEStionable:CONDition?", Number),
            write_number(
                "e8df7e5a-0b4b-49ab-a7b0-f5a9dd3da3a3",
                "Status Questionable Enable Command",
                "STATus:QUEStionable:ENABle",
                "ae1a7724-0b60-4326-93dd-5121fd29d4f1",
                "Questionable status value?",
            ),
            query("a2174281-7a9e-41b4-97ec-01da025a291c", "Status Questionable Enable Query", "STATus:QUEStionable:ENABle?", Number),
            write("be4fd43b-5149-40fa-86ad-cb30b4d48fa1", "Status Preset Command", "STATus:PRESet"),
        ],
    )
});

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ieee4882_set_contents() {
        let commands: Vec<&str> = IEEE4882_MANDATED
            .instructions
            .iter()
            .map(|i| i.command.as_str())
            .collect();
        assert_eq!(
            commands,
            vec![
                "*CLS", "*ESE", "*ESE?", "*ESR?", "*IDN?", "*OPC", "*OPC?", "*RST", "*SRE",
                "*SRE?", "*STB?", "*TST?", "*WAI"
            ]
        );
    }

    #[test]
    fn test_scpi_set_contents() {
        let set = &*SCPI_REQUIRED;
        assert_eq!(set.instructions.len(), 11);
        let status_operation = set
            .instructions
            .iter()
            .filter(|i| i.command.starts_with("STATus:OPERation"))
            .count();
        let status_questionable = set
            .instructions
            .iter()
            .filter(|i| i.command.starts_with("STATus:QUEStionable"))
            .count();
        assert_eq!((status_operation, status_questionable), (4, 4));
    }

    #[test]
    fn test_builtin_sets_are_valid_templates() {
        for instruction in IEEE4882_MANDATED.instructions.iter().chain(&SCPI_REQUIRED.instructions) {
            assert!(instruction.validate().is_empty(), "{}", instruction.name);
        }
    }
}
