//! PlantUML export of machine definitions.

use crate::definition::{Event, MachineDefinition, Rule};
use crate::error::CoreError;
use base64::alphabet::Alphabet;
use base64::engine::{general_purpose, GeneralPurpose};
use base64::Engine;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fmt::Write as _;
use std::io::Write as _;

/// Rendering service path the encoded diagram is appended to.
pub const PLANTUML_URL: &str = "https://www.plantuml.com/plantuml/svg/~1";

const PLANTUML_ALPHABET: &str =
    "0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-_";

/// Renders the definition as a PlantUML state diagram.
pub fn to_uml(definition: &MachineDefinition) -> String {
    let mut out = String::new();
    out.push_str("@startuml\n");
    if !definition.name.is_empty() {
        let _ = writeln!(out, "title {}", definition.name);
    }

    let _ = writeln!(out, "[*] --> {}", definition.initial_state());
    for state in definition.states() {
        for transition in &state.transitions {
            let _ = writeln!(
                out,
                "{} --> {} : {}",
                state.name,
                transition.target,
                label(&transition.trigger)
            );
        }
        if state.terminal {
            let _ = writeln!(out, "{} --> [*]", state.name);
        }
    }

    out.push_str("@enduml\n");
    out
}

fn label(event: &Event) -> String {
    match event.rule {
        Rule::InputEqual => format!("{} = {}", event.protocol, event.data),
        Rule::InputSave => format!("{} -> {}", event.protocol, event.data),
        Rule::Input => event.protocol.to_string(),
        rule => format!("{} {}", event.protocol, rule),
    }
}

/// Returns a rendering service URL for the definition.
pub fn uml_url(definition: &MachineDefinition) -> Result<String, CoreError> {
    let uml = to_uml(definition);

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(uml.as_bytes())?;
    let compressed = encoder.finish()?;

    let alphabet = Alphabet::new(PLANTUML_ALPHABET).map_err(|e| CoreError::Diagram {
        reason: e.to_string(),
    })?;
    let engine = GeneralPurpose::new(&alphabet, general_purpose::NO_PAD);

    Ok(format!("{}{}", PLANTUML_URL, engine.encode(compressed)))
}
