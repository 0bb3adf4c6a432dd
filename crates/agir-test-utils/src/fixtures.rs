use std::io::Write;

use tempfile::NamedTempFile;

use agir_core::process::{Learner, Node, ProcessDefinition, Role, Transition};

/// A two-phase clinic visit: a doctor greets, then the learner answers.
pub const CLINIC_YAML: &str = r#"
process:
  name: Clinic Visit
  description: A short consultation between a doctor and a patient
  learner:
    username: alice
    first_name: Alice
    last_name: Liddell
    role: medical student
    model: modelA
    evolution_objective: Improve bedside manner
  roles:
    - id: doctor
      name: Doctor
      description: A general practitioner
      model: doctor-model
  nodes:
    - id: intro
      name: Intro
      description: Greet the patient and ask what brings them in
      role: doctor
    - id: consult
      name: Consult
      description: Describe the symptoms
      role: learner
  transitions:
    - from: Intro
      to: Consult
  evolution:
    method: reflection
    description: Reflect on how the consultation went
"#;

/// Intro (doctor on `doctor-model`) followed by Consult (learner alice on `modelA`).
pub fn scenario_a() -> ProcessDefinition {
    ProcessDefinition::builder("Scenario A")
        .learner(Learner::new("alice").with_model("modelA"))
        .role(Role::new("doctor", "Doctor").with_model("doctor-model"))
        .node(Node::new("intro", "Intro", "doctor").with_description("Greet the patient"))
        .node(Node::new("consult", "Consult", "learner").with_description("Answer the doctor"))
        .transition(Transition::new("Intro", "Consult"))
        .build()
        .expect("scenario A is a valid process")
}

/// Write `contents` to a fresh temp file that lives as long as the handle.
pub fn write_temp_file(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("create temp file");
    file.write_all(contents.as_bytes()).expect("write temp file");
    file.flush().expect("flush temp file");
    file
}
