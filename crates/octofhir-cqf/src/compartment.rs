//! Patient compartment definition.
//!
//! For each resource type that can belong to a patient, the search parameters
//! through which it references the patient, most specific first. Used to
//! scope retrieves to the current subject and to select group members' data
//! during bulk export.

const PATIENT_COMPARTMENT: &[(&str, &[&str])] = &[
    ("Patient", &["_id"]),
    ("AllergyIntolerance", &["patient", "recorder", "asserter"]),
    ("CarePlan", &["subject", "performer"]),
    ("CareTeam", &["subject", "participant"]),
    ("Claim", &["patient", "payee"]),
    ("Communication", &["subject", "sender", "recipient"]),
    ("Condition", &["subject", "asserter"]),
    ("Coverage", &["beneficiary", "subscriber", "policy-holder", "payor"]),
    ("DiagnosticReport", &["subject"]),
    ("DocumentReference", &["subject", "author"]),
    ("Encounter", &["subject"]),
    ("ExplanationOfBenefit", &["patient", "payee"]),
    ("Goal", &["subject"]),
    ("Immunization", &["patient"]),
    ("MedicationAdministration", &["subject", "performer"]),
    ("MedicationDispense", &["subject", "patient", "receiver"]),
    ("MedicationRequest", &["subject"]),
    ("MedicationStatement", &["subject"]),
    ("Observation", &["subject", "performer"]),
    ("Procedure", &["subject", "performer"]),
    ("ServiceRequest", &["subject", "performer"]),
    ("Specimen", &["subject"]),
];

/// Parameters linking `resource_type` to a patient; empty when the type is
/// outside the compartment.
pub fn patient_params(resource_type: &str) -> &'static [&'static str] {
    PATIENT_COMPARTMENT
        .iter()
        .find(|(rt, _)| *rt == resource_type)
        .map(|(_, params)| *params)
        .unwrap_or_default()
}

/// The parameter a retrieve uses to pin `resource_type` to one patient.
pub fn subject_param(resource_type: &str) -> &'static str {
    patient_params(resource_type)
        .first()
        .copied()
        .unwrap_or("subject")
}

/// Every compartment type, in definition order.
pub fn compartment_types() -> Vec<String> {
    PATIENT_COMPARTMENT
        .iter()
        .map(|(rt, _)| (*rt).to_string())
        .collect()
}
