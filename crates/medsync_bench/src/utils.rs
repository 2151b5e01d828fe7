//! Benchmark utilities.

use medsync_testkit::{scenarios, TestCentral};
use rand::Rng;
use serde_json::{json, Value};

/// Generate an encounter payload with a random note of `size` characters.
pub fn random_encounter(patient_id: &str, size: usize) -> Value {
    let mut rng = rand::thread_rng();
    let note: String = (0..size)
        .map(|_| char::from(rng.gen_range(b'a'..=b'z')))
        .collect();
    json!({ "patientId": patient_id, "note": note })
}

/// A central server with `patients` patients over 4 facilities and
/// `encounters` encounters each. The lookup table is not built.
pub fn unbuilt_central(patients: usize, encounters: usize) -> TestCentral {
    let central = TestCentral::new();
    scenarios::populate(&central, patients, 4, encounters);
    central
}

/// Rewrites `count` random encounters of a populated server.
pub fn touch_random_encounters(central: &TestCentral, patients: usize, encounters: usize, count: usize) {
    let mut rng = rand::thread_rng();
    for _ in 0..count {
        let p = rng.gen_range(0..patients.max(1));
        let e = rng.gen_range(0..encounters.max(1));
        let patient_id = format!("p{p}");
        central.write(
            "encounters",
            &format!("e{p}-{e}"),
            random_encounter(&patient_id, 64),
        );
    }
}
