//! Scalar and boolean field reconciliation.

use datapub_core::{FieldInput, FieldKind};
use datapub_harness::{TestBed, boolean_field, scalar_field};
use serde_json::json;

#[test]
fn first_scalar_write_creates_value() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let name_field = bed.add_field(master, "mineral_name", FieldKind::Text).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(scalar_field(name_field, json!("olivine")));

    let outcome = bed.submit(dataset).unwrap();
    assert!(outcome.changed);

    let entry = outcome.dataset.field(name_field).unwrap();
    assert!(entry.id.is_some());
    assert!(entry.updated_at.is_some());
    assert_eq!(
        entry.value,
        Some(FieldInput::Scalar(json!("olivine")))
    );

    let exported = bed.export(record).unwrap();
    let entry = exported.field(name_field).unwrap();
    assert_eq!(entry.value, Some(FieldInput::Scalar(json!("olivine"))));
}

#[test]
fn identical_submission_is_a_no_op() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let name_field = bed.add_field(master, "mineral_name", FieldKind::Text).unwrap();
    let mass_field = bed.add_field(master, "mass_g", FieldKind::Decimal).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(scalar_field(name_field, json!("augite")));
    dataset.fields.push(scalar_field(mass_field, json!(12.5)));
    assert!(bed.submit(dataset).unwrap().changed);

    // Reconciling the materialized snapshot against itself writes nothing.
    let snapshot = bed.export(record).unwrap();
    let outcome = bed.submit(snapshot).unwrap();
    assert!(!outcome.changed);
    assert!(outcome.affected_datatypes.is_empty());
}

#[test]
fn scalar_change_supersedes_the_old_row() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let count_field = bed.add_field(master, "grain_count", FieldKind::Integer).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(scalar_field(count_field, json!(3)));
    let first = bed.submit(dataset).unwrap();
    let first_id = first.dataset.field(count_field).unwrap().id.unwrap();

    let mut dataset = bed.export(record).unwrap();
    dataset
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == count_field)
        .unwrap()
        .value = Some(FieldInput::Scalar(json!(4)));
    let second = bed.submit(dataset).unwrap();
    assert!(second.changed);

    let second_id = second.dataset.field(count_field).unwrap().id.unwrap();
    assert_ne!(first_id, second_id);

    // The superseded row survives as history.
    use datapub_core::ids::ValueId;
    use datapub_storage::Storage;
    let old = bed
        .engine
        .storage()
        .get_value(ValueId::from_uuid(first_id))
        .unwrap()
        .unwrap();
    assert!(old.deleted);
}

#[test]
fn round_trip_restores_the_previous_state() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let name_field = bed.add_field(master, "mineral_name", FieldKind::Text).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(scalar_field(name_field, json!("quartz")));
    bed.submit(dataset).unwrap();

    let before = bed.export(record).unwrap();

    let mut edited = before.clone();
    edited
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == name_field)
        .unwrap()
        .value = Some(FieldInput::Scalar(json!("feldspar")));
    assert!(bed.submit(edited).unwrap().changed);

    // Submitting the earlier snapshot brings the value back.
    assert!(bed.submit(before).unwrap().changed);
    let restored = bed.export(record).unwrap();
    assert_eq!(
        restored.field(name_field).unwrap().value,
        Some(FieldInput::Scalar(json!("quartz")))
    );
}

#[test]
fn boolean_flip_and_short_circuit() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let flag = bed.add_field(master, "verified", FieldKind::Boolean).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(boolean_field(flag, true));
    assert!(bed.submit(dataset.clone()).unwrap().changed);

    // Same boolean again: equality short-circuits, nothing is rewritten.
    let again = bed.submit(dataset).unwrap();
    assert!(!again.changed);

    let mut dataset = bed.export(record).unwrap();
    dataset
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == flag)
        .unwrap()
        .selected = Some(false);
    assert!(bed.submit(dataset).unwrap().changed);
    assert_eq!(
        bed.export(record).unwrap().field(flag).unwrap().selected,
        Some(false)
    );
}

#[test]
fn scalar_field_rejects_an_option_list() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let name_field = bed.add_field(master, "mineral_name", FieldKind::Text).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    let mut entry = scalar_field(name_field, json!("x"));
    entry.value = Some(FieldInput::Options(vec![datapub_core::OptionNode::new(
        "not-a-scalar",
    )]));
    dataset.fields.push(entry);

    let err = bed.submit(dataset).unwrap_err();
    assert_eq!(err.status, 400);
}
