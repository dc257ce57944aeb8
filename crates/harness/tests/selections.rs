//! Option-set and tag-tree reconciliation: set diffs, cardinality,
//! user-created option provisioning.

use datapub_core::{
    FieldInput, FieldKind,
    ids::{RecordId, SelectionId, TemplateFieldId},
};
use datapub_harness::{
    TestBed, find_tag, option_field, selected_tag, set_tag_selected, tag_field,
};
use datapub_storage::Storage;
use uuid::Uuid;

#[test]
fn radio_flip_deletes_one_and_creates_one() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let kind_field = bed.add_field(master, "rock_kind", FieldKind::SingleRadio).unwrap();
    bed.add_option(master, kind_field, "igneous").unwrap();
    bed.add_option(master, kind_field, "sedimentary").unwrap();

    let record = bed.create_dataset(master).unwrap();
    let igneous = bed.option_named(record, kind_field, "igneous").unwrap();
    let sedimentary = bed.option_named(record, kind_field, "sedimentary").unwrap();

    let mut dataset = bed.export(record).unwrap();
    dataset
        .fields
        .push(option_field(kind_field, &[&igneous.to_string()]));
    let first = bed.submit(dataset).unwrap();
    assert!(first.changed);
    let first_selection = match &first.dataset.field(kind_field).unwrap().value {
        Some(FieldInput::Options(nodes)) => nodes[0].id.unwrap(),
        other => panic!("unexpected field payload: {other:?}"),
    };

    let mut dataset = bed.export(record).unwrap();
    dataset
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == kind_field)
        .unwrap()
        .value = Some(FieldInput::Options(vec![datapub_core::OptionNode::new(
        sedimentary.to_string(),
    )]));
    let second = bed.submit(dataset).unwrap();
    assert!(second.changed);

    // Exactly one delete and one create: the old selection row is gone, the
    // new one is live, and the export shows only the new option.
    let old = bed
        .engine
        .storage()
        .get_selection(SelectionId::from_uuid(first_selection))
        .unwrap()
        .unwrap();
    assert!(old.deleted);

    let exported = bed.export(record).unwrap();
    let nodes = match &exported.field(kind_field).unwrap().value {
        Some(FieldInput::Options(nodes)) => nodes.clone(),
        other => panic!("unexpected field payload: {other:?}"),
    };
    assert_eq!(nodes.len(), 1);
    assert_eq!(nodes[0].name.as_deref(), Some("sedimentary"));
}

#[test]
fn single_cardinality_rejects_two_new_selections() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let kind_field = bed.add_field(master, "rock_kind", FieldKind::SingleSelect).unwrap();
    bed.add_option(master, kind_field, "igneous").unwrap();
    bed.add_option(master, kind_field, "sedimentary").unwrap();

    let record = bed.create_dataset(master).unwrap();
    let igneous = bed.option_named(record, kind_field, "igneous").unwrap();
    let sedimentary = bed.option_named(record, kind_field, "sedimentary").unwrap();

    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(option_field(
        kind_field,
        &[&igneous.to_string(), &sedimentary.to_string()],
    ));
    let err = bed.submit(dataset).unwrap_err();
    assert_eq!(err.status, 400);
}

#[test]
fn multi_select_diff_touches_only_the_difference() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let uses = bed.add_field(master, "uses", FieldKind::MultiSelect).unwrap();
    for name in ["abrasive", "flux", "gemstone"] {
        bed.add_option(master, uses, name).unwrap();
    }

    let record = bed.create_dataset(master).unwrap();
    let abrasive = bed.option_named(record, uses, "abrasive").unwrap();
    let flux = bed.option_named(record, uses, "flux").unwrap();
    let gemstone = bed.option_named(record, uses, "gemstone").unwrap();

    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(option_field(
        uses,
        &[&abrasive.to_string(), &flux.to_string()],
    ));
    let first = bed.submit(dataset).unwrap();
    let survivor_id = match &first.dataset.field(uses).unwrap().value {
        Some(FieldInput::Options(nodes)) => nodes
            .iter()
            .find(|n| n.name.as_deref() == Some("flux"))
            .unwrap()
            .id
            .unwrap(),
        other => panic!("unexpected field payload: {other:?}"),
    };

    // {abrasive, flux} -> {flux, gemstone}: abrasive removed, gemstone added,
    // flux's selection row untouched.
    let mut dataset = bed.export(record).unwrap();
    dataset
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == uses)
        .unwrap()
        .value = Some(FieldInput::Options(vec![
        datapub_core::OptionNode::new(flux.to_string()),
        datapub_core::OptionNode::new(gemstone.to_string()),
    ]));
    let second = bed.submit(dataset).unwrap();
    assert!(second.changed);

    let nodes = match &second.dataset.field(uses).unwrap().value {
        Some(FieldInput::Options(nodes)) => nodes.clone(),
        other => panic!("unexpected field payload: {other:?}"),
    };
    let flux_node = nodes
        .iter()
        .find(|n| n.name.as_deref() == Some("flux"))
        .unwrap();
    assert_eq!(flux_node.id, Some(survivor_id));

    let exported = bed.export(record).unwrap();
    let names: Vec<_> = match &exported.field(uses).unwrap().value {
        Some(FieldInput::Options(nodes)) => {
            nodes.iter().filter_map(|n| n.name.clone()).collect()
        }
        other => panic!("unexpected field payload: {other:?}"),
    };
    assert_eq!(names, vec!["flux", "gemstone"]);
}

#[test]
fn tag_selection_diff_adds_and_removes() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let taxonomy = bed.add_field(master, "taxonomy", FieldKind::TagTree).unwrap();
    let silicates = bed.add_tag(master, taxonomy, "silicates", None).unwrap();
    bed.add_tag(master, taxonomy, "olivines", Some(silicates)).unwrap();
    bed.add_tag(master, taxonomy, "pyroxenes", Some(silicates)).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    let entry = dataset
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == taxonomy)
        .unwrap();
    let Some(FieldInput::Tags(nodes)) = entry.value.as_mut() else {
        panic!("tag tree expected");
    };
    assert!(set_tag_selected(nodes, "silicates", true));
    assert!(set_tag_selected(nodes, "olivines", true));
    assert!(bed.submit(dataset).unwrap().changed);

    // olivines -> pyroxenes: one removed, one added, silicates untouched.
    let mut dataset = bed.export(record).unwrap();
    let entry = dataset
        .fields
        .iter_mut()
        .find(|f| f.template_field_uuid == taxonomy)
        .unwrap();
    let Some(FieldInput::Tags(nodes)) = entry.value.as_mut() else {
        panic!("tag tree expected");
    };
    let silicates_selection = find_tag(nodes, "silicates").unwrap().id.unwrap();
    assert!(set_tag_selected(nodes, "olivines", false));
    assert!(set_tag_selected(nodes, "pyroxenes", true));
    assert!(bed.submit(dataset).unwrap().changed);

    let exported = bed.export(record).unwrap();
    let Some(FieldInput::Tags(nodes)) = &exported.field(taxonomy).unwrap().value else {
        panic!("tag tree expected");
    };
    assert!(find_tag(nodes, "silicates").unwrap().selected);
    assert!(!find_tag(nodes, "olivines").unwrap().selected);
    assert!(find_tag(nodes, "pyroxenes").unwrap().selected);
    assert_eq!(
        find_tag(nodes, "silicates").unwrap().id,
        Some(silicates_selection)
    );
}

#[test]
fn untouched_tag_tree_submission_writes_nothing() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let taxonomy = bed.add_field(master, "taxonomy", FieldKind::TagTree).unwrap();
    bed.add_tag(master, taxonomy, "silicates", None).unwrap();

    let record = bed.create_dataset(master).unwrap();
    let dataset = bed.export(record).unwrap();
    let outcome = bed.submit(dataset).unwrap();
    assert!(!outcome.changed);
    assert!(outcome.affected_datatypes.is_empty());

    // Nothing was selected, so no container row should exist either.
    let storage = bed.engine.storage();
    let row = storage
        .get_record(RecordId::from_uuid(record))
        .unwrap()
        .unwrap();
    let field = storage
        .resolve_field(TemplateFieldId::from_uuid(taxonomy), row.datatype_id)
        .unwrap()
        .unwrap();
    assert!(
        storage
            .get_container(row.record_id, field.field_id)
            .unwrap()
            .is_none()
    );
}

#[test]
fn unknown_option_uuid_provisions_a_user_created_option() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let uses = bed.add_field(master, "uses", FieldKind::MultiRadio).unwrap();
    bed.add_option(master, uses, "abrasive").unwrap();

    let record = bed.create_dataset(master).unwrap();
    let mut dataset = bed.export(record).unwrap();
    // The submitted uuid is a display name; the server mints the real uuid.
    dataset.fields.push(option_field(uses, &["paperweight"]));
    let outcome = bed.submit(dataset).unwrap();
    assert!(outcome.changed);

    let nodes = match &outcome.dataset.field(uses).unwrap().value {
        Some(FieldInput::Options(nodes)) => nodes.clone(),
        other => panic!("unexpected field payload: {other:?}"),
    };
    assert_eq!(nodes.len(), 1);
    assert!(nodes[0].user_created);
    assert_eq!(nodes[0].name.as_deref(), Some("paperweight"));
    assert!(Uuid::parse_str(&nodes[0].template_radio_option_uuid).is_ok());

    let names: Vec<_> = bed
        .options_of(record, uses)
        .unwrap()
        .into_iter()
        .map(|(_, n)| n)
        .collect();
    assert!(names.contains(&"paperweight".to_string()));
}

#[test]
fn user_created_tag_requires_a_resolvable_parent() {
    let mut bed = TestBed::new().unwrap();
    let master = bed.new_master("specimen").unwrap();
    let taxonomy = bed.add_field(master, "taxonomy", FieldKind::TagTree).unwrap();
    bed.add_tag(master, taxonomy, "silicates", None).unwrap();

    let record = bed.create_dataset(master).unwrap();

    // No parent named at all.
    let mut dataset = bed.export(record).unwrap();
    dataset.fields.push(tag_field(
        taxonomy,
        vec![selected_tag("garnet group")],
    ));
    assert_eq!(bed.submit(dataset).unwrap_err().status, 400);

    // Parent named but unknown.
    let mut dataset = bed.export(record).unwrap();
    let mut node = selected_tag("garnet group");
    node.tag_parent_uuid = Some(Uuid::nil().to_string());
    dataset.fields.push(tag_field(taxonomy, vec![node]));
    assert_eq!(bed.submit(dataset).unwrap_err().status, 404);

    // Parent resolved: the tag is provisioned under it.
    let parent = bed.option_named(record, taxonomy, "silicates").unwrap();
    let mut dataset = bed.export(record).unwrap();
    let mut node = selected_tag("garnet group");
    node.tag_parent_uuid = Some(parent.to_string());
    dataset.fields.push(tag_field(taxonomy, vec![node]));
    let outcome = bed.submit(dataset).unwrap();
    assert!(outcome.changed);

    let exported = bed.export(record).unwrap();
    let Some(FieldInput::Tags(nodes)) = &exported.field(taxonomy).unwrap().value else {
        panic!("tag tree expected");
    };
    let garnet = find_tag(nodes, "garnet group").unwrap();
    assert!(garnet.selected);
    assert!(garnet.user_created);
    assert_eq!(garnet.tag_parent_uuid.as_deref(), Some(parent.to_string().as_str()));
}
