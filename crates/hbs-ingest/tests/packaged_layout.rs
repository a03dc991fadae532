use std::fs;

use hbs_ingest::{TableLayout, TableLoader};
use hbs_metadata::{MetadataContext, Settings};
use hbs_model::{LoadTableSettings, OnMissing};
use polars::prelude::*;
use tempfile::TempDir;

fn context(dir: &TempDir) -> MetadataContext {
    let settings = Settings::packaged()
        .unwrap()
        .with_local_directory(dir.path())
        .with_local_metadata_directory(dir.path().join("metadata"));
    MetadataContext::with_settings(settings).unwrap()
}

fn write(ctx: &MetadataContext, year: i64, urban: bool, file_code: &str, text: &str) {
    let path = ctx.paths().raw_file(year, urban, file_code);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn render_schema(df: &DataFrame) -> String {
    df.schema()
        .iter()
        .map(|(name, dtype)| format!("{name}: {dtype}"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[test]
fn members_are_cleaned_with_year_rules() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let header = "Address,DYCOL01,DYCOL03,DYCOL04,DYCOL05,DYCOL07,DYCOL10\n";
    write(
        &ctx,
        1396,
        true,
        "P1",
        &format!("{header}100011,1,1,1,45,2,a\n100011,2,2,2,41,1,b\n100011,3,3,2,,2,c\n"),
    );
    write(&ctx, 1396, false, "P1", &format!("{header}200011,1,1,2,60,,d\n"));

    let loader = TableLoader::new(
        &ctx,
        LoadTableSettings::new()
            .with_on_missing(OnMissing::Create)
            .with_save_created(false),
    );
    let table = loader.load("members_properties", 1396).unwrap();
    assert_eq!(table.height(), 4);

    insta::assert_snapshot!(render_schema(&table.data), @r"
    ID: u32
    Member_Number: u8
    Relationship: cat
    Sex: cat
    Age: u8
    Is_Student: bool
    ");

    let relationship = table.data.column("Relationship").unwrap();
    assert!(relationship.dtype().is_categorical());
    assert_eq!(relationship.get(0).unwrap().get_str(), Some("Head"));
    assert_eq!(relationship.get(2).unwrap().get_str(), Some("Child"));

    // from 1395 a student is coded 2
    let student = table.data.column("Is_Student").unwrap();
    assert_eq!(student.get(0).unwrap(), AnyValue::Boolean(true));
    assert_eq!(student.get(1).unwrap(), AnyValue::Boolean(false));
    assert_eq!(student.get(3).unwrap(), AnyValue::Null);
}

#[test]
fn food_layout_changes_with_year() {
    let dir = TempDir::new().unwrap();
    let ctx = context(&dir);
    let early = TableLayout::resolve(&ctx, "food", 1380, true).unwrap();
    assert_eq!(early.rule_for("DYCOL04").new_name(), None);
    let late = TableLayout::resolve(&ctx, "food", 1390, false).unwrap();
    assert_eq!(late.rule_for("dycol04").new_name(), Some("Duration"));
    assert_eq!(late.file_code, "P3S01");
}
