use std::fs;

use hbs_core::{
    AttributeOptions, AverageOptions, CpiOptions, Dataset, Engine, EquivalenceScale, ErrorKind,
    HbsError, LoadTableSettings, MetaValue, MetadataContext, OnMissing, QuantileOptions,
    SchemaInput, SelectOptions, Settings, Table, YearSpec,
};
use hbs_ingest::{read_parquet, write_parquet_atomic};
use polars::prelude::*;
use tempfile::TempDir;

const YEAR: i64 = 1396;

fn create() -> LoadTableSettings {
    LoadTableSettings::new().with_on_missing(OnMissing::Create)
}

fn engine(dir: &TempDir) -> Engine {
    let settings = Settings::packaged()
        .unwrap()
        .with_local_directory(dir.path())
        .with_local_metadata_directory(dir.path().join("metadata"))
        .with_load_table(create());
    let engine = Engine::new(MetadataContext::with_settings(settings).unwrap());
    write_raw(engine.context());
    engine
}

fn write(ctx: &MetadataContext, urban: bool, file_code: &str, text: &str) {
    write_year(ctx, YEAR, urban, file_code, text);
}

fn write_year(ctx: &MetadataContext, year: i64, urban: bool, file_code: &str, text: &str) {
    let path = ctx.paths().raw_file(year, urban, file_code);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, text).unwrap();
}

fn write_raw(ctx: &MetadataContext) {
    let household = "ADDRESS,MAHMORED,TAKMIL,WEIGHT\n";
    write(ctx, true, "Data", &format!("{household}123012345,1,1,250.5\n123012346,2,1,300\n"));
    write(ctx, false, "Data", &format!("{household}201000001,3,1,410\n"));
    write_year(ctx, 1397, true, "Data", &format!("{household}130012345,4,1,275\n"));
    write_year(ctx, 1397, false, "Data", &format!("{household}229000001,5,0,390\n"));

    let members = "ADDRESS,DYCOL01,DYCOL03,DYCOL04,DYCOL05\n";
    write(
        ctx,
        true,
        "P1",
        &format!("{members}123012345,1,1,1,45\n123012345,2,2,2,41\n123012346,1,1,2,30\n"),
    );
    write(
        ctx,
        false,
        "P1",
        &format!("{members}201000001,1,1,1,50\n201000001,2,2,2,48\n201000001,3,3,1,12\n"),
    );

    let expenditure = "ADDRESS,DYCOL01,DYCOL02,DYCOL03,DYCOL05,DYCOL06\n";
    write(
        ctx,
        true,
        "P3S01",
        &format!(
            "{expenditure}123012345,11111,1,2,600,1200\n123012345,11211,2,1,800,800\n123012346,11111,1,3,500,1500\n"
        ),
    );
    write(
        ctx,
        false,
        "P3S01",
        &format!("{expenditure}201000001,11111,1,1,700,700\n201000001,11211,1,0,0,0\n"),
    );
    write(ctx, true, "P3S02", &format!("{expenditure}123012345,22111,1,1,300,300\n"));
    write(ctx, false, "P3S02", &format!("{expenditure}201000001,22111,1,2,250,500\n"));
}

fn column_names(table: &Table) -> Vec<String> {
    table
        .data
        .get_column_names()
        .into_iter()
        .map(|name| name.to_string())
        .collect()
}

/// Labels of a categorical column.
fn labels(table: &Table, name: &str) -> Vec<Option<String>> {
    let column = table.data.column(name).unwrap();
    assert!(column.dtype().is_categorical(), "{name} is {}", column.dtype());
    column
        .cast(&DataType::String)
        .unwrap()
        .str()
        .unwrap()
        .into_iter()
        .map(|value| value.map(str::to_string))
        .collect()
}

fn f64_column(table: &Table, name: &str) -> Vec<Option<f64>> {
    table
        .data
        .column(name)
        .unwrap()
        .cast(&DataType::Float64)
        .unwrap()
        .f64()
        .unwrap()
        .into_iter()
        .collect()
}

#[test]
fn base_table_datasets() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);

    let processed = engine.load_table("food", YEAR, create()).unwrap();
    assert_eq!(processed.height(), 5);
    assert_eq!(processed.table_name(), Some("food"));
    let names = column_names(&processed);
    assert!(names.contains(&"Year".to_string()));
    assert!(names.contains(&"Table_Name".to_string()));
    assert!(engine.context().paths().processed_file("food", YEAR).is_file());

    let cleaned = engine
        .load_table("food", YEAR, create().with_dataset(Dataset::Cleaned))
        .unwrap();
    assert_eq!(cleaned.height(), 5);
    assert!(!column_names(&cleaned).contains(&"Year".to_string()));

    let original = engine
        .load_table("food", YEAR, create().with_dataset(Dataset::Original))
        .unwrap();
    assert!(column_names(&original).contains(&"DYCOL06".to_string()));

    // tobacco is published from 1370 on
    let early = engine
        .load_table("tobacco", vec![1369], create().with_dataset(Dataset::Original))
        .unwrap();
    assert!(early.is_empty());
}

#[test]
fn cached_table_is_reused_until_a_dependency_changes() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let paths = engine.context().paths();

    let built = engine.load_table("Expenditures", YEAR, create()).unwrap();
    assert_eq!(built.height(), 6);
    assert_eq!(
        column_names(&built)[..4],
        ["Year", "ID", "Table_Name", "Code"].map(String::from)
    );
    assert!(paths.cached_file("Expenditures", YEAR).is_file());
    assert!(paths.cached_sidecar("Expenditures", YEAR).is_file());

    let mut marker = df! { "Marker" => [1i64] }.unwrap();
    write_parquet_atomic(&mut marker, &paths.cached_file("Expenditures", YEAR)).unwrap();
    let cached = engine.load_table("Expenditures", YEAR, create()).unwrap();
    assert_eq!(column_names(&cached), vec!["Marker"]);

    let tobacco_path = paths.processed_file("tobacco", YEAR);
    let mut tobacco = read_parquet(&tobacco_path).unwrap().slice(0, 1);
    write_parquet_atomic(&mut tobacco, &tobacco_path).unwrap();
    let rebuilt = engine.load_table("Expenditures", YEAR, create()).unwrap();
    assert_eq!(rebuilt.height(), 5);
    assert!(!column_names(&rebuilt).contains(&"Marker".to_string()));

    let again = engine.load_table("Expenditures", YEAR, create()).unwrap();
    assert!(again.data.equals_missing(&rebuilt.data));
}

#[test]
fn attribute_decoding_keeps_row_count() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let table = engine.load_table("Expenditures", YEAR, create()).unwrap();
    let rows = table.height();

    let table = engine
        .add_attribute(table, &AttributeOptions::new("Province"))
        .unwrap();
    let table = engine
        .add_attribute(table, &AttributeOptions::new("Urban_Rural"))
        .unwrap();
    assert_eq!(table.height(), rows);

    let provinces = labels(&table, "Province");
    let urban = labels(&table, "Urban_Rural");
    let ids = table.data.column("ID").unwrap().cast(&DataType::Int64).unwrap();
    for (row, id) in ids.i64().unwrap().into_iter().enumerate() {
        let expected = match id {
            Some(201_000_001) => ("Gilan", "Rural"),
            _ => ("Tehran", "Urban"),
        };
        assert_eq!(provinces[row].as_deref(), Some(expected.0));
        assert_eq!(urban[row].as_deref(), Some(expected.1));
    }
}

#[test]
fn join_does_not_duplicate_rows() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let table = engine.load_table("Food_Per_Capita", YEAR, create()).unwrap();
    assert_eq!(table.height(), 5);
    assert_eq!(
        f64_column(&table, "Per_Capita_Expenditure"),
        vec![Some(600.0), Some(400.0), Some(1500.0), Some(700.0 / 3.0), Some(0.0)]
    );
    let purchased = labels(&table, "Purchased");
    assert_eq!(purchased[1].as_deref(), Some("Not_Purchased"));
    assert_eq!(purchased[0].as_deref(), Some("Purchased"));
}

#[test]
fn add_weight_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let food = engine.load_table("food", YEAR, create()).unwrap();

    let once = engine.add_weight(food, false).unwrap();
    let twice = engine.add_weight(once.clone(), false).unwrap();
    assert_eq!(once.height(), twice.height());
    assert_eq!(column_names(&once), column_names(&twice));
    assert!(once.data.equals_missing(&twice.data));
    assert_eq!(
        f64_column(&once, "Weight"),
        vec![Some(250.5), Some(250.5), Some(300.0), Some(410.0), Some(410.0)]
    );

    let adjusted = engine.add_weight(twice, true).unwrap();
    assert_eq!(adjusted.height(), 5);
    assert_eq!(
        f64_column(&adjusted, "Weight"),
        vec![Some(501.0), Some(501.0), Some(300.0), Some(1230.0), Some(1230.0)]
    );
}

#[test]
fn ad_hoc_schema_is_built_without_changing_metadata() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let node = MetaValue::from_yaml_str(
        "
table_list: [food, tobacco]
instructions:
  - apply_filter: Expenditure >= 700
years: 1396
",
        "input",
    )
    .unwrap();
    let input = SchemaInput::from_meta(&node).unwrap();
    let table = engine.create_table_with_schema(input, None, create()).unwrap();
    assert_eq!(table.height(), 4);
    assert_eq!(table.table_name(), Some("_Input_Table"));
    assert!(engine.context().schema_node("_Input_Table").is_none());

    let set = MetaValue::from_yaml_str(
        "
Large:
  table_list: food
  instructions:
    - apply_filter: Expenditure > 1000
Large_Purchases:
  table_list: Large
  instructions:
    - apply_filter: Provision_Method == 'Purchase'
",
        "input",
    )
    .unwrap();
    let table = engine
        .create_table_with_schema(
            SchemaInput::from_meta(&set).unwrap(),
            Some(YearSpec::from(YEAR)),
            create(),
        )
        .unwrap();
    assert_eq!(table.height(), 2);
    assert_eq!(table.table_name(), Some("Large_Purchases"));
}

#[test]
fn household_attributes_over_two_years() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let node = MetaValue::from_yaml_str(
        "
table_list: [household_information]
years: [1396, 1397]
",
        "input",
    )
    .unwrap();
    let households = engine
        .create_table_with_schema(SchemaInput::from_meta(&node).unwrap(), None, create())
        .unwrap();
    assert_eq!(households.height(), 5);

    let table = engine
        .add_attribute(households, &AttributeOptions::new("Province"))
        .unwrap();
    let table = engine
        .add_attribute(table, &AttributeOptions::new("Region"))
        .unwrap();
    assert_eq!(table.height(), 5);
    for name in ["Province", "Region"] {
        assert_eq!(table.data.column(name).unwrap().null_count(), 0, "{name}");
    }
    let regions = labels(&table, "Region");
    let regions: Vec<Option<&str>> = regions.iter().map(Option::as_deref).collect();
    assert_eq!(
        regions,
        vec![
            Some("Capital"),
            Some("Capital"),
            Some("Caspian"),
            Some("Capital"),
            Some("North_East"),
        ]
    );
}

fn i64_column(table: &Table, name: &str) -> Vec<Option<i64>> {
    table
        .data
        .column(name)
        .unwrap()
        .cast(&DataType::Int64)
        .unwrap()
        .i64()
        .unwrap()
        .into_iter()
        .collect()
}

fn write_cpi(engine: &Engine) {
    let mut cpi = df! {
        "Year" => [1396i64, 1396],
        "Urban_Rural" => ["Urban", "Rural"],
        "CPI" => [50.0, 40.0],
    }
    .unwrap();
    let path = engine
        .context()
        .paths()
        .external_file("cpi_1400_annual_urban_rural");
    write_parquet_atomic(&mut cpi, &path).unwrap();
}

#[test]
fn select_keeps_one_part_of_the_survey() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let food = engine.load_table("food", YEAR, create()).unwrap();
    let columns = column_names(&food);

    let urban = engine
        .select(food.clone(), &SelectOptions::new().with_urban_rural("Urban"))
        .unwrap();
    assert_eq!(urban.height(), 3);
    assert_eq!(column_names(&urban), columns);

    let gilan = engine
        .select(food.clone(), &SelectOptions::new().with_province("Gilan"))
        .unwrap();
    assert_eq!(gilan.height(), 2);

    let capital = engine
        .select(
            food,
            &SelectOptions::new().with_province("Gilan").with_region("Capital"),
        )
        .unwrap();
    assert_eq!(capital.height(), 3);
}

#[test]
fn cpi_is_matched_by_year_and_urban_rural() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    write_cpi(&engine);
    let food = engine.load_table("food", YEAR, create()).unwrap();

    let with_cpi = engine.add_cpi(food.clone(), CpiOptions::new()).unwrap();
    assert_eq!(
        f64_column(&with_cpi, "CPI"),
        vec![Some(50.0), Some(50.0), Some(50.0), Some(40.0), Some(40.0)]
    );
    assert!(with_cpi.data.column("Urban_Rural").is_err());

    let adjusted = engine.adjust_by_cpi(food, None, CpiOptions::new()).unwrap();
    assert!(adjusted.data.column("CPI").is_err());
    assert_eq!(
        f64_column(&adjusted, "Expenditure"),
        vec![Some(2400.0), Some(1600.0), Some(3000.0), Some(1750.0), Some(0.0)]
    );
    assert_eq!(
        f64_column(&adjusted, "Price"),
        vec![Some(1200.0), Some(1600.0), Some(1000.0), Some(1750.0), Some(0.0)]
    );
}

#[test]
fn missing_cpi_file_is_reported() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let food = engine.load_table("food", YEAR, create()).unwrap();
    let err = engine
        .add_cpi(food, CpiOptions::new().with_separate_by_urban_rural(false))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Io, "{err}");
}

#[test]
fn averages_are_weighted_per_group() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let food = engine.load_table("food", YEAR, create()).unwrap();

    let options = AverageOptions::new()
        .with_columns(["Expenditure"])
        .with_groupby(["Urban_Rural"]);
    let averages = Table::new(engine.average_table(food.clone(), &options).unwrap());
    assert_eq!(averages.height(), 2);
    let parts = labels(&averages, "Urban_Rural");
    let values = f64_column(&averages, "Expenditure");
    for (part, value) in parts.iter().zip(&values) {
        let expected = match part.as_deref() {
            Some("Urban") => 951_000.0 / 801.0,
            Some("Rural") => 350.0,
            other => panic!("unexpected group {other:?}"),
        };
        assert!((value.unwrap() - expected).abs() < 1e-9, "{part:?}");
    }

    let options = AverageOptions::new()
        .with_columns(["Expenditure"])
        .with_groupby(Vec::<String>::new())
        .with_weighted(false);
    let overall = Table::new(engine.average_table(food, &options).unwrap());
    assert_eq!(f64_column(&overall, "Expenditure"), vec![Some(840.0)]);
}

#[test]
fn deciles_rank_households_by_weighted_expenditure() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let households = engine
        .load_table("household_information", YEAR, create())
        .unwrap();
    let rows = households.height();

    let ranked = engine
        .add_decile(households.clone(), QuantileOptions::new())
        .unwrap();
    assert_eq!(ranked.height(), rows);
    assert_eq!(i64_column(&ranked, "Decile"), vec![Some(10), Some(8), Some(5)]);

    let again = engine.add_decile(ranked, QuantileOptions::new()).unwrap();
    assert_eq!(i64_column(&again, "Decile"), vec![Some(10), Some(8), Some(5)]);

    let per_capita = engine
        .add_decile(
            households.clone(),
            QuantileOptions::new().with_equivalence_scale(EquivalenceScale::PerCapita),
        )
        .unwrap();
    assert_eq!(i64_column(&per_capita, "Decile"), vec![Some(7), Some(10), Some(5)]);

    let by_part = engine
        .add_percentile(households, QuantileOptions::new().with_groupby(["Urban_Rural"]))
        .unwrap();
    assert_eq!(
        i64_column(&by_part, "Percentile"),
        vec![Some(100), Some(55), Some(100)]
    );
    assert!(by_part.data.column("Urban_Rural").is_err());
}

#[test]
fn quantile_of_a_table_column() {
    let dir = TempDir::new().unwrap();
    let engine = engine(&dir);
    let food = engine.load_table("food", YEAR, create()).unwrap();

    let options = QuantileOptions::new()
        .on_column("Expenditure")
        .with_weighted(false);
    let quantiles = engine.calculate_quantile(Some(&food), &options).unwrap();
    assert_eq!(quantiles.height(), 3);

    let table = engine.add_quantile(food, &options).unwrap();
    let values = f64_column(&table, "Quantile");
    let expected = [1.0, 1.0, 2.0 / 3.0, 1.0 / 3.0, 1.0 / 3.0];
    assert_eq!(values.len(), expected.len());
    for (value, expected) in values.iter().zip(expected) {
        assert!((value.unwrap() - expected).abs() < 1e-12);
    }

    let err = engine.calculate_quantile(None, &options).unwrap_err();
    assert!(matches!(err, HbsError::ColumnNotFound { .. }));
}
