use hbs_metadata::{MetadataContext, Settings};
use hbs_model::Table;
use hbs_transform::{
    AttributeOptions, ClassificationOptions, FunctionRegistry, Pipeline, TableProvider,
    add_attribute, add_classification,
};
use polars::prelude::*;

fn context() -> MetadataContext {
    MetadataContext::packaged(Settings::packaged().unwrap()).unwrap()
}

fn render(df: &DataFrame, columns: &[&str]) -> String {
    (0..df.height())
        .map(|row| {
            columns
                .iter()
                .map(|name| {
                    let value = df.column(name).unwrap().get(row).unwrap();
                    match value {
                        AnyValue::Null => "null".to_string(),
                        other => match other.get_str() {
                            Some(label) => label.to_string(),
                            None => other.to_string(),
                        },
                    }
                })
                .collect::<Vec<_>>()
                .join(" | ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn expenditures() -> Table {
    Table::stamped(
        df! {
            "Year" => [1396i64, 1396, 1396, 1396],
            "ID" => [123_012_345i64, 123_012_345, 201_000_001, 201_000_001],
            "Code" => [11111i64, 22150, 11211, 99999],
            "Expenditure" => [1200.0, 300.0, 5000.0, 70.0],
        }
        .unwrap(),
        "Expenditures",
        1396,
    )
}

#[test]
fn attributes_and_commodities_decode_in_place() {
    let ctx = context();
    let table = expenditures();
    let table = add_attribute(&ctx, table, &AttributeOptions::new("Urban_Rural")).unwrap();
    let table = add_attribute(&ctx, table, &AttributeOptions::new("Province")).unwrap();
    let table = add_classification(&ctx, table, &ClassificationOptions::new()).unwrap();

    assert_eq!(table.height(), 4);
    assert_eq!(table.table_name(), Some("Expenditures"));
    insta::assert_snapshot!(
        render(&table.data, &["ID", "Code", "Urban_Rural", "Province", "item_key_1"]),
        @r"
    123012345 | 11111 | Urban | Tehran | food
    123012345 | 22150 | Urban | Tehran | tobacco
    201000001 | 11211 | Rural | Gilan | food
    201000001 | 99999 | Rural | Gilan | Other
    "
    );
}

#[test]
fn classification_filter_never_adds_rows() {
    let ctx = context();
    let unfiltered = add_classification(&ctx, expenditures(), &ClassificationOptions::new()).unwrap();
    let filtered = add_classification(
        &ctx,
        expenditures(),
        &ClassificationOptions::new()
            .with_levels([2])
            .with_drop_value(true),
    )
    .unwrap();
    assert!(filtered.height() <= unfiltered.height());
    assert_eq!(filtered.height(), 3);
}

struct NoTables;

impl TableProvider for NoTables {
    fn create_table(&self, table_name: &str, years: &[i64]) -> hbs_model::Result<Table> {
        Err(hbs_model::HbsError::TableNotFound {
            table: table_name.to_string(),
            year: years.first().copied().unwrap_or_default(),
        })
    }

    fn load_weights(&self, years: &[i64], _adjust: bool) -> hbs_model::Result<DataFrame> {
        Err(hbs_model::HbsError::TableNotFound {
            table: "Weights".to_string(),
            year: years.first().copied().unwrap_or_default(),
        })
    }
}

#[test]
fn packaged_members_instructions_run() {
    let ctx = context();
    let functions = FunctionRegistry::new();
    let instructions = ctx
        .resolved_schema_node("members_properties", 1396)
        .unwrap()
        .unwrap()
        .get("instructions")
        .unwrap()
        .as_seq()
        .unwrap()
        .to_vec();
    let members = Table::stamped(
        df! {
            "ID" => [5i64, 5, 6],
            "Relationship" => ["Head", "Child", "Head"],
            "Sex" => ["Female", "Male", "Male"],
        }
        .unwrap(),
        "members_properties",
        1396,
    );
    let mut pipeline = Pipeline::new(&ctx, &NoTables, &functions, "members_properties", 1396);
    let out = pipeline.run(members, &instructions).unwrap();
    insta::assert_snapshot!(render(&out.data, &["ID", "Year", "Head_Sex"]), @r"
    5 | 1396 | Female_Head
    5 | 1396 | Not_Head
    6 | 1396 | Male_Head
    ");
}
