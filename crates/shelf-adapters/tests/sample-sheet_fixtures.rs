// Fixture checks for the sample sheet shared by the adapter and sync tests.

use shelf_adapters::{adapter_for_format, extract_sheet_id};
use shelf_core::SheetFormat;

fn fixture_dir() -> std::path::PathBuf {
    std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/sample-sheet")
}

#[test]
fn sample_sheet_fixtures_exist() {
    let root = fixture_dir();
    for name in ["books.csv", "values.json", "gviz.txt", "snapshot.json"] {
        assert!(root.join(name).exists(), "missing fixture {name}");
    }
}

#[test]
fn every_format_yields_six_data_rows() {
    let cases = [
        (SheetFormat::Csv, "books.csv"),
        (SheetFormat::ValuesApi, "values.json"),
        (SheetFormat::GvizJson, "gviz.txt"),
    ];
    for (format, name) in cases {
        let text = std::fs::read_to_string(fixture_dir().join(name)).unwrap();
        let adapter = adapter_for_format(format);
        assert_eq!(adapter.format(), format);
        let titles: Vec<String> = adapter
            .data_rows(&text)
            .map(|row| row.field(0).to_string())
            .collect();
        assert_eq!(
            titles,
            vec![
                "Dune",
                "Good Omens",
                "The Quote Book",
                "Dune",
                "",
                "The Left Hand of Darkness"
            ],
            "{format}"
        );
    }
}

#[test]
fn sharing_url_round_trips_into_a_valid_target() {
    let id = extract_sheet_id("https://docs.google.com/spreadsheets/d/1x2Y3z_-Q/edit?usp=sharing").unwrap();
    let target = shelf_adapters::SheetTarget::new(id);
    assert_eq!(target.validated_sheet_id().unwrap(), "1x2Y3z_-Q");
}
