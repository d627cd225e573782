use income_evidence_tracker::{
    group_by, ColumnMapping, DifferenceStatus, FilterCriteria, GroupField, IncomeEvidenceTracker,
    RecordEdit, Settings, Table,
};
use rust_decimal_macros::dec;
use std::error::Error;
use std::fs;

const JANUARY: &str = "合同号,客户名,收入主体,本年确认的收入\n\
                       HT-2024-001,Acme Trading,Beijing,\"120,000.00\"\n\
                       HT-2024-002,Globex,Shanghai,45000\n\
                       HT-2024-003,Initech,Beijing,8000\n";

const MARCH: &str = "合同号,客户名,收入主体,本年确认的收入\n\
                     HT-2024-001,Acme Trading,Beijing,\"135,000.00\"\n\
                     HT-2024-002,Globex,Shanghai,45000\n\
                     HT-2024-003,Initech,Beijing,6500\n\
                     HT-2024-004,Umbrella,Shenzhen,22000\n\
                     ,Unknown,Shenzhen,100\n";

fn main() -> Result<(), Box<dyn Error>> {
    let workspace = tempfile::tempdir()?;
    let mut tracker = IncomeEvidenceTracker::open(Settings::rooted_at(workspace.path()))?;

    println!("Importing January figures...");
    let january = Table::from_csv_reader(JANUARY.as_bytes())?;
    let summary = tracker.import_table(&january, &ColumnMapping::default(), "january.csv")?;
    println!(
        " - version {}: {} records, {} new",
        summary.version,
        summary.persisted_count,
        summary.new_contract_ids.len()
    );

    let invoice = workspace.path().join("acme_invoice.pdf");
    fs::write(&invoice, b"%PDF-1.4 demo")?;
    tracker.attach_file("HT-2024-001", &invoice, Some("stamped invoice"))?;
    tracker.store_mut().edit(
        "HT-2024-001",
        &RecordEdit {
            attachment_confirmed_income: Some(Some(dec!(118000))),
            difference_note: Some("2,000 rebate pending".to_string()),
            ..Default::default()
        },
    )?;

    println!("\nImporting March figures...");
    let march = Table::from_csv_reader(MARCH.as_bytes())?;
    let summary = tracker.import_table(&march, &ColumnMapping::default(), "march.csv")?;
    println!(
        " - version {}: {} records, new {:?}, changed {:?}",
        summary.version,
        summary.persisted_count,
        summary.new_contract_ids,
        summary.changed_contract_ids
    );
    for error in &summary.import_errors {
        println!(" - skipped {}", error);
    }

    println!("\nContracts:");
    for record in tracker.view(&FilterCriteria::default(), "", Some(("annual_confirmed_income", false))) {
        println!(
            " - {:<12} {:<14} income {:>10}  difference {:>8}  {}",
            record.contract_id,
            record.client_name,
            record.annual_confirmed_income,
            record
                .difference()
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".to_string()),
            record.change_status()
        );
    }

    let unconfirmed = tracker.view(
        &FilterCriteria {
            difference_status: Some(DifferenceStatus::Unconfirmed),
            ..Default::default()
        },
        "",
        None,
    );
    println!("\n{} contracts still lack evidence", unconfirmed.len());

    for (entity, records) in group_by(&tracker.store().list_all(), GroupField::SubjectEntity) {
        println!(" - {}: {} contracts", entity, records.len());
    }

    let stats = tracker.store().statistics()?;
    println!(
        "\nTotal income {} across {} contracts, evidence ratio {}%",
        stats.total_income, stats.total_count, stats.evidence_ratio
    );

    let export_path = workspace.path().join("export").join("income.csv");
    let records = tracker.store().list_all();
    tracker.export_csv(&records, &export_path)?;
    println!("Exported to {}", export_path.display());

    Ok(())
}
