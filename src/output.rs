use tabled::settings::Style;
use tabled::{Table, Tabled};

use terraform_instance::InstanceDescription;

#[derive(Tabled)]
struct InstanceRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "LOGICAL ID")]
    logical_id: String,
    #[tabled(rename = "TAGS")]
    tags: String,
}

impl From<&InstanceDescription> for InstanceRow {
    fn from(desc: &InstanceDescription) -> Self {
        Self {
            id: desc.id.to_string(),
            logical_id: desc.logical_id.clone().unwrap_or_else(|| "-".to_string()),
            tags: desc
                .tags
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

pub fn instances_table(descriptions: &[InstanceDescription]) -> String {
    let rows: Vec<InstanceRow> = descriptions.iter().map(InstanceRow::from).collect();
    Table::new(rows).with(Style::sharp()).to_string()
}
